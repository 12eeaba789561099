//! Semiconductor region assembler.
//!
//! Governing equations per FVM node: Poisson, electron and hole
//! continuity with Scharfetter-Gummel edge fluxes and SRH
//! recombination, and the optional lattice-heat and carrier
//! energy-balance equations (variables w_n = n·Tn, w_p = p·Tp).
//!
//! Continuity rows are written in charge units with opposite carrier
//! signs, so the sum of a node's electron and hole rows is the net
//! terminal current through that node. The boundary preprocess relies
//! on this when it redirects contact rows into a circuit KCL row.
//!
//! Jacobians come from the same kernels evaluated on seeded dual
//! numbers; the local derivative blocks are scattered through the
//! index map.

use nalgebra::{DVector, Dyn, U1};
use num_dual::{Derivative, DualDVec64, DualNum};

use crate::discretization::mesh::{NodeData, Region};
use crate::dofmap::IndexMap;
use crate::error::Result;
use crate::numerics::bdf::TimeContext;
use crate::numerics::linear::{InsertMode, SysMatrix};
use crate::physics::bern;
use crate::physics::material::Material;
use crate::units::{thermal_voltage, E, KB};

/// Variable offsets of a region, resolved once per assembly pass.
pub(crate) struct VarLayout {
    pub nv: usize,
    pub psi: usize,
    pub n: usize,
    pub p: usize,
    pub tl: Option<usize>,
    pub wn: Option<usize>,
    pub wp: Option<usize>,
}

impl VarLayout {
    pub fn of(region: &Region) -> Self {
        use crate::discretization::mesh::Variable as V;
        Self {
            nv: region.n_variables(),
            psi: region.variable_offset(V::Potential).expect("psi is always active"),
            n: region.variable_offset(V::Electron).expect("semiconductor region"),
            p: region.variable_offset(V::Hole).expect("semiconductor region"),
            tl: region.variable_offset(V::LatticeTemp),
            wn: region.variable_offset(V::ElecTemp),
            wp: region.variable_offset(V::HoleTemp),
        }
    }
}

/// Equilibrium carrier densities for net doping `c`, evaluated in the
/// branch that avoids cancellation.
pub fn equilibrium_carriers(c: f64, ni: f64) -> (f64, f64) {
    let s = (c * c + 4.0 * ni * ni).sqrt();
    if c >= 0.0 {
        let n_eq = 0.5 * (c + s);
        (n_eq, ni * ni / n_eq)
    } else {
        let p_eq = 0.5 * (-c + s);
        (ni * ni / p_eq, p_eq)
    }
}

/// Built-in potential of an ohmic contact relative to the intrinsic
/// Fermi level.
pub fn builtin_potential(c: f64, ni: f64, vt: f64) -> f64 {
    vt * (c / (2.0 * ni)).asinh()
}

/// Charge-neutral equilibrium, written into the node data. The
/// potential reference is the intrinsic Fermi level.
pub fn init_equilibrium(region: &mut Region, t_ext: f64) {
    let ni = region.material.ni;
    let vt = thermal_voltage(t_ext);
    for data in &mut region.data {
        let c = data.doping;
        let (n_eq, p_eq) = equilibrium_carriers(c, ni);
        data.psi = builtin_potential(c, ni, vt);
        data.n = n_eq;
        data.p = p_eq;
        data.t = t_ext;
        data.tn = t_ext;
        data.tp = t_ext;
        data.n_last = n_eq;
        data.p_last = p_eq;
        data.t_last = t_ext;
        data.tn_last = t_ext;
        data.tp_last = t_ext;
        data.n_last_last = n_eq;
        data.p_last_last = p_eq;
        data.t_last_last = t_ext;
        data.tn_last_last = t_ext;
        data.tp_last_last = t_ext;
    }
}

/// Copy the node data into the solution vector; unit row scaling until
/// the first Jacobian assembly refreshes L from the diagonal.
pub fn fill_value(
    region: &Region,
    region_id: usize,
    dof: &IndexMap,
    x: &mut DVector<f64>,
    l: &mut DVector<f64>,
) {
    let lay = VarLayout::of(region);
    for i in region.on_processor_nodes() {
        let base = dof.local_offset(region_id, i);
        let data = &region.data[i];
        x[base + lay.psi] = data.psi;
        x[base + lay.n] = data.n;
        x[base + lay.p] = data.p;
        if let Some(tl) = lay.tl {
            x[base + tl] = data.t;
        }
        if let Some(wn) = lay.wn {
            x[base + wn] = data.n * data.tn;
        }
        if let Some(wp) = lay.wp {
            x[base + wp] = data.p * data.tp;
        }
        for a in 0..lay.nv {
            l[base + a] = 1.0;
        }
    }
}

/// Per-node sources: space charge, SRH recombination, recombination
/// heating and the carrier-lattice energy relaxation.
fn node_sources<T: DualNum<f64>>(
    lay: &VarLayout,
    mat: &Material,
    data: &NodeData,
    volume: f64,
    u: &[T],
    t_ext: f64,
    f: &mut [T],
) {
    let n = &u[lay.n];
    let p = &u[lay.p];

    // Poisson: sum_l eps c (psi_k - psi_l) - vol e (p - n + C) = 0
    f[lay.psi] += (n.clone() - p.clone() - T::from(data.doping)) * (E * volume);

    let ni = mat.ni;
    let numer = n.clone() * p.clone() - T::from(ni * ni);
    let denom = (n.clone() + T::from(ni)) * mat.tau_p + (p.clone() + T::from(ni)) * mat.tau_n;
    let r_srh = numer / denom;
    f[lay.n] += r_srh.clone() * (-E * volume);
    f[lay.p] += r_srh.clone() * (E * volume);

    if let Some(tl_i) = lay.tl {
        // recombination releases the bandgap energy into the lattice
        f[tl_i] += r_srh * (-E * mat.eg * volume);
    }

    if let Some(wn_i) = lay.wn {
        let tl_term: T = match lay.tl {
            Some(i) => u[i].clone(),
            None => T::from(t_ext),
        };
        let relax = (u[wn_i].clone() - n.clone() * tl_term) * (1.5 * KB * volume / mat.tau_energy);
        f[wn_i] += relax.clone();
        if let Some(tl_i) = lay.tl {
            f[tl_i] += relax * (-1.0);
        }
    }

    if let Some(wp_i) = lay.wp {
        let tl_term: T = match lay.tl {
            Some(i) => u[i].clone(),
            None => T::from(t_ext),
        };
        let relax = (u[wp_i].clone() - p.clone() * tl_term) * (1.5 * KB * volume / mat.tau_energy);
        f[wp_i] += relax.clone();
        if let Some(tl_i) = lay.tl {
            f[tl_i] += relax * (-1.0);
        }
    }
}

/// Per-edge fluxes: dielectric displacement, Scharfetter-Gummel
/// carrier fluxes, lattice heat conduction and carrier energy
/// advection with Joule-power routing.
///
/// `fk` receives the contribution to node k's rows, `fl` to node l's.
fn edge_fluxes<T: DualNum<f64>>(
    lay: &VarLayout,
    mat: &Material,
    uk: &[T],
    ul: &[T],
    coupling: f64,
    t_ext: f64,
    fk: &mut [T],
    fl: &mut [T],
) {
    let psi_k = &uk[lay.psi];
    let psi_l = &ul[lay.psi];

    let t_k = lay.tl.map(|i| uk[i].re()).unwrap_or(t_ext);
    let t_l = lay.tl.map(|i| ul[i].re()).unwrap_or(t_ext);
    let t_avg = 0.5 * (t_k + t_l);
    let vt = thermal_voltage(t_avg);
    let mu_n = (mat.mobility_n)(t_avg);
    let mu_p = (mat.mobility_p)(t_avg);

    let d_psi = (psi_k.clone() - psi_l.clone()) * (mat.eps * coupling);
    fk[lay.psi] += d_psi.clone();
    fl[lay.psi] += d_psi * (-1.0);

    let delta = (psi_l.clone() - psi_k.clone()) * (1.0 / vt);
    let bp = bern(delta.clone());
    let bm = bern(delta * (-1.0));

    // particle fluxes k -> l
    let flux_n =
        (bm.clone() * uk[lay.n].clone() - bp.clone() * ul[lay.n].clone()) * (mu_n * vt * coupling);
    fk[lay.n] += flux_n.clone() * (-E);
    fl[lay.n] += flux_n.clone() * E;

    let flux_p =
        (bp.clone() * uk[lay.p].clone() - bm.clone() * ul[lay.p].clone()) * (mu_p * vt * coupling);
    fk[lay.p] += flux_p.clone() * E;
    fl[lay.p] += flux_p.clone() * (-E);

    // power picked up by carriers drifting along the edge
    let joule_n = flux_n * (psi_l.clone() - psi_k.clone()) * E;
    let joule_p = flux_p * (psi_k.clone() - psi_l.clone()) * E;

    if let Some(tl_i) = lay.tl {
        let kappa = (mat.kappa)(t_avg);
        let cond = (uk[tl_i].clone() - ul[tl_i].clone()) * (kappa * coupling);
        fk[tl_i] += cond.clone();
        fl[tl_i] += cond * (-1.0);
        // carriers without an energy equation dump Joule power
        // straight into the lattice
        if lay.wn.is_none() {
            fk[tl_i] += joule_n.clone() * (-0.5);
            fl[tl_i] += joule_n.clone() * (-0.5);
        }
        if lay.wp.is_none() {
            fk[tl_i] += joule_p.clone() * (-0.5);
            fl[tl_i] += joule_p.clone() * (-0.5);
        }
    }

    if let Some(wn_i) = lay.wn {
        let s_n = (bm.clone() * uk[wn_i].clone() - bp.clone() * ul[wn_i].clone())
            * (1.5 * KB * mu_n * vt * coupling);
        fk[wn_i] += s_n.clone();
        fl[wn_i] += s_n * (-1.0);
        fk[wn_i] += joule_n.clone() * (-0.5);
        fl[wn_i] += joule_n.clone() * (-0.5);
    }

    if let Some(wp_i) = lay.wp {
        let s_p = (bp * uk[wp_i].clone() - bm * ul[wp_i].clone())
            * (1.5 * KB * mu_p * vt * coupling);
        fk[wp_i] += s_p.clone();
        fl[wp_i] += s_p * (-1.0);
        fk[wp_i] += joule_p.clone() * (-0.5);
        fl[wp_i] += joule_p.clone() * (-0.5);
    }
}

pub fn residual(
    region: &Region,
    region_id: usize,
    dof: &IndexMap,
    lx: &DVector<f64>,
    r: &mut DVector<f64>,
    mode: &mut InsertMode,
    t_ext: f64,
) -> Result<()> {
    mode.promote(InsertMode::Add);
    let lay = VarLayout::of(region);
    let u_all = lx.as_slice();

    let mut f = vec![0.0f64; lay.nv];
    for i in region.on_processor_nodes() {
        let base = dof.local_offset(region_id, i);
        f.iter_mut().for_each(|v| *v = 0.0);
        node_sources(
            &lay,
            &region.material,
            &region.data[i],
            region.nodes[i].volume,
            &u_all[base..base + lay.nv],
            t_ext,
            &mut f,
        );
        for a in 0..lay.nv {
            r[base + a] += f[a];
        }
    }

    let mut fk = vec![0.0f64; lay.nv];
    let mut fl = vec![0.0f64; lay.nv];
    for edge in &region.edges {
        let (k, l) = edge.nodes;
        let base_k = dof.local_offset(region_id, k);
        let base_l = dof.local_offset(region_id, l);
        fk.iter_mut().for_each(|v| *v = 0.0);
        fl.iter_mut().for_each(|v| *v = 0.0);
        edge_fluxes(
            &lay,
            &region.material,
            &u_all[base_k..base_k + lay.nv],
            &u_all[base_l..base_l + lay.nv],
            edge.coupling,
            t_ext,
            &mut fk,
            &mut fl,
        );
        for a in 0..lay.nv {
            r[base_k + a] += fk[a];
            r[base_l + a] += fl[a];
        }
    }

    Ok(())
}

/// Seed one node block with unit derivatives of local dimension `m`.
fn seed_node(u: &[f64], m: usize) -> Vec<DualDVec64> {
    (0..m)
        .map(|j| DualDVec64::new(u[j], Derivative::derivative_generic(Dyn(m), U1, j)))
        .collect()
}

/// Seed both endpoint blocks of an edge; local dimension 2m.
fn seed_edge(uk: &[f64], ul: &[f64], m: usize) -> (Vec<DualDVec64>, Vec<DualDVec64>) {
    let k = (0..m)
        .map(|j| DualDVec64::new(uk[j], Derivative::derivative_generic(Dyn(2 * m), U1, j)))
        .collect();
    let l = (0..m)
        .map(|j| DualDVec64::new(ul[j], Derivative::derivative_generic(Dyn(2 * m), U1, m + j)))
        .collect();
    (k, l)
}

pub fn jacobian(
    region: &Region,
    region_id: usize,
    dof: &IndexMap,
    lx: &DVector<f64>,
    j: &mut SysMatrix,
    mode: &mut InsertMode,
    t_ext: f64,
) -> Result<()> {
    mode.promote(InsertMode::Add);
    let lay = VarLayout::of(region);
    let m = lay.nv;
    let u_all = lx.as_slice();

    for i in region.on_processor_nodes() {
        let base = dof.local_offset(region_id, i);
        let u = seed_node(&u_all[base..base + m], m);
        let mut f = vec![DualDVec64::from_re(0.0); m];
        node_sources(
            &lay,
            &region.material,
            &region.data[i],
            region.nodes[i].volume,
            &u,
            t_ext,
            &mut f,
        );
        for a in 0..m {
            let g = f[a].eps.clone().unwrap_generic(Dyn(m), U1);
            for b in 0..m {
                j.set(base + a, base + b, g[(b, 0)], *mode);
            }
        }
    }

    for edge in &region.edges {
        let (k, l) = edge.nodes;
        let base_k = dof.local_offset(region_id, k);
        let base_l = dof.local_offset(region_id, l);
        let (uk, ul) = seed_edge(
            &u_all[base_k..base_k + m],
            &u_all[base_l..base_l + m],
            m,
        );
        let mut fk = vec![DualDVec64::from_re(0.0); m];
        let mut fl = vec![DualDVec64::from_re(0.0); m];
        edge_fluxes(
            &lay,
            &region.material,
            &uk,
            &ul,
            edge.coupling,
            t_ext,
            &mut fk,
            &mut fl,
        );
        for a in 0..m {
            let gk = fk[a].eps.clone().unwrap_generic(Dyn(2 * m), U1);
            let gl = fl[a].eps.clone().unwrap_generic(Dyn(2 * m), U1);
            for b in 0..m {
                j.set(base_k + a, base_k + b, gk[(b, 0)], *mode);
                j.set(base_k + a, base_l + b, gk[(m + b, 0)], *mode);
                j.set(base_l + a, base_k + b, gl[(b, 0)], *mode);
                j.set(base_l + a, base_l + b, gl[(m + b, 0)], *mode);
            }
        }
    }

    Ok(())
}

pub fn time_dependent_residual(
    region: &Region,
    region_id: usize,
    dof: &IndexMap,
    lx: &DVector<f64>,
    r: &mut DVector<f64>,
    mode: &mut InsertMode,
    time: &TimeContext,
) -> Result<()> {
    mode.promote(InsertMode::Add);
    let lay = VarLayout::of(region);
    let lead = time.lead();
    for i in region.on_processor_nodes() {
        let base = dof.local_offset(region_id, i);
        let data = &region.data[i];
        let vol = region.nodes[i].volume;

        let dn_dt = lead * lx[base + lay.n] - time.hist(data.n_last, data.n_last_last);
        r[base + lay.n] += -E * vol * dn_dt;

        let dp_dt = lead * lx[base + lay.p] - time.hist(data.p_last, data.p_last_last);
        r[base + lay.p] += E * vol * dp_dt;

        if let Some(tl) = lay.tl {
            let dt_dt = lead * lx[base + tl] - time.hist(data.t_last, data.t_last_last);
            r[base + tl] += region.material.heat_capacity * vol * dt_dt;
        }
        if let Some(wn) = lay.wn {
            let dw_dt = lead * lx[base + wn]
                - time.hist(data.tn_last * data.n_last, data.tn_last_last * data.n_last_last);
            r[base + wn] += 1.5 * KB * vol * dw_dt;
        }
        if let Some(wp) = lay.wp {
            let dw_dt = lead * lx[base + wp]
                - time.hist(data.tp_last * data.p_last, data.tp_last_last * data.p_last_last);
            r[base + wp] += 1.5 * KB * vol * dw_dt;
        }
    }
    Ok(())
}

pub fn time_dependent_jacobian(
    region: &Region,
    region_id: usize,
    dof: &IndexMap,
    _lx: &DVector<f64>,
    j: &mut SysMatrix,
    mode: &mut InsertMode,
    time: &TimeContext,
) -> Result<()> {
    mode.promote(InsertMode::Add);
    let lay = VarLayout::of(region);
    let lead = time.lead();
    for i in region.on_processor_nodes() {
        let base = dof.local_offset(region_id, i);
        let vol = region.nodes[i].volume;

        j.set(base + lay.n, base + lay.n, -E * vol * lead, *mode);
        j.set(base + lay.p, base + lay.p, E * vol * lead, *mode);
        if let Some(tl) = lay.tl {
            j.set(base + tl, base + tl, region.material.heat_capacity * vol * lead, *mode);
        }
        if let Some(wn) = lay.wn {
            j.set(base + wn, base + wn, 1.5 * KB * vol * lead, *mode);
        }
        if let Some(wp) = lay.wp {
            j.set(base + wp, base + wp, 1.5 * KB * vol * lead, *mode);
        }
    }
    Ok(())
}

/// Scatter an accepted iterate back into the node data. Carrier
/// temperatures are recovered from the energy products.
pub fn update_solution(region: &mut Region, region_id: usize, dof: &IndexMap, lx: &DVector<f64>) {
    let lay = VarLayout::of(region);
    for i in 0..region.nodes.len() {
        let base = dof.local_offset(region_id, i);
        let data = &mut region.data[i];
        data.psi = lx[base + lay.psi];
        data.n = lx[base + lay.n];
        data.p = lx[base + lay.p];
        if let Some(tl) = lay.tl {
            data.t = lx[base + tl];
        }
        if let Some(wn) = lay.wn {
            data.tn = lx[base + wn] / data.n;
        }
        if let Some(wp) = lay.wp {
            data.tp = lx[base + wp] / data.p;
        }
    }
}
