//! Insulator and metal region assembler.
//!
//! Both region kinds carry {psi, Tl?}. Insulators solve the
//! charge-free Poisson equation; metals solve ohmic current
//! continuity sigma grad(psi) with Joule heating into the optional
//! lattice-heat equation. The couplings are linear, so the Jacobian
//! entries are written directly.

use nalgebra::DVector;

use crate::discretization::mesh::{Region, RegionKind, Variable};
use crate::dofmap::IndexMap;
use crate::error::Result;
use crate::numerics::bdf::TimeContext;
use crate::numerics::linear::{InsertMode, SysMatrix};

fn layout(region: &Region) -> (usize, usize, Option<usize>) {
    let nv = region.n_variables();
    let psi = region.variable_offset(Variable::Potential).expect("psi is always active");
    let tl = region.variable_offset(Variable::LatticeTemp);
    (nv, psi, tl)
}

/// Edge transport coefficient: dielectric for insulators, ohmic for
/// metals.
fn conduction_coeff(region: &Region) -> f64 {
    match region.kind {
        RegionKind::Insulator => region.material.eps,
        RegionKind::Metal => region.material.sigma,
        _ => unreachable!("conductor assembler on a non-conductor region"),
    }
}

pub fn init_equilibrium(region: &mut Region, t_ext: f64) {
    for data in &mut region.data {
        data.psi = 0.0;
        data.t = t_ext;
        data.t_last = t_ext;
        data.t_last_last = t_ext;
    }
}

pub fn fill_value(
    region: &Region,
    region_id: usize,
    dof: &IndexMap,
    x: &mut DVector<f64>,
    l: &mut DVector<f64>,
) {
    let (nv, psi, tl) = layout(region);
    for i in region.on_processor_nodes() {
        let base = dof.local_offset(region_id, i);
        x[base + psi] = region.data[i].psi;
        if let Some(tl) = tl {
            x[base + tl] = region.data[i].t;
        }
        for a in 0..nv {
            l[base + a] = 1.0;
        }
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
    let (_, psi, tl) = layout(region);
    let g = conduction_coeff(region);

    for edge in &region.edges {
        let (k, l) = edge.nodes;
        let base_k = dof.local_offset(region_id, k);
        let base_l = dof.local_offset(region_id, l);
        let d_psi = lx[base_k + psi] - lx[base_l + psi];

        let flux = g * edge.coupling * d_psi;
        r[base_k + psi] += flux;
        r[base_l + psi] -= flux;

        if let Some(tl) = tl {
            let t_avg = 0.5 * (lx[base_k + tl] + lx[base_l + tl]);
            let kappa = (region.material.kappa)(if t_avg > 0.0 { t_avg } else { t_ext });
            let cond = kappa * edge.coupling * (lx[base_k + tl] - lx[base_l + tl]);
            r[base_k + tl] += cond;
            r[base_l + tl] -= cond;

            if region.kind == RegionKind::Metal {
                let joule = region.material.sigma * edge.coupling * d_psi * d_psi;
                r[base_k + tl] -= 0.5 * joule;
                r[base_l + tl] -= 0.5 * joule;
            }
        }
    }

    Ok(())
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
    let (_, psi, tl) = layout(region);
    let g = conduction_coeff(region);

    for edge in &region.edges {
        let (k, l) = edge.nodes;
        let base_k = dof.local_offset(region_id, k);
        let base_l = dof.local_offset(region_id, l);
        let c = g * edge.coupling;

        j.set(base_k + psi, base_k + psi, c, *mode);
        j.set(base_k + psi, base_l + psi, -c, *mode);
        j.set(base_l + psi, base_l + psi, c, *mode);
        j.set(base_l + psi, base_k + psi, -c, *mode);

        if let Some(tl) = tl {
            let t_avg = 0.5 * (lx[base_k + tl] + lx[base_l + tl]);
            let kappa = (region.material.kappa)(if t_avg > 0.0 { t_avg } else { t_ext });
            let ck = kappa * edge.coupling;
            j.set(base_k + tl, base_k + tl, ck, *mode);
            j.set(base_k + tl, base_l + tl, -ck, *mode);
            j.set(base_l + tl, base_l + tl, ck, *mode);
            j.set(base_l + tl, base_k + tl, -ck, *mode);

            if region.kind == RegionKind::Metal {
                let d_psi = lx[base_k + psi] - lx[base_l + psi];
                let dj = region.material.sigma * edge.coupling * d_psi;
                // d(-0.5 joule)/dpsi on both rows
                j.set(base_k + tl, base_k + psi, -dj, *mode);
                j.set(base_k + tl, base_l + psi, dj, *mode);
                j.set(base_l + tl, base_k + psi, -dj, *mode);
                j.set(base_l + tl, base_l + psi, dj, *mode);
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
    let (_, _, tl) = layout(region);
    let Some(tl) = tl else { return Ok(()) };
    mode.promote(InsertMode::Add);
    let lead = time.lead();
    for i in region.on_processor_nodes() {
        let base = dof.local_offset(region_id, i);
        let data = &region.data[i];
        let dt_dt = lead * lx[base + tl] - time.hist(data.t_last, data.t_last_last);
        r[base + tl] += region.material.heat_capacity * region.nodes[i].volume * dt_dt;
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
    let (_, _, tl) = layout(region);
    let Some(tl) = tl else { return Ok(()) };
    mode.promote(InsertMode::Add);
    let lead = time.lead();
    for i in region.on_processor_nodes() {
        let base = dof.local_offset(region_id, i);
        let vol = region.nodes[i].volume;
        j.set(base + tl, base + tl, region.material.heat_capacity * vol * lead, *mode);
    }
    Ok(())
}

pub fn update_solution(region: &mut Region, region_id: usize, dof: &IndexMap, lx: &DVector<f64>) {
    let (_, psi, tl) = layout(region);
    for i in 0..region.nodes.len() {
        let base = dof.local_offset(region_id, i);
        region.data[i].psi = lx[base + psi];
        if let Some(tl) = tl {
            region.data[i].t = lx[base + tl];
        }
    }
}
