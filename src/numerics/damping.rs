//! Newton-update damping strategies and the post-acceptance
//! projection.
//!
//! Exactly one strategy transforms each Newton step: `y` is the search
//! direction returned by the linear solve, `w = x - y` the trial
//! iterate. Strategies report whether they changed `y` or `w` so the
//! driver knows what to re-evaluate.

use nalgebra::DVector;

use crate::circuit::SpiceCircuit;
use crate::discretization::mesh::{Mesh, RegionKind, Variable};
use crate::dofmap::IndexMap;
use crate::parallel::Comm;
use crate::physics::semiconductor::VarLayout;
use crate::units::{thermal_voltage, ONE_PER_CM3};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DampingStrategy {
    Potential,
    PositiveDensity,
    /// Reserved extension point; passes the trial iterate through.
    BankRose,
}

/// What a strategy did to the step.
#[derive(Clone, Copy, Debug)]
pub struct DampingReport {
    pub changed_y: bool,
    pub changed_w: bool,
    /// Logarithmic potential-damping factor, 1.0 when it did not fire.
    pub factor: f64,
}

impl DampingReport {
    fn unchanged() -> Self {
        Self { changed_y: false, changed_w: false, factor: 1.0 }
    }
}

/// Logarithmic damping factor for the largest potential update.
pub fn potential_damping_factor(dv_max: f64, vt: f64) -> f64 {
    let u = dv_max / vt;
    (1.0 + u).ln() / u
}

/// Convex temperature blend that keeps a carrier temperature above
/// 0.9 T_ext: T0 is taken from the reference iterate, the candidate
/// energy product is rebuilt from the blended temperature.
fn blend_energy_product(w_ref: f64, dens_ref: f64, w_new: f64, dens_new: f64, t_ext: f64) -> f64 {
    let t0 = w_ref / dens_ref;
    let alpha = (dens_new / dens_ref).min(2.0);
    let mut t1 = t0 * (1.0 - alpha) + w_new / dens_ref;
    if t1 < 0.9 * t_ext {
        t1 = 0.9 * t_ext;
    }
    t1 * dens_new
}

/// Physical clamps applied to the candidate iterate at one
/// semiconductor node; shared by both damping strategies and the
/// projection.
fn clamp_node(
    lay: &VarLayout,
    base: usize,
    reference: &DVector<f64>,
    w: &mut DVector<f64>,
    t_ext: f64,
) {
    if w[base + lay.n] < ONE_PER_CM3 {
        w[base + lay.n] = ONE_PER_CM3;
    }
    if w[base + lay.p] < ONE_PER_CM3 {
        w[base + lay.p] = ONE_PER_CM3;
    }
    if let Some(tl) = lay.tl {
        if w[base + tl] < t_ext - 50.0 {
            w[base + tl] = t_ext - 50.0;
        }
    }
    if let Some(wn) = lay.wn {
        w[base + wn] = blend_energy_product(
            reference[base + wn],
            reference[base + lay.n],
            w[base + wn],
            w[base + lay.n],
            t_ext,
        );
    }
    if let Some(wp) = lay.wp {
        w[base + wp] = blend_energy_product(
            reference[base + wp],
            reference[base + lay.p],
            w[base + wp],
            w[base + lay.p],
            t_ext,
        );
    }
}

/// Potential damping: the largest psi update (reduced over ranks)
/// sets a logarithmic step factor applied to every potential
/// component; carrier and temperature clamps follow, and circuit
/// voltage/current increments are clipped by scaling.
#[allow(clippy::too_many_arguments)]
pub fn potential_damping(
    mesh: &Mesh,
    dof: &IndexMap,
    circuit: Option<&SpiceCircuit>,
    x: &DVector<f64>,
    y: &mut DVector<f64>,
    w: &mut DVector<f64>,
    voltage_clip: f64,
    current_clip: f64,
    comm: &impl Comm,
) -> DampingReport {
    let t_ext = mesh.t_external;
    let mut dv_max = 0.0f64;

    for (region_id, region) in mesh.regions.iter().enumerate() {
        if region.kind != RegionKind::Semiconductor {
            continue;
        }
        let lay = VarLayout::of(region);
        for i in region.on_processor_nodes() {
            let base = dof.local_offset(region_id, i);
            dv_max = dv_max.max(y[base + lay.psi].abs());
            clamp_node(&lay, base, x, w, t_ext);
        }
    }

    dv_max = comm.max(dv_max);

    let mut factor = 1.0;
    if dv_max > 1e-6 {
        let vt = thermal_voltage(t_ext);
        factor = potential_damping_factor(dv_max, vt);
        for (region_id, region) in mesh.regions.iter().enumerate() {
            let Some(psi) = region.variable_offset(Variable::Potential) else {
                continue;
            };
            for i in region.on_processor_nodes() {
                let base = dof.local_offset(region_id, i);
                w[base + psi] = x[base + psi] - factor * y[base + psi];
            }
        }
    }

    if let Some(ckt) = circuit {
        if comm.is_last() {
            for node in 0..ckt.n_ckt_nodes() {
                let row = dof.circuit_offset_x(node);
                let dv = y[row].abs();
                if ckt.is_voltage_node(node) && dv > voltage_clip {
                    w[row] = x[row] - voltage_clip / dv * y[row];
                }
                if ckt.is_current_node(node) && dv > current_clip {
                    w[row] = x[row] - current_clip / dv * y[row];
                }
            }
        }
    }

    DampingReport { changed_y: false, changed_w: true, factor }
}

/// Positive-density damping: potential updates clipped to 1 V by
/// sign, then the physical clamps.
pub fn positive_density_damping(
    mesh: &Mesh,
    dof: &IndexMap,
    x: &DVector<f64>,
    y: &mut DVector<f64>,
    w: &mut DVector<f64>,
) -> DampingReport {
    let t_ext = mesh.t_external;

    for (region_id, region) in mesh.regions.iter().enumerate() {
        if region.kind != RegionKind::Semiconductor {
            continue;
        }
        let lay = VarLayout::of(region);
        for i in region.on_processor_nodes() {
            let base = dof.local_offset(region_id, i);
            let dpsi = y[base + lay.psi];
            if dpsi.abs() > 1.0 {
                w[base + lay.psi] = x[base + lay.psi] - dpsi.signum();
            }
            clamp_node(&lay, base, x, w, t_ext);
        }
    }

    DampingReport { changed_y: false, changed_w: true, factor: 1.0 }
}

/// Dispatch the active strategy.
#[allow(clippy::too_many_arguments)]
pub fn apply(
    strategy: DampingStrategy,
    mesh: &Mesh,
    dof: &IndexMap,
    circuit: Option<&SpiceCircuit>,
    x: &DVector<f64>,
    y: &mut DVector<f64>,
    w: &mut DVector<f64>,
    voltage_clip: f64,
    current_clip: f64,
    comm: &impl Comm,
) -> DampingReport {
    match strategy {
        DampingStrategy::Potential => potential_damping(
            mesh,
            dof,
            circuit,
            x,
            y,
            w,
            voltage_clip,
            current_clip,
            comm,
        ),
        DampingStrategy::PositiveDensity => positive_density_damping(mesh, dof, x, y, w),
        DampingStrategy::BankRose => DampingReport::unchanged(),
    }
}

/// Post-acceptance projection: apply the same physical clips to the
/// accepted iterate, blending temperatures against the pre-Newton
/// iterate `x_old`.
pub fn projection_positive_density(
    mesh: &Mesh,
    dof: &IndexMap,
    x: &mut DVector<f64>,
    x_old: &DVector<f64>,
) {
    let t_ext = mesh.t_external;
    for (region_id, region) in mesh.regions.iter().enumerate() {
        if region.kind != RegionKind::Semiconductor {
            continue;
        }
        let lay = VarLayout::of(region);
        for i in region.on_processor_nodes() {
            let base = dof.local_offset(region_id, i);
            clamp_node(&lay, base, x_old, x, t_ext);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::builder::{semiconductor_bar, uniform_line};
    use crate::discretization::mesh::AdvancedModel;
    use crate::parallel::SerialComm;
    use crate::physics::material::Material;
    use crate::units::UM;

    #[test]
    fn damping_factor_is_in_unit_interval_and_tends_to_one() {
        let vt = thermal_voltage(300.0);
        for dv in [1e-6, 1e-3, 0.1, 1.0, 10.0] {
            let f = potential_damping_factor(dv, vt);
            assert!(f > 0.0 && f <= 1.0, "f({dv}) = {f}");
        }
        assert!(potential_damping_factor(1e-9, vt) > 0.999999);
        // monotone decreasing in the update size
        assert!(
            potential_damping_factor(1.0, vt) > potential_damping_factor(2.0, vt)
        );
    }

    fn mesh_with_ebm() -> (Mesh, IndexMap) {
        let coords = uniform_line(0.0, 1.0 * UM, 3);
        let region = semiconductor_bar(
            "bar",
            &coords,
            1e-8,
            Material::silicon(),
            AdvancedModel { enable_tl: true, enable_tn: true, enable_tp: true },
            |_| 1e16,
            300.0,
        );
        let mesh = Mesh { regions: vec![region], t_external: 300.0 };
        let dof = IndexMap::build(&mesh, 0);
        (mesh, dof)
    }

    #[test]
    fn positive_density_damping_clips_and_clamps() {
        let (mesh, dof) = mesh_with_ebm();
        let n_rows = dof.n_rows();
        // reference iterate: 1e16 carriers at 300 K
        let mut x = DVector::zeros(n_rows);
        for node in 0..3 {
            let base = dof.local_offset(0, node);
            x[base] = 0.2;
            x[base + 1] = 1e16;
            x[base + 2] = 1e16;
            x[base + 3] = 300.0;
            x[base + 4] = 1e16 * 300.0;
            x[base + 5] = 1e16 * 300.0;
        }
        // a hostile Newton step
        let mut y = DVector::zeros(n_rows);
        let mut w = x.clone();
        for node in 0..3 {
            let base = dof.local_offset(0, node);
            y[base] = 3.0;
            w[base] = x[base] - y[base];
            w[base + 1] = -1e15; // negative density
            w[base + 2] = 0.5; // below the floor
            w[base + 3] = 100.0; // far below ambient
            w[base + 4] = 1e15 * 10.0; // Tn collapse
            w[base + 5] = 1e15 * 10.0;
        }

        let report = positive_density_damping(&mesh, &dof, &x, &mut y, &mut w);
        assert!(report.changed_w && !report.changed_y);

        for node in 0..3 {
            let base = dof.local_offset(0, node);
            // psi update clipped to 1 V by sign
            assert!((w[base] - (x[base] - 1.0)).abs() < 1e-12);
            assert!(w[base + 1] >= ONE_PER_CM3);
            assert!(w[base + 2] >= ONE_PER_CM3);
            assert!(w[base + 3] >= 250.0);
            // blended carrier temperatures respect the 0.9 T_ext floor
            assert!(w[base + 4] / w[base + 1] >= 0.9 * 300.0 - 1e-9);
            assert!(w[base + 5] / w[base + 2] >= 0.9 * 300.0 - 1e-9);
        }
    }

    #[test]
    fn potential_damping_scales_every_psi_component() {
        let (mesh, dof) = mesh_with_ebm();
        let n_rows = dof.n_rows();
        let mut x = DVector::zeros(n_rows);
        let mut y = DVector::zeros(n_rows);
        for node in 0..3 {
            let base = dof.local_offset(0, node);
            x[base + 1] = 1e16;
            x[base + 2] = 1e16;
            x[base + 3] = 300.0;
            x[base + 4] = 1e16 * 300.0;
            x[base + 5] = 1e16 * 300.0;
            y[base] = 0.5; // half-volt update everywhere
        }
        let mut w = &x - &y;

        let report = potential_damping(
            &mesh,
            &dof,
            None,
            &x,
            &mut y,
            &mut w,
            5.0,
            1.0,
            &SerialComm,
        );
        assert!(report.factor < 1.0 && report.factor > 0.0);
        for node in 0..3 {
            let base = dof.local_offset(0, node);
            let expected = x[base] - report.factor * y[base];
            assert!((w[base] - expected).abs() < 1e-12);
        }
    }
}
