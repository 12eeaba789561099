pub mod bc;
pub mod conductor;
pub mod material;
pub mod semiconductor;

use nalgebra::DVector;
use num_dual::DualNum;

use crate::discretization::mesh::{Mesh, RegionKind};
use crate::dofmap::IndexMap;
use crate::error::Result;
use crate::numerics::bdf::TimeContext;
use crate::numerics::linear::{InsertMode, SysMatrix};

/// Scharfetter-Gummel weight B(x) = x / (e^x - 1).
///
/// Branches keep the function and its dual-number derivative finite
/// over the whole argument range reached during damped Newton steps.
pub fn bern<T: DualNum<f64>>(x: T) -> T {
    let xr = x.re();
    if xr > 37.0 {
        // x / (e^x - 1) ~ x e^-x, underflows cleanly
        x.clone() * (x.clone() * (-1.0)).exp()
    } else if xr < -37.0 {
        x * (-1.0)
    } else if xr.abs() < 1e-4 {
        let x2 = x.clone() * x.clone();
        T::from(1.0) - x.clone() * T::from(0.5) + x2.clone() * T::from(1.0 / 12.0)
            - x2.clone() * x2 * T::from(1.0 / 720.0)
    } else {
        x.clone() / (x.exp() - T::from(1.0))
    }
}

/// Write the equilibrium state into every region's node data.
pub fn init_equilibrium(mesh: &mut Mesh) {
    let t_ext = mesh.t_external;
    for region in &mut mesh.regions {
        match region.kind {
            RegionKind::Semiconductor => semiconductor::init_equilibrium(region, t_ext),
            RegionKind::Insulator | RegionKind::Metal => conductor::init_equilibrium(region, t_ext),
            RegionKind::Vacuum => {}
        }
    }
}

/// Region dispatch for the initial-guess fill.
pub fn region_fill_value(
    mesh: &Mesh,
    region_id: usize,
    dof: &IndexMap,
    x: &mut DVector<f64>,
    l: &mut DVector<f64>,
) {
    let region = mesh.region(region_id);
    match region.kind {
        RegionKind::Semiconductor => semiconductor::fill_value(region, region_id, dof, x, l),
        RegionKind::Insulator | RegionKind::Metal => {
            conductor::fill_value(region, region_id, dof, x, l)
        }
        RegionKind::Vacuum => {}
    }
}

/// Region dispatch for the steady governing-equation residual.
pub fn region_residual(
    mesh: &Mesh,
    region_id: usize,
    dof: &IndexMap,
    lx: &DVector<f64>,
    r: &mut DVector<f64>,
    mode: &mut InsertMode,
) -> Result<()> {
    let region = mesh.region(region_id);
    match region.kind {
        RegionKind::Semiconductor => {
            semiconductor::residual(region, region_id, dof, lx, r, mode, mesh.t_external)
        }
        RegionKind::Insulator | RegionKind::Metal => {
            conductor::residual(region, region_id, dof, lx, r, mode, mesh.t_external)
        }
        RegionKind::Vacuum => Ok(()),
    }
}

/// Region dispatch for the steady Jacobian.
pub fn region_jacobian(
    mesh: &Mesh,
    region_id: usize,
    dof: &IndexMap,
    lx: &DVector<f64>,
    j: &mut SysMatrix,
    mode: &mut InsertMode,
) -> Result<()> {
    let region = mesh.region(region_id);
    match region.kind {
        RegionKind::Semiconductor => {
            semiconductor::jacobian(region, region_id, dof, lx, j, mode, mesh.t_external)
        }
        RegionKind::Insulator | RegionKind::Metal => {
            conductor::jacobian(region, region_id, dof, lx, j, mode, mesh.t_external)
        }
        RegionKind::Vacuum => Ok(()),
    }
}

/// Region dispatch for the BDF storage-term residual.
pub fn region_time_dependent_residual(
    mesh: &Mesh,
    region_id: usize,
    dof: &IndexMap,
    lx: &DVector<f64>,
    r: &mut DVector<f64>,
    mode: &mut InsertMode,
    time: &TimeContext,
) -> Result<()> {
    let region = mesh.region(region_id);
    match region.kind {
        RegionKind::Semiconductor => {
            semiconductor::time_dependent_residual(region, region_id, dof, lx, r, mode, time)
        }
        RegionKind::Insulator | RegionKind::Metal => {
            conductor::time_dependent_residual(region, region_id, dof, lx, r, mode, time)
        }
        RegionKind::Vacuum => Ok(()),
    }
}

/// Region dispatch for the BDF storage-term Jacobian.
pub fn region_time_dependent_jacobian(
    mesh: &Mesh,
    region_id: usize,
    dof: &IndexMap,
    lx: &DVector<f64>,
    j: &mut SysMatrix,
    mode: &mut InsertMode,
    time: &TimeContext,
) -> Result<()> {
    let region = mesh.region(region_id);
    match region.kind {
        RegionKind::Semiconductor => {
            semiconductor::time_dependent_jacobian(region, region_id, dof, lx, j, mode, time)
        }
        RegionKind::Insulator | RegionKind::Metal => {
            conductor::time_dependent_jacobian(region, region_id, dof, lx, j, mode, time)
        }
        RegionKind::Vacuum => Ok(()),
    }
}

/// Interpolation constraints for hanging nodes, residual side. Every
/// active variable of the hanging node is tied to the weighted parent
/// combination.
pub fn region_hanging_node_residual(
    mesh: &Mesh,
    region_id: usize,
    dof: &IndexMap,
    lx: &DVector<f64>,
    r: &mut DVector<f64>,
    mode: &mut InsertMode,
) {
    let region = mesh.region(region_id);
    if region.hanging.is_empty() {
        return;
    }
    mode.promote(InsertMode::Add);
    let nv = region.n_variables();
    for hn in &region.hanging {
        let row_base = dof.local_offset(region_id, hn.node);
        for a in 0..nv {
            let mut constraint = lx[row_base + a];
            for &(parent, weight) in &hn.parents {
                constraint -= weight * lx[dof.local_offset(region_id, parent) + a];
            }
            r[row_base + a] += constraint;
        }
    }
}

/// Hanging-node constraints, Jacobian side.
pub fn region_hanging_node_jacobian(
    mesh: &Mesh,
    region_id: usize,
    dof: &IndexMap,
    j: &mut SysMatrix,
    mode: &mut InsertMode,
) {
    let region = mesh.region(region_id);
    if region.hanging.is_empty() {
        return;
    }
    mode.promote(InsertMode::Add);
    let nv = region.n_variables();
    for hn in &region.hanging {
        let row_base = dof.local_offset(region_id, hn.node);
        for a in 0..nv {
            j.set(row_base + a, row_base + a, 1.0, *mode);
            for &(parent, weight) in &hn.parents {
                let col = dof.local_offset(region_id, parent) + a;
                j.set(row_base + a, col, -weight, *mode);
            }
        }
    }
}

/// Scatter an accepted iterate back into the per-node data of every
/// region.
pub fn update_solution(mesh: &mut Mesh, dof: &IndexMap, lx: &DVector<f64>) {
    for region_id in 0..mesh.n_regions() {
        let kind = mesh.region(region_id).kind;
        match kind {
            RegionKind::Semiconductor => {
                semiconductor::update_solution(mesh.region_mut(region_id), region_id, dof, lx)
            }
            RegionKind::Insulator | RegionKind::Metal => {
                conductor::update_solution(mesh.region_mut(region_id), region_id, dof, lx)
            }
            RegionKind::Vacuum => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::builder::{semiconductor_bar, uniform_line};
    use crate::discretization::mesh::{AdvancedModel, HangingNode};
    use crate::units::UM;
    use nalgebra::DVector;

    #[test]
    fn hanging_node_constraint_rows() {
        let coords = uniform_line(0.0, 1.0 * UM, 3);
        let mut region = semiconductor_bar(
            "bar",
            &coords,
            1e-8,
            material::Material::silicon(),
            AdvancedModel::default(),
            |_| 1e16,
            300.0,
        );
        region.hanging.push(HangingNode {
            node: 2,
            parents: vec![(0, 0.5), (1, 0.5)],
        });
        let mesh = Mesh { regions: vec![region], t_external: 300.0 };
        let dof = crate::dofmap::IndexMap::build(&mesh, 0);

        let mut lx = DVector::zeros(dof.n_rows());
        // psi at the three nodes: 1, 3, 4 (midpoint would be 2)
        lx[dof.local_offset(0, 0)] = 1.0;
        lx[dof.local_offset(0, 1)] = 3.0;
        lx[dof.local_offset(0, 2)] = 4.0;

        let mut r = DVector::zeros(dof.n_rows());
        let mut mode = crate::numerics::linear::InsertMode::NotSet;
        region_hanging_node_residual(&mesh, 0, &dof, &lx, &mut r, &mut mode);
        assert_eq!(mode, crate::numerics::linear::InsertMode::Add);
        assert!((r[dof.local_offset(0, 2)] - 2.0).abs() < 1e-14);

        let mut j = crate::numerics::linear::SysMatrix::new(dof.n_rows());
        let mut mode = crate::numerics::linear::InsertMode::NotSet;
        region_hanging_node_jacobian(&mesh, 0, &dof, &mut j, &mut mode);
        let row = dof.local_offset(0, 2);
        assert_eq!(j.get(row, row), 1.0);
        assert_eq!(j.get(row, dof.local_offset(0, 0)), -0.5);
    }

    #[test]
    fn bernoulli_limits() {
        assert!((bern(0.0_f64) - 1.0).abs() < 1e-14);
        assert!((bern(1e-6_f64) - (1.0 - 0.5e-6)).abs() < 1e-12);
        // large negative argument: B(x) -> -x
        assert!((bern(-100.0_f64) - 100.0).abs() < 1e-9);
        // large positive argument underflows to zero without NaN
        let b = bern(800.0_f64);
        assert!(b.is_finite() && b >= 0.0);
        // detailed balance identity B(-x) = B(x) e^x
        let x = 3.7_f64;
        assert!((bern(-x) - bern(x) * x.exp()).abs() < 1e-12);
    }
}
