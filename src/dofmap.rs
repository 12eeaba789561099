//! Global degree-of-freedom layout.
//!
//! The unified state vector concatenates, region by region, every
//! on-processor node's variable block (contiguous, in the region's
//! declared order), followed by the circuit unknowns on the last rank.
//! Offsets are stable for the lifetime of a partition; the map is
//! rebuilt only when the partition changes.

use crate::discretization::mesh::{Mesh, Variable};
use crate::error::{Result, SolverError};

pub struct IndexMap {
    region_base: Vec<usize>,
    region_nvar: Vec<usize>,
    circuit_base: usize,
    n_circuit: usize,
    n_rows: usize,
}

impl IndexMap {
    pub fn build(mesh: &Mesh, n_circuit: usize) -> Self {
        let mut region_base = Vec::with_capacity(mesh.n_regions());
        let mut region_nvar = Vec::with_capacity(mesh.n_regions());
        let mut base = 0usize;
        for region in &mesh.regions {
            region_base.push(base);
            let nvar = region.n_variables();
            region_nvar.push(nvar);
            base += nvar * region.nodes.len();
        }
        Self {
            region_base,
            region_nvar,
            circuit_base: base,
            n_circuit,
            n_rows: base + n_circuit,
        }
    }

    /// Global row of (region, node, variable). Querying a kind the
    /// region has disabled is a programmer bug.
    pub fn offset(&self, mesh: &Mesh, region: usize, node: usize, var: Variable) -> Result<usize> {
        let off = mesh.region(region).variable_offset(var).ok_or(SolverError::Index {
            region,
            var: var.name(),
        })?;
        Ok(self.local_offset(region, node) + off)
    }

    /// Row base of the node's variable block.
    pub fn local_offset(&self, region: usize, node: usize) -> usize {
        self.region_base[region] + node * self.region_nvar[region]
    }

    pub fn n_variables(&self, region: usize) -> usize {
        self.region_nvar[region]
    }

    /// Solution-vector row of a circuit node.
    pub fn circuit_offset_x(&self, ckt_node: usize) -> usize {
        debug_assert!(ckt_node < self.n_circuit);
        self.circuit_base + ckt_node
    }

    /// Residual-vector row of a circuit node. The layout keeps the
    /// residual rows aligned with the solution rows.
    pub fn circuit_offset_f(&self, ckt_node: usize) -> usize {
        self.circuit_offset_x(ckt_node)
    }

    pub fn n_circuit(&self) -> usize {
        self.n_circuit
    }

    /// Rows owned by the device regions (everything below the circuit
    /// block).
    pub fn device_rows(&self) -> usize {
        self.circuit_base
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::builder::{semiconductor_bar, uniform_line};
    use crate::discretization::mesh::{AdvancedModel, Mesh, Variable};
    use crate::physics::material::Material;
    use crate::units::UM;

    fn two_region_mesh() -> Mesh {
        let coords = uniform_line(0.0, 1.0 * UM, 5);
        let bulk = semiconductor_bar(
            "bulk",
            &coords,
            1e-8,
            Material::silicon(),
            AdvancedModel { enable_tl: true, ..Default::default() },
            |_| 1e16,
            300.0,
        );
        let cap = semiconductor_bar(
            "cap",
            &coords,
            1e-8,
            Material::silicon(),
            AdvancedModel::default(),
            |_| -1e16,
            300.0,
        );
        Mesh { regions: vec![bulk, cap], t_external: 300.0 }
    }

    #[test]
    fn blocks_are_contiguous_per_node() {
        let mesh = two_region_mesh();
        let dof = IndexMap::build(&mesh, 3);

        // region 0 has psi,n,p,Tl
        assert_eq!(dof.n_variables(0), 4);
        assert_eq!(dof.offset(&mesh, 0, 0, Variable::Potential).unwrap(), 0);
        assert_eq!(dof.offset(&mesh, 0, 0, Variable::LatticeTemp).unwrap(), 3);
        assert_eq!(dof.offset(&mesh, 0, 2, Variable::Electron).unwrap(), 2 * 4 + 1);

        // region 1 follows region 0 without gaps
        assert_eq!(dof.local_offset(1, 0), 5 * 4);
        assert_eq!(dof.n_variables(1), 3);

        // circuit rows sit at the tail
        assert_eq!(dof.device_rows(), 5 * 4 + 5 * 3);
        assert_eq!(dof.circuit_offset_x(2), dof.device_rows() + 2);
        assert_eq!(dof.n_rows(), dof.device_rows() + 3);
    }

    #[test]
    fn disabled_variable_is_an_index_error() {
        let mesh = two_region_mesh();
        let dof = IndexMap::build(&mesh, 0);
        let err = dof.offset(&mesh, 1, 0, Variable::ElecTemp).unwrap_err();
        assert!(matches!(err, crate::error::SolverError::Index { region: 1, .. }));
    }
}
