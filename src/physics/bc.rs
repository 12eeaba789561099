//! Boundary-condition assemblers.
//!
//! Every boundary condition works in two phases. `preprocess` names
//! the row rewrites the driver must perform before insertion: each
//! src row is added into its dst row (in both the residual and the
//! Jacobian) and every clear row is zeroed. `assemble_*` then writes
//! the condition's own rows into the post-preprocess structure.
//!
//! The spice electrode exploits the charge-signed continuity rows:
//! adding a contact node's electron and hole rows into the bound
//! circuit KCL row injects exactly the terminal current (the
//! recombination terms cancel between the two rows), and the Dirichlet
//! potential row then reads the circuit nodal voltage from the unified
//! vector.

use nalgebra::DVector;

use crate::circuit::Waveform;
use crate::discretization::mesh::{Mesh, Variable};
use crate::dofmap::IndexMap;
use crate::error::Result;
use crate::numerics::linear::{InsertMode, SysMatrix};
use crate::physics::semiconductor::{builtin_potential, equilibrium_carriers};
use crate::units::thermal_voltage;

/// Row rewrites requested by a boundary condition's preprocess phase.
#[derive(Default, Clone)]
pub struct RowOps {
    pub src: Vec<usize>,
    pub dst: Vec<usize>,
    pub clear: Vec<usize>,
}

impl RowOps {
    pub fn merge(&mut self, other: RowOps) {
        self.src.extend(other.src);
        self.dst.extend(other.dst);
        self.clear.extend(other.clear);
    }
}

/// Ohmic contact driven by an applied bias waveform.
pub struct OhmicContact {
    pub name: String,
    pub region: usize,
    pub nodes: Vec<usize>,
    pub bias: Waveform,
}

/// Ohmic contact tied to an external circuit node; `None` binds the
/// electrode to circuit ground.
pub struct SpiceElectrode {
    pub name: String,
    pub region: usize,
    pub nodes: Vec<usize>,
    pub ckt_node: Option<usize>,
}

/// Potential Dirichlet contact on an insulator or metal region, e.g.
/// a MOS gate. The workfunction offsets the applied bias.
pub struct GateContact {
    pub name: String,
    pub region: usize,
    pub nodes: Vec<usize>,
    pub bias: Waveform,
    pub workfunction: f64,
}

/// Continuity of the potential across a semiconductor/insulator
/// interface. Node lists are paired element-wise.
pub struct InsulatorInterface {
    pub name: String,
    pub semi_region: usize,
    pub semi_nodes: Vec<usize>,
    pub ins_region: usize,
    pub ins_nodes: Vec<usize>,
}

pub enum BoundaryCondition {
    Ohmic(OhmicContact),
    Gate(GateContact),
    SpiceElectrode(SpiceElectrode),
    InsulatorInterface(InsulatorInterface),
}

impl BoundaryCondition {
    pub fn name(&self) -> &str {
        match self {
            BoundaryCondition::Ohmic(bc) => &bc.name,
            BoundaryCondition::Gate(bc) => &bc.name,
            BoundaryCondition::SpiceElectrode(bc) => &bc.name,
            BoundaryCondition::InsulatorInterface(bc) => &bc.name,
        }
    }

    pub fn is_spice_electrode(&self) -> bool {
        matches!(self, BoundaryCondition::SpiceElectrode(_))
    }

    /// Rows owned by a contact node: the Dirichlet replacements for
    /// every active variable.
    fn contact_rows(dof: &IndexMap, region: usize, node: usize) -> Vec<usize> {
        let nv = dof.n_variables(region);
        let base = dof.local_offset(region, node);
        (0..nv).map(|a| base + a).collect()
    }

    /// Potential Dirichlet rows of an electrode-type condition; they
    /// feed the electrode norm of the convergence test. Interfaces
    /// contribute nothing.
    pub fn electrode_rows(&self, mesh: &Mesh, dof: &IndexMap) -> Result<Vec<usize>> {
        let mut rows = Vec::new();
        match self {
            BoundaryCondition::Ohmic(bc) => {
                for &node in &bc.nodes {
                    rows.push(dof.offset(mesh, bc.region, node, Variable::Potential)?);
                }
            }
            BoundaryCondition::Gate(bc) => {
                for &node in &bc.nodes {
                    rows.push(dof.offset(mesh, bc.region, node, Variable::Potential)?);
                }
            }
            BoundaryCondition::SpiceElectrode(bc) => {
                for &node in &bc.nodes {
                    rows.push(dof.offset(mesh, bc.region, node, Variable::Potential)?);
                }
            }
            BoundaryCondition::InsulatorInterface(_) => {}
        }
        Ok(rows)
    }

    /// Structure rewrite requests; identical for the residual and the
    /// Jacobian pass.
    pub fn preprocess(&self, mesh: &Mesh, dof: &IndexMap) -> Result<RowOps> {
        let mut ops = RowOps::default();
        match self {
            BoundaryCondition::Ohmic(bc) => {
                for &node in &bc.nodes {
                    ops.clear
                        .extend(Self::contact_rows(dof, bc.region, node));
                }
            }
            BoundaryCondition::Gate(bc) => {
                for &node in &bc.nodes {
                    ops.clear
                        .extend(Self::contact_rows(dof, bc.region, node));
                }
            }
            BoundaryCondition::SpiceElectrode(bc) => {
                for &node in &bc.nodes {
                    if let Some(ckt) = bc.ckt_node {
                        let kcl = dof.circuit_offset_f(ckt);
                        let n_row = dof.offset(mesh, bc.region, node, Variable::Electron)?;
                        let p_row = dof.offset(mesh, bc.region, node, Variable::Hole)?;
                        ops.src.push(n_row);
                        ops.dst.push(kcl);
                        ops.src.push(p_row);
                        ops.dst.push(kcl);
                    }
                    ops.clear
                        .extend(Self::contact_rows(dof, bc.region, node));
                }
            }
            BoundaryCondition::InsulatorInterface(bc) => {
                for (&ins, &semi) in bc.ins_nodes.iter().zip(&bc.semi_nodes) {
                    let ins_row = dof.offset(mesh, bc.ins_region, ins, Variable::Potential)?;
                    let semi_row = dof.offset(mesh, bc.semi_region, semi, Variable::Potential)?;
                    ops.src.push(ins_row);
                    ops.dst.push(semi_row);
                    ops.clear.push(ins_row);
                }
            }
        }
        Ok(ops)
    }

    /// Dirichlet rows of an ohmic-style contact at a given applied
    /// voltage.
    #[allow(clippy::too_many_arguments)]
    fn ohmic_rows_residual(
        mesh: &Mesh,
        dof: &IndexMap,
        region_id: usize,
        node: usize,
        v_applied: f64,
        lx: &DVector<f64>,
        r: &mut DVector<f64>,
    ) -> Result<()> {
        let region = mesh.region(region_id);
        let ni = region.material.ni;
        let t_ext = mesh.t_external;
        let vt = thermal_voltage(t_ext);
        let c = region.data[node].doping;
        let (n_eq, p_eq) = equilibrium_carriers(c, ni);

        let psi_row = dof.offset(mesh, region_id, node, Variable::Potential)?;
        let n_row = dof.offset(mesh, region_id, node, Variable::Electron)?;
        let p_row = dof.offset(mesh, region_id, node, Variable::Hole)?;

        r[psi_row] = lx[psi_row] - (v_applied + builtin_potential(c, ni, vt));
        r[n_row] = lx[n_row] - n_eq;
        r[p_row] = lx[p_row] - p_eq;

        if region.advanced.enable_tl {
            let row = dof.offset(mesh, region_id, node, Variable::LatticeTemp)?;
            r[row] = lx[row] - t_ext;
        }
        if region.advanced.enable_tn {
            let row = dof.offset(mesh, region_id, node, Variable::ElecTemp)?;
            r[row] = lx[row] - n_eq * t_ext;
        }
        if region.advanced.enable_tp {
            let row = dof.offset(mesh, region_id, node, Variable::HoleTemp)?;
            r[row] = lx[row] - p_eq * t_ext;
        }
        Ok(())
    }

    fn ohmic_rows_jacobian(
        mesh: &Mesh,
        dof: &IndexMap,
        region_id: usize,
        node: usize,
        j: &mut SysMatrix,
        mode: InsertMode,
    ) -> Result<()> {
        for row in Self::contact_rows(dof, region_id, node) {
            j.set(row, row, 1.0, mode);
        }
        Ok(())
    }

    /// Residual insertion after the driver applied the row rewrites.
    pub fn assemble_residual(
        &self,
        mesh: &Mesh,
        dof: &IndexMap,
        lx: &DVector<f64>,
        r: &mut DVector<f64>,
        mode: &mut InsertMode,
        t: f64,
    ) -> Result<()> {
        mode.promote(InsertMode::Insert);
        match self {
            BoundaryCondition::Ohmic(bc) => {
                let v = bc.bias.eval(t);
                for &node in &bc.nodes {
                    Self::ohmic_rows_residual(mesh, dof, bc.region, node, v, lx, r)?;
                }
            }
            BoundaryCondition::Gate(bc) => {
                let v = bc.bias.eval(t) - bc.workfunction;
                let region = mesh.region(bc.region);
                for &node in &bc.nodes {
                    let psi_row = dof.offset(mesh, bc.region, node, Variable::Potential)?;
                    r[psi_row] = lx[psi_row] - v;
                    if region.advanced.enable_tl {
                        let row = dof.offset(mesh, bc.region, node, Variable::LatticeTemp)?;
                        r[row] = lx[row] - mesh.t_external;
                    }
                }
            }
            BoundaryCondition::SpiceElectrode(bc) => {
                let v = bc
                    .ckt_node
                    .map(|ckt| lx[dof.circuit_offset_x(ckt)])
                    .unwrap_or(0.0);
                for &node in &bc.nodes {
                    Self::ohmic_rows_residual(mesh, dof, bc.region, node, v, lx, r)?;
                }
            }
            BoundaryCondition::InsulatorInterface(bc) => {
                for (&ins, &semi) in bc.ins_nodes.iter().zip(&bc.semi_nodes) {
                    let ins_row = dof.offset(mesh, bc.ins_region, ins, Variable::Potential)?;
                    let semi_row = dof.offset(mesh, bc.semi_region, semi, Variable::Potential)?;
                    r[ins_row] = lx[ins_row] - lx[semi_row];
                }
            }
        }
        Ok(())
    }

    /// Jacobian insertion after the row rewrites.
    pub fn assemble_jacobian(
        &self,
        mesh: &Mesh,
        dof: &IndexMap,
        _lx: &DVector<f64>,
        j: &mut SysMatrix,
        mode: &mut InsertMode,
        _t: f64,
    ) -> Result<()> {
        mode.promote(InsertMode::Insert);
        match self {
            BoundaryCondition::Ohmic(bc) => {
                for &node in &bc.nodes {
                    Self::ohmic_rows_jacobian(mesh, dof, bc.region, node, j, *mode)?;
                }
            }
            BoundaryCondition::Gate(bc) => {
                for &node in &bc.nodes {
                    Self::ohmic_rows_jacobian(mesh, dof, bc.region, node, j, *mode)?;
                }
            }
            BoundaryCondition::SpiceElectrode(bc) => {
                for &node in &bc.nodes {
                    Self::ohmic_rows_jacobian(mesh, dof, bc.region, node, j, *mode)?;
                    if let Some(ckt) = bc.ckt_node {
                        let psi_row = dof.offset(mesh, bc.region, node, Variable::Potential)?;
                        j.set(psi_row, dof.circuit_offset_x(ckt), -1.0, *mode);
                    }
                }
            }
            BoundaryCondition::InsulatorInterface(bc) => {
                for (&ins, &semi) in bc.ins_nodes.iter().zip(&bc.semi_nodes) {
                    let ins_row = dof.offset(mesh, bc.ins_region, ins, Variable::Potential)?;
                    let semi_row = dof.offset(mesh, bc.semi_region, semi, Variable::Potential)?;
                    j.set(ins_row, ins_row, 1.0, *mode);
                    j.set(ins_row, semi_row, -1.0, *mode);
                }
            }
        }
        Ok(())
    }

    /// Reserve the off-pattern positions this condition will write, so
    /// the first assembly fixes the sparsity before zero insertions
    /// are forbidden.
    pub fn jacobian_reserve(
        &self,
        mesh: &Mesh,
        dof: &IndexMap,
        j: &mut SysMatrix,
        mode: &mut InsertMode,
    ) -> Result<()> {
        mode.promote(InsertMode::Add);
        if let BoundaryCondition::SpiceElectrode(bc) = self {
            if let Some(ckt) = bc.ckt_node {
                for &node in &bc.nodes {
                    let psi_row = dof.offset(mesh, bc.region, node, Variable::Potential)?;
                    j.add(psi_row, dof.circuit_offset_x(ckt), 0.0);
                }
            }
        }
        Ok(())
    }
}
