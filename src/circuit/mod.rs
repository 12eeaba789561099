//! External circuit engine and its bridge into the unified system.
//!
//! The circuit is a nonlinear MNA DAE living on the last rank: node
//! voltages plus branch currents for voltage sources, with KCL
//! residual rows for voltage nodes and branch equations for current
//! nodes. The solver sees it only through the bridge operations
//! (fill/residual/jacobian/save/restore/norm); electrode coupling is
//! wired by the spice-electrode boundary condition through the row
//! preprocess.

use nalgebra::DVector;

use crate::dofmap::IndexMap;
use crate::error::Result;
use crate::numerics::bdf::TimeContext;
use crate::numerics::linear::{InsertMode, SysMatrix};
use crate::units::thermal_voltage;

/// Circuit unknown classification: nodal voltage or branch current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CktNodeKind {
    Voltage,
    Current,
}

#[derive(Clone, Debug)]
pub struct CktNode {
    pub name: String,
    pub kind: CktNodeKind,
}

/// Source waveform. `eval(t)` with t = 0 gives the operating-point
/// value.
#[derive(Clone, Copy, Debug)]
pub enum Waveform {
    Dc(f64),
    Step { t0: f64, v0: f64, v1: f64 },
}

impl Waveform {
    pub fn eval(&self, t: f64) -> f64 {
        match *self {
            Waveform::Dc(v) => v,
            Waveform::Step { t0, v0, v1 } => {
                if t > t0 {
                    v1
                } else {
                    v0
                }
            }
        }
    }
}

enum Element {
    Resistor {
        a: Option<usize>,
        b: Option<usize>,
        res: f64,
    },
    Capacitor {
        a: Option<usize>,
        b: Option<usize>,
        cap: f64,
        v_last: f64,
        v_last_last: f64,
    },
    VSource {
        pos: Option<usize>,
        neg: Option<usize>,
        branch: usize,
        wave: Waveform,
    },
    ISource {
        pos: Option<usize>,
        neg: Option<usize>,
        wave: Waveform,
    },
    Diode {
        pos: Option<usize>,
        neg: Option<usize>,
        is_sat: f64,
        ideality: f64,
    },
}

/// Exponential with a linear extension beyond u = 40 so a wild Newton
/// trial cannot overflow the diode law.
fn limited_exp(u: f64) -> (f64, f64) {
    if u > 40.0 {
        let e = 40f64.exp();
        (e * (1.0 + (u - 40.0)), e)
    } else {
        let e = u.exp();
        (e, e)
    }
}

pub struct SpiceCircuit {
    nodes: Vec<CktNode>,
    elements: Vec<Element>,
    solution: DVector<f64>,
    saved: DVector<f64>,
    last_residual: DVector<f64>,
    temperature: f64,
}

impl SpiceCircuit {
    pub fn new(temperature: f64) -> Self {
        Self {
            nodes: Vec::new(),
            elements: Vec::new(),
            solution: DVector::zeros(0),
            saved: DVector::zeros(0),
            last_residual: DVector::zeros(0),
            temperature,
        }
    }

    pub fn add_node(&mut self, name: impl Into<String>) -> usize {
        self.nodes.push(CktNode {
            name: name.into(),
            kind: CktNodeKind::Voltage,
        });
        self.resize();
        self.nodes.len() - 1
    }

    pub fn add_resistor(&mut self, a: Option<usize>, b: Option<usize>, res: f64) {
        self.elements.push(Element::Resistor { a, b, res });
    }

    pub fn add_capacitor(&mut self, a: Option<usize>, b: Option<usize>, cap: f64) {
        self.elements.push(Element::Capacitor {
            a,
            b,
            cap,
            v_last: 0.0,
            v_last_last: 0.0,
        });
    }

    /// Adds the branch-current unknown along with the source.
    pub fn add_vsource(&mut self, pos: Option<usize>, neg: Option<usize>, wave: Waveform) -> usize {
        self.nodes.push(CktNode {
            name: format!("branch{}", self.nodes.len()),
            kind: CktNodeKind::Current,
        });
        self.resize();
        let branch = self.nodes.len() - 1;
        self.elements.push(Element::VSource { pos, neg, branch, wave });
        branch
    }

    pub fn add_isource(&mut self, pos: Option<usize>, neg: Option<usize>, wave: Waveform) {
        self.elements.push(Element::ISource { pos, neg, wave });
    }

    pub fn add_diode(&mut self, pos: Option<usize>, neg: Option<usize>, is_sat: f64, ideality: f64) {
        self.elements.push(Element::Diode { pos, neg, is_sat, ideality });
    }

    fn resize(&mut self) {
        let n = self.nodes.len();
        self.solution = self.solution.clone().resize_vertically(n, 0.0);
        self.saved = self.saved.clone().resize_vertically(n, 0.0);
        self.last_residual = self.last_residual.clone().resize_vertically(n, 0.0);
    }

    pub fn n_ckt_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_name(&self, i: usize) -> &str {
        &self.nodes[i].name
    }

    pub fn is_voltage_node(&self, i: usize) -> bool {
        self.nodes[i].kind == CktNodeKind::Voltage
    }

    pub fn is_current_node(&self, i: usize) -> bool {
        self.nodes[i].kind == CktNodeKind::Current
    }

    pub fn voltage(&self, node: usize) -> f64 {
        self.solution[node]
    }

    fn v_at(&self, lx: &DVector<f64>, dof: &IndexMap, node: Option<usize>) -> f64 {
        node.map(|i| lx[dof.circuit_offset_x(i)]).unwrap_or(0.0)
    }

    /// Write the circuit state into the unified vector.
    pub fn fill_value(&self, dof: &IndexMap, x: &mut DVector<f64>, l: &mut DVector<f64>) {
        for i in 0..self.nodes.len() {
            x[dof.circuit_offset_x(i)] = self.solution[i];
            l[dof.circuit_offset_x(i)] = 1.0;
        }
    }

    /// KCL and branch residuals at simulation time `t`. The circuit's
    /// own contribution is cached for `residual_norm2`.
    pub fn residual(
        &mut self,
        dof: &IndexMap,
        lx: &DVector<f64>,
        r: &mut DVector<f64>,
        mode: &mut InsertMode,
        time: Option<&TimeContext>,
        t: f64,
    ) -> Result<()> {
        mode.promote(InsertMode::Add);
        let vt = thermal_voltage(self.temperature);
        let mut local = DVector::<f64>::zeros(self.nodes.len());

        let mut kcl = |local: &mut DVector<f64>, node: Option<usize>, current: f64| {
            if let Some(i) = node {
                local[i] += current;
            }
        };

        for element in &self.elements {
            match element {
                Element::Resistor { a, b, res } => {
                    let i = (self.v_at(lx, dof, *a) - self.v_at(lx, dof, *b)) / res;
                    kcl(&mut local, *a, i);
                    kcl(&mut local, *b, -i);
                }
                Element::Capacitor { a, b, cap, v_last, v_last_last } => {
                    if let Some(ctx) = time {
                        let vd = self.v_at(lx, dof, *a) - self.v_at(lx, dof, *b);
                        let i = cap * (ctx.lead() * vd - ctx.hist(*v_last, *v_last_last));
                        kcl(&mut local, *a, i);
                        kcl(&mut local, *b, -i);
                    }
                }
                Element::VSource { pos, neg, branch, wave } => {
                    let i_branch = lx[dof.circuit_offset_x(*branch)];
                    kcl(&mut local, *pos, i_branch);
                    kcl(&mut local, *neg, -i_branch);
                    local[*branch] +=
                        self.v_at(lx, dof, *pos) - self.v_at(lx, dof, *neg) - wave.eval(t);
                }
                Element::ISource { pos, neg, wave } => {
                    let i = wave.eval(t);
                    kcl(&mut local, *pos, i);
                    kcl(&mut local, *neg, -i);
                }
                Element::Diode { pos, neg, is_sat, ideality } => {
                    let vd = self.v_at(lx, dof, *pos) - self.v_at(lx, dof, *neg);
                    let (e, _) = limited_exp(vd / (ideality * vt));
                    let i = is_sat * (e - 1.0);
                    kcl(&mut local, *pos, i);
                    kcl(&mut local, *neg, -i);
                }
            }
        }

        for i in 0..self.nodes.len() {
            r[dof.circuit_offset_f(i)] += local[i];
        }
        self.last_residual.copy_from(&local);
        Ok(())
    }

    pub fn jacobian(
        &self,
        dof: &IndexMap,
        lx: &DVector<f64>,
        j: &mut SysMatrix,
        mode: &mut InsertMode,
        time: Option<&TimeContext>,
        _t: f64,
    ) -> Result<()> {
        mode.promote(InsertMode::Add);
        let vt = thermal_voltage(self.temperature);

        let mut stamp_conductance =
            |j: &mut SysMatrix, a: Option<usize>, b: Option<usize>, g: f64, mode: InsertMode| {
                if let Some(i) = a {
                    j.set(dof.circuit_offset_f(i), dof.circuit_offset_x(i), g, mode);
                }
                if let Some(i) = b {
                    j.set(dof.circuit_offset_f(i), dof.circuit_offset_x(i), g, mode);
                }
                if let (Some(ia), Some(ib)) = (a, b) {
                    j.set(dof.circuit_offset_f(ia), dof.circuit_offset_x(ib), -g, mode);
                    j.set(dof.circuit_offset_f(ib), dof.circuit_offset_x(ia), -g, mode);
                }
            };

        for element in &self.elements {
            match element {
                Element::Resistor { a, b, res } => {
                    stamp_conductance(j, *a, *b, 1.0 / res, *mode);
                }
                Element::Capacitor { a, b, cap, .. } => {
                    if let Some(ctx) = time {
                        stamp_conductance(j, *a, *b, cap * ctx.lead(), *mode);
                    }
                }
                Element::VSource { pos, neg, branch, .. } => {
                    let br_f = dof.circuit_offset_f(*branch);
                    let br_x = dof.circuit_offset_x(*branch);
                    if let Some(i) = pos {
                        j.set(dof.circuit_offset_f(*i), br_x, 1.0, *mode);
                        j.set(br_f, dof.circuit_offset_x(*i), 1.0, *mode);
                    }
                    if let Some(i) = neg {
                        j.set(dof.circuit_offset_f(*i), br_x, -1.0, *mode);
                        j.set(br_f, dof.circuit_offset_x(*i), -1.0, *mode);
                    }
                }
                Element::ISource { .. } => {}
                Element::Diode { pos, neg, is_sat, ideality } => {
                    let vd = self.v_at(lx, dof, *pos) - self.v_at(lx, dof, *neg);
                    let nvt = ideality * vt;
                    let (_, de) = limited_exp(vd / nvt);
                    let g = (is_sat * de / nvt).max(1e-12);
                    stamp_conductance(j, *pos, *neg, g, *mode);
                }
            }
        }

        Ok(())
    }

    /// Scatter the accepted unified iterate back into the circuit
    /// state.
    pub fn update_solution(&mut self, dof: &IndexMap, lx: &DVector<f64>) {
        for i in 0..self.nodes.len() {
            self.solution[i] = lx[dof.circuit_offset_x(i)];
        }
    }

    /// Snapshot for divergence rollback; taken on every accepted step.
    pub fn save_solution(&mut self) {
        self.saved.copy_from(&self.solution);
    }

    pub fn restore_solution(&mut self) {
        self.solution.copy_from(&self.saved);
    }

    /// Rotate the element histories after an accepted time step.
    pub fn rotate_history(&mut self, dof: &IndexMap, lx: &DVector<f64>) {
        let volt = |node: &Option<usize>| -> f64 {
            node.map(|i| lx[dof.circuit_offset_x(i)]).unwrap_or(0.0)
        };
        for element in &mut self.elements {
            if let Element::Capacitor { a, b, v_last, v_last_last, .. } = element {
                *v_last_last = *v_last;
                *v_last = volt(a) - volt(b);
            }
        }
    }

    /// Capture the fully assembled circuit rows after the boundary
    /// preprocess merged the device terminal currents into the KCL
    /// equations; this is what `residual_norm2` reports.
    pub fn capture_assembled_residual(&mut self, dof: &IndexMap, r: &DVector<f64>) {
        for i in 0..self.nodes.len() {
            self.last_residual[i] = r[dof.circuit_offset_f(i)];
        }
    }

    /// L2 norm of the circuit residual rows from the last assembly.
    pub fn residual_norm2(&self) -> f64 {
        self.last_residual.norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::mesh::Mesh;

    fn empty_mesh() -> Mesh {
        Mesh { regions: Vec::new(), t_external: 300.0 }
    }

    /// 10 V source across a 1k/3k divider: v1 = 10, v2 = 7.5,
    /// branch current = -2.5 mA by the leaving-current convention.
    #[test]
    fn resistor_divider_residual_vanishes_at_solution() {
        let mut ckt = SpiceCircuit::new(300.0);
        let v1 = ckt.add_node("v1");
        let v2 = ckt.add_node("v2");
        let branch = ckt.add_vsource(Some(v1), None, Waveform::Dc(10.0));
        ckt.add_resistor(Some(v1), Some(v2), 1000.0);
        ckt.add_resistor(Some(v2), None, 3000.0);

        let mesh = empty_mesh();
        let dof = crate::dofmap::IndexMap::build(&mesh, ckt.n_ckt_nodes());

        let mut x = DVector::zeros(dof.n_rows());
        x[dof.circuit_offset_x(v1)] = 10.0;
        x[dof.circuit_offset_x(v2)] = 7.5;
        x[dof.circuit_offset_x(branch)] = -2.5e-3;

        let mut r = DVector::zeros(dof.n_rows());
        let mut mode = InsertMode::NotSet;
        ckt.residual(&dof, &x, &mut r, &mut mode, None, 0.0).unwrap();

        assert!(r.amax() < 1e-12, "residual {:?}", r);
        assert!(ckt.residual_norm2() < 1e-12);
        assert!(ckt.is_voltage_node(v1) && ckt.is_current_node(branch));
    }

    #[test]
    fn diode_jacobian_matches_finite_difference() {
        let mut ckt = SpiceCircuit::new(300.0);
        let v1 = ckt.add_node("v1");
        ckt.add_diode(Some(v1), None, 1e-14, 1.0);

        let mesh = empty_mesh();
        let dof = crate::dofmap::IndexMap::build(&mesh, ckt.n_ckt_nodes());

        let mut x = DVector::zeros(dof.n_rows());
        x[dof.circuit_offset_x(v1)] = 0.55;

        let mut j = SysMatrix::new(dof.n_rows());
        let mut mode = InsertMode::NotSet;
        ckt.jacobian(&dof, &x, &mut j, &mut mode, None, 0.0).unwrap();

        let h = 1e-7;
        let mut r0 = DVector::zeros(dof.n_rows());
        let mut r1 = DVector::zeros(dof.n_rows());
        let mut m = InsertMode::NotSet;
        ckt.residual(&dof, &x, &mut r0, &mut m, None, 0.0).unwrap();
        x[dof.circuit_offset_x(v1)] += h;
        ckt.residual(&dof, &x, &mut r1, &mut m, None, 0.0).unwrap();

        let fd = (r1[dof.circuit_offset_f(v1)] - r0[dof.circuit_offset_f(v1)]) / h;
        let an = j.get(dof.circuit_offset_f(v1), dof.circuit_offset_x(v1));
        assert!((fd - an).abs() / an.abs() < 1e-5, "fd {fd} vs analytic {an}");
    }

    #[test]
    fn save_and_restore_round_trip() {
        let mut ckt = SpiceCircuit::new(300.0);
        let v1 = ckt.add_node("v1");
        ckt.solution[v1] = 1.25;
        ckt.save_solution();
        ckt.solution[v1] = -4.0;
        ckt.restore_solution();
        assert_eq!(ckt.voltage(v1), 1.25);
    }
}
