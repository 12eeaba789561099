//! BDF1/BDF2 time integration: predictors, local-truncation-error
//! estimation, the BDF2 positivity test and step-size control.

use nalgebra::DVector;

use crate::discretization::mesh::{Mesh, RegionKind, Variable};
use crate::dofmap::IndexMap;
use crate::parallel::Comm;

/// Configured integrator family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TsType {
    Bdf1,
    Bdf2,
}

/// Integration order actually used for a given step. BDF2 runs fall
/// back to `Bdf1` when the positivity test rejects the step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BdfOrder {
    Bdf1,
    Bdf2,
}

/// Step-local integration coefficients handed to the storage-term
/// assemblers: residual contribution is vol * (lead() * u - hist(...)).
#[derive(Clone, Copy, Debug)]
pub struct TimeContext {
    pub order: BdfOrder,
    pub dt: f64,
    pub dt_last: f64,
}

impl TimeContext {
    fn ratio(&self) -> f64 {
        self.dt_last / (self.dt_last + self.dt)
    }

    /// Coefficient of the current value in the discrete time
    /// derivative.
    pub fn lead(&self) -> f64 {
        match self.order {
            BdfOrder::Bdf1 => 1.0 / self.dt,
            BdfOrder::Bdf2 => {
                let r = self.ratio();
                (2.0 - r) / ((1.0 - r) * self.dt)
            }
        }
    }

    /// History combination subtracted from lead()*u.
    pub fn hist(&self, last: f64, last_last: f64) -> f64 {
        match self.order {
            BdfOrder::Bdf1 => last / self.dt,
            BdfOrder::Bdf2 => {
                let r = self.ratio();
                (last / (r * (1.0 - r)) - last_last * (1.0 - r) / r) / self.dt
            }
        }
    }
}

/// Higher-order BDF2 predictor coefficients for steps h_n, h_{n-1},
/// h_{n-2}.
pub fn bdf2_predictor_coeffs(hn: f64, hn1: f64, hn2: f64) -> (f64, f64, f64) {
    let cn = 1.0 + hn * (hn + 2.0 * hn1 + hn2) / (hn1 * (hn1 + hn2));
    let cn1 = -hn * (hn + hn1 + hn2) / (hn1 * hn2);
    let cn2 = hn * (hn + hn1) / (hn2 * (hn1 + hn2));
    (cn, cn1, cn2)
}

/// BDF2 is usable only while the interpolated storage stays positive
/// at every semiconductor node; with r = h_{n-1}/(h_n + h_{n-1}) the
/// condition is a*xi >= b*xi_last for all tracked densities.
pub fn bdf2_positive_defined(mesh: &Mesh, dt: f64, dt_last: f64, comm: &impl Comm) -> bool {
    let r = dt_last / (dt_last + dt);
    let a = 1.0 / (r * (1.0 - r));
    let b = (1.0 - r) / r;

    let mut failure_count = 0usize;
    for region in &mesh.regions {
        if region.kind != RegionKind::Semiconductor {
            continue;
        }
        let adv = &region.advanced;
        for i in region.on_processor_nodes() {
            let d = &region.data[i];
            if a * d.n < b * d.n_last {
                failure_count += 1;
            }
            if a * d.p < b * d.p_last {
                failure_count += 1;
            }
            if adv.enable_tl && a * d.t < b * d.t_last {
                failure_count += 1;
            }
            if adv.enable_tn && a * d.n * d.tn < b * d.n_last * d.tn_last {
                failure_count += 1;
            }
            if adv.enable_tp && a * d.p * d.tp < b * d.p_last * d.tp_last {
                failure_count += 1;
            }
        }
    }

    comm.sum_usize(failure_count) == 0
}

/// Time-step driver state: solution history, prediction and LTE work
/// vectors, and the step-size window.
pub struct TimeIntegrator {
    pub x_n: DVector<f64>,
    pub x_n1: DVector<f64>,
    pub x_n2: DVector<f64>,
    xp: DVector<f64>,
    lte: DVector<f64>,

    pub dt: f64,
    pub dt_last: f64,
    pub dt_last_last: f64,
    pub time: f64,
    pub accepted_steps: usize,
}

impl TimeIntegrator {
    pub fn new(n_rows: usize, dt0: f64) -> Self {
        Self {
            x_n: DVector::zeros(n_rows),
            x_n1: DVector::zeros(n_rows),
            x_n2: DVector::zeros(n_rows),
            xp: DVector::zeros(n_rows),
            lte: DVector::zeros(n_rows),
            dt: dt0,
            dt_last: dt0,
            dt_last_last: dt0,
            time: 0.0,
            accepted_steps: 0,
        }
    }

    /// Seed every history slot from the pre-transient solution.
    pub fn load_history(&mut self, x: &DVector<f64>) {
        self.x_n.copy_from(x);
        self.x_n1.copy_from(x);
        self.x_n2.copy_from(x);
    }

    /// Integration order for the upcoming step.
    pub fn scheme_for_step(
        &self,
        ts_type: TsType,
        mesh: &Mesh,
        comm: &impl Comm,
    ) -> BdfOrder {
        if ts_type == TsType::Bdf2
            && self.accepted_steps >= 1
            && bdf2_positive_defined(mesh, self.dt, self.dt_last, comm)
        {
            BdfOrder::Bdf2
        } else {
            BdfOrder::Bdf1
        }
    }

    /// Fill the prediction vector for the current step sizes.
    pub fn predict(&mut self, ts_type: TsType, bdf2_lower_order: bool) {
        let hn = self.dt;
        let hn1 = self.dt_last;
        let hn2 = self.dt_last_last;

        self.xp.fill(0.0);
        let first_order = ts_type == TsType::Bdf1 || bdf2_lower_order || self.accepted_steps < 2;
        if first_order {
            self.xp.axpy(1.0 + hn / hn1, &self.x_n, 1.0);
            self.xp.axpy(-hn / hn1, &self.x_n1, 1.0);
        } else {
            let (cn, cn1, cn2) = bdf2_predictor_coeffs(hn, hn1, hn2);
            self.xp.axpy(cn, &self.x_n, 1.0);
            self.xp.axpy(cn1, &self.x_n1, 1.0);
            self.xp.axpy(cn2, &self.x_n2, 1.0);
        }
    }

    /// Scaled local-truncation-error norm of a candidate solution.
    ///
    /// Potential rows are masked; every other device variable and the
    /// circuit rows contribute. The count of contributing components
    /// is reduced across ranks before normalisation.
    #[allow(clippy::too_many_arguments)]
    pub fn lte_norm(
        &mut self,
        x: &DVector<f64>,
        mesh: &Mesh,
        dof: &IndexMap,
        ts_type: TsType,
        bdf2_lower_order: bool,
        eps_r: f64,
        eps_a: f64,
        comm: &impl Comm,
    ) -> f64 {
        self.predict(ts_type, bdf2_lower_order);

        let hn = self.dt;
        let hn1 = self.dt_last;
        let hn2 = self.dt_last_last;
        let first_order = ts_type == TsType::Bdf1 || bdf2_lower_order || self.accepted_steps < 2;
        let beta = if first_order {
            hn / (hn + hn1)
        } else {
            hn / (hn + hn1 + hn2)
        };

        self.lte.fill(0.0);
        self.lte.axpy(beta, x, 1.0);
        self.lte.axpy(-beta, &self.xp, 1.0);

        let mut n_components = 0usize;
        for (region_id, region) in mesh.regions.iter().enumerate() {
            let nv = region.n_variables();
            if nv == 0 {
                continue;
            }
            let psi = region
                .variable_offset(Variable::Potential)
                .expect("psi is always active");
            for i in region.on_processor_nodes() {
                let base = dof.local_offset(region_id, i);
                self.lte[base + psi] = 0.0;
                for a in 0..nv {
                    if a == psi {
                        continue;
                    }
                    let row = base + a;
                    self.lte[row] /= eps_r * x[row].abs() + eps_a;
                }
            }
            n_components += (nv - 1) * region.nodes.len();
        }

        if comm.is_last() {
            for ckt in 0..dof.n_circuit() {
                let row_f = dof.circuit_offset_f(ckt);
                let row_x = dof.circuit_offset_x(ckt);
                self.lte[row_f] /= eps_r * x[row_x].abs() + eps_a;
            }
            n_components += dof.n_circuit();
        }

        let n_total = comm.sum_usize(n_components);
        if n_total == 0 {
            return 1.0;
        }
        self.lte.norm() / (n_total as f64).sqrt()
    }

    /// Accept a step: rotate the solution history and the step-size
    /// window, advance time.
    pub fn rotate(&mut self, x: &DVector<f64>) {
        self.time += self.dt;
        self.accepted_steps += 1;

        std::mem::swap(&mut self.x_n2, &mut self.x_n1);
        std::mem::swap(&mut self.x_n1, &mut self.x_n);
        self.x_n.copy_from(x);

        self.dt_last_last = self.dt_last;
        self.dt_last = self.dt;
    }

    /// Bounded step-size growth from the LTE estimate.
    pub fn next_dt(&self, lte: f64, order: BdfOrder, dt_min: f64, dt_max: f64) -> f64 {
        let p = match order {
            BdfOrder::Bdf1 => 1.0,
            BdfOrder::Bdf2 => 2.0,
        };
        let factor = (0.9 * (1.0 / lte.max(1e-10)).powf(1.0 / (p + 1.0))).clamp(0.3, 2.0);
        (self.dt * factor).clamp(dt_min, dt_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::builder::{semiconductor_bar, uniform_line};
    use crate::discretization::mesh::{AdvancedModel, Mesh};
    use crate::parallel::SerialComm;
    use crate::physics::material::Material;
    use crate::units::UM;

    fn small_mesh() -> Mesh {
        let coords = uniform_line(0.0, 1.0 * UM, 4);
        let region = semiconductor_bar(
            "bar",
            &coords,
            1e-8,
            Material::silicon(),
            AdvancedModel::default(),
            |_| 1e16,
            300.0,
        );
        Mesh { regions: vec![region], t_external: 300.0 }
    }

    #[test]
    fn bdf1_predictor_is_exact_for_steady_history() {
        let mut ti = TimeIntegrator::new(4, 1e-9);
        let x = DVector::from_vec(vec![1.0, -2.0, 3.0, 0.5]);
        ti.load_history(&x);
        ti.predict(TsType::Bdf1, false);
        for i in 0..4 {
            assert!((ti.xp[i] - x[i]).abs() < 1e-15);
        }
    }

    #[test]
    fn bdf2_predictor_coefficient_identities() {
        let (hn, hn1, hn2) = (3e-9, 2e-9, 5e-9);
        let (cn, cn1, cn2) = bdf2_predictor_coeffs(hn, hn1, hn2);
        // zeroth moment: interpolation reproduces constants
        assert!((cn + cn1 + cn2 - 1.0).abs() < 1e-12);
        // first moment: linear-in-time histories extrapolate exactly
        let moment = cn1 * (-hn1) + cn2 * (-hn1 - hn2);
        assert!((moment - hn).abs() / hn < 1e-12);
    }

    #[test]
    fn bdf2_time_context_is_consistent() {
        // a constant solution has zero discrete time derivative
        let ctx = TimeContext { order: BdfOrder::Bdf2, dt: 2e-9, dt_last: 3e-9 };
        let u = 7.5;
        let deriv = ctx.lead() * u - ctx.hist(u, u);
        assert!(deriv.abs() < 1e-3 * ctx.lead().abs());
    }

    #[test]
    fn positivity_test_accepts_equal_steps_with_flat_history() {
        // r = 1/2, a = 4, b = 1
        let mesh = small_mesh();
        assert!(bdf2_positive_defined(&mesh, 1e-9, 1e-9, &SerialComm));
    }

    #[test]
    fn integrator_falls_back_to_bdf1_on_density_drop() {
        let mut mesh = small_mesh();
        for data in &mut mesh.regions[0].data {
            data.n_last = data.n * 10.0; // n dropped by more than 8x
        }
        assert!(!bdf2_positive_defined(&mesh, 1e-9, 1e-9, &SerialComm));

        let mut ti = TimeIntegrator::new(12, 1e-9);
        ti.accepted_steps = 3;
        assert_eq!(ti.scheme_for_step(TsType::Bdf2, &mesh, &SerialComm), BdfOrder::Bdf1);

        // with a restored history BDF2 is used again
        for data in &mut mesh.regions[0].data {
            data.n_last = data.n;
        }
        assert_eq!(ti.scheme_for_step(TsType::Bdf2, &mesh, &SerialComm), BdfOrder::Bdf2);
    }
}
