//! Top-level mixed-mode solver: create -> pre_solve -> solve ->
//! post_solve, dispatching among operating point, DC sweep and
//! transient analysis.

use nalgebra::DVector;

use crate::circuit::{SpiceCircuit, Waveform};
use crate::discretization::mesh::{Mesh, RegionKind};
use crate::dofmap::IndexMap;
use crate::error::{Result, SolverError};
use crate::numerics::bdf::{BdfOrder, TimeContext, TimeIntegrator, TsType};
use crate::numerics::damping::{projection_positive_density, DampingStrategy};
use crate::numerics::linear::InsertMode;
use crate::numerics::newton::{NewtonDriver, NewtonReport};
use crate::parallel::{Comm, SerialComm};
use crate::physics;
use crate::physics::bc::BoundaryCondition;
use crate::physics::semiconductor::VarLayout;
use crate::units::ONE_PER_CM3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveType {
    Op,
    DcSweep,
    Transient,
}

/// All solver knobs, threaded explicitly instead of global state.
#[derive(Clone)]
pub struct SolverConfig {
    pub solve_type: SolveType,

    // time stepping
    pub ts_type: TsType,
    pub bdf2_lower_order: bool,
    pub time_dependent: bool,
    pub ts_rtol: f64,
    pub ts_atol: f64,
    pub dt: f64,
    pub dt_min: f64,
    pub dt_max: f64,
    pub t_stop: f64,

    // Newton iteration
    pub max_newton_iterations: u32,
    pub newton_rtol: f64,
    pub poisson_atol: f64,
    pub continuity_atol: f64,
    pub heat_atol: f64,
    pub energy_atol: f64,
    pub electrode_atol: f64,
    pub spice_atol: f64,
    pub divergence_factor: f64,
    pub forcing_term: f64,
    pub damping: DampingStrategy,
    pub voltage_clip: f64,
    pub current_clip: f64,

    // DC sweep
    pub sweep_electrode: usize,
    pub sweep_start: f64,
    pub sweep_stop: f64,
    pub sweep_step: f64,

    pub logging: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            solve_type: SolveType::Op,
            ts_type: TsType::Bdf1,
            bdf2_lower_order: false,
            time_dependent: false,
            ts_rtol: 1e-3,
            ts_atol: 1e5,
            dt: 1e-9,
            dt_min: 1e-15,
            dt_max: 1e-6,
            t_stop: 1e-6,
            max_newton_iterations: 50,
            newton_rtol: 1e-9,
            poisson_atol: 1e-10,
            continuity_atol: 1e8,
            heat_atol: 1e-8,
            energy_atol: 1e10,
            electrode_atol: 1e-9,
            spice_atol: 1e-9,
            divergence_factor: 100.0,
            forcing_term: 0.01,
            damping: DampingStrategy::Potential,
            voltage_clip: 5.0,
            current_clip: 1.0,
            sweep_electrode: 0,
            sweep_start: 0.0,
            sweep_stop: 0.0,
            sweep_step: 0.1,
            logging: false,
        }
    }
}

/// The device plus everything coupled to it.
pub struct DeviceSystem {
    pub mesh: Mesh,
    pub bcs: Vec<BoundaryCondition>,
    pub circuit: Option<SpiceCircuit>,
    pub dof: IndexMap,
}

/// One transient step as recorded by the controller.
#[derive(Clone, Copy, Debug)]
pub struct StepRecord {
    pub time: f64,
    pub dt: f64,
    pub lte: f64,
    pub order: BdfOrder,
    pub accepted: bool,
    pub newton_iterations: u32,
}

pub struct MixedModeSolver {
    pub sys: DeviceSystem,
    pub config: SolverConfig,
    pub driver: NewtonDriver,
    pub integrator: TimeIntegrator,
    comm: SerialComm,

    /// (bias, terminal current) samples from a DC sweep.
    pub iv_curve: Vec<(f64, f64)>,
    /// Transient step log: every attempt, accepted or not.
    pub step_log: Vec<StepRecord>,
    pub last_report: Option<NewtonReport>,
    last_time_ctx: Option<TimeContext>,
}

impl MixedModeSolver {
    /// Build the solver around a mesh, its boundary conditions and an
    /// optional circuit; equilibrium is written into the node data.
    pub fn create(
        mut mesh: Mesh,
        bcs: Vec<BoundaryCondition>,
        circuit: Option<SpiceCircuit>,
        config: SolverConfig,
    ) -> Self {
        physics::init_equilibrium(&mut mesh);
        let n_ckt = circuit.as_ref().map(|c| c.n_ckt_nodes()).unwrap_or(0);
        let dof = IndexMap::build(&mesh, n_ckt);
        let n_rows = dof.n_rows();
        let integrator = TimeIntegrator::new(n_rows, config.dt);
        Self {
            sys: DeviceSystem { mesh, bcs, circuit, dof },
            config,
            driver: NewtonDriver::new(n_rows),
            integrator,
            comm: SerialComm,
            iv_curve: Vec::new(),
            step_log: Vec::new(),
            last_report: None,
            last_time_ctx: None,
        }
    }

    /// Load the solution and scaling vectors from the per-node data,
    /// the boundary conditions and the circuit.
    pub fn pre_solve(&mut self, load_solution: bool) {
        if load_solution {
            for region_id in 0..self.sys.mesh.n_regions() {
                physics::region_fill_value(
                    &self.sys.mesh,
                    region_id,
                    &self.sys.dof,
                    &mut self.driver.x,
                    &mut self.driver.l,
                );
            }
            if let Some(ckt) = self.sys.circuit.as_ref() {
                ckt.fill_value(&self.sys.dof, &mut self.driver.x, &mut self.driver.l);
            }
        }
    }

    pub fn solve(&mut self) -> Result<()> {
        crate::numerics::timing::reset_timing();
        let start = std::time::Instant::now();
        let result = match self.config.solve_type {
            SolveType::Op => self.solve_op(),
            SolveType::DcSweep => self.solve_dcsweep(),
            SolveType::Transient => self.solve_transient(),
        };
        crate::numerics::timing::finalize_and_print(start.elapsed());
        result
    }

    /// Restore the accepted solution into every region and snapshot
    /// the circuit.
    pub fn post_solve(&mut self) {
        self.driver.scatter_to_local();
        let lx = self.driver.local_solution().clone();
        physics::update_solution(&mut self.sys.mesh, &self.sys.dof, &lx);
        if let Some(ckt) = self.sys.circuit.as_mut() {
            ckt.update_solution(&self.sys.dof, &lx);
            ckt.save_solution();
        }
    }

    /// Replace the bias waveform of an ohmic contact.
    pub fn set_ohmic_bias(&mut self, bc_index: usize, wave: Waveform) {
        if let BoundaryCondition::Ohmic(bc) = &mut self.sys.bcs[bc_index] {
            bc.bias = wave;
        }
    }

    fn solve_op(&mut self) -> Result<()> {
        let cfg = self.config.clone();
        let x_before = self.driver.x.clone();
        match self.driver.solve(&mut self.sys, &cfg, None, 0.0, &self.comm) {
            Ok(report) => {
                self.accept(&x_before)?;
                self.last_report = Some(report);
                Ok(())
            }
            Err(e) => {
                self.diverged_recovery();
                Err(e)
            }
        }
    }

    fn solve_dcsweep(&mut self) -> Result<()> {
        let cfg = self.config.clone();
        let mut v = cfg.sweep_start;
        let step = cfg.sweep_step;
        while v <= cfg.sweep_stop + 0.5 * step.abs() {
            self.set_ohmic_bias(cfg.sweep_electrode, Waveform::Dc(v));
            let x_before = self.driver.x.clone();
            match self.driver.solve(&mut self.sys, &cfg, None, 0.0, &self.comm) {
                Ok(report) => {
                    self.accept(&x_before)?;
                    let current = self.electrode_current(cfg.sweep_electrode)?;
                    self.iv_curve.push((v, current));
                    if cfg.logging {
                        println!("  V = {v:.3} V | I = {current:.6e} A | iters = {}", report.iterations);
                    }
                    self.last_report = Some(report);
                }
                Err(e) => {
                    self.diverged_recovery();
                    return Err(e);
                }
            }
            v += step;
        }
        Ok(())
    }

    fn solve_transient(&mut self) -> Result<()> {
        self.config.time_dependent = true;
        let cfg = self.config.clone();

        // the pre-transient state is the entire history
        self.integrator.load_history(&self.driver.x);
        self.rotate_node_histories();
        self.rotate_node_histories();
        self.driver.scatter_to_local();
        let lx = self.driver.local_solution().clone();
        if let Some(ckt) = self.sys.circuit.as_mut() {
            ckt.save_solution();
            ckt.rotate_history(&self.sys.dof, &lx);
            ckt.rotate_history(&self.sys.dof, &lx);
        }

        while self.integrator.time < cfg.t_stop * (1.0 - 1e-12) {
            let remaining = cfg.t_stop - self.integrator.time;
            if self.integrator.dt > remaining {
                self.integrator.dt = remaining;
            }

            let order = self
                .integrator
                .scheme_for_step(cfg.ts_type, &self.sys.mesh, &self.comm);
            let ctx = TimeContext {
                order,
                dt: self.integrator.dt,
                dt_last: self.integrator.dt_last,
            };
            self.last_time_ctx = Some(ctx);
            let t_new = self.integrator.time + self.integrator.dt;
            let x_before = self.driver.x.clone();

            let report = match self
                .driver
                .solve(&mut self.sys, &cfg, Some(&ctx), t_new, &self.comm)
            {
                Ok(report) => report,
                Err(SolverError::Index { region, var }) => {
                    return Err(SolverError::Index { region, var });
                }
                Err(_) => {
                    // failed step: restore the snapshot and halve dt
                    self.diverged_recovery();
                    self.step_log.push(StepRecord {
                        time: self.integrator.time,
                        dt: self.integrator.dt,
                        lte: f64::INFINITY,
                        order,
                        accepted: false,
                        newton_iterations: cfg.max_newton_iterations,
                    });
                    self.integrator.dt *= 0.5;
                    if self.integrator.dt < cfg.dt_min {
                        return Err(SolverError::TimeStepUnderflow { dt_min: cfg.dt_min });
                    }
                    continue;
                }
            };

            let lte = self.integrator.lte_norm(
                &self.driver.x,
                &self.sys.mesh,
                &self.sys.dof,
                cfg.ts_type,
                cfg.bdf2_lower_order,
                cfg.ts_rtol,
                cfg.ts_atol,
                &self.comm,
            );

            self.step_log.push(StepRecord {
                time: t_new,
                dt: self.integrator.dt,
                lte,
                order,
                accepted: lte <= 1.0,
                newton_iterations: report.iterations,
            });

            if lte > 1.0 {
                self.driver.x.copy_from(&x_before);
                self.integrator.dt *= 0.5;
                if self.integrator.dt < cfg.dt_min {
                    return Err(SolverError::TimeStepUnderflow { dt_min: cfg.dt_min });
                }
                continue;
            }

            self.accept_transient(&x_before)?;
            self.last_report = Some(report);
            self.integrator.rotate(&self.driver.x);
            self.integrator.dt = self.integrator.next_dt(lte, order, cfg.dt_min, cfg.dt_max);
        }

        Ok(())
    }

    /// Projection, invariant check and solution scatter for a
    /// steady-state acceptance.
    fn accept(&mut self, x_before: &DVector<f64>) -> Result<()> {
        projection_positive_density(
            &self.sys.mesh,
            &self.sys.dof,
            &mut self.driver.x,
            x_before,
        );
        self.check_invariants()?;
        self.post_solve();
        Ok(())
    }

    /// Acceptance at the end of a transient step additionally rotates
    /// the node and circuit histories before the new solution lands.
    fn accept_transient(&mut self, x_before: &DVector<f64>) -> Result<()> {
        projection_positive_density(
            &self.sys.mesh,
            &self.sys.dof,
            &mut self.driver.x,
            x_before,
        );
        self.check_invariants()?;
        self.rotate_node_histories();
        self.driver.scatter_to_local();
        let lx = self.driver.local_solution().clone();
        physics::update_solution(&mut self.sys.mesh, &self.sys.dof, &lx);
        if let Some(ckt) = self.sys.circuit.as_mut() {
            ckt.update_solution(&self.sys.dof, &lx);
            ckt.save_solution();
            ckt.rotate_history(&self.sys.dof, &lx);
        }
        Ok(())
    }

    fn rotate_node_histories(&mut self) {
        for region in &mut self.sys.mesh.regions {
            for data in &mut region.data {
                data.rotate_history();
            }
        }
    }

    /// Reload the last accepted state after a divergence verdict.
    pub fn diverged_recovery(&mut self) {
        if self.comm.is_last() {
            if let Some(ckt) = self.sys.circuit.as_mut() {
                ckt.restore_solution();
            }
        }
        for region_id in 0..self.sys.mesh.n_regions() {
            physics::region_fill_value(
                &self.sys.mesh,
                region_id,
                &self.sys.dof,
                &mut self.driver.x,
                &mut self.driver.l,
            );
        }
        if let Some(ckt) = self.sys.circuit.as_ref() {
            ckt.fill_value(&self.sys.dof, &mut self.driver.x, &mut self.driver.l);
        }
    }

    /// Post-projection sanity check over the accepted iterate.
    fn check_invariants(&self) -> Result<()> {
        let mesh = &self.sys.mesh;
        let t_ext = mesh.t_external;
        for (region_id, region) in mesh.regions.iter().enumerate() {
            if region.kind != RegionKind::Semiconductor {
                continue;
            }
            let lay = VarLayout::of(region);
            for i in region.on_processor_nodes() {
                let base = self.sys.dof.local_offset(region_id, i);
                let x = &self.driver.x;
                if x[base + lay.n] < 0.999 * ONE_PER_CM3 || x[base + lay.p] < 0.999 * ONE_PER_CM3 {
                    return Err(SolverError::InvariantViolation(format!(
                        "negative carrier density at {}:{}",
                        region.name, i
                    )));
                }
                if let Some(tl) = lay.tl {
                    if x[base + tl] < t_ext - 50.0 - 1e-9 {
                        return Err(SolverError::InvariantViolation(format!(
                            "lattice temperature below floor at {}:{}",
                            region.name, i
                        )));
                    }
                }
                if let Some(wn) = lay.wn {
                    if x[base + wn] / x[base + lay.n] < 0.9 * t_ext - 1e-9 {
                        return Err(SolverError::InvariantViolation(format!(
                            "electron temperature below floor at {}:{}",
                            region.name, i
                        )));
                    }
                }
                if let Some(wp) = lay.wp {
                    if x[base + wp] / x[base + lay.p] < 0.9 * t_ext - 1e-9 {
                        return Err(SolverError::InvariantViolation(format!(
                            "hole temperature below floor at {}:{}",
                            region.name, i
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Conventional current flowing from an electrode into the device:
    /// the sum of the (pre-clear) charge-signed continuity rows over
    /// the contact nodes.
    pub fn electrode_current(&mut self, bc_index: usize) -> Result<f64> {
        use crate::discretization::mesh::Variable;

        let (region, nodes) = match &self.sys.bcs[bc_index] {
            BoundaryCondition::Ohmic(bc) => (bc.region, bc.nodes.clone()),
            BoundaryCondition::SpiceElectrode(bc) => (bc.region, bc.nodes.clone()),
            BoundaryCondition::Gate(_) | BoundaryCondition::InsulatorInterface(_) => {
                return Err(SolverError::InvariantViolation(
                    "terminal current queried on a non-electrode boundary".into(),
                ))
            }
        };

        self.driver.scatter_to_local();
        let lx = self.driver.local_solution().clone();
        let mut r = DVector::zeros(self.sys.dof.n_rows());
        let mut mode = InsertMode::NotSet;
        for region_id in 0..self.sys.mesh.n_regions() {
            physics::region_residual(&self.sys.mesh, region_id, &self.sys.dof, &lx, &mut r, &mut mode)?;
        }
        if self.config.time_dependent {
            if let Some(ctx) = self.last_time_ctx.as_ref() {
                for region_id in 0..self.sys.mesh.n_regions() {
                    physics::region_time_dependent_residual(
                        &self.sys.mesh, region_id, &self.sys.dof, &lx, &mut r, &mut mode, ctx,
                    )?;
                }
            }
        }

        let mut current = 0.0;
        for &node in &nodes {
            current += r[self.sys.dof.offset(&self.sys.mesh, region, node, Variable::Electron)?];
            current += r[self.sys.dof.offset(&self.sys.mesh, region, node, Variable::Hole)?];
        }
        Ok(current)
    }
}
