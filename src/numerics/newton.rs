//! Inexact-Newton driver.
//!
//! One iteration: scatter the global iterate to the local view,
//! assemble residual and Jacobian in the fixed phase order (regions,
//! storage terms, hanging nodes, circuit, boundary preprocess row
//! rewrites, boundary insertion), refresh the row scaling from the
//! Jacobian diagonal, solve the scaled system with BiCGStab and a
//! forcing-term tolerance, let the active damping strategy transform
//! the step, then test convergence on the physical norms.

use nalgebra::DVector;

use crate::error::{Result, SolverError};
use crate::numerics::bdf::TimeContext;
use crate::numerics::damping;
use crate::numerics::linear::{solve_bicgstab, vec_add_clear_rows, InsertMode, SysMatrix};
use crate::numerics::timing::{record_jacobian, record_linear_solve, record_residual};
use crate::parallel::Comm;
use crate::physics;
use crate::physics::bc::RowOps;
use crate::physics::semiconductor::VarLayout;
use crate::discretization::mesh::{RegionKind, Variable};
use crate::solver::{DeviceSystem, SolverConfig};
use crate::units::A;

/// Per-variable solution norms and per-equation residual norms,
/// reduced across ranks.
#[derive(Clone, Copy, Debug, Default)]
pub struct Norms {
    pub potential: f64,
    pub electron: f64,
    pub hole: f64,
    pub lattice_temp: f64,
    pub elec_temp: f64,
    pub hole_temp: f64,

    pub poisson: f64,
    pub elec_continuity: f64,
    pub hole_continuity: f64,
    pub heat: f64,
    pub elec_energy: f64,
    pub hole_energy: f64,
    pub electrode: f64,
    pub spice: f64,
}

impl Norms {
    /// Largest equation residual; drives the divergence monitor.
    pub fn max_residual(&self) -> f64 {
        [
            self.poisson,
            self.elec_continuity,
            self.hole_continuity,
            self.heat,
            self.elec_energy,
            self.hole_energy,
            self.electrode,
            self.spice,
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }
}

/// Outcome of a Newton solve.
#[derive(Clone, Debug)]
pub struct NewtonReport {
    pub iterations: u32,
    pub norms: Norms,
    /// Smallest potential-damping factor seen during the solve.
    pub min_damping_factor: f64,
}

pub struct NewtonDriver {
    /// Global iterate, exclusively owned by the driver.
    pub x: DVector<f64>,
    /// Row scaling: reciprocal Jacobian diagonal of the last assembly.
    pub l: DVector<f64>,
    lx: DVector<f64>,
    lf: DVector<f64>,
    r: DVector<f64>,
    j: SysMatrix,
    /// Dirichlet potential rows of the electrode boundaries; they
    /// feed the electrode norm.
    bc_rows: Vec<usize>,
    jacobian_first_assembled: bool,
}

fn check_finite(v: &DVector<f64>, phase: &'static str) -> Result<()> {
    if v.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(SolverError::AssemblyNan { phase })
    }
}

impl NewtonDriver {
    pub fn new(n_rows: usize) -> Self {
        Self {
            x: DVector::zeros(n_rows),
            l: DVector::from_element(n_rows, 1.0),
            lx: DVector::zeros(n_rows),
            lf: DVector::zeros(n_rows),
            r: DVector::zeros(n_rows),
            j: SysMatrix::new(n_rows),
            bc_rows: Vec::new(),
            jacobian_first_assembled: false,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.x.len()
    }

    /// Local solution view of the last assembly.
    pub fn local_solution(&self) -> &DVector<f64> {
        &self.lx
    }

    /// Scatter the global iterate into the local view. Serial builds
    /// alias the full vector; the call marks the ghost-exchange point.
    pub fn scatter_to_local(&mut self) {
        self.lx.copy_from(&self.x);
    }

    /// Assemble the raw (unscaled) residual at the current iterate.
    pub fn assemble_residual(
        &mut self,
        sys: &mut DeviceSystem,
        time: Option<&TimeContext>,
        t: f64,
    ) -> Result<()> {
        self.scatter_to_local();
        self.r.fill(0.0);

        let mut mode = InsertMode::NotSet;
        for region_id in 0..sys.mesh.n_regions() {
            physics::region_residual(&sys.mesh, region_id, &sys.dof, &self.lx, &mut self.r, &mut mode)?;
        }
        check_finite(&self.r, "region residual")?;

        if let Some(ctx) = time {
            for region_id in 0..sys.mesh.n_regions() {
                physics::region_time_dependent_residual(
                    &sys.mesh, region_id, &sys.dof, &self.lx, &mut self.r, &mut mode, ctx,
                )?;
            }
            check_finite(&self.r, "storage residual")?;
        }

        for region_id in 0..sys.mesh.n_regions() {
            physics::region_hanging_node_residual(
                &sys.mesh, region_id, &sys.dof, &self.lx, &mut self.r, &mut mode,
            );
        }
        check_finite(&self.r, "hanging node residual")?;

        if let Some(ckt) = sys.circuit.as_mut() {
            ckt.residual(&sys.dof, &self.lx, &mut self.r, &mut mode, time, t)?;
            check_finite(&self.r, "circuit residual")?;
        }

        let mut ops = RowOps::default();
        for bc in &sys.bcs {
            ops.merge(bc.preprocess(&sys.mesh, &sys.dof)?);
        }
        vec_add_clear_rows(&mut self.r, &ops.src, &ops.dst, &ops.clear);
        self.bc_rows.clear();
        for bc in &sys.bcs {
            self.bc_rows.extend(bc.electrode_rows(&sys.mesh, &sys.dof)?);
        }

        let mut mode = InsertMode::NotSet;
        for bc in &sys.bcs {
            bc.assemble_residual(&sys.mesh, &sys.dof, &self.lx, &mut self.r, &mut mode, t)?;
        }
        check_finite(&self.r, "boundary residual")?;

        if let Some(ckt) = sys.circuit.as_mut() {
            ckt.capture_assembled_residual(&sys.dof, &self.r);
        }

        Ok(())
    }

    /// Assemble the raw Jacobian at the current iterate. The first
    /// assembly reserves the boundary fill-in; afterwards zero
    /// insertions are forbidden.
    pub fn assemble_jacobian(
        &mut self,
        sys: &mut DeviceSystem,
        time: Option<&TimeContext>,
        t: f64,
    ) -> Result<()> {
        self.j.zero_entries();

        let mut mode = InsertMode::NotSet;
        for region_id in 0..sys.mesh.n_regions() {
            physics::region_jacobian(&sys.mesh, region_id, &sys.dof, &self.lx, &mut self.j, &mut mode)?;
        }

        if let Some(ctx) = time {
            for region_id in 0..sys.mesh.n_regions() {
                physics::region_time_dependent_jacobian(
                    &sys.mesh, region_id, &sys.dof, &self.lx, &mut self.j, &mut mode, ctx,
                )?;
            }
        }

        for region_id in 0..sys.mesh.n_regions() {
            physics::region_hanging_node_jacobian(&sys.mesh, region_id, &sys.dof, &mut self.j, &mut mode);
        }

        if let Some(ckt) = sys.circuit.as_ref() {
            ckt.jacobian(&sys.dof, &self.lx, &mut self.j, &mut mode, time, t)?;
        }

        if !self.jacobian_first_assembled {
            for bc in &sys.bcs {
                bc.jacobian_reserve(&sys.mesh, &sys.dof, &mut self.j, &mut mode)?;
            }
        } else {
            self.j.set_ignore_zero_entries(true);
        }

        let mut ops = RowOps::default();
        for bc in &sys.bcs {
            ops.merge(bc.preprocess(&sys.mesh, &sys.dof)?);
        }
        self.j.add_rows_to_rows(&ops.src, &ops.dst);
        self.j.zero_rows(&ops.clear);

        let mut mode = InsertMode::NotSet;
        for bc in &sys.bcs {
            bc.assemble_jacobian(&sys.mesh, &sys.dof, &self.lx, &mut self.j, &mut mode, t)?;
        }

        self.jacobian_first_assembled = true;
        Ok(())
    }

    /// Refresh L from the Jacobian diagonal and scale both the
    /// residual and the matrix.
    fn row_scale(&mut self) -> Result<()> {
        let diag = self.j.diagonal();
        check_finite(&diag, "jacobian")?;
        for i in 0..self.l.len() {
            self.l[i] = if diag[i].abs() < 1e-300 { 1.0 } else { 1.0 / diag[i] };
        }
        self.r.component_mul_assign(&self.l);
        self.j.scale_rows(&self.l);
        Ok(())
    }

    /// Norms of the current local solution and scaled residual.
    pub fn error_norms(&self, sys: &DeviceSystem, comm: &impl Comm) -> Norms {
        let mut n = Norms::default();
        let mesh = &sys.mesh;
        let dof = &sys.dof;
        let lx = &self.lx;
        let lf = &self.lf;

        for (region_id, region) in mesh.regions.iter().enumerate() {
            match region.kind {
                RegionKind::Semiconductor => {
                    let lay = VarLayout::of(region);
                    for i in region.on_processor_nodes() {
                        let base = dof.local_offset(region_id, i);
                        n.potential += lx[base + lay.psi] * lx[base + lay.psi];
                        n.electron += lx[base + lay.n] * lx[base + lay.n];
                        n.hole += lx[base + lay.p] * lx[base + lay.p];
                        n.poisson += lf[base + lay.psi] * lf[base + lay.psi];
                        n.elec_continuity += lf[base + lay.n] * lf[base + lay.n];
                        n.hole_continuity += lf[base + lay.p] * lf[base + lay.p];
                        if let Some(tl) = lay.tl {
                            n.lattice_temp += lx[base + tl] * lx[base + tl];
                            n.heat += lf[base + tl] * lf[base + tl];
                        }
                        if let Some(wn) = lay.wn {
                            let tn = lx[base + wn] / lx[base + lay.n];
                            n.elec_temp += tn * tn;
                            n.elec_energy += lf[base + wn] * lf[base + wn];
                        }
                        if let Some(wp) = lay.wp {
                            let tp = lx[base + wp] / lx[base + lay.p];
                            n.hole_temp += tp * tp;
                            n.hole_energy += lf[base + wp] * lf[base + wp];
                        }
                    }
                }
                RegionKind::Insulator | RegionKind::Metal => {
                    let psi = region
                        .variable_offset(Variable::Potential)
                        .expect("psi is always active");
                    let tl = region.variable_offset(Variable::LatticeTemp);
                    for i in region.on_processor_nodes() {
                        let base = dof.local_offset(region_id, i);
                        n.potential += lx[base + psi] * lx[base + psi];
                        n.poisson += lf[base + psi] * lf[base + psi];
                        if let Some(tl) = tl {
                            n.lattice_temp += lx[base + tl] * lx[base + tl];
                            n.heat += lf[base + tl] * lf[base + tl];
                        }
                    }
                }
                RegionKind::Vacuum => {}
            }
        }

        for &row in &self.bc_rows {
            n.electrode += lf[row] * lf[row];
        }

        let mut buffer = [
            n.potential,
            n.electron,
            n.hole,
            n.lattice_temp,
            n.elec_temp,
            n.hole_temp,
            n.poisson,
            n.elec_continuity,
            n.hole_continuity,
            n.heat,
            n.elec_energy,
            n.hole_energy,
            n.electrode,
        ];
        comm.sum_slice(&mut buffer);

        n.potential = buffer[0].sqrt();
        n.electron = buffer[1].sqrt();
        n.hole = buffer[2].sqrt();
        n.lattice_temp = buffer[3].sqrt();
        n.elec_temp = buffer[4].sqrt();
        n.hole_temp = buffer[5].sqrt();
        n.poisson = buffer[6].sqrt();
        n.elec_continuity = buffer[7].sqrt();
        n.hole_continuity = buffer[8].sqrt();
        n.heat = buffer[9].sqrt();
        n.elec_energy = buffer[10].sqrt();
        n.hole_energy = buffer[11].sqrt();
        n.electrode = buffer[12].sqrt();

        // the circuit norm exists on the last rank only
        let spice = if comm.is_last() {
            sys.circuit.as_ref().map(|c| c.residual_norm2() * A).unwrap_or(0.0)
        } else {
            0.0
        };
        n.spice = comm.broadcast(spice, comm.last_rank());

        n
    }

    fn converged(sys: &DeviceSystem, cfg: &SolverConfig, norms: &Norms, norms0: &Norms) -> bool {
        let ok = |norm: f64, norm0: f64, atol: f64| norm <= cfg.newton_rtol * norm0 + atol;

        let mut any_tl = false;
        let mut any_tn = false;
        let mut any_tp = false;
        for region in &sys.mesh.regions {
            any_tl |= region.advanced.enable_tl;
            any_tn |= region.advanced.enable_tn;
            any_tp |= region.advanced.enable_tp;
        }

        ok(norms.poisson, norms0.poisson, cfg.poisson_atol)
            && ok(norms.elec_continuity, norms0.elec_continuity, cfg.continuity_atol)
            && ok(norms.hole_continuity, norms0.hole_continuity, cfg.continuity_atol)
            && (!any_tl || ok(norms.heat, norms0.heat, cfg.heat_atol))
            && (!any_tn || ok(norms.elec_energy, norms0.elec_energy, cfg.energy_atol))
            && (!any_tp || ok(norms.hole_energy, norms0.hole_energy, cfg.energy_atol))
            && ok(norms.electrode, norms0.electrode, cfg.electrode_atol)
            && (sys.circuit.is_none() || norms.spice <= cfg.spice_atol)
    }

    /// Damped inexact-Newton loop.
    pub fn solve(
        &mut self,
        sys: &mut DeviceSystem,
        cfg: &SolverConfig,
        time: Option<&TimeContext>,
        t: f64,
        comm: &impl Comm,
    ) -> Result<NewtonReport> {
        let mut norms0 = Norms::default();
        let mut res_norm0 = 0.0f64;
        let mut prev_residual: Option<f64> = None;
        let mut growth_count = 0u32;
        let mut min_factor = 1.0f64;

        if cfg.logging {
            println!("{} unknowns", self.x.len());
            println!("  Iter |  Residual  |  Poisson   | Continuity |  Damping");
        }

        for iter in 0..cfg.max_newton_iterations {
            record_residual(|| self.assemble_residual(sys, time, t))?;
            record_jacobian(|| self.assemble_jacobian(sys, time, t))?;
            self.row_scale()?;

            self.lf.copy_from(&self.r);
            let norms = self.error_norms(sys, comm);
            if iter == 0 {
                norms0 = norms;
            }

            let res_norm = self.r.norm();
            if iter == 0 {
                res_norm0 = res_norm;
            }
            if cfg.logging {
                println!(
                    "  {:4} | {:.4e} | {:.4e} | {:.4e} | {:.3}",
                    iter,
                    res_norm,
                    norms.poisson,
                    norms.elec_continuity.max(norms.hole_continuity),
                    min_factor,
                );
            }

            if Self::converged(sys, cfg, &norms, &norms0) {
                return Ok(NewtonReport {
                    iterations: iter,
                    norms,
                    min_damping_factor: min_factor,
                });
            }

            if let Some(prev) = prev_residual {
                if res_norm > cfg.divergence_factor * prev {
                    growth_count += 1;
                    if growth_count >= 3 {
                        return Err(SolverError::NewtonDiverged { iterations: iter });
                    }
                } else {
                    growth_count = 0;
                }
            }
            prev_residual = Some(res_norm);

            // inexact-Newton forcing term: tighten the relative Krylov
            // tolerance as the residual falls from its starting level
            let reduction = if res_norm0 > 0.0 { res_norm / res_norm0 } else { 1.0 };
            let linear_tol = (cfg.forcing_term * reduction).clamp(1e-8, 1e-2);
            let (mut y, _lin_iters) =
                record_linear_solve(|| solve_bicgstab(&self.j, &self.r, linear_tol, 2000))?;

            let mut w = &self.x - &y;
            let report = damping::apply(
                cfg.damping,
                &sys.mesh,
                &sys.dof,
                sys.circuit.as_ref(),
                &self.x,
                &mut y,
                &mut w,
                cfg.voltage_clip,
                cfg.current_clip,
                comm,
            );
            min_factor = min_factor.min(report.factor);

            check_finite(&w, "newton update")?;
            self.x.copy_from(&w);
        }

        Err(SolverError::NewtonDiverged { iterations: cfg.max_newton_iterations })
    }
}
