//! Transient verification: the adaptive BDF2 stepper must shrink the
//! step on a switching edge and recover the initial step once the
//! local truncation error dies down.

use mixsim::circuit::Waveform;
use mixsim::discretization::builder::{graded_line, semiconductor_bar};
use mixsim::discretization::mesh::{AdvancedModel, Mesh};
use mixsim::numerics::bdf::{BdfOrder, TsType};
use mixsim::physics::bc::{BoundaryCondition, OhmicContact};
use mixsim::physics::material::Material;
use mixsim::solver::{MixedModeSolver, SolveType, SolverConfig};
use mixsim::units::UM;

const AREA: f64 = 1e-6;

fn step_diode() -> (Mesh, Vec<BoundaryCondition>) {
    let x_j = 2.0 * UM;
    let coords = graded_line(0.0, x_j, 4.0 * UM, 2e-7, 1.4);
    let n_nodes = coords.len();

    let region = semiconductor_bar(
        "diode",
        &coords,
        AREA,
        Material::silicon(),
        AdvancedModel::default(),
        move |x| if x < x_j { -1e17 } else { 1e17 },
        300.0,
    );
    let mesh = Mesh { regions: vec![region], t_external: 300.0 };

    let bcs = vec![
        BoundaryCondition::Ohmic(OhmicContact {
            name: "anode".into(),
            region: 0,
            nodes: vec![0],
            bias: Waveform::Step { t0: 0.0, v0: 0.0, v1: 1.0 },
        }),
        BoundaryCondition::Ohmic(OhmicContact {
            name: "cathode".into(),
            region: 0,
            nodes: vec![n_nodes - 1],
            bias: Waveform::Dc(0.0),
        }),
    ];
    (mesh, bcs)
}

#[test]
fn step_input_shrinks_then_recovers_dt() {
    let dt_init = 1e-6;

    let (mesh, bcs) = step_diode();
    let mut config = SolverConfig::default();
    config.solve_type = SolveType::Transient;
    config.ts_type = TsType::Bdf2;
    config.ts_rtol = 1e-3;
    config.max_newton_iterations = 150;
    config.dt = dt_init;
    config.dt_max = dt_init;
    config.dt_min = 1e-16;
    config.t_stop = 10e-6;

    let mut solver = MixedModeSolver::create(mesh, bcs, None, config);
    solver.pre_solve(true);
    solver.solve().expect("switching transient must complete");
    solver.post_solve();

    assert!(solver.integrator.time >= 10e-6 * (1.0 - 1e-9));

    let log = &solver.step_log;
    assert!(!log.is_empty());

    // the stepper resolved the edge: at least three consecutive
    // accepted steps well below the initial step size
    let mut consecutive = 0;
    let mut best_run = 0;
    for step in log.iter() {
        if step.accepted && step.dt < dt_init / 4.0 {
            consecutive += 1;
            best_run = best_run.max(consecutive);
        } else if step.accepted {
            consecutive = 0;
        }
    }
    assert!(
        best_run >= 3,
        "longest run of small accepted steps was {best_run}"
    );

    // once the LTE collapses the stepper climbs back to dt_init
    let recovered = log
        .iter()
        .any(|s| s.accepted && s.dt >= 0.999 * dt_init && s.lte <= 0.1);
    assert!(recovered, "dt never recovered to its initial value");

    // BDF2 was actually exercised after the history filled up
    assert!(log.iter().any(|s| s.accepted && s.order == BdfOrder::Bdf2));

    // accepted time steps always pass the error test
    for step in log.iter().filter(|s| s.accepted) {
        assert!(step.lte <= 1.0);
    }
}
