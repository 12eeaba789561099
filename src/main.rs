use std::fs;

use mixsim::circuit::Waveform;
use mixsim::discretization::builder::{graded_line, semiconductor_bar};
use mixsim::discretization::mesh::{AdvancedModel, Mesh};
use mixsim::physics::bc::{BoundaryCondition, OhmicContact};
use mixsim::physics::material::Material;
use mixsim::processing::csv_writer;
use mixsim::solver::{MixedModeSolver, SolveType, SolverConfig};
use mixsim::units::UM;

/// A 2 um abrupt PN diode with contacts at both ends; the anode sits
/// on the p side so forward bias is a positive sweep.
fn build_diode(na: f64, nd: f64, area: f64) -> (Mesh, Vec<BoundaryCondition>) {
    let x_j = 1.0 * UM;
    let coords = graded_line(0.0, x_j, 2.0 * UM, 1e-7, 1.25);
    let n_nodes = coords.len();

    let region = semiconductor_bar(
        "diode",
        &coords,
        area,
        Material::silicon().with_lifetimes(1e-3, 1e-3),
        AdvancedModel::default(),
        move |x| if x < x_j { -na } else { nd },
        300.0,
    );
    let mesh = Mesh { regions: vec![region], t_external: 300.0 };

    let bcs = vec![
        BoundaryCondition::Ohmic(OhmicContact {
            name: "anode".into(),
            region: 0,
            nodes: vec![0],
            bias: Waveform::Dc(0.0),
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

fn main() {
    fs::create_dir_all("output").expect("failed to create output directory");

    // forward I-V sweep
    let (mesh, bcs) = build_diode(1e18, 1e18, 1e-6);
    let mut config = SolverConfig::default();
    config.solve_type = SolveType::DcSweep;
    config.sweep_electrode = 0;
    config.sweep_start = 0.0;
    config.sweep_stop = 0.8;
    config.sweep_step = 0.05;
    config.logging = true;

    println!("PN diode DC sweep, 0 -> 0.8 V");
    let mut solver = MixedModeSolver::create(mesh, bcs, None, config);
    solver.pre_solve(true);
    solver.solve().expect("DC sweep failed");
    solver.post_solve();

    let (biases, currents): (Vec<f64>, Vec<f64>) = solver.iv_curve.iter().cloned().unzip();
    csv_writer::write_xy("output/iv.csv", "bias_v", "current_a", &biases, &currents)
        .expect("failed to write I-V curve");
    println!("I-V curve saved to output/iv.csv\n");

    // switching transient
    let (mesh, mut bcs) = build_diode(1e18, 1e18, 1e-6);
    if let BoundaryCondition::Ohmic(anode) = &mut bcs[0] {
        anode.bias = Waveform::Step { t0: 0.0, v0: 0.0, v1: 0.5 };
    }
    let mut config = SolverConfig::default();
    config.solve_type = SolveType::Transient;
    config.ts_type = mixsim::numerics::bdf::TsType::Bdf2;
    config.dt = 1e-9;
    config.dt_max = 1e-9;
    config.t_stop = 50e-9;

    println!("Switching transient, 0 -> 0.5 V step");
    let mut solver = MixedModeSolver::create(mesh, bcs, None, config);
    solver.pre_solve(true);
    solver.solve().expect("transient failed");
    solver.post_solve();

    let accepted: Vec<_> = solver.step_log.iter().filter(|s| s.accepted).collect();
    let times: Vec<f64> = accepted.iter().map(|s| s.time).collect();
    let dts: Vec<f64> = accepted.iter().map(|s| s.dt).collect();
    let ltes: Vec<f64> = accepted.iter().map(|s| s.lte).collect();
    csv_writer::write_csv(
        "output/transient.csv",
        &["time_s", "dt_s", "lte"],
        &[times, dts, ltes],
    )
    .expect("failed to write transient log");

    println!(
        "{} accepted steps ({} attempts), log saved to output/transient.csv",
        accepted.len(),
        solver.step_log.len()
    );
}
