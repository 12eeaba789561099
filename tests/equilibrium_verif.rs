//! Operating-point verification: pure-Poisson equilibrium, divergence
//! recovery from an unphysical seed, and a MOS stack exercising the
//! insulator interface.

use mixsim::circuit::Waveform;
use mixsim::discretization::builder::{conductor_bar, semiconductor_bar, uniform_line};
use mixsim::discretization::mesh::{AdvancedModel, Mesh, RegionKind};
use mixsim::error::SolverError;
use mixsim::physics::bc::{
    BoundaryCondition, GateContact, InsulatorInterface, OhmicContact,
};
use mixsim::physics::material::Material;
use mixsim::solver::{MixedModeSolver, SolverConfig};
use mixsim::units::{ONE_PER_CM3, UM};

const AREA: f64 = 1e-6;

/// Uniformly doped n-type bar with ohmic contacts at both ends.
fn resistor(n_nodes: usize) -> (Mesh, Vec<BoundaryCondition>) {
    let coords = uniform_line(0.0, 1.0 * UM, n_nodes);
    let region = semiconductor_bar(
        "bulk",
        &coords,
        AREA,
        Material::silicon(),
        AdvancedModel::default(),
        |_| 1e16,
        300.0,
    );
    let mesh = Mesh { regions: vec![region], t_external: 300.0 };
    let bcs = vec![
        BoundaryCondition::Ohmic(OhmicContact {
            name: "left".into(),
            region: 0,
            nodes: vec![0],
            bias: Waveform::Dc(0.0),
        }),
        BoundaryCondition::Ohmic(OhmicContact {
            name: "right".into(),
            region: 0,
            nodes: vec![n_nodes - 1],
            bias: Waveform::Dc(0.0),
        }),
    ];
    (mesh, bcs)
}

#[test]
fn poisson_equilibrium_resistor() {
    let (mesh, bcs) = resistor(11);
    let config = SolverConfig::default();

    let mut solver = MixedModeSolver::create(mesh, bcs, None, config);
    solver.pre_solve(true);
    solver.solve().expect("zero-bias operating point must converge");
    solver.post_solve();

    let report = solver.last_report.as_ref().expect("operating point ran");
    assert!(report.iterations <= 8, "took {} Newton iterations", report.iterations);
    assert!(
        report.norms.max_residual() < 1e-10,
        "residual norm {:e}",
        report.norms.max_residual()
    );

    // zero bias, uniform doping: psi is flat between the contacts
    let region = &solver.sys.mesh.regions[0];
    let psi_min = region.data.iter().map(|d| d.psi).fold(f64::INFINITY, f64::min);
    let psi_max = region.data.iter().map(|d| d.psi).fold(f64::NEG_INFINITY, f64::max);
    assert!(psi_max - psi_min < 1e-9, "psi spread {:e} V", psi_max - psi_min);

    for data in &region.data {
        assert!(data.n >= ONE_PER_CM3);
        assert!(data.p >= ONE_PER_CM3);
    }
}

#[test]
fn divergence_recovery_from_unphysical_seed() {
    let (mesh, bcs) = resistor(11);
    let mut config = SolverConfig::default();
    config.damping = mixsim::numerics::damping::DampingStrategy::PositiveDensity;
    config.max_newton_iterations = 30;

    let mut solver = MixedModeSolver::create(mesh, bcs, None, config);

    // seed the last accepted state with wildly unphysical densities
    for data in &mut solver.sys.mesh.regions[0].data {
        data.n = 1e20;
        data.p = 1e20;
        data.n_last = 1e20;
        data.p_last = 1e20;
    }
    solver.pre_solve(true);

    match solver.solve() {
        Ok(()) => {
            // recovered: the accepted iterate is physical
            for data in &solver.sys.mesh.regions[0].data {
                assert!(data.n.is_finite() && data.n >= ONE_PER_CM3);
                assert!(data.p.is_finite() && data.p >= ONE_PER_CM3);
            }
        }
        Err(SolverError::AssemblyNan { phase }) => {
            panic!("the unphysical seed must not produce NaN ({phase})")
        }
        Err(SolverError::NewtonDiverged { iterations }) => {
            assert!(iterations <= 30);
            // the snapshot was restored into the solution vector
            let base = solver.sys.dof.local_offset(0, 0);
            assert_eq!(solver.driver.x[base + 1], 1e20);
            assert_eq!(solver.driver.x[base + 2], 1e20);
        }
        Err(_) => {
            // other step failures also restore the snapshot
            let base = solver.sys.dof.local_offset(0, 0);
            assert_eq!(solver.driver.x[base + 1], 1e20);
        }
    }

    // no NaN may survive anywhere on either path
    assert!(solver.driver.x.iter().all(|v| v.is_finite()));
}

#[test]
fn mos_capacitor_interface() {
    // p substrate, 10 nm oxide, gate at +1 V
    let sub_coords = uniform_line(0.0, 0.5 * UM, 21);
    let substrate = semiconductor_bar(
        "substrate",
        &sub_coords,
        AREA,
        Material::silicon(),
        AdvancedModel::default(),
        |_| -1e17,
        300.0,
    );
    let ox_coords = uniform_line(0.5 * UM, 0.51 * UM, 5);
    let oxide = conductor_bar(
        "oxide",
        RegionKind::Insulator,
        &ox_coords,
        AREA,
        Material::oxide(),
        AdvancedModel::default(),
        300.0,
    );
    let mesh = Mesh { regions: vec![substrate, oxide], t_external: 300.0 };

    let bcs = vec![
        BoundaryCondition::Ohmic(OhmicContact {
            name: "substrate".into(),
            region: 0,
            nodes: vec![0],
            bias: Waveform::Dc(0.0),
        }),
        BoundaryCondition::InsulatorInterface(InsulatorInterface {
            name: "si/sio2".into(),
            semi_region: 0,
            semi_nodes: vec![20],
            ins_region: 1,
            ins_nodes: vec![0],
        }),
        BoundaryCondition::Gate(GateContact {
            name: "gate".into(),
            region: 1,
            nodes: vec![4],
            bias: Waveform::Dc(1.0),
            workfunction: 0.0,
        }),
    ];

    let config = SolverConfig::default();
    let mut solver = MixedModeSolver::create(mesh, bcs, None, config);
    solver.pre_solve(true);
    solver.solve().expect("MOS operating point must converge");
    solver.post_solve();

    let semi = &solver.sys.mesh.regions[0];
    let ox = &solver.sys.mesh.regions[1];

    // the interface condition ties the potentials together
    assert!(
        (ox.data[0].psi - semi.data[20].psi).abs() < 1e-6,
        "interface potential jump {:e}",
        (ox.data[0].psi - semi.data[20].psi).abs()
    );
    // the gate node sits at the applied bias
    assert!((ox.data[4].psi - 1.0).abs() < 1e-6);
    // positive gate bias bends the bands up at the surface
    assert!(semi.data[20].psi > semi.data[0].psi + 0.1);
}
