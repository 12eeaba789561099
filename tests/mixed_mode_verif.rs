//! Mixed-mode verification: two device diodes behind a 1 kOhm load in
//! a SPICE netlist, solved as a single coupled operating point.

use mixsim::circuit::{SpiceCircuit, Waveform};
use mixsim::discretization::builder::{graded_line, semiconductor_bar};
use mixsim::discretization::mesh::{AdvancedModel, Mesh, Region};
use mixsim::physics::bc::{BoundaryCondition, SpiceElectrode};
use mixsim::physics::material::Material;
use mixsim::solver::{MixedModeSolver, SolveType, SolverConfig};
use mixsim::units::{ONE_PER_CM3, UM};

const AREA: f64 = 1e-6;

fn diode_region(name: &str) -> (Region, usize) {
    let x_j = 2.0 * UM;
    let coords = graded_line(0.0, x_j, 4.0 * UM, 2e-7, 1.4);
    let n_nodes = coords.len();
    let region = semiconductor_bar(
        name,
        &coords,
        AREA,
        Material::silicon().with_lifetimes(1e-3, 1e-3),
        AdvancedModel::default(),
        move |x| if x < x_j { -1e17 } else { 1e17 },
        300.0,
    );
    (region, n_nodes)
}

#[test]
fn two_diode_latch_operating_point() {
    let (d1, n1) = diode_region("diode1");
    let (d2, n2) = diode_region("diode2");
    let mesh = Mesh { regions: vec![d1, d2], t_external: 300.0 };

    // V1 --- 1k --- node2 --- (D1 || D2) --- gnd
    let mut ckt = SpiceCircuit::new(300.0);
    let node1 = ckt.add_node("supply");
    let node2 = ckt.add_node("load");
    ckt.add_vsource(Some(node1), None, Waveform::Dc(1.0));
    ckt.add_resistor(Some(node1), Some(node2), 1000.0);

    let bcs = vec![
        BoundaryCondition::SpiceElectrode(SpiceElectrode {
            name: "d1.anode".into(),
            region: 0,
            nodes: vec![0],
            ckt_node: Some(node2),
        }),
        BoundaryCondition::SpiceElectrode(SpiceElectrode {
            name: "d1.cathode".into(),
            region: 0,
            nodes: vec![n1 - 1],
            ckt_node: None,
        }),
        BoundaryCondition::SpiceElectrode(SpiceElectrode {
            name: "d2.anode".into(),
            region: 1,
            nodes: vec![0],
            ckt_node: Some(node2),
        }),
        BoundaryCondition::SpiceElectrode(SpiceElectrode {
            name: "d2.cathode".into(),
            region: 1,
            nodes: vec![n2 - 1],
            ckt_node: None,
        }),
    ];

    let mut config = SolverConfig::default();
    config.max_newton_iterations = 150;
    let mut solver = MixedModeSolver::create(mesh, bcs, Some(ckt), config);
    solver.pre_solve(true);
    solver.solve().expect("latch operating point must converge");
    solver.post_solve();

    let report = solver.last_report.as_ref().expect("operating point ran");

    // the first bias jump is large enough that potential damping
    // must fire at least once
    assert!(
        report.min_damping_factor < 1.0,
        "potential damping never fired (factor {})",
        report.min_damping_factor
    );

    // both diodes share the load node; its voltage sits one diode
    // drop below the supply
    let ckt = solver.sys.circuit.as_ref().unwrap();
    let v2 = ckt.voltage(1);
    assert!(v2 > 0.55 && v2 < 0.9, "load node at {v2} V");
    let v1 = ckt.voltage(0);
    assert!((v1 - 1.0).abs() < 1e-6, "supply node at {v1} V");

    // the circuit KCL residual (including device terminal currents)
    // converged
    assert!(report.norms.spice <= 1e-9, "spice norm {:e}", report.norms.spice);

    // device invariants hold on the accepted iterate
    for region in &solver.sys.mesh.regions {
        for data in &region.data {
            assert!(data.n >= ONE_PER_CM3 && data.p >= ONE_PER_CM3);
        }
    }
}
