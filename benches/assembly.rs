use criterion::{criterion_group, criterion_main, Criterion};

use mixsim::circuit::Waveform;
use mixsim::discretization::builder::{semiconductor_bar, uniform_line};
use mixsim::discretization::mesh::{AdvancedModel, Mesh};
use mixsim::physics::bc::{BoundaryCondition, OhmicContact};
use mixsim::physics::material::Material;
use mixsim::solver::{MixedModeSolver, SolverConfig};
use mixsim::units::UM;

fn bench_assembly(c: &mut Criterion) {
    let n_nodes = 201;
    let coords = uniform_line(0.0, 2.0 * UM, n_nodes);
    let x_j = 1.0 * UM;
    let region = semiconductor_bar(
        "diode",
        &coords,
        1e-6,
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
            bias: Waveform::Dc(0.3),
        }),
        BoundaryCondition::Ohmic(OhmicContact {
            name: "cathode".into(),
            region: 0,
            nodes: vec![n_nodes - 1],
            bias: Waveform::Dc(0.0),
        }),
    ];

    let mut solver = MixedModeSolver::create(mesh, bcs, None, SolverConfig::default());
    solver.pre_solve(true);

    c.bench_function("residual_assembly", |b| {
        b.iter(|| solver.driver.assemble_residual(&mut solver.sys, None, 0.0).unwrap())
    });

    c.bench_function("jacobian_assembly", |b| {
        b.iter(|| {
            solver.driver.assemble_residual(&mut solver.sys, None, 0.0).unwrap();
            solver.driver.assemble_jacobian(&mut solver.sys, None, 0.0).unwrap()
        })
    });
}

criterion_group!(benches, bench_assembly);
criterion_main!(benches);
