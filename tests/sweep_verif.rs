//! DC sweep verification: the forward I-V curve of a long-lifetime
//! abrupt PN diode against the short-base Shockley law.

use mixsim::circuit::Waveform;
use mixsim::discretization::builder::{graded_line, semiconductor_bar};
use mixsim::discretization::mesh::{AdvancedModel, Mesh};
use mixsim::physics::bc::{BoundaryCondition, OhmicContact};
use mixsim::physics::material::Material;
use mixsim::solver::{MixedModeSolver, SolveType, SolverConfig};
use mixsim::units::{thermal_voltage, E, UM};

const AREA: f64 = 1e-6;
const NA: f64 = 1e17;
const ND: f64 = 1e17;
/// Quasi-neutral width of each side, cm.
const SIDE: f64 = 2.0 * UM;

fn diode() -> (Mesh, Vec<BoundaryCondition>) {
    let x_j = SIDE;
    let coords = graded_line(0.0, x_j, 2.0 * SIDE, 1e-7, 1.3);
    let n_nodes = coords.len();

    // millisecond lifetimes make the diffusion length far larger than
    // the base, so the short-base law applies
    let region = semiconductor_bar(
        "diode",
        &coords,
        AREA,
        Material::silicon().with_lifetimes(1e-3, 1e-3),
        AdvancedModel::default(),
        move |x| if x < x_j { -NA } else { ND },
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

/// Short-base saturation current of the abrupt junction.
fn shockley_saturation_current() -> f64 {
    let mat = Material::silicon();
    let vt = thermal_voltage(300.0);
    let dn = (mat.mobility_n)(300.0) * vt;
    let dp = (mat.mobility_p)(300.0) * vt;
    let ni2 = mat.ni * mat.ni;
    E * AREA * ni2 * (dp / (SIDE * ND) + dn / (SIDE * NA))
}

#[test]
fn pn_diode_forward_sweep_matches_shockley() {
    let (mesh, bcs) = diode();
    let mut config = SolverConfig::default();
    config.solve_type = SolveType::DcSweep;
    config.sweep_electrode = 0;
    config.sweep_start = 0.0;
    config.sweep_stop = 0.8;
    config.sweep_step = 0.1;

    let mut solver = MixedModeSolver::create(mesh, bcs, None, config);
    solver.pre_solve(true);
    solver.solve().expect("forward sweep must converge");
    solver.post_solve();

    let iv = &solver.iv_curve;
    assert_eq!(iv.len(), 9);

    // monotone increasing wherever the current is above the
    // femtoampere cancellation noise of the contact flux sum
    for pair in iv.windows(2) {
        let (_, i_low) = pair[0];
        let (v_high, i_high) = pair[1];
        if i_high.abs() > 1e-13 || i_low.abs() > 1e-13 {
            assert!(
                i_high > i_low,
                "I-V not monotone at V = {v_high}: {i_low:e} -> {i_high:e}"
            );
        }
    }

    // Shockley comparison at 0.7 V
    let (_, i_sim) = iv
        .iter()
        .find(|(v, _)| (v - 0.7).abs() < 1e-6)
        .copied()
        .expect("0.7 V bias point present");
    let vt = thermal_voltage(300.0);
    let i_ref = shockley_saturation_current() * ((0.7 / vt).exp() - 1.0);
    let rel_err = (i_sim - i_ref).abs() / i_ref;
    assert!(
        rel_err < 0.05,
        "I(0.7 V) = {i_sim:e} A vs Shockley {i_ref:e} A ({:.1}% off)",
        rel_err * 100.0
    );
}
