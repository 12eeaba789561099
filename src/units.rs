//! Physical unit table, cm-based.
//!
//! All quantities in the crate are expressed in this unit system:
//! lengths in cm, potentials in V, temperatures in K, times in s,
//! currents in A. The table is immutable; there is no runtime unit
//! configuration.

/// Length unit.
pub const CM: f64 = 1.0;
pub const UM: f64 = 1e-4 * CM;
pub const NM: f64 = 1e-7 * CM;

/// Time unit.
pub const S: f64 = 1.0;

/// Electrical units.
pub const V: f64 = 1.0;
pub const A: f64 = 1.0;
pub const C: f64 = A * S;

/// Temperature unit.
pub const K: f64 = 1.0;

/// Energy unit.
pub const J: f64 = C * V;

/// Boltzmann constant.
pub const KB: f64 = 1.380649e-23 * J / K;

/// Elementary charge.
pub const E: f64 = 1.602176634e-19 * C;

/// Vacuum permittivity, F/cm.
pub const EPS0: f64 = 8.854187817e-14 * C / V / CM;

/// Floor for carrier densities, 1 cm^-3.
pub const ONE_PER_CM3: f64 = 1.0 / (CM * CM * CM);

/// Thermal voltage kT/e at temperature `t`.
#[inline]
pub fn thermal_voltage(t: f64) -> f64 {
    KB * t / E
}
