//! Per-region material property tables.
//!
//! The tables are opaque to the solver: each is a callable evaluated
//! at the current lattice temperature. Coefficients are frozen within
//! a Newton step; the Jacobian differentiates the governing equations
//! through the state variables, not through the tables.

use std::sync::Arc;

use crate::units::{CM, J, K, S, V};

/// Property table that may depend on lattice temperature.
pub type PropertyFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

fn constant(value: f64) -> PropertyFn {
    Arc::new(move |_| value)
}

#[derive(Clone)]
pub struct Material {
    /// Permittivity, F/cm.
    pub eps: f64,
    /// Intrinsic carrier density at the ambient temperature, cm^-3.
    pub ni: f64,
    /// Bandgap, used for recombination heating, V.
    pub eg: f64,
    /// Carrier mobility tables, cm^2/(V s).
    pub mobility_n: PropertyFn,
    pub mobility_p: PropertyFn,
    /// SRH lifetimes, s.
    pub tau_n: f64,
    pub tau_p: f64,
    /// Electrical conductivity (metal regions), 1/(Ohm cm).
    pub sigma: f64,
    /// Thermal conductivity table, J/(cm K s).
    pub kappa: PropertyFn,
    /// Volumetric heat capacity, J/(cm^3 K).
    pub heat_capacity: f64,
    /// Carrier energy relaxation time, s.
    pub tau_energy: f64,
}

impl Material {
    pub fn silicon() -> Self {
        Self {
            eps: 11.7 * crate::units::EPS0,
            ni: 1.0e10 / (CM * CM * CM),
            eg: 1.12 * V,
            // Power-law lattice scattering around 300 K.
            mobility_n: Arc::new(|t| 1417.0 * (t / 300.0).powf(-2.2)),
            mobility_p: Arc::new(|t| 470.0 * (t / 300.0).powf(-2.2)),
            tau_n: 1e-7 * S,
            tau_p: 1e-7 * S,
            sigma: 0.0,
            kappa: constant(1.5 * J / (CM * K * S)),
            heat_capacity: 1.63 * J / (CM * CM * CM * K),
            tau_energy: 1e-12 * S,
        }
    }

    pub fn oxide() -> Self {
        Self {
            eps: 3.9 * crate::units::EPS0,
            ni: 0.0,
            eg: 9.0 * V,
            mobility_n: constant(0.0),
            mobility_p: constant(0.0),
            tau_n: 0.0,
            tau_p: 0.0,
            sigma: 0.0,
            kappa: constant(0.014 * J / (CM * K * S)),
            heat_capacity: 1.67 * J / (CM * CM * CM * K),
            tau_energy: 0.0,
        }
    }

    pub fn aluminum() -> Self {
        Self {
            eps: crate::units::EPS0,
            ni: 0.0,
            eg: 0.0,
            mobility_n: constant(0.0),
            mobility_p: constant(0.0),
            tau_n: 0.0,
            tau_p: 0.0,
            sigma: 3.5e5 / (CM),
            kappa: constant(2.37 * J / (CM * K * S)),
            heat_capacity: 2.42 * J / (CM * CM * CM * K),
            tau_energy: 0.0,
        }
    }

    /// Replace the SRH lifetimes; builder-style.
    pub fn with_lifetimes(mut self, tau_n: f64, tau_p: f64) -> Self {
        self.tau_n = tau_n;
        self.tau_p = tau_p;
        self
    }

    /// Replace both mobility tables with constants; builder-style.
    pub fn with_constant_mobility(mut self, mu_n: f64, mu_p: f64) -> Self {
        self.mobility_n = constant(mu_n);
        self.mobility_p = constant(mu_p);
        self
    }
}
