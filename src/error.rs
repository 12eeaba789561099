use thiserror::Error;

/// Solver failure taxonomy.
///
/// `Index` and `InvariantViolation` indicate programmer bugs and are
/// fatal. The remaining kinds are step-level failures: the driver
/// restores the last accepted state and retries with a halved time
/// step until `dt_min` is reached.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("query of disabled variable {var} in region {region}")]
    Index { region: usize, var: &'static str },

    #[error("NaN produced during {phase} assembly")]
    AssemblyNan { phase: &'static str },

    #[error("linear solve failed: {0}")]
    LinearSolveFailure(String),

    #[error("Newton iteration diverged after {iterations} iterations")]
    NewtonDiverged { iterations: u32 },

    #[error("invariant violated after projection: {0}")]
    InvariantViolation(String),

    #[error("circuit equations rejected the step: {0}")]
    CircuitFailure(String),

    #[error("time step fell below dt_min = {dt_min:e} s")]
    TimeStepUnderflow { dt_min: f64 },
}

pub type Result<T> = std::result::Result<T, SolverError>;
