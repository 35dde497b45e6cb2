use thiserror::Error;

/// Error kinds a planning run can surface.
///
/// Most trouble is folded into result diagnostics instead: decode failures
/// fall back to defaults, bad domain records are dropped and tagged, and a
/// solver outage degrades to the greedy fallback. Only a missing required
/// input or a broken internal invariant aborts a run.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("configuration rejected: {0}")]
    Config(String),

    #[error("invalid input data: {0}")]
    Data(String),

    #[error("solver unavailable: {0}")]
    SolverUnavailable(String),

    #[error("invariant violated: {0}")]
    Fatal(String),
}

pub type PlanResult<T> = Result<T, PlanError>;
