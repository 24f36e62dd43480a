use thiserror::Error;

/// Errors raised by the truncated EM routines that callers may want to match on.
///
/// They travel inside an [eyre::Report]; use `report.downcast_ref::<EtError>()` to inspect them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EtError {
    /// A precondition on the model configuration does not hold, e.g. a label mask that leaves
    /// fewer than `Hprime` eligible causes.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Parameters, data and model disagree on a dimension.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Workers contributed incompatible values to the same collective call.
    #[error("collective mismatch: {0}")]
    CollectiveMismatch(String),
}
