use crate::fit_engine::EngineState;

/// Error returned by the fitting core
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum FitError {
    #[error("{context}: expected size {expected}, got {actual}")]
    Dimension {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid block sizes: {0}")]
    Allocation(String),

    #[error("{context}: index {index} is out of range 0..{size}")]
    Index {
        context: &'static str,
        index: usize,
        size: usize,
    },

    #[error("parameters out of domain: {0}")]
    Domain(String),

    #[error("ill-conditioned step: {0}")]
    Conditioning(String),

    #[error("could not find a suitable point along the step direction")]
    UnreachableStep,

    #[error("failed to find a suitable step after {tries} tries")]
    NoSuitableStep { tries: usize },

    #[error("fit engine must be initialized before iterating")]
    NotInitialized,

    #[error("cannot iterate a fit engine in state {0:?}")]
    InvalidState(EngineState),

    #[error("unknown fit engine: {0}")]
    UnknownEngine(String),

    #[error("fit function failed: {0}")]
    Model(String),
}

impl FitError {
    pub(crate) fn dimension(context: &'static str, expected: usize, actual: usize) -> Self {
        Self::Dimension {
            context,
            expected,
            actual,
        }
    }

    pub(crate) fn index(context: &'static str, index: usize, size: usize) -> Self {
        Self::Index {
            context,
            index,
            size,
        }
    }

    /// Errors that the engines may recover from locally: infeasible points and ill-conditioned
    /// linear systems.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Domain(_) | Self::Conditioning(_))
    }
}

/// Error returned from user-provided residual and Jacobian callbacks
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The parameters are outside of the model's domain, a smaller step may succeed
    #[error("out of domain: {0}")]
    OutOfDomain(String),

    /// The derivatives cannot be trusted at this point, rescaling the Jacobian may help
    #[error("ill-conditioned: {0}")]
    IllConditioned(String),

    #[error("{0}")]
    Failed(String),
}

impl From<ModelError> for FitError {
    fn from(error: ModelError) -> Self {
        match error {
            ModelError::OutOfDomain(msg) => Self::Domain(msg),
            ModelError::IllConditioned(msg) => Self::Conditioning(msg),
            ModelError::Failed(msg) => Self::Model(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_errors_keep_recoverability() {
        let domain: FitError = ModelError::OutOfDomain("negative rate".into()).into();
        assert!(domain.is_recoverable());
        let conditioning: FitError = ModelError::IllConditioned("flat".into()).into();
        assert!(conditioning.is_recoverable());
        let fatal: FitError = ModelError::Failed("broken".into()).into();
        assert_eq!(fatal, FitError::Model("broken".into()));
        assert!(!fatal.is_recoverable());
    }

    #[test]
    fn dimension_error_message() {
        let err = FitError::dimension("residual vector", 7, 5);
        assert_eq!(err.to_string(), "residual vector: expected size 7, got 5");
    }
}
