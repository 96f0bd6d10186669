//! Error types for the host-path scenario

use thiserror::Error;

use crate::scenario::StepName;

/// A failed scenario run
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A step's action or readiness gate failed; later steps did not run
    #[error("step {step} failed: {source}")]
    Step {
        /// The step that failed
        step: StepName,
        /// Collaborator error or gate timeout
        source: kmc_common::Error,
    },

    /// The persistence directory lacks required entries
    #[error("host path is missing {missing:?} (listing: {listing:?})")]
    Verification {
        /// Required entries not found
        missing: Vec<String>,
        /// Raw directory listing
        listing: String,
    },

    /// Invalid scenario configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a harness error as the failure of `step`
    pub fn step(step: StepName, source: kmc_common::Error) -> Self {
        Self::Step { step, source }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The step that failed, if the error came from one
    pub fn failed_step(&self) -> Option<StepName> {
        match self {
            Self::Step { step, .. } => Some(*step),
            Self::Verification { .. } => Some(StepName::VerifyHostPath),
            Self::Config(_) => None,
        }
    }

    /// Whether a readiness gate or the tunnel did not converge in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Step { source, .. } if source.is_timeout())
    }
}
