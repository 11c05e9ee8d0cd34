//! Error types for reconstruction runs.
//!
//! Every error is raised synchronously where it is detected, before any
//! partial computation, and is never retried. The orchestrator hands them back
//! to the caller unchanged.

use thiserror::Error;

/// Main error type for reconstruction operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconError {
    /// Geometry lookup outside the recorded projection range.
    #[error("Invalid projection index {index} (geometry holds {len} projections)")]
    InvalidIndex { index: usize, len: usize },

    /// A required input was never bound.
    #[error("Missing input: {0}")]
    MissingInput(&'static str),

    /// DVF / phase-count / volume-dimension inconsistency.
    #[error("Geometry mismatch: {0}")]
    GeometryMismatch(String),

    /// Attempt to rebind an operator that is fixed at construction.
    #[error("Configuration locked: {0} cannot be changed")]
    ConfigurationLocked(&'static str),

    /// Malformed configuration value or signal sample.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type for reconstruction operations.
pub type Result<T> = std::result::Result<T, ReconError>;

impl ReconError {
    /// Create a geometry mismatch error.
    pub fn mismatch(msg: impl Into<String>) -> Self {
        Self::GeometryMismatch(msg.into())
    }

    /// Create an invalid parameter error.
    pub fn parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Check that `index` addresses one of `len` projections.
    pub fn check_index(index: usize, len: usize) -> Result<()> {
        if index < len {
            Ok(())
        } else {
            Err(Self::InvalidIndex { index, len })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_index() {
        assert!(ReconError::check_index(2, 3).is_ok());
        assert_eq!(
            ReconError::check_index(3, 3),
            Err(ReconError::InvalidIndex { index: 3, len: 3 })
        );
    }

    #[test]
    fn test_display() {
        let err = ReconError::mismatch("4 fields for 5 phases");
        assert_eq!(err.to_string(), "Geometry mismatch: 4 fields for 5 phases");
    }
}
