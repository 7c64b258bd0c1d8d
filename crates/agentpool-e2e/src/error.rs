//! Error types for agentpool-e2e

use thiserror::Error;

/// Errors that can occur while staging, validating or tearing down a fixture
#[derive(Error, Debug)]
pub enum HarnessError {
    /// A named external resource did not exist when a lookup required it
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// A name lookup matched more than one pool
    #[error("agent pool name {name:?} matched {matches} pools, expected exactly one")]
    AmbiguousPool { name: String, matches: usize },

    /// Transport, auth or rate-limit failure talking to a remote API
    #[error("API request failed: {0}")]
    Api(String),

    /// The infrastructure-as-code engine reported failure
    #[error("`{command}` failed (exit code {exit_code:?}): {stderr}")]
    Provisioning {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The settle deadline elapsed without observing the expected state
    #[error("{check}: expected {expected}, observed {observed} after {attempts} attempt(s)")]
    PostconditionMismatch {
        check: String,
        expected: String,
        observed: String,
        attempts: u32,
    },

    /// Missing or invalid harness configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Persisted fixture state is missing or inconsistent
    #[error("fixture state error: {0}")]
    State(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Shorthand for a missing agent pool.
    pub fn pool_not_found(name: impl Into<String>) -> Self {
        HarnessError::NotFound {
            kind: "agent pool",
            name: name.into(),
        }
    }
}

impl From<reqwest::Error> for HarnessError {
    fn from(err: reqwest::Error) -> Self {
        HarnessError::Api(err.to_string())
    }
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postcondition_message_carries_expected_and_observed() {
        let err = HarnessError::PostconditionMismatch {
            check: "agents in pool linux-e2e-agents-42".to_string(),
            expected: "2".to_string(),
            observed: "1".to_string(),
            attempts: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 2"));
        assert!(msg.contains("observed 1"));
        assert!(msg.contains("4 attempt"));
    }

    #[test]
    fn test_pool_not_found_kind() {
        let err = HarnessError::pool_not_found("e2e-agents-7");
        assert_eq!(err.to_string(), "agent pool not found: e2e-agents-7");
    }
}
