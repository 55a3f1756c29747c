//! Request-level error taxonomy.
//!
//! A timed-out script is not an error: it is a handled result with
//! `success: false`. Rule-store failures never surface here either; they
//! become a single failed test outcome.

/// Why an execution request could not produce a normal result.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Malformed request body. Caller-correctable.
    #[error("{0}")]
    Input(String),

    /// Script refused by the policy engine before any container existed.
    #[error("{reason}")]
    PolicyRejection { reason: String },

    /// The container runtime failed to create, start, attach, or wait.
    #[error("sandbox execution failed: {0}")]
    Resource(String),

    /// Bug or panic inside the pipeline.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// True when the caller can fix the problem by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Input(_) | Self::PolicyRejection { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_input_and_policy() {
        assert!(ExecError::Input("bad".into()).is_client_error());
        assert!(
            ExecError::PolicyRejection {
                reason: "nope".into()
            }
            .is_client_error()
        );
        assert!(!ExecError::Resource("daemon down".into()).is_client_error());
        assert!(!ExecError::Internal("panic".into()).is_client_error());
    }

    #[test]
    fn policy_rejection_displays_reason_verbatim() {
        let err = ExecError::PolicyRejection {
            reason: "Execution of command 'rm' is not permitted.".into(),
        };
        assert_eq!(
            err.to_string(),
            "Execution of command 'rm' is not permitted."
        );
    }
}
