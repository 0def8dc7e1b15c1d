use thiserror::Error;

/// Conditions that end a completion without an answer.
#[derive(Debug, Error)]
pub enum RlmError {
    #[error("Max iterations ({0}) exceeded without FINAL()")]
    MaxIterations(u32),

    #[error("Max recursion depth ({0}) exceeded")]
    MaxDepth(u32),

    /// The model-call collaborator failed. Surfaced as-is, never retried here.
    #[error("model call failed: {0:#}")]
    Model(#[source] anyhow::Error),

    /// A dedicated async runtime for a blocking completion could not be built.
    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The Python interpreter backing the session could not be started.
    #[error("sandbox unavailable: {0}")]
    Sandbox(#[from] ReplError),
}

/// Faults raised while running one code fragment. These never end a session;
/// the loop turns them into feedback for the model.
#[derive(Debug, Error)]
pub enum ReplError {
    #[error("Compilation error: {0}")]
    Compile(String),

    #[error("Compilation error: {0}")]
    Forbidden(String),

    #[error("Execution error: {message}")]
    Runtime { message: String, output: String },

    #[error("Python session unavailable: {0}")]
    Unavailable(String),
}

impl ReplError {
    /// Text fed back to the model in place of the fragment's output.
    pub fn to_observation(&self) -> String {
        match self {
            ReplError::Runtime { output, .. } if !output.trim().is_empty() => {
                format!("{}\nError: {}", output.trim_end(), self)
            }
            _ => format!("Error: {}", self),
        }
    }
}

pub type Result<T, E = RlmError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_observation_keeps_partial_output() {
        let err = ReplError::Runtime {
            message: "ZeroDivisionError: division by zero".to_string(),
            output: "before\n".to_string(),
        };
        assert_eq!(
            err.to_observation(),
            "before\nError: Execution error: ZeroDivisionError: division by zero"
        );
    }

    #[test]
    fn test_compile_observation() {
        let err = ReplError::Forbidden("Line 1: import statements are not allowed".to_string());
        assert_eq!(
            err.to_observation(),
            "Error: Compilation error: Line 1: import statements are not allowed"
        );
    }

    #[test]
    fn test_limit_messages() {
        assert_eq!(
            RlmError::MaxIterations(3).to_string(),
            "Max iterations (3) exceeded without FINAL()"
        );
        assert_eq!(
            RlmError::MaxDepth(2).to_string(),
            "Max recursion depth (2) exceeded"
        );
    }
}
