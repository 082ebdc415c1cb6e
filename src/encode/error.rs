//! Error types for external encoder invocations.

use thiserror::Error;

pub type EncodeResult<T> = Result<T, EncodeError>;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {secs} seconds")]
    Timeout { program: String, secs: u64 },

    #[error("{program} exited with status {exit_code:?}: {stderr}")]
    Failed {
        program: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    pub fn failed(program: &str, stderr: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::Failed {
            program: program.to_string(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}
