use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Classified failure of a single pipeline stage.
///
/// Any of these aborts the remaining stages; the rendered message becomes the
/// error artifact sent back to the job service.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("source tree at {} is empty", path.display())]
    EmptySource { path: PathBuf },

    #[error("expected toolchain output {} does not exist", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("`{command}` failed ({}): {stderr_tail}", exit_label(*code))]
    ProcessFailure {
        command: String,
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("`{command}` produced no output for {}s and was killed", after.as_secs())]
    Timeout {
        command: String,
        after: Duration,
        stderr_tail: String,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    InvalidOutput {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

impl StageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "no exit code".to_string(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("no result data after analyzer")]
    MissingAnalyzerResult,
}
