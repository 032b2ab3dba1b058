use std::path::{Path, PathBuf};

use anyhow::Context;
use tempfile::TempDir;
use tracing::debug;

use crate::error::StageError;
use crate::job::Job;
use crate::normalize::{OrtResult, Report};

pub const REPO_DIR: &str = "repo";
pub const OUT_DIR: &str = "out";
pub const LOG_FILE: &str = "logger.txt";
pub const ANALYZER_RESULT: &str = "analyzer-result.json";
pub const SCAN_RESULT: &str = "scan-result.json";
pub const HTML_REPORT: &str = "scan-report-web-app.html";

/// Scratch directory for one job: `repo/`, `out/` and `logger.txt`.
///
/// [`WorkingContext::cleanup`] removes the tree. If the context is dropped
/// without it (a panic unwinding through the pipeline), `TempDir`'s own
/// drop removes it instead.
#[derive(Debug)]
pub struct WorkingContext {
    dir: TempDir,
}

impl WorkingContext {
    pub fn create(parent: Option<&Path>) -> Result<Self, StageError> {
        let parent = parent.map_or_else(std::env::temp_dir, Path::to_path_buf);
        let dir = tempfile::Builder::new()
            .prefix("ortrun-")
            .tempdir_in(&parent)
            .map_err(|e| StageError::io(&parent, e))?;

        let out = dir.path().join(OUT_DIR);
        std::fs::create_dir(&out).map_err(|e| StageError::io(&out, e))?;

        debug!(path = %dir.path().display(), "created working directory");
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root().join(REPO_DIR)
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root().join(OUT_DIR)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root().join(LOG_FILE)
    }

    pub fn analyzer_result(&self) -> PathBuf {
        self.out_dir().join(ANALYZER_RESULT)
    }

    pub fn scan_result(&self) -> PathBuf {
        self.out_dir().join(SCAN_RESULT)
    }

    pub fn html_report(&self) -> PathBuf {
        self.out_dir().join(HTML_REPORT)
    }

    /// Combined subprocess log so far; empty if nothing has run yet.
    pub async fn read_log(&self) -> String {
        tokio::fs::read_to_string(self.log_path())
            .await
            .unwrap_or_default()
    }

    /// Remove the whole tree.
    pub async fn cleanup(self) -> anyhow::Result<()> {
        let path = self.root().to_path_buf();
        tokio::task::spawn_blocking(move || self.dir.close())
            .await
            .context("cleanup task panicked")?
            .with_context(|| format!("failed to remove {}", path.display()))?;
        debug!(path = %path.display(), "removed working directory");
        Ok(())
    }
}

/// Everything the stages of one pipeline run share.
#[derive(Debug)]
pub struct JobContext {
    pub job: Job,
    pub workdir: WorkingContext,
    /// Parsed `analyzer-result.json`, set by the analyze stage.
    pub analyzer: Option<OrtResult>,
    pub report: Option<Report>,
    pub html: Option<String>,
}

impl JobContext {
    pub fn new(job: Job, workdir: WorkingContext) -> Self {
        Self {
            job,
            workdir,
            analyzer: None,
            report: None,
            html: None,
        }
    }
}
