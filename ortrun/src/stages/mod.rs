pub mod analyze;
pub mod report;
pub mod scan;
pub mod source;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::StageError;
use crate::normalize::OrtResult;
use crate::supervisor::{ProcessOutput, ProcessSupervisor};

pub use analyze::{AnalyzeStage, ConvertAnalyzerStage, VerifyHasPackagesStage};
pub use report::ReportStage;
pub use scan::{NormalizeStage, ScanStage};
pub use source::{SourceStage, VerifyNonEmptyStage};

/// What the pipeline does after a stage succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    Continue,
    /// Stop here and report what the context holds.
    Finish(Completion),
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every stage ran.
    Complete,
    /// Analysis found no packages; scanning was skipped.
    NoDependenciesFound,
}

#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(&self, ctx: &mut JobContext) -> Result<StageFlow, StageError>;
    fn name(&self) -> &'static str;
}

/// The analysis toolchain executable and the settings its stages share.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub supervisor: ProcessSupervisor,
    program: String,
    base_args: Vec<String>,
    pub scanner_config: PathBuf,
}

impl Toolchain {
    /// `command` may carry leading arguments, e.g. `java -jar ort.jar`.
    pub fn new(supervisor: ProcessSupervisor, command: &str, scanner_config: impl Into<PathBuf>) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self {
            supervisor,
            program,
            base_args: parts.collect(),
            scanner_config: scanner_config.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the toolchain with `args` inside the job's working directory.
    pub async fn invoke(&self, ctx: &JobContext, args: Vec<String>) -> Result<ProcessOutput, StageError> {
        let args: Vec<String> = self.base_args.iter().cloned().chain(args).collect();
        self.supervisor
            .run(&self.program, &args, ctx.workdir.root(), &ctx.workdir.log_path())
            .await
    }
}

/// Fail with `MissingArtifact` unless `path` exists.
pub fn require(path: &Path) -> Result<(), StageError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(StageError::MissingArtifact {
            path: path.to_path_buf(),
        })
    }
}

pub async fn read_ort_result(path: &Path) -> Result<OrtResult, StageError> {
    require(path)?;
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StageError::io(path, e))?;
    serde_json::from_str(&content).map_err(|source| StageError::InvalidOutput {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn path_arg(path: &Path) -> String {
    path.display().to_string()
}
