use std::io::ErrorKind;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{path_arg, Stage, StageFlow};
use crate::context::{JobContext, REPO_DIR};
use crate::error::StageError;
use crate::job::SourceLocator;
use crate::supervisor::ProcessSupervisor;

/// Materializes the component sources under `repo/`: `git clone` for
/// remotes, a recursive copy for local paths.
pub struct SourceStage {
    supervisor: ProcessSupervisor,
}

impl SourceStage {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }
}

fn source_command(source: &SourceLocator) -> (&'static str, Vec<String>) {
    match source {
        SourceLocator::Remote(url) => (
            "git",
            vec![
                "clone".to_string(),
                "--depth".to_string(),
                "1".to_string(),
                url.clone(),
                REPO_DIR.to_string(),
            ],
        ),
        SourceLocator::Path(path) => (
            "cp",
            vec!["-R".to_string(), path_arg(path), format!("./{REPO_DIR}")],
        ),
    }
}

#[async_trait]
impl Stage for SourceStage {
    #[instrument(skip(self, ctx), fields(job = %ctx.job, source = %ctx.job.source))]
    async fn run(&self, ctx: &mut JobContext) -> Result<StageFlow, StageError> {
        let (program, args) = source_command(&ctx.job.source);
        self.supervisor
            .run(program, &args, ctx.workdir.root(), &ctx.workdir.log_path())
            .await?;
        Ok(StageFlow::Continue)
    }

    fn name(&self) -> &'static str {
        "Source"
    }
}

/// Fails unless `repo/` holds something besides VCS metadata.
pub struct VerifyNonEmptyStage;

#[async_trait]
impl Stage for VerifyNonEmptyStage {
    #[instrument(skip(self, ctx), fields(job = %ctx.job))]
    async fn run(&self, ctx: &mut JobContext) -> Result<StageFlow, StageError> {
        let repo = ctx.workdir.repo_dir();
        let empty = || StageError::EmptySource { path: repo.clone() };

        let mut entries = match tokio::fs::read_dir(&repo).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(empty()),
            Err(e) => return Err(StageError::io(&repo, e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| StageError::io(&repo, e))? {
            if entry.file_name() != ".git" {
                debug!(first_entry = ?entry.file_name(), "source tree is not empty");
                return Ok(StageFlow::Continue);
            }
        }

        Err(empty())
    }

    fn name(&self) -> &'static str {
        "VerifyNonEmpty"
    }
}
