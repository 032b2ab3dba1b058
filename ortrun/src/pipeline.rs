use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Mode;
use crate::context::{JobContext, WorkingContext};
use crate::error::StageError;
use crate::job::{ArtifactSink, Job, JobSource};
use crate::normalize::Report;
use crate::stages::{
    AnalyzeStage, Completion, ConvertAnalyzerStage, NormalizeStage, ReportStage, ScanStage, SourceStage, Stage,
    StageFlow, Toolchain, VerifyHasPackagesStage, VerifyNonEmptyStage,
};

/// Name used for failures that happen before any stage runs.
const SETUP_STAGE: &str = "Setup";

/// The first stage error of a run, tagged with the stage that raised it.
#[derive(Debug, Error)]
#[error("{stage}: {error}")]
pub struct StageFailure {
    pub stage: &'static str,
    #[source]
    pub error: StageError,
}

#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<Vec<Box<dyn Stage>>>,
}

impl Pipeline {
    /// The stage sequence for `mode`.
    ///
    /// Scan: source, verify, analyze, verify packages, scan, normalize, report.
    /// Analyze: source, verify, analyze, convert.
    pub fn for_mode(mode: Mode, toolchain: Toolchain) -> Self {
        let builder = PipelineBuilder::new()
            .stage(SourceStage::new(toolchain.supervisor.clone()))
            .stage(VerifyNonEmptyStage)
            .stage(AnalyzeStage::new(toolchain.clone()));

        let builder = match mode {
            Mode::Analyze => builder.stage(ConvertAnalyzerStage),
            Mode::Scan => builder
                .stage(VerifyHasPackagesStage)
                .stage(ScanStage::new(toolchain.clone()))
                .stage(NormalizeStage)
                .stage(ReportStage::new(toolchain)),
        };
        builder.build()
    }

    /// Run the stages in order, stopping at the first error or at a stage
    /// that finishes the run.
    #[instrument(skip(self, ctx), fields(job = %ctx.job, stage_count = self.stages.len()))]
    pub async fn run_one(&self, ctx: &mut JobContext) -> Result<Completion, StageFailure> {
        for stage in self.stages.iter() {
            match stage.run(ctx).await {
                Ok(StageFlow::Continue) => {
                    debug!(stage = stage.name(), "stage complete");
                }
                Ok(StageFlow::Finish(completion)) => {
                    debug!(stage = stage.name(), ?completion, "stage finished the run");
                    return Ok(completion);
                }
                Err(error) => {
                    warn!(stage = stage.name(), error = %error, "stage failed");
                    return Err(StageFailure {
                        stage: stage.name(),
                        error,
                    });
                }
            }
        }
        Ok(Completion::Complete)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { stages: vec![] }
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: Arc::new(self.stages),
        }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// How a processed job ended, after uploads and acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded(Completion),
    Failed { stage: &'static str, reason: String },
}

/// What survives the working directory: collected before cleanup, uploaded
/// after it.
struct Artifacts {
    result: Result<Completion, StageFailure>,
    report: Option<Report>,
    html: Option<String>,
    logs: String,
}

/// Drives one job end to end: working directory, stages, cleanup, uploads,
/// acknowledgement.
pub struct Orchestrator {
    pipeline: Pipeline,
    source: Arc<dyn JobSource>,
    sink: Arc<dyn ArtifactSink>,
    work_root: Option<PathBuf>,
    ack_backoff: Duration,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline, source: Arc<dyn JobSource>, sink: Arc<dyn ArtifactSink>) -> Self {
        Self {
            pipeline,
            source,
            sink,
            work_root: None,
            ack_backoff: Duration::from_secs(1),
        }
    }

    /// Parent directory for working directories; the system temp dir if unset.
    pub fn work_root(mut self, root: Option<PathBuf>) -> Self {
        self.work_root = root;
        self
    }

    pub fn ack_backoff(mut self, backoff: Duration) -> Self {
        self.ack_backoff = backoff;
        self
    }

    pub fn source(&self) -> &Arc<dyn JobSource> {
        &self.source
    }

    #[instrument(skip(self, job), fields(job = %job))]
    pub async fn process(&self, job: Job) -> JobOutcome {
        info!(source = %job.source, "processing job");
        let (job, artifacts) = self.execute(job).await;

        let outcome = match artifacts.result {
            Ok(completion) => {
                self.deliver_success(&job, artifacts.report.as_ref(), artifacts.html.as_deref(), &artifacts.logs)
                    .await;
                info!(?completion, "job succeeded");
                JobOutcome::Succeeded(completion)
            }
            Err(failure) => {
                let reason = failure.to_string();
                self.deliver_failure(&job, &reason, &artifacts.logs).await;
                error!(stage = failure.stage, error = %failure.error, "job failed");
                JobOutcome::Failed {
                    stage: failure.stage,
                    reason,
                }
            }
        };

        ack_with_retry(self.source.as_ref(), &job.id, self.ack_backoff).await;
        outcome
    }

    /// Run the pipeline in a fresh working directory and remove it again,
    /// keeping what has to be uploaded.
    async fn execute(&self, job: Job) -> (Job, Artifacts) {
        let workdir = match WorkingContext::create(self.work_root.as_deref()) {
            Ok(workdir) => workdir,
            Err(error) => {
                let artifacts = Artifacts {
                    result: Err(StageFailure {
                        stage: SETUP_STAGE,
                        error,
                    }),
                    report: None,
                    html: None,
                    logs: String::new(),
                };
                return (job, artifacts);
            }
        };

        let mut ctx = JobContext::new(job, workdir);
        let result = self.pipeline.run_one(&mut ctx).await;
        let logs = ctx.workdir.read_log().await;

        let JobContext {
            job,
            workdir,
            report,
            html,
            ..
        } = ctx;
        if let Err(e) = workdir.cleanup().await {
            error!(error = %e, "failed to remove working directory");
        }

        (
            job,
            Artifacts {
                result,
                report,
                html,
                logs,
            },
        )
    }

    async fn deliver_success(&self, job: &Job, report: Option<&Report>, html: Option<&str>, logs: &str) {
        match report {
            Some(report) => log_upload(
                "report",
                self.sink.upload_report(report, &job.component, &job.version).await,
            ),
            None => warn!("run completed without a report"),
        }
        if let Some(html) = html {
            log_upload("html", self.sink.upload_html(html, &job.component, &job.version).await);
        }
        log_upload("logs", self.sink.upload_logs(logs, &job.component, &job.version).await);
    }

    async fn deliver_failure(&self, job: &Job, reason: &str, logs: &str) {
        log_upload("logs", self.sink.upload_logs(logs, &job.component, &job.version).await);
        log_upload(
            "error",
            self.sink.upload_error(reason, &job.component, &job.version).await,
        );
    }
}

fn log_upload(artifact: &'static str, result: anyhow::Result<()>) {
    match result {
        Ok(()) => debug!(artifact, "uploaded"),
        Err(e) => error!(artifact, error = %e, "upload failed"),
    }
}

/// Acknowledge `job_id` until the source accepts it, sleeping `backoff`
/// between attempts. Returns the number of attempts.
pub async fn ack_with_retry(source: &dyn JobSource, job_id: &str, backoff: Duration) -> u32 {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match source.acknowledge_finished(job_id).await {
            Ok(()) => {
                info!(job_id, attempts, "job acknowledged");
                return attempts;
            }
            Err(e) => {
                warn!(job_id, attempts, error = %e, "acknowledgement failed, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
