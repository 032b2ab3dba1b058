//! Job runner for an external software-composition-analysis toolchain.
//!
//! A [`scheduler::Scheduler`] polls a [`job::JobSource`] and hands each job to
//! the [`pipeline::Orchestrator`], which runs the stages in a scratch
//! directory, uploads the artifacts through an [`job::ArtifactSink`] and
//! acknowledges the job.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod normalize;
pub mod pipeline;
pub mod scheduler;
pub mod stages;
pub mod supervisor;

use std::sync::Arc;

use anyhow::Result;

pub use api::JobApiClient;
pub use config::{Config, Mode};
pub use error::{NormalizeError, StageError};
pub use job::{ArtifactSink, Job, JobSource, SourceLocator};
pub use normalize::Report;
pub use pipeline::{JobOutcome, Orchestrator, Pipeline, PipelineBuilder};
pub use scheduler::{Scheduler, TickOutcome};
pub use stages::{Completion, Toolchain};
pub use supervisor::ProcessSupervisor;

/// Wire a scheduler from configuration, talking HTTP to the job service.
pub fn scheduler_from_config(config: &Config) -> Result<Scheduler> {
    let client = Arc::new(JobApiClient::new(
        &config.job_api_url,
        config.worker.clone(),
        config.job_type().to_string(),
    )?);

    let supervisor = ProcessSupervisor::new(config.silence_timeout(), config.info_marker.clone());
    let toolchain = Toolchain::new(supervisor, &config.ort_command, config.scanner_config.clone());
    let pipeline = Pipeline::for_mode(config.mode, toolchain);

    let orchestrator = Orchestrator::new(pipeline, client.clone(), client)
        .work_root(config.work_root.clone())
        .ack_backoff(config.ack_retry_backoff());

    Scheduler::new(orchestrator, &config.schedule)
}
