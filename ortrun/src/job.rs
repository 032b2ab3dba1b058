use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;

use crate::normalize::Report;

/// Where a component's sources come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// Directory on the local filesystem, copied into the working directory.
    Path(PathBuf),
    /// Git remote, cloned into the working directory.
    Remote(String),
}

impl FromStr for SourceLocator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            anyhow::bail!("empty source locator");
        }
        if s.contains("://") || s.starts_with("git@") {
            Ok(SourceLocator::Remote(s.to_string()))
        } else {
            Ok(SourceLocator::Path(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Path(p) => write!(f, "{}", p.display()),
            SourceLocator::Remote(url) => f.write_str(url),
        }
    }
}

/// One unit of work handed out by the job service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub component: String,
    pub version: String,
    pub source: SourceLocator,
}

#[derive(Deserialize)]
struct JobEnvelope {
    id: String,
    payload: JobPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobPayload {
    component: String,
    component_version: String,
    component_path: String,
}

impl Job {
    /// Parse the job service's `{ id, payload: { ... } }` document.
    pub fn from_json(body: &str) -> anyhow::Result<Self> {
        let envelope: JobEnvelope = serde_json::from_str(body)?;
        Ok(Job {
            id: envelope.id,
            component: envelope.payload.component,
            version: envelope.payload.component_version,
            source: envelope.payload.component_path.parse()?,
        })
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}@{})", self.id, self.component, self.version)
    }
}

/// Supplies jobs and takes completion acknowledgements.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<Option<Job>>;
    async fn acknowledge_finished(&self, job_id: &str) -> anyhow::Result<()>;
}

/// Receives the artifacts produced for a job.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn upload_report(&self, report: &Report, component: &str, version: &str) -> anyhow::Result<()>;
    async fn upload_html(&self, html: &str, component: &str, version: &str) -> anyhow::Result<()>;
    async fn upload_logs(&self, logs: &str, component: &str, version: &str) -> anyhow::Result<()>;
    async fn upload_error(&self, reason: &str, component: &str, version: &str) -> anyhow::Result<()>;
}
