use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::job::{ArtifactSink, Job, JobSource};
use crate::normalize::Report;

const EMPTY_HTML: &str = "Html empty!";
const EMPTY_LOGS: &str = "Logs empty!";

#[derive(Serialize)]
struct ReportBody<'a> {
    result: &'a Report,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// HTTP client for the job service: hands out jobs, takes acknowledgements
/// and receives artifacts.
pub struct JobApiClient {
    client: reqwest::Client,
    base: Url,
    worker: String,
    job_type: String,
}

impl JobApiClient {
    pub fn new(base_url: &str, worker: impl Into<String>, job_type: impl Into<String>) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid job API URL `{base_url}`"))?;
        if base.cannot_be_a_base() {
            bail!("job API URL `{base_url}` cannot be used as a base");
        }
        let client = reqwest::Client::builder()
            .user_agent("ortrun")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base,
            worker: worker.into(),
            job_type: job_type.into(),
        })
    }

    /// `base` with `segments` appended, each percent-encoded as one segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("{} cannot be a base", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_text(&self, url: Url, body: String) -> Result<()> {
        let response = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        check_status(&url, response.status())
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: Url, body: &T) -> Result<()> {
        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        check_status(&url, response.status())
    }
}

fn check_status(url: &Url, status: StatusCode) -> Result<()> {
    if !status.is_success() {
        bail!("{url} returned HTTP {status}");
    }
    Ok(())
}

fn or_placeholder(text: &str, placeholder: &str) -> String {
    if text.is_empty() {
        placeholder.to_string()
    } else {
        text.to_string()
    }
}

#[async_trait]
impl JobSource for JobApiClient {
    #[instrument(skip(self), fields(job_type = %self.job_type, worker = %self.worker))]
    async fn fetch(&self) -> Result<Option<Job>> {
        let url = self.endpoint(&["find_job", &self.job_type, &self.worker])?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        check_status(&url, status)?;

        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read response from {url}"))?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        let job = Job::from_json(&body).with_context(|| format!("invalid job document from {url}"))?;
        debug!(job = %job, "fetched job");
        Ok(Some(job))
    }

    #[instrument(skip(self))]
    async fn acknowledge_finished(&self, job_id: &str) -> Result<()> {
        let url = self.endpoint(&["finish_job", job_id, &self.worker])?;
        let response = self
            .client
            .put(url.clone())
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        check_status(&url, response.status())
    }
}

#[async_trait]
impl ArtifactSink for JobApiClient {
    #[instrument(skip(self, report), fields(packages = report.package_count()))]
    async fn upload_report(&self, report: &Report, component: &str, version: &str) -> Result<()> {
        let url = self.endpoint(&["ort", "report", component, version])?;
        let body = ReportBody {
            result: report,
            kind: "json",
        };
        self.post_json(url, &body).await
    }

    #[instrument(skip(self, html), fields(bytes = html.len()))]
    async fn upload_html(&self, html: &str, component: &str, version: &str) -> Result<()> {
        let url = self.endpoint(&["ort", "html", component, version])?;
        self.post_text(url, or_placeholder(html, EMPTY_HTML)).await
    }

    #[instrument(skip(self, logs), fields(bytes = logs.len()))]
    async fn upload_logs(&self, logs: &str, component: &str, version: &str) -> Result<()> {
        let url = self.endpoint(&["ort", "logs", component, version])?;
        self.post_text(url, or_placeholder(logs, EMPTY_LOGS)).await
    }

    /// Errors share the report endpoint; the service tells them apart by the
    /// `error` key.
    #[instrument(skip(self))]
    async fn upload_error(&self, reason: &str, component: &str, version: &str) -> Result<()> {
        let url = self.endpoint(&["ort", "report", component, version])?;
        self.post_json(url, &ErrorBody { error: reason }).await
    }
}
