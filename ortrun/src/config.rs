use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Which pipeline a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Analyze, scan, normalize and render the HTML report.
    #[default]
    Scan,
    /// Analyze only and upload the project/package listing.
    Analyze,
}

impl FromStr for Mode {
    type Err = std::convert::Infallible;

    /// Anything other than `analyze` selects scan mode.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("analyze") {
            Ok(Mode::Analyze)
        } else {
            Ok(Mode::Scan)
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Scan => f.write_str("scan"),
            Mode::Analyze => f.write_str("analyze"),
        }
    }
}

/// Job type polled from the job service, per mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobTypes {
    pub scan: String,
    pub analyze: String,
}

impl Default for JobTypes {
    fn default() -> Self {
        Self {
            scan: "ort-scan".to_string(),
            analyze: "ort-analyze".to_string(),
        }
    }
}

/// Worker configuration, read from a TOML file.
///
/// A file may carry `[profiles.<name>]` tables; the one named by the
/// `PROFILE` environment variable is laid over the top-level keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the job service.
    pub job_api_url: String,
    /// Worker name reported to the job service when fetching and finishing.
    pub worker: String,
    pub mode: Mode,
    pub job_type: JobTypes,
    /// Executable of the analysis toolchain.
    pub ort_command: String,
    pub scanner_config: PathBuf,
    /// Kill a subprocess after this many seconds without output.
    pub silence_timeout_secs: u64,
    /// Subprocess lines containing this marker are logged to file only.
    pub info_marker: String,
    pub ack_retry_backoff_ms: u64,
    /// Cron expression (with seconds) driving the scheduler tick.
    pub schedule: String,
    /// Parent directory for per-job working directories. Defaults to the
    /// system temp dir.
    pub work_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            job_api_url: "http://localhost:8080".to_string(),
            worker: "oscar-ort-1".to_string(),
            mode: Mode::Scan,
            job_type: JobTypes::default(),
            ort_command: "ort".to_string(),
            scanner_config: PathBuf::from("/ort-api/config.yml"),
            silence_timeout_secs: 5 * 3600,
            info_marker: "INFO".to_string(),
            ack_retry_backoff_ms: 1000,
            schedule: "0 * * * * *".to_string(),
            work_root: None,
        }
    }
}

impl Config {
    /// Load from `path` (or defaults when `None`), apply the profile and
    /// environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml(&content, env("PROFILE").as_deref())
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        let config = config.with_env_overrides(env);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str, profile: Option<&str>) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(content)?;
        let profiles = table.remove("profiles");

        if let Some(name) = profile {
            let overlay = profiles
                .as_ref()
                .and_then(|p| p.get(name))
                .and_then(|p| p.as_table())
                .with_context(|| format!("profile '{name}' not found"))?;
            merge_tables(&mut table, overlay);
        }

        let merged = toml::to_string(&table).context("failed to re-encode config")?;
        toml::from_str(&merged).context("failed to deserialize config")
    }

    /// `MODE` and `ORTRUN_*` variables win over file values.
    pub fn with_env_overrides(mut self, env: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(mode) = env("MODE") {
            self.mode = mode.parse().unwrap_or_default();
        }
        if let Some(url) = env("ORTRUN_JOB_API_URL") {
            self.job_api_url = url;
        }
        if let Some(worker) = env("ORTRUN_WORKER") {
            self.worker = worker;
        }
        if let Some(command) = env("ORTRUN_ORT_COMMAND") {
            self.ort_command = command;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_api_url.trim().is_empty() {
            bail!("job_api_url must not be empty");
        }
        if self.worker.trim().is_empty() {
            bail!("worker must not be empty");
        }
        if self.ort_command.trim().is_empty() {
            bail!("ort_command must not be empty");
        }
        if self.silence_timeout_secs == 0 {
            bail!("silence_timeout_secs must be greater than zero");
        }
        cron::Schedule::from_str(&self.schedule)
            .with_context(|| format!("invalid schedule '{}'", self.schedule))?;
        Ok(())
    }

    pub fn job_type(&self) -> &str {
        match self.mode {
            Mode::Scan => &self.job_type.scan,
            Mode::Analyze => &self.job_type.analyze,
        }
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }

    pub fn ack_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.ack_retry_backoff_ms)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: &toml::Table) {
    for (key, value) in overlay {
        if let (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) =
            (base.get_mut(key), value)
        {
            merge_tables(existing, nested);
            continue;
        }
        base.insert(key.clone(), value.clone());
    }
}
