//! Runs one external command with a silence watchdog and a persisted log.
//!
//! Output from both streams is forwarded chunk by chunk over a channel to a
//! single supervising loop. Every chunk resets the watchdog; the complete
//! lines it carries are appended to the job log before the next chunk is
//! looked at. When the watchdog fires the
//! child is killed with SIGKILL and the run fails with
//! [`StageError::Timeout`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, instrument, warn};

use crate::error::StageError;

const STDERR_TAIL_LINES: usize = 20;
const READ_CHUNK: usize = 8 * 1024;

/// Resettable deadline. Dropping it cancels it.
pub struct Watchdog {
    ceiling: Duration,
    timer: Pin<Box<Sleep>>,
}

impl Watchdog {
    pub fn arm(ceiling: Duration) -> Self {
        Self {
            ceiling,
            timer: Box::pin(tokio::time::sleep(ceiling)),
        }
    }

    pub fn reset(&mut self) {
        self.timer.as_mut().reset(Instant::now() + self.ceiling);
    }

    /// Completes once `ceiling` has passed since the last reset.
    pub async fn expired(&mut self) {
        self.timer.as_mut().await
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

/// Append-only log of subprocess output for one job.
pub struct LogRecord {
    path: PathBuf,
    file: BufWriter<File>,
    info_marker: String,
    stderr_tail: VecDeque<String>,
}

impl LogRecord {
    pub async fn open(path: &Path, info_marker: &str) -> Result<Self, StageError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StageError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            info_marker: info_marker.to_string(),
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
        })
    }

    async fn write_line(&mut self, prefix: &str, line: &str) -> Result<(), StageError> {
        let entry = format!("{prefix}{line}\n");
        self.file
            .write_all(entry.as_bytes())
            .await
            .map_err(|e| StageError::io(&self.path, e))
    }

    /// Informational lines go to the file only.
    pub async fn stdout(&mut self, command: &str, line: &str) -> Result<(), StageError> {
        if !line.contains(&self.info_marker) {
            info!(target: "ortrun::subprocess", command, "{line}");
        }
        self.write_line("", line).await
    }

    pub async fn stderr(&mut self, command: &str, line: &str) -> Result<(), StageError> {
        warn!(target: "ortrun::subprocess", command, stream = "stderr", "{line}");
        if self.stderr_tail.len() == STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line.to_string());
        self.write_line("ERROR: ", line).await
    }

    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Flush and close the file.
    pub async fn close(mut self) -> Result<(), StageError> {
        self.file
            .shutdown()
            .await
            .map_err(|e| StageError::io(&self.path, e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout_lines: usize,
    pub stderr_lines: usize,
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    silence_timeout: Duration,
    info_marker: String,
}

impl ProcessSupervisor {
    pub fn new(silence_timeout: Duration, info_marker: impl Into<String>) -> Self {
        Self {
            silence_timeout,
            info_marker: info_marker.into(),
        }
    }

    pub fn silence_timeout(&self) -> Duration {
        self.silence_timeout
    }

    /// Run `program` in `working_dir`, appending its output to `log_path`.
    ///
    /// Returns once the process has exited and the log is closed, whatever
    /// the outcome.
    #[instrument(skip(self, program, args, log_path), fields(command = %program))]
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        working_dir: &Path,
        log_path: &Path,
    ) -> Result<ProcessOutput, StageError> {
        let command = command_line(program, args);
        info!(command = %command, "starting command");

        let mut log = LogRecord::open(log_path, &self.info_marker).await?;

        let spawned = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let outcome = match spawned {
            Ok(mut child) => {
                let mut watchdog = Watchdog::arm(self.silence_timeout);
                let outcome = supervise(&mut child, &mut log, &mut watchdog, &command).await;
                drop(watchdog);
                outcome
            }
            Err(e) => {
                let reason = format!("failed to start: {e}");
                if let Err(log_err) = log.stderr(&command, &reason).await {
                    debug!(command = %command, error = %log_err, "failed to record spawn failure");
                }
                Err(StageError::ProcessFailure {
                    command: command.clone(),
                    code: None,
                    stderr_tail: reason,
                })
            }
        };

        let closed = log.close().await;

        match &outcome {
            Ok(_) => info!(command = %command, "finished command"),
            Err(e) => warn!(command = %command, error = %e, "failed command"),
        }

        let output = outcome?;
        closed?;
        Ok(output)
    }
}

async fn supervise(
    child: &mut Child,
    log: &mut LogRecord,
    watchdog: &mut Watchdog,
    command: &str,
) -> Result<ProcessOutput, StageError> {
    let (tx, mut rx) = mpsc::channel::<(Stream, Vec<String>)>(256);
    if let Some(stdout) = child.stdout.take() {
        forward(stdout, Stream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward(stderr, Stream::Stderr, tx.clone());
    }
    drop(tx);

    let mut output = ProcessOutput {
        stdout_lines: 0,
        stderr_lines: 0,
    };

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some((stream, lines)) = event else { break };
                // Any chunk counts as activity, even one without a newline.
                watchdog.reset();
                for line in lines.iter().filter(|l| !l.trim().is_empty()) {
                    match stream {
                        Stream::Stdout => {
                            output.stdout_lines += 1;
                            log.stdout(command, line).await?;
                        }
                        Stream::Stderr => {
                            output.stderr_lines += 1;
                            log.stderr(command, line).await?;
                        }
                    }
                }
            }
            _ = watchdog.expired() => {
                return Err(kill(child, command, watchdog.ceiling(), log.stderr_tail()).await);
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| StageError::ProcessFailure {
            command: command.to_string(),
            code: None,
            stderr_tail: e.to_string(),
        })?,
        _ = watchdog.expired() => {
            return Err(kill(child, command, watchdog.ceiling(), log.stderr_tail()).await);
        }
    };

    if status.success() {
        Ok(output)
    } else {
        Err(StageError::ProcessFailure {
            command: command.to_string(),
            code: status.code(),
            stderr_tail: log.stderr_tail(),
        })
    }
}

async fn kill(child: &mut Child, command: &str, after: Duration, stderr_tail: String) -> StageError {
    warn!(command = %command, silence_secs = after.as_secs(), "no output within watchdog window, killing");
    if let Err(e) = child.start_kill() {
        debug!(command = %command, error = %e, "kill failed, process already gone");
    }
    if let Err(e) = child.wait().await {
        debug!(command = %command, error = %e, "failed to reap killed process");
    }
    StageError::Timeout {
        command: command.to_string(),
        after,
        stderr_tail,
    }
}

/// Splits raw output into lines, holding back a trailing partial line until
/// its newline arrives.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending, rest);
            lines.push(decode_line(&line));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

/// Invalid UTF-8 is replaced rather than treated as an error.
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches(['\n', '\r']).to_string()
}

/// Read `reader` chunk by chunk into `tx` until EOF. Every chunk is sent,
/// with whatever complete lines it finished (possibly none).
fn forward<R>(mut reader: R, stream: Stream, tx: mpsc::Sender<(Stream, Vec<String>)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut splitter = LineSplitter::default();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let lines = splitter.push(&buf[..n]);
                    if tx.send((stream, lines)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(?stream, error = %e, "output stream read failed");
                    break;
                }
            }
        }
        if let Some(last) = splitter.finish() {
            if tx.send((stream, vec![last])).await.is_err() {
                debug!(?stream, "supervisor gone before final line");
            }
        }
    });
}

fn command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}
