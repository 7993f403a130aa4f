//! Generic owning handle around an external program's stdio (§4.6, §4.7,
//! §9 "model each external program as an owning handle that spawns lazily,
//! restarts on demand, and is closed on teardown").
//!
//! Grounded on the teacher's actor task pattern (`backend/src/actor/watcher.rs`):
//! a dedicated tokio task owns the resource and communicates over channels,
//! rather than sharing the `Child` behind a mutex. stdout framing is
//! line-delimited JSON, read with a buffered reader exactly as the teacher
//! reads debounced filesystem events off a channel into an async loop.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ring::StderrRing;

#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
  #[error("failed to spawn {path}: {source}")]
  Spawn { path: PathBuf, #[source] source: std::io::Error },
  #[error("subprocess stdio pipe unavailable")]
  NoPipe,
  #[error("write to subprocess stdin failed: {0}")]
  Write(#[source] std::io::Error),
  #[error("read from subprocess stdout failed: {0}")]
  Read(#[source] std::io::Error),
  #[error("subprocess closed its output before a complete frame was read")]
  Eof,
  #[error("malformed frame from subprocess: {0}")]
  Framing(#[source] serde_json::Error),
  #[error("subprocess is in an invalid state pending restart")]
  InvalidState,
}

pub type Result<T> = std::result::Result<T, SubprocessError>;

/// Backoff schedule for `RestartProcess` (SPEC_FULL.md §C.2): capped
/// exponential doubling from `base_ms`, reset after a successful restart
/// stays alive past one request/response round trip.
#[derive(Debug, Clone, Copy)]
pub struct RestartBackoff {
  base_ms: u64,
  max_ms: u64,
  attempt: u32,
}

impl RestartBackoff {
  pub fn new(base_ms: u64, max_ms: u64) -> Self {
    Self { base_ms, max_ms, attempt: 0 }
  }

  pub fn next_delay(&mut self) -> Duration {
    let shift = self.attempt.min(20);
    let ms = self.base_ms.saturating_mul(1u64 << shift).min(self.max_ms);
    self.attempt += 1;
    Duration::from_millis(ms)
  }

  pub fn reset(&mut self) {
    self.attempt = 0;
  }
}

/// Owns a spawned child process's stdin/stdout/stderr. Spawns lazily on
/// first use; `restart` kills+waits then respawns. Stderr is drained on a
/// background task into a bounded ring buffer rather than left to fill the
/// OS pipe buffer and deadlock the child.
pub struct Subprocess {
  program: PathBuf,
  args: Vec<String>,
  child: Option<Child>,
  stdin: Option<ChildStdin>,
  stdout: Option<BufReader<ChildStdout>>,
  stderr_ring: std::sync::Arc<std::sync::Mutex<StderrRing>>,
  stderr_task: Option<JoinHandle<()>>,
  /// Set on any framing/decoding error; cleared only by a successful restart
  /// (§4.6 "on any framing/decoding error the worker enters invalidState").
  invalid: bool,
  backoff: RestartBackoff,
}

impl Subprocess {
  pub fn new(program: impl Into<PathBuf>, args: Vec<String>, stderr_ring_capacity: usize, backoff_base_ms: u64, backoff_max_ms: u64) -> Self {
    Self {
      program: program.into(),
      args,
      child: None,
      stdin: None,
      stdout: None,
      stderr_ring: std::sync::Arc::new(std::sync::Mutex::new(StderrRing::new(stderr_ring_capacity))),
      stderr_task: None,
      invalid: false,
      backoff: RestartBackoff::new(backoff_base_ms, backoff_max_ms),
    }
  }

  pub fn is_invalid(&self) -> bool {
    self.invalid
  }

  pub fn is_running(&self) -> bool {
    self.child.is_some()
  }

  pub fn stderr_since(&self, cursor: u64) -> (Vec<String>, u64) {
    self.stderr_ring.lock().expect("stderr ring mutex poisoned").since(cursor)
  }

  /// Spawns the child if not already running.
  pub async fn ensure_started(&mut self) -> Result<()> {
    if self.child.is_some() {
      return Ok(());
    }
    debug!(program = %self.program.display(), "spawning subprocess");
    let mut child = Command::new(&self.program)
      .args(&self.args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| SubprocessError::Spawn { path: self.program.clone(), source })?;

    let stdin = child.stdin.take().ok_or(SubprocessError::NoPipe)?;
    let stdout = child.stdout.take().ok_or(SubprocessError::NoPipe)?;
    let stderr = child.stderr.take().ok_or(SubprocessError::NoPipe)?;

    let ring = self.stderr_ring.clone();
    let program_name = self.program.display().to_string();
    self.stderr_task = Some(tokio::spawn(async move {
      let mut lines = BufReader::new(stderr).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        warn!(program = %program_name, "{line}");
        ring.lock().expect("stderr ring mutex poisoned").push(line);
      }
    }));

    self.child = Some(child);
    self.stdin = Some(stdin);
    self.stdout = Some(BufReader::new(stdout));
    self.invalid = false;
    self.backoff.reset();
    Ok(())
  }

  /// Kills, waits, and respawns, per §4.6 `RestartProcess`.
  pub async fn restart(&mut self) -> Result<()> {
    if let Some(task) = self.stderr_task.take() {
      task.abort();
    }
    if let Some(mut child) = self.child.take() {
      let _ = child.start_kill();
      let _ = child.wait().await;
    }
    self.stdin = None;
    self.stdout = None;
    self.ensure_started().await
  }

  /// Sleeps for the next backoff interval before a caller retries `restart`.
  pub async fn wait_backoff(&mut self) {
    tokio::time::sleep(self.backoff.next_delay()).await;
  }

  pub fn mark_invalid(&mut self) {
    self.invalid = true;
  }

  async fn write_line(&mut self, line: &str) -> Result<()> {
    let stdin = self.stdin.as_mut().ok_or(SubprocessError::NoPipe)?;
    stdin.write_all(line.as_bytes()).await.map_err(SubprocessError::Write)?;
    stdin.write_all(b"\n").await.map_err(SubprocessError::Write)?;
    stdin.flush().await.map_err(SubprocessError::Write)
  }

  /// Serializes `value` as one JSON line and writes it to stdin.
  pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
    let line = serde_json::to_string(value).map_err(SubprocessError::Framing)?;
    self.write_line(&line).await
  }

  /// Writes a bare blank line (stream/record terminator in both protocols).
  pub async fn write_blank_line(&mut self) -> Result<()> {
    self.write_line("").await
  }

  /// Reads one line and parses it as JSON. Marks the worker invalid on any
  /// decode failure, matching §4.6's `invalidState` rule.
  pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
    let line = self.read_line().await?;
    serde_json::from_str(&line).map_err(|e| {
      self.invalid = true;
      SubprocessError::Framing(e)
    })
  }

  /// Reads one line, returning `Ok(None)` on a blank line (the terminator).
  pub async fn read_json_or_blank<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
    let line = self.read_line().await?;
    if line.trim().is_empty() {
      return Ok(None);
    }
    serde_json::from_str(&line).map(Some).map_err(|e| {
      self.invalid = true;
      SubprocessError::Framing(e)
    })
  }

  async fn read_line(&mut self) -> Result<String> {
    let stdout = self.stdout.as_mut().ok_or(SubprocessError::NoPipe)?;
    let mut line = String::new();
    let n = stdout.read_line(&mut line).await.map_err(SubprocessError::Read)?;
    if n == 0 {
      self.invalid = true;
      return Err(SubprocessError::Eof);
    }
    if line.ends_with('\n') {
      line.pop();
      if line.ends_with('\r') {
        line.pop();
      }
    }
    Ok(line)
  }
}

impl Drop for Subprocess {
  fn drop(&mut self) {
    if let Some(task) = self.stderr_task.take() {
      task.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backoff_doubles_and_caps() {
    let mut b = RestartBackoff::new(100, 1_000);
    assert_eq!(b.next_delay(), Duration::from_millis(100));
    assert_eq!(b.next_delay(), Duration::from_millis(200));
    assert_eq!(b.next_delay(), Duration::from_millis(400));
    assert_eq!(b.next_delay(), Duration::from_millis(800));
    assert_eq!(b.next_delay(), Duration::from_millis(1_000));
    assert_eq!(b.next_delay(), Duration::from_millis(1_000));
  }

  #[test]
  fn backoff_resets() {
    let mut b = RestartBackoff::new(50, 1_000);
    b.next_delay();
    b.next_delay();
    b.reset();
    assert_eq!(b.next_delay(), Duration::from_millis(50));
  }

  #[tokio::test]
  async fn spawns_writes_and_reads_through_cat() {
    // `cat` echoes stdin to stdout line-for-line, enough to exercise the
    // write_json/read_json framing without a purpose-built test binary.
    let mut sub = Subprocess::new("cat", vec![], 10, 10, 1_000);
    sub.ensure_started().await.unwrap();
    sub.write_json(&serde_json::json!({"hello": "world"})).await.unwrap();
    let value: serde_json::Value = sub.read_json().await.unwrap();
    assert_eq!(value, serde_json::json!({"hello": "world"}));
  }

  #[tokio::test]
  async fn blank_line_is_read_as_terminator() {
    let mut sub = Subprocess::new("cat", vec![], 10, 10, 1_000);
    sub.ensure_started().await.unwrap();
    sub.write_blank_line().await.unwrap();
    let value: Option<serde_json::Value> = sub.read_json_or_blank().await.unwrap();
    assert!(value.is_none());
  }
}
