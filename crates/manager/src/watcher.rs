//! Converter Directory Watcher (§4.8). Debounces filesystem events on the
//! converter directory into add/restart/remove operations.
//!
//! Grounded directly on the teacher's `actor::watcher::WatcherTask`: a
//! notify callback forwards events onto an mpsc channel (since the
//! callback runs on notify's own thread), consumed by an async loop that
//! coalesces per-path pending changes on a debounce-interval tick.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use streamcore::converter::validate_converter_name;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
  #[error("failed to initialize converter directory watcher: {0}")]
  Init(#[source] notify::Error),
  #[error("failed to watch path: {0}")]
  Watch(#[source] notify::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
  Created,
  Modified,
  Deleted,
}

struct PendingChange {
  kind: ChangeKind,
  last_event: Instant,
}

impl PendingChange {
  fn new(kind: ChangeKind) -> Self {
    Self { kind, last_event: Instant::now() }
  }

  fn update(&mut self, kind: ChangeKind) {
    self.last_event = Instant::now();
    self.kind = match (self.kind, kind) {
      (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
      (ChangeKind::Deleted, ChangeKind::Created) => ChangeKind::Modified,
      (ChangeKind::Created, ChangeKind::Deleted) => ChangeKind::Deleted,
      (_, latest) => latest,
    };
  }
}

/// One settled filesystem change, ready to be applied to the converter
/// registry (§4.8 "add on Create, restart on Write, remove on Remove").
#[derive(Debug, Clone)]
pub enum ConverterEvent {
  Add { name: String, path: PathBuf },
  Restart { name: String },
  Remove { name: String },
  /// Name or executable-bit validation failed; logged and dropped rather
  /// than surfaced as a registry error (there is no synchronous caller).
  Rejected { path: PathBuf, reason: String },
}

pub struct ConverterWatcher {
  dir: PathBuf,
  debounce: Duration,
  cancel: CancellationToken,
  _watcher: RecommendedWatcher,
  event_rx: mpsc::Receiver<notify::Result<Event>>,
}

impl ConverterWatcher {
  pub fn new(dir: PathBuf, debounce: Duration, cancel: CancellationToken) -> Result<Self, WatcherError> {
    info!(dir = %dir.display(), "initializing converter directory watcher");
    let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>(256);

    let mut watcher = RecommendedWatcher::new(move |res| {
      let _ = event_tx.blocking_send(res);
    }, Config::default())
    .map_err(WatcherError::Init)?;

    watcher.watch(&dir, RecursiveMode::NonRecursive).map_err(WatcherError::Watch)?;

    Ok(Self { dir, debounce, cancel, _watcher: watcher, event_rx })
  }

  pub fn spawn(dir: PathBuf, debounce: Duration, cancel: CancellationToken, sink: mpsc::Sender<ConverterEvent>) -> Result<tokio::task::JoinHandle<()>, WatcherError> {
    let task = Self::new(dir, debounce, cancel)?;
    Ok(tokio::spawn(task.run(sink)))
  }

  pub async fn run(mut self, sink: mpsc::Sender<ConverterEvent>) {
    info!(dir = %self.dir.display(), "converter directory watcher started");
    let mut pending: HashMap<PathBuf, PendingChange> = HashMap::new();
    let mut debounce_interval = tokio::time::interval(self.debounce);

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!("converter directory watcher shutting down (cancelled)");
          break;
        }

        event = self.event_rx.recv() => {
          match event {
            Some(Ok(event)) => self.process_event(&mut pending, event),
            Some(Err(e)) => warn!(error = %e, "converter directory watcher error"),
            None => {
              info!("converter directory watcher shutting down (channel closed)");
              break;
            }
          }
        }

        _ = debounce_interval.tick() => {
          self.flush_settled(&mut pending, &sink).await;
        }
      }
    }

    if !pending.is_empty() {
      self.flush_all(&mut pending, &sink).await;
    }
  }

  fn process_event(&self, pending: &mut HashMap<PathBuf, PendingChange>, event: Event) {
    for path in &event.paths {
      if path.is_dir() {
        continue;
      }
      let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Deleted,
        _ => continue,
      };
      pending.entry(path.clone()).and_modify(|p| p.update(kind)).or_insert_with(|| PendingChange::new(kind));
      trace!(path = %path.display(), ?kind, "converter directory event pending");
    }
  }

  async fn flush_settled(&self, pending: &mut HashMap<PathBuf, PendingChange>, sink: &mpsc::Sender<ConverterEvent>) {
    let settled: Vec<PathBuf> = pending
      .iter()
      .filter(|(_, change)| change.last_event.elapsed() >= self.debounce)
      .map(|(path, _)| path.clone())
      .collect();
    for path in settled {
      if let Some(change) = pending.remove(&path) {
        self.emit(&path, change.kind, sink).await;
      }
    }
  }

  async fn flush_all(&self, pending: &mut HashMap<PathBuf, PendingChange>, sink: &mpsc::Sender<ConverterEvent>) {
    debug!(pending = pending.len(), "flushing remaining converter directory events on shutdown");
    for (path, change) in pending.drain() {
      self.emit(&path, change.kind, sink).await;
    }
  }

  async fn emit(&self, path: &Path, kind: ChangeKind, sink: &mpsc::Sender<ConverterEvent>) {
    let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else { return };

    let event = match kind {
      ChangeKind::Deleted => ConverterEvent::Remove { name },
      ChangeKind::Modified => ConverterEvent::Restart { name },
      ChangeKind::Created => match validate_new_converter(&name, path) {
        Ok(()) => ConverterEvent::Add { name, path: path.to_path_buf() },
        Err(reason) => ConverterEvent::Rejected { path: path.to_path_buf(), reason },
      },
    };
    let _ = sink.send(event).await;
  }
}

/// Shared with the scheduler's startup directory scan, which applies the
/// same acceptance rule to converters already on disk before the watcher
/// existed to observe their creation.
pub(crate) fn validate_new_converter(name: &str, path: &Path) -> Result<(), String> {
  validate_converter_name(name).map_err(|e| e.to_string())?;
  if !is_executable(path) {
    return Err(format!("{name:?} is not executable"));
  }
  Ok(())
}

#[cfg(unix)]
pub(crate) fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  std::fs::metadata(path).map(|m| m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(_path: &Path) -> bool {
  true
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_reserved_converter_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("none");
    std::fs::write(&path, b"").unwrap();
    assert!(validate_new_converter("none", &path).is_err());
  }

  #[test]
  fn rejects_non_executable_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upper");
    std::fs::write(&path, b"").unwrap();
    assert!(validate_new_converter("upper", &path).is_err());
  }

  #[cfg(unix)]
  #[test]
  fn accepts_executable_with_valid_name() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upper");
    std::fs::write(&path, b"").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    assert!(validate_new_converter("upper", &path).is_ok());
  }

  #[test]
  fn change_kind_coalesces_create_then_delete_to_delete() {
    let mut change = PendingChange::new(ChangeKind::Created);
    change.update(ChangeKind::Deleted);
    assert_eq!(change.kind, ChangeKind::Deleted);
  }
}
