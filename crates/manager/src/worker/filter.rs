//! Filter Worker (§4.6): long-running subprocess that filters one stream at
//! a time and persists results to a `.fidx` cache.
//!
//! Runs as a dedicated task, mirroring the teacher's actor pattern: a single
//! consumer owns the subprocess and the cache file handle; callers only ever
//! send commands down a bounded channel, never touch the child process
//! directly.

use std::path::PathBuf;
use std::sync::Arc;

use streamcore::{Stream, StreamId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::FilterIndex;

use super::subprocess::Subprocess;
use super::wire::{FilterMetadata, FlowHeaderWire, PacketWire};

enum Command {
  Enqueue(StreamId),
  Restart,
  Shutdown,
}

/// Non-blocking handle used by the tag registry / tagging job to feed
/// streams to a filter worker (§4.6 `EnqueueStream`).
#[derive(Clone)]
pub struct FilterHandle {
  tx: mpsc::Sender<Command>,
}

impl FilterHandle {
  /// Returns `false` if the bounded queue is full; the caller is expected to
  /// retry later rather than block the scheduler (§5).
  pub fn enqueue_stream(&self, id: StreamId) -> bool {
    self.tx.try_send(Command::Enqueue(id)).is_ok()
  }

  pub fn request_restart(&self) {
    let _ = self.tx.try_send(Command::Restart);
  }

  pub async fn shutdown(&self) {
    let _ = self.tx.send(Command::Shutdown).await;
  }
}

/// Looks up a stream's current bytes across whatever indexes currently hold
/// it. Injected rather than the worker owning the manager's index list
/// directly, since indexes rotate under merges while this task runs
/// independently of the scheduler (§5).
pub type StreamFetcher = Arc<dyn Fn(StreamId) -> Option<Stream> + Send + Sync>;

pub struct FilterWorker {
  name: String,
  program: PathBuf,
  queue: mpsc::Receiver<Command>,
  subprocess: Subprocess,
  index: Arc<FilterIndex>,
  fetch: StreamFetcher,
}

impl FilterWorker {
  #[allow(clippy::too_many_arguments)]
  pub fn spawn(
    name: String,
    program: PathBuf,
    index: Arc<FilterIndex>,
    fetch: StreamFetcher,
    queue_capacity: usize,
    stderr_ring_capacity: usize,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
  ) -> (FilterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_capacity);
    let subprocess = Subprocess::new(program.clone(), vec![], stderr_ring_capacity, backoff_base_ms, backoff_max_ms);
    let worker = FilterWorker { name, program, queue: rx, subprocess, index, fetch };
    let join = tokio::spawn(worker.run());
    (FilterHandle { tx }, join)
  }

  async fn run(mut self) {
    while let Some(command) = self.queue.recv().await {
      match command {
        Command::Shutdown => break,
        Command::Restart => {
          self.subprocess.wait_backoff().await;
          if let Err(err) = self.subprocess.restart().await {
            warn!(filter = %self.name, program = %self.program.display(), %err, "filter worker restart failed");
          }
        }
        Command::Enqueue(id) => self.process_one(id).await,
      }
    }
    debug!(filter = %self.name, "filter worker stopped");
  }

  async fn process_one(&mut self, id: StreamId) {
    if self.index.contains(id).await {
      return;
    }
    if self.subprocess.is_invalid() {
      // §4.6: drains but discards its queue until restart.
      debug!(filter = %self.name, stream = id, "discarding stream, worker is in invalidState");
      return;
    }

    let Some(stream) = (self.fetch)(id) else {
      debug!(filter = %self.name, stream = id, "stream no longer available, skipping");
      return;
    };

    if let Err(err) = self.subprocess.ensure_started().await {
      warn!(filter = %self.name, %err, "failed to start filter subprocess");
      return;
    }

    if let Err(err) = self.run_protocol(&stream).await {
      warn!(filter = %self.name, stream = id, %err, "filter protocol failed, entering invalidState");
      self.subprocess.mark_invalid();
    }
  }

  async fn run_protocol(&mut self, stream: &Stream) -> super::subprocess::Result<()> {
    self.subprocess.write_json(&FlowHeaderWire::from(&stream.flow)).await?;
    for packet in &stream.packets {
      self.subprocess.write_json(&PacketWire::from(packet)).await?;
    }
    self.subprocess.write_blank_line().await?;

    let mut out_packets = Vec::new();
    while let Some(wire) = self.subprocess.read_json_or_blank::<PacketWire>().await? {
      match wire.into_packet() {
        Ok(packet) => out_packets.push(packet),
        Err(err) => {
          warn!(filter = %self.name, %err, "dropping packet with malformed wire direction/data");
        }
      }
    }
    let _metadata: FilterMetadata = self.subprocess.read_json().await?;

    if let Err(err) = self.index.set_data(stream.id, &out_packets).await {
      warn!(filter = %self.name, stream = stream.id, %err, "failed to persist filtered stream");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use streamcore::{Direction, FlowKey, Packet};

  fn sample_stream(id: StreamId) -> Stream {
    Stream {
      id,
      flow: FlowKey { client_host: "a".into(), client_port: 1, server_host: "b".into(), server_port: 2, protocol: "tcp".into() },
      packets: vec![Packet::new(Direction::ClientToServer, b"hi".to_vec())],
    }
  }

  #[tokio::test]
  async fn skips_streams_already_in_cache() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(FilterIndex::open(dir.path().join("x.fidx")).unwrap());
    index.set_data(1, &[Packet::new(Direction::ClientToServer, b"cached".to_vec())]).await.unwrap();

    let fetch: StreamFetcher = Arc::new(|_| panic!("should not be called for a cached stream"));
    let (handle, join) = FilterWorker::spawn("noop".into(), PathBuf::from("/bin/true"), index, fetch, 10, 10, 10, 1000);
    assert!(handle.enqueue_stream(1));
    handle.shutdown().await;
    join.await.unwrap();
  }

  #[tokio::test]
  async fn enqueue_reports_false_once_queue_is_full() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(FilterIndex::open(dir.path().join("x.fidx")).unwrap());
    let fetch: StreamFetcher = Arc::new(|id| Some(sample_stream(id)));
    let (tx, _rx) = mpsc::channel(1);
    // Exercise the handle's backpressure logic directly without running the
    // subprocess loop (`cat` would accept everything instantly in CI).
    let handle = FilterHandle { tx: tx.clone() };
    tx.try_send(Command::Enqueue(1)).unwrap();
    assert!(!handle.enqueue_stream(2));
    let _ = index;
    let _ = fetch;
  }
}
