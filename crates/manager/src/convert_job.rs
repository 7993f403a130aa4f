//! Conversion job (§4.7): fans a converter's work-queue bitmask out across
//! a bounded pool of subprocess slots, newest-index-first.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use streamcore::bitmask::Bitmask;
use streamcore::{IndexReader, Stream, StreamId};
use tracing::warn;

use crate::cache::ConverterCache;
use crate::worker::ConverterWorkerPool;

/// Outcome of one conversion job run, to be folded back into manager state
/// on the scheduler: `converted` bits cleared from the work-queue and OR'd
/// into every data-filter tag's `uncertain`; `failed` bits re-queued.
pub struct ConvertOutcome {
  pub converted: Bitmask,
  pub failed: Bitmask,
}

/// Drains `queue` against `indexes` (newest-to-oldest order, per §4.7),
/// persisting successes into `cache`. A bit whose owning index can no
/// longer be found (concurrent merge) is folded into `failed` so the
/// caller re-queues it, exactly like a failure — the lock held by the
/// caller's index snapshot is what makes this safe (§5c).
pub async fn run_conversion(pool: Arc<ConverterWorkerPool>, cache: Arc<ConverterCache>, indexes: Vec<Arc<dyn IndexReader>>, queue: Bitmask) -> ConvertOutcome {
  let parallelism = pool.parallelism();
  let mut converted = Bitmask::new();
  let mut failed = Bitmask::new();
  let mut located = Bitmask::new();

  let work: Vec<(StreamId, Stream)> = indexes
    .iter()
    .rev()
    .flat_map(|index| {
      index
        .stream_ids()
        .into_iter()
        .rev()
        .filter(|id| queue.is_set(*id))
        .filter_map(|id| index.stream_by_id(id).map(|s| (id, s)))
    })
    .collect();

  for (id, _) in &work {
    located.set(*id);
  }

  let mut in_flight = FuturesUnordered::new();
  let mut next = 0usize;
  let mut slot = 0usize;

  while next < work.len() && in_flight.len() < parallelism {
    let (id, stream) = work[next].clone();
    in_flight.push(convert_one(pool.clone(), cache.clone(), slot % parallelism, id, stream));
    slot += 1;
    next += 1;
  }

  while let Some((id, result)) = in_flight.next().await {
    match result {
      Ok(()) => converted.set(id),
      Err(err) => {
        warn!(stream_id = id, %err, "conversion failed, stream re-queued");
        failed.set(id);
      }
    }
    if next < work.len() {
      let (id, stream) = work[next].clone();
      in_flight.push(convert_one(pool.clone(), cache.clone(), slot % parallelism, id, stream));
      slot += 1;
      next += 1;
    }
  }

  let mut unresolved = queue;
  unresolved.sub_with(&located);
  if !unresolved.is_zero() {
    warn!(count = unresolved.ones_count(), "queued streams absent from index snapshot, re-queued");
    failed.or_with(&unresolved);
  }

  ConvertOutcome { converted, failed }
}

async fn convert_one(pool: Arc<ConverterWorkerPool>, cache: Arc<ConverterCache>, slot: usize, id: StreamId, stream: Stream) -> (StreamId, Result<(), String>) {
  let result = async {
    let packets = pool.convert(slot, &stream).await.map_err(|e| e.to_string())?;
    cache.set_data(id, &packets).await.map_err(|e| e.to_string())?;
    Ok(())
  }
  .await;
  (id, result)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{DateTime, Utc};
  use std::collections::BTreeSet;
  use streamcore::{Direction, FlowKey, Packet};

  struct FakeIndex {
    streams: Vec<Stream>,
  }

  impl IndexReader for FakeIndex {
    fn filename(&self) -> &str {
      "fake.idx"
    }
    fn stream_count(&self) -> u64 {
      self.streams.len() as u64
    }
    fn packet_count(&self) -> u64 {
      0
    }
    fn min_stream_id(&self) -> StreamId {
      self.streams.iter().map(|s| s.id).min().unwrap_or(0)
    }
    fn max_stream_id(&self) -> StreamId {
      self.streams.iter().map(|s| s.id).max().unwrap_or(0)
    }
    fn stream_ids(&self) -> BTreeSet<StreamId> {
      self.streams.iter().map(|s| s.id).collect()
    }
    fn reference_time(&self) -> DateTime<Utc> {
      Utc::now()
    }
    fn stream_by_id(&self, id: StreamId) -> Option<Stream> {
      self.streams.iter().find(|s| s.id == id).cloned()
    }
    fn all_streams(&self, callback: &mut dyn FnMut(&Stream)) {
      for s in &self.streams {
        callback(s);
      }
    }
  }

  fn flow() -> FlowKey {
    FlowKey { client_host: "a".into(), client_port: 1, server_host: "b".into(), server_port: 2, protocol: "tcp".into() }
  }

  #[tokio::test]
  async fn bits_absent_from_any_index_are_requeued_as_failed() {
    let index: Arc<dyn IndexReader> = Arc::new(FakeIndex { streams: vec![Stream { id: 1, flow: flow(), packets: vec![Packet::new(Direction::ClientToServer, b"x".to_vec())] }] });
    let pool = Arc::new(ConverterWorkerPool::new("upper".into(), "/bin/true".into(), 1, 64, 10, 1000));
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ConverterCache::open(dir.path().join("c.cidx"), Default::default()).unwrap());

    let mut queue = Bitmask::new();
    queue.set(1);
    queue.set(99); // not present in any index: the queue outruns the index snapshot
    let outcome = run_conversion(pool, cache, vec![index], queue).await;
    assert!(!outcome.converted.is_set(99));
    assert!(outcome.failed.is_set(99));
  }
}
