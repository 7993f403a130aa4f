//! Index ReleasePool (§4.2): reference-counts index readers and deletes
//! their backing files when the last reference drops.
//!
//! `lock`/`release` are only ever called from the scheduler task (§4.2,
//! §5d), so this type needs no internal synchronization of its own.

use std::collections::HashMap;
use std::sync::Arc;

use streamcore::IndexReader;
use tracing::{debug, warn};

/// A locked snapshot of index readers. Dropping this without calling
/// [`ReleasePool::release`] is a bug (it leaks the refcounts) — callers that
/// hold one across an `.await` should still always route the handle back to
/// the scheduler for release rather than dropping it.
#[derive(Debug, Clone)]
pub struct LockedIndexes {
  pub readers: Vec<Arc<dyn IndexReader>>,
}

pub struct ReleasePool {
  refcounts: HashMap<String, (Arc<dyn IndexReader>, u32)>,
}

impl ReleasePool {
  pub fn new() -> Self {
    Self { refcounts: HashMap::new() }
  }

  /// Increments refcounts for every reader and returns a releaser handle.
  pub fn lock(&mut self, readers: &[Arc<dyn IndexReader>]) -> LockedIndexes {
    for reader in readers {
      let key = reader.filename().to_string();
      let entry = self.refcounts.entry(key).or_insert_with(|| (Arc::clone(reader), 0));
      entry.1 += 1;
    }
    LockedIndexes { readers: readers.to_vec() }
  }

  /// Decrements refcounts; when a reader's count hits zero its backing file
  /// is removed from disk (§3 "file deletion is deferred until count reaches
  /// zero").
  pub fn release(&mut self, locked: LockedIndexes) {
    for reader in locked.readers {
      let key = reader.filename().to_string();
      let Some((_, count)) = self.refcounts.get_mut(&key) else {
        warn!(file = %key, "release() called for an index not tracked by the pool");
        continue;
      };
      *count -= 1;
      if *count == 0 {
        self.refcounts.remove(&key);
        if let Err(e) = std::fs::remove_file(&key) {
          if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %key, error = %e, "failed to remove released index file");
          }
        } else {
          debug!(file = %key, "removed index file after last reference dropped");
        }
      }
    }
  }

  pub fn refcount(&self, filename: &str) -> u32 {
    self.refcounts.get(filename).map(|(_, c)| *c).unwrap_or(0)
  }
}

impl Default for ReleasePool {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{DateTime, Utc};
  use std::collections::BTreeSet;
  use streamcore::{Stream, StreamId};

  struct FakeReader {
    path: std::path::PathBuf,
  }

  impl IndexReader for FakeReader {
    fn filename(&self) -> &str {
      self.path.to_str().unwrap()
    }
    fn stream_count(&self) -> u64 {
      0
    }
    fn packet_count(&self) -> u64 {
      0
    }
    fn min_stream_id(&self) -> StreamId {
      0
    }
    fn max_stream_id(&self) -> StreamId {
      0
    }
    fn stream_ids(&self) -> BTreeSet<StreamId> {
      BTreeSet::new()
    }
    fn reference_time(&self) -> DateTime<Utc> {
      Utc::now()
    }
    fn stream_by_id(&self, _id: StreamId) -> Option<Stream> {
      None
    }
    fn all_streams(&self, _callback: &mut dyn FnMut(&Stream)) {}
  }

  #[test]
  fn file_deleted_only_after_last_release() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.idx");
    std::fs::write(&path, b"x").unwrap();
    let reader: Arc<dyn IndexReader> = Arc::new(FakeReader { path: path.clone() });

    let mut pool = ReleasePool::new();
    let lock1 = pool.lock(&[reader.clone()]);
    let lock2 = pool.lock(&[reader.clone()]);
    assert_eq!(pool.refcount(path.to_str().unwrap()), 2);

    pool.release(lock1);
    assert!(path.exists(), "file must survive while a lock remains");

    pool.release(lock2);
    assert!(!path.exists(), "file must be deleted once refcount hits zero");
  }
}
