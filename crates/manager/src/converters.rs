//! Converter registry: per-name pairing of a [`ConverterWorkerPool`], its
//! [`ConverterCache`] file, and the pending work-queue bitmask the
//! conversion job (§4.7) drains. Owned exclusively by the scheduler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use streamcore::bitmask::Bitmask;
use tracing::info;

use crate::cache::{CompactionThresholds, ConverterCache};
use crate::worker::ConverterWorkerPool;

pub struct ConverterEntry {
  pub program: PathBuf,
  pub pool: Arc<ConverterWorkerPool>,
  pub cache: Arc<ConverterCache>,
  pub queue: Bitmask,
}

pub struct ConverterRegistry {
  directory: PathBuf,
  entries: HashMap<String, ConverterEntry>,
  parallelism: usize,
  stderr_ring_capacity: usize,
  backoff_base_ms: u64,
  backoff_max_ms: u64,
  compaction: CompactionThresholds,
}

impl ConverterRegistry {
  pub fn new(directory: PathBuf, parallelism: usize, stderr_ring_capacity: usize, backoff_base_ms: u64, backoff_max_ms: u64, compaction: CompactionThresholds) -> Self {
    Self { directory, entries: HashMap::new(), parallelism, stderr_ring_capacity, backoff_base_ms, backoff_max_ms, compaction }
  }

  pub fn cache_path(&self, name: &str) -> PathBuf {
    self.directory.join(format!("converterindex-{name}.cidx"))
  }

  /// §4.8 add: opens (or reopens) the converter's cache file and starts a
  /// fresh worker pool for it.
  pub fn add(&mut self, name: String, program: PathBuf) -> std::io::Result<()> {
    let cache = Arc::new(ConverterCache::open(self.cache_path(&name), self.compaction)?);
    let pool = Arc::new(ConverterWorkerPool::new(name.clone(), program.clone(), self.parallelism, self.stderr_ring_capacity, self.backoff_base_ms, self.backoff_max_ms));
    info!(converter = %name, program = %program.display(), "converter registered");
    self.entries.insert(name, ConverterEntry { program, pool, cache, queue: Bitmask::new() });
    Ok(())
  }

  /// §4.8 restart: respawns the subprocess pool without touching the cache
  /// or queue.
  pub fn restart(&mut self, name: &str, program: PathBuf) {
    if let Some(entry) = self.entries.get_mut(name) {
      entry.program = program.clone();
      entry.pool = Arc::new(ConverterWorkerPool::new(name.to_string(), program, self.parallelism, self.stderr_ring_capacity, self.backoff_base_ms, self.backoff_max_ms));
    }
  }

  /// §4.8 remove: returns the removed entry so the caller can detach it
  /// from every tag and reset its cache file (§4.7 "converter removed
  /// mid-flight: discard results and reset the cache file").
  pub fn remove(&mut self, name: &str) -> Option<ConverterEntry> {
    self.entries.remove(name)
  }

  pub fn get(&self, name: &str) -> Option<&ConverterEntry> {
    self.entries.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.entries.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.entries.keys().map(String::as_str)
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// ORs `ids` into `name`'s work-queue (called when a tagging job commits
  /// new matches for a tag with this converter attached, §4.3 Tagging job).
  pub fn enqueue(&mut self, name: &str, ids: &Bitmask) {
    if let Some(entry) = self.entries.get_mut(name) {
      entry.queue.or_with(ids);
    }
  }

  /// Drains the work-queue for a conversion job run, leaving it empty so
  /// newly-enqueued bits during the run accumulate separately.
  pub fn take_queue(&mut self, name: &str) -> Option<Bitmask> {
    self.entries.get_mut(name).map(|e| std::mem::take(&mut e.queue))
  }

  /// Re-merges bits the conversion job could not process this round (§4.7
  /// "re-queue any bits whose index no longer holds the stream" / "re-enqueue
  /// any failed bits").
  pub fn requeue(&mut self, name: &str, ids: Bitmask) {
    if let Some(entry) = self.entries.get_mut(name) {
      entry.queue.or_with(&ids);
    }
  }

  pub fn any_has_pending_work(&self) -> Option<String> {
    self.entries.iter().find(|(_, e)| !e.queue.is_zero()).map(|(name, _)| name.clone())
  }
}

pub fn converter_directory_entries(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
  let mut out = Vec::new();
  for entry in std::fs::read_dir(dir)? {
    let entry = entry?;
    let path = entry.path();
    if path.is_file() {
      if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        out.push((name.to_string(), path));
      }
    }
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn enqueue_and_take_queue_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ConverterRegistry::new(dir.path().to_path_buf(), 2, 64, 10, 1000, CompactionThresholds::default());
    registry.add("upper".into(), PathBuf::from("/bin/true")).unwrap();

    registry.enqueue("upper", &Bitmask::from_ids([1, 2]));
    let queue = registry.take_queue("upper").unwrap();
    assert!(queue.is_set(1) && queue.is_set(2));
    assert!(registry.take_queue("upper").unwrap().is_zero());
  }

  #[test]
  fn removed_converter_returns_its_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ConverterRegistry::new(dir.path().to_path_buf(), 1, 64, 10, 1000, CompactionThresholds::default());
    registry.add("upper".into(), PathBuf::from("/bin/true")).unwrap();
    assert!(registry.remove("upper").is_some());
    assert!(!registry.contains("upper"));
  }
}
