//! The manager's authoritative, ordered list of live indexes (§4.1, §4.4),
//! plus the merge-eligibility scan. Owned exclusively by the scheduler.

use std::sync::Arc;

use streamcore::{IndexReader, StreamId};

#[derive(Default)]
pub struct IndexList {
  indexes: Vec<Arc<dyn IndexReader>>,
  /// §4.1 merge eligibility: indexes before this offset have already been
  /// tried and found unmergeable (or are themselves a merge's output still
  /// waiting for more siblings to accumulate).
  n_unmergeable: usize,
}

impl IndexList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn as_slice(&self) -> &[Arc<dyn IndexReader>] {
    &self.indexes
  }

  pub fn snapshot(&self) -> Vec<Arc<dyn IndexReader>> {
    self.indexes.clone()
  }

  pub fn total_streams(&self) -> u64 {
    self.indexes.iter().map(|i| i.stream_count()).sum()
  }

  pub fn total_packets(&self) -> u64 {
    self.indexes.iter().map(|i| i.packet_count()).sum()
  }

  pub fn push_all(&mut self, new_indexes: Vec<Arc<dyn IndexReader>>) {
    self.indexes.extend(new_indexes);
  }

  pub fn find_stream(&self, id: StreamId) -> Option<streamcore::Stream> {
    find_stream_in(&self.indexes, id)
  }

  pub fn owns_stream(&self, id: StreamId) -> bool {
    self.indexes.iter().any(|idx| idx.min_stream_id() <= id && id <= idx.max_stream_id() && idx.stream_ids().contains(&id))
  }

  /// §4.1 "scan indexes in order starting from `nUnmergeableIndexes`; find
  /// the first whose stream count is strictly less than the cumulative
  /// count of all later indexes; merge from there onward."
  pub fn find_merge_range(&self) -> Option<(usize, Vec<Arc<dyn IndexReader>>)> {
    let start = self.n_unmergeable.min(self.indexes.len());
    for i in start..self.indexes.len() {
      let later: u64 = self.indexes[i + 1..].iter().map(|idx| idx.stream_count()).sum();
      if self.indexes[i].stream_count() < later {
        return Some((i, self.indexes[i..].to_vec()));
      }
    }
    None
  }

  /// A merge at `offset` produced nothing usable; skip this prefix next time.
  pub fn mark_unmergeable(&mut self, offset: usize) {
    self.n_unmergeable = offset + 1;
  }

  /// Replaces `indexes[offset..offset+removed_count]` with `merged`, and
  /// sets `nUnmergeableIndexes` so the merge outputs themselves are only
  /// retried once more indexes accumulate alongside them (§4.4).
  pub fn apply_merge(&mut self, offset: usize, removed_count: usize, merged: Vec<Arc<dyn IndexReader>>) -> Vec<Arc<dyn IndexReader>> {
    let removed: Vec<Arc<dyn IndexReader>> = self.indexes.splice(offset..offset + removed_count, merged.clone()).collect();
    self.n_unmergeable = offset + merged.len().saturating_sub(1);
    removed
  }
}

/// Looks a stream up across an index slice, newest first. Shared by
/// [`IndexList::find_stream`] and the filter worker's synchronous
/// [`crate::worker::StreamFetcher`], which holds a read-only snapshot of the
/// index list rather than the scheduler's live [`IndexList`] (§5: indexes
/// are immutable once written, so a stale snapshot is safe to read from a
/// task that runs independently of the scheduler).
pub fn find_stream_in(indexes: &[Arc<dyn IndexReader>], id: StreamId) -> Option<streamcore::Stream> {
  indexes.iter().rev().find_map(|idx| idx.stream_by_id(id))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{DateTime, Utc};
  use std::collections::BTreeSet;
  use streamcore::Stream;

  struct FakeReader {
    name: String,
    count: u64,
  }

  impl IndexReader for FakeReader {
    fn filename(&self) -> &str {
      &self.name
    }
    fn stream_count(&self) -> u64 {
      self.count
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

  fn reader(name: &str, count: u64) -> Arc<dyn IndexReader> {
    Arc::new(FakeReader { name: name.to_string(), count })
  }

  #[test]
  fn finds_merge_range_where_a_small_index_precedes_larger_later_ones() {
    let mut list = IndexList::new();
    list.push_all(vec![reader("a", 100), reader("b", 10), reader("c", 20), reader("d", 5)]);
    // b (10) < c+d (25) -> merge starts at index 1.
    let (offset, range) = list.find_merge_range().unwrap();
    assert_eq!(offset, 1);
    assert_eq!(range.len(), 3);
  }

  #[test]
  fn no_merge_when_every_index_outweighs_its_suffix() {
    let mut list = IndexList::new();
    list.push_all(vec![reader("a", 100), reader("b", 50), reader("c", 10)]);
    assert!(list.find_merge_range().is_none());
  }

  #[test]
  fn unmergeable_prefix_is_skipped_on_subsequent_scans() {
    let mut list = IndexList::new();
    list.push_all(vec![reader("a", 10), reader("b", 20)]);
    assert!(list.find_merge_range().is_some());
    list.mark_unmergeable(0);
    assert!(list.find_merge_range().is_none());
  }
}
