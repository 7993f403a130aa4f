//! Read View (§4.9): a point-in-time, lock-counted snapshot of the index
//! set, tag details, and converter caches, used to answer a single query
//! without touching scheduler state.
//!
//! Grounded on the teacher's read-snapshot pattern of handing callers an
//! owned copy behind a handle rather than a reference into live state;
//! generalized here to the index-refcount + tag-details + converter-cache
//! triple this crate's queries need.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use streamcore::bitmask::Bitmask;
use streamcore::query::Condition;
use streamcore::{IndexReader, Packet, Stream, StreamId, TagDetails};

use crate::cache::ConverterCache;
use crate::error::{ManagerError, Result};
use crate::indexes::find_stream_in;
use crate::release_pool::LockedIndexes;
use crate::scheduler::{SchedulerHandle, ViewSnapshot};
use crate::search::search_streams;

/// §4.9: answers `AllStreams`, `SearchStreams`, `Stream`, `ReferenceTime`,
/// `HasTag`, `AllTags`, `AllConverters`, `Data` entirely from its own
/// snapshot. Call [`View::release`] (or just drop it) when done so the
/// index lock returns to the pool.
pub struct View {
  handle: SchedulerHandle,
  locked: Option<LockedIndexes>,
  tags: HashMap<String, TagDetails>,
  converters: HashMap<String, Arc<ConverterCache>>,
}

impl View {
  pub(crate) fn new(handle: SchedulerHandle, snapshot: ViewSnapshot) -> Self {
    let tags = snapshot.tags.into_iter().map(|t| (t.name.clone(), t)).collect();
    Self { handle, locked: Some(snapshot.locked), tags, converters: snapshot.converters }
  }

  fn indexes(&self) -> &[Arc<dyn IndexReader>] {
    &self.locked.as_ref().expect("View used after release").readers
  }

  fn universe(&self) -> Bitmask {
    Bitmask::from_ids(self.all_streams())
  }

  fn tag_matches_snapshot(&self) -> HashMap<String, Bitmask> {
    self.tags.iter().map(|(name, tag)| (name.clone(), tag.matches.clone())).collect()
  }

  pub fn all_streams(&self) -> Vec<StreamId> {
    let mut ids = BTreeSet::new();
    for index in self.indexes() {
      ids.extend(index.stream_ids());
    }
    ids.into_iter().collect()
  }

  pub fn search_streams(&self, condition: &Condition) -> Bitmask {
    let universe = self.universe();
    let tag_matches = self.tag_matches_snapshot();
    search_streams(self.indexes(), &universe, condition, &tag_matches)
  }

  pub fn stream(&self, id: StreamId) -> Option<Stream> {
    find_stream_in(self.indexes(), id)
  }

  pub fn reference_time(&self, id: StreamId) -> Option<DateTime<Utc>> {
    self
      .indexes()
      .iter()
      .rev()
      .find(|idx| idx.min_stream_id() <= id && id <= idx.max_stream_id() && idx.stream_ids().contains(&id))
      .map(|idx| idx.reference_time())
  }

  pub fn has_tag(&self, id: StreamId, tag_name: &str) -> bool {
    self.tags.get(tag_name).is_some_and(|tag| tag.matches.is_set(id))
  }

  pub fn all_tags(&self) -> Vec<String> {
    self.tags.keys().cloned().collect()
  }

  pub fn tag_details(&self, tag_name: &str) -> Option<&TagDetails> {
    self.tags.get(tag_name)
  }

  pub fn all_converters(&self) -> Vec<String> {
    self.converters.keys().cloned().collect()
  }

  pub async fn data(&self, converter_name: &str, id: StreamId) -> Result<Option<Vec<Packet>>> {
    let cache = self
      .converters
      .get(converter_name)
      .ok_or_else(|| ManagerError::NotFound { entity: "converter", id: converter_name.to_string() })?;
    Ok(cache.data(id).await?)
  }

  /// §4.9 tag prefetch: for each named tag whose `uncertain` intersects
  /// `mask` (the whole view if `mask` is `None`), evaluates its condition
  /// over this View's indexes and folds the result into the View-local
  /// `matches`/`uncertain` copy. Referenced tags are evaluated before their
  /// dependents so a dependent's prefetch sees up-to-date matches. Mutates
  /// only this View's copy — the manager's authoritative tags are
  /// untouched.
  pub fn prefetch_tags(&mut self, names: &[String], mask: Option<&Bitmask>) {
    let mut visited = HashSet::new();
    for name in names {
      self.prefetch_one(name, mask, &mut visited);
    }
  }

  fn prefetch_one(&mut self, name: &str, mask: Option<&Bitmask>, visited: &mut HashSet<String>) {
    if !visited.insert(name.to_string()) {
      return;
    }
    let Some(tag) = self.tags.get(name) else { return };
    let referenced = tag.features.all_referenced_tags();
    for dep in referenced {
      self.prefetch_one(&dep, mask, visited);
    }

    let Some(tag) = self.tags.get(name) else { return };
    let mut target = tag.uncertain.clone();
    if let Some(mask) = mask {
      target.and_with(mask);
    }
    if target.is_zero() {
      return;
    }
    let condition = tag.conditions.clone();

    let tag_matches = self.tag_matches_snapshot();
    let indexes = self.indexes().to_vec();
    let evaluated = search_streams(&indexes, &target, &condition, &tag_matches);

    if let Some(tag) = self.tags.get_mut(name) {
      tag.matches.or_with(&evaluated);
      tag.uncertain.sub_with(&target);
    }
  }

  /// Hands the index lock back to the scheduler's release pool. Calling
  /// this explicitly is preferred; dropping a View without releasing also
  /// releases it (§4.2: a reader count must never leak past its owner).
  pub fn release(mut self) {
    self.release_locked();
  }

  fn release_locked(&mut self) {
    if let Some(locked) = self.locked.take() {
      self.handle.release_view(locked);
    }
  }
}

impl Drop for View {
  fn drop(&mut self) {
    self.release_locked();
  }
}
