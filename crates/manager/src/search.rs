//! Minimal `SearchStreams` stand-in (§1 scopes the real query engine out;
//! §4.3/§4.9 still need something to actually evaluate the grammar in
//! `streamcore::query` against a snapshot of indexes).
//!
//! Time predicates are evaluated against the owning index's `ReferenceTime`
//! (§6) — a stream has no timestamp of its own in this data model, only its
//! containing index does. Data predicates match against the concatenated
//! packet bytes of a stream, across both directions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use streamcore::bitmask::Bitmask;
use streamcore::query::Condition;
use streamcore::IndexReader;

/// Evaluates `condition` over every id set in `mask`, returning the subset
/// that matches. `tag_matches` resolves `ref:`/`subquery:` leaves to the
/// referenced tag's already-computed match set (the caller is responsible
/// for snapshotting referenced tags before calling this, §4.3 Tagging job).
pub fn search_streams(indexes: &[Arc<dyn IndexReader>], mask: &Bitmask, condition: &Condition, tag_matches: &HashMap<String, Bitmask>) -> Bitmask {
  match condition {
    Condition::IdSet(ids) => {
      let mut out = Bitmask::new();
      for id in ids {
        if mask.is_set(*id) {
          out.set(*id);
        }
      }
      out
    }
    Condition::Data(needle) => filter_mask(indexes, mask, |stream| {
      stream.packets.iter().any(|p| contains_subslice(&p.data, needle.as_bytes()))
    }),
    Condition::AbsoluteTime { from, to } => {
      let mut out = Bitmask::new();
      for id in mask.iter() {
        let Some(index) = owning_index(indexes, id) else { continue };
        let t = index.reference_time();
        if from.is_none_or(|f| t >= f) && to.is_none_or(|u| t <= u) {
          out.set(id);
        }
      }
      out
    }
    Condition::RelativeTime(duration) => {
      let cutoff = Utc::now() - *duration;
      let mut out = Bitmask::new();
      for id in mask.iter() {
        let Some(index) = owning_index(indexes, id) else { continue };
        if index.reference_time() >= cutoff {
          out.set(id);
        }
      }
      out
    }
    Condition::TagRef { name, .. } => {
      let mut out = tag_matches.get(name).cloned().unwrap_or_default();
      out.and_with(mask);
      out
    }
    Condition::And(parts) => {
      let mut out = mask.clone();
      for part in parts {
        out.and_with(&search_streams(indexes, &out, part, tag_matches));
      }
      out
    }
    Condition::Or(parts) => {
      let mut out = Bitmask::new();
      for part in parts {
        out.or_with(&search_streams(indexes, mask, part, tag_matches));
      }
      out
    }
  }
}

fn owning_index<'a>(indexes: &'a [Arc<dyn IndexReader>], id: streamcore::StreamId) -> Option<&'a Arc<dyn IndexReader>> {
  indexes.iter().rev().find(|idx| idx.min_stream_id() <= id && id <= idx.max_stream_id() && idx.stream_ids().contains(&id))
}

fn filter_mask(indexes: &[Arc<dyn IndexReader>], mask: &Bitmask, predicate: impl Fn(&streamcore::Stream) -> bool) -> Bitmask {
  let mut out = Bitmask::new();
  for id in mask.iter() {
    let Some(index) = owning_index(indexes, id) else { continue };
    let Some(stream) = index.stream_by_id(id) else { continue };
    if predicate(&stream) {
      out.set(id);
    }
  }
  out
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
  if needle.is_empty() {
    return true;
  }
  haystack.windows(needle.len()).any(|w| w == needle)
}
