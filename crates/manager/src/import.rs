//! Import job (§4.4): runs off-scheduler, handing pending pcap files to the
//! Builder and classifying the streams it reports into added vs. updated.

use std::path::PathBuf;
use std::sync::Arc;

use streamcore::bitmask::Bitmask;
use streamcore::{IndexReader, StreamId};

use crate::builder::IndexBuilder;

pub struct ImportOutcome {
  pub processed_count: u64,
  pub new_indexes: Vec<Arc<dyn IndexReader>>,
  pub added: Bitmask,
  pub updated: Bitmask,
  pub next_stream_id: StreamId,
}

/// Runs the builder over `files`, classifying each resulting stream id as
/// *added* (`>= previous_next_stream_id`) or *updated* (otherwise) per §4.4.
pub async fn run_import(builder: Arc<dyn IndexBuilder>, files: Vec<PathBuf>, previous_next_stream_id: StreamId) -> std::io::Result<ImportOutcome> {
  let files_for_blocking = files.clone();
  let result = tokio::task::spawn_blocking(move || builder.build(&files_for_blocking, previous_next_stream_id))
    .await
    .expect("builder task panicked")?;

  let mut added = Bitmask::new();
  let mut updated = Bitmask::new();
  let mut max_id_seen = previous_next_stream_id;

  for index in &result.new_indexes {
    for id in index.stream_ids() {
      if id >= previous_next_stream_id {
        added.set(id);
      } else {
        updated.set(id);
      }
      max_id_seen = max_id_seen.max(id + 1);
    }
  }

  Ok(ImportOutcome {
    processed_count: result.processed_count,
    new_indexes: result.new_indexes,
    added,
    updated,
    next_stream_id: max_id_seen,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{DateTime, Utc};
  use std::collections::BTreeSet;
  use streamcore::Stream;

  struct FakeReader {
    ids: BTreeSet<StreamId>,
  }

  impl IndexReader for FakeReader {
    fn filename(&self) -> &str {
      "fake.idx"
    }
    fn stream_count(&self) -> u64 {
      self.ids.len() as u64
    }
    fn packet_count(&self) -> u64 {
      0
    }
    fn min_stream_id(&self) -> StreamId {
      *self.ids.iter().next().unwrap_or(&0)
    }
    fn max_stream_id(&self) -> StreamId {
      *self.ids.iter().next_back().unwrap_or(&0)
    }
    fn stream_ids(&self) -> BTreeSet<StreamId> {
      self.ids.clone()
    }
    fn reference_time(&self) -> DateTime<Utc> {
      Utc::now()
    }
    fn stream_by_id(&self, _id: StreamId) -> Option<Stream> {
      None
    }
    fn all_streams(&self, _callback: &mut dyn FnMut(&Stream)) {}
  }

  struct FakeBuilder;
  impl IndexBuilder for FakeBuilder {
    fn build(&self, _files: &[PathBuf], _next_stream_id: StreamId) -> std::io::Result<crate::builder::BuildResult> {
      let reader: Arc<dyn IndexReader> = Arc::new(FakeReader { ids: BTreeSet::from([0, 1, 5]) });
      Ok(crate::builder::BuildResult { processed_count: 1, new_indexes: vec![reader] })
    }
    fn merge(&self, _indexes: &[Arc<dyn IndexReader>]) -> std::io::Result<Vec<Arc<dyn IndexReader>>> {
      Ok(vec![])
    }
  }

  #[tokio::test]
  async fn classifies_added_vs_updated_by_previous_next_stream_id() {
    let outcome = run_import(Arc::new(FakeBuilder), vec![PathBuf::from("a.pcap")], 2).await.unwrap();
    assert!(outcome.updated.is_set(0));
    assert!(outcome.updated.is_set(1));
    assert!(outcome.added.is_set(5));
    assert_eq!(outcome.next_stream_id, 6);
  }
}
