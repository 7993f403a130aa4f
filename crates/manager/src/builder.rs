//! Interface to the Builder (§1 external collaborator, §6): produces
//! `.idx` readers from pcap files and merges existing ones. The core never
//! parses packet-capture bytes itself; it only calls through this trait.

use std::path::PathBuf;
use std::sync::Arc;

use streamcore::{IndexReader, StreamId};

/// Result of running the builder over a batch of pcap files (§4.4 Import).
pub struct BuildResult {
  pub processed_count: u64,
  pub new_indexes: Vec<Arc<dyn IndexReader>>,
}

pub trait IndexBuilder: Send + Sync {
  /// Builds new index readers from `files`, using `next_stream_id` as the
  /// first id to assign to a brand-new stream.
  fn build(&self, files: &[PathBuf], next_stream_id: StreamId) -> std::io::Result<BuildResult>;

  /// Coalesces `indexes` into a new, possibly empty, set of replacement
  /// indexes (§4.4 Merge). An empty result means the merge produced nothing
  /// usable and the caller should treat it as failure.
  fn merge(&self, indexes: &[Arc<dyn IndexReader>]) -> std::io::Result<Vec<Arc<dyn IndexReader>>>;
}
