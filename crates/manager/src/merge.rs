//! Merge job (§4.4): runs off-scheduler against a locked snapshot of a
//! contiguous index range, invoking the Builder's merge operation.

use std::sync::Arc;

use streamcore::IndexReader;

use crate::builder::IndexBuilder;

pub struct MergeOutcome {
  pub offset: usize,
  pub merged: Vec<Arc<dyn IndexReader>>,
}

/// Returns `merged` empty when the builder produced nothing usable; the
/// scheduler treats that identically to a merge failure (§4.4).
pub async fn run_merge(builder: Arc<dyn IndexBuilder>, offset: usize, indexes: Vec<Arc<dyn IndexReader>>) -> MergeOutcome {
  let result = tokio::task::spawn_blocking(move || builder.merge(&indexes)).await.expect("builder task panicked");

  let merged = match result {
    Ok(merged) => merged,
    Err(err) => {
      tracing::warn!(%err, "merge job failed, index range left unmerged");
      Vec::new()
    }
  };
  MergeOutcome { offset, merged }
}
