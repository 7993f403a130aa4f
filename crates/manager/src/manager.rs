//! Public front door (§6): wraps the scheduler's command queue and the
//! [`crate::view::View`] abstraction behind ergonomic `async fn`s, so the
//! outer API layer never constructs a [`crate::scheduler::Command`] itself.

use std::path::PathBuf;
use std::sync::Arc;

use streamcore::config::Config;
use streamcore::TagDetails;
use tokio::task::JoinHandle;

use crate::builder::IndexBuilder;
use crate::error::Result;
use crate::scheduler::{Scheduler, SchedulerHandle, StatusSummary, TagOp};
use crate::state::PcapRecord;
use crate::view::View;

/// Owns the scheduler task end to end. Created with [`Manager::spawn`],
/// torn down with [`Manager::close`].
pub struct Manager {
  handle: SchedulerHandle,
  join: Option<JoinHandle<()>>,
}

impl Manager {
  pub fn spawn(config: Config, builder: Arc<dyn IndexBuilder>) -> Self {
    let (handle, join) = Scheduler::spawn(config, builder);
    Self { handle, join: Some(join) }
  }

  /// A cheap-to-clone handle onto the scheduler, for callers that want to
  /// hold their own reference independent of this `Manager`'s lifetime.
  pub fn handle(&self) -> SchedulerHandle {
    self.handle.clone()
  }

  pub async fn status(&self) -> Result<StatusSummary> {
    self.handle.status().await
  }

  pub async fn known_pcaps(&self) -> Result<Vec<PcapRecord>> {
    self.handle.known_pcaps().await
  }

  pub async fn import_pcap(&self, path: PathBuf) -> Result<()> {
    self.handle.import_pcap(path).await
  }

  pub async fn list_tags(&self) -> Result<Vec<TagDetails>> {
    self.handle.list_tags().await
  }

  pub async fn add_tag(&self, name: String, definition: String, color: String) -> Result<()> {
    self.handle.add_tag(name, definition, color).await
  }

  pub async fn del_tag(&self, name: String) -> Result<()> {
    self.handle.del_tag(name).await
  }

  pub async fn update_tag(&self, name: String, op: TagOp) -> Result<()> {
    self.handle.update_tag(name, op).await
  }

  pub async fn list_converters(&self) -> Result<Vec<String>> {
    self.handle.list_converters().await
  }

  pub async fn reset_converter(&self, name: String) -> Result<()> {
    self.handle.reset_converter(name).await
  }

  pub async fn converter_stderr(&self, name: String, cursor: u64) -> Result<(Vec<String>, u64)> {
    self.handle.converter_stderr(name, cursor).await
  }

  pub async fn restart_filter(&self) -> Result<()> {
    self.handle.restart_filter().await
  }

  /// §4.9: takes a lock-counted snapshot for ad-hoc querying. Release it
  /// (explicitly or by drop) when done to return the lock to the pool.
  pub async fn view(&self) -> Result<View> {
    let snapshot = self.handle.get_view().await?;
    Ok(View::new(self.handle.clone(), snapshot))
  }

  /// §5 `Close`: drains the command queue, shuts down the converter
  /// directory watcher, the filter worker, and every converter subprocess,
  /// then waits for the scheduler task to actually exit.
  pub async fn close(mut self) -> Result<()> {
    self.handle.close().await?;
    if let Some(join) = self.join.take() {
      let _ = join.await;
    }
    Ok(())
  }
}
