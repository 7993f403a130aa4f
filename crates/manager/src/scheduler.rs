//! Job Scheduler (§4.1, §5): the single task that owns every piece of
//! mutable manager state. Everything else — background jobs, the converter
//! directory watcher, the filter worker, views — talks to it through
//! [`Command`]s on an unbounded FIFO queue, never by touching state
//! directly.
//!
//! Grounded on the teacher's `ProjectActor`: one task behind an `mpsc`
//! command channel, running a `tokio::select! { biased; ... }` loop, with
//! background jobs posting their own completion back onto the same queue
//! instead of the scheduler awaiting them inline (§5: "jobs run off the
//! scheduler task; only their completion is applied on it").

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use streamcore::bitmask::Bitmask;
use streamcore::config::Config;
use streamcore::query::FeatureKind;
use streamcore::{IndexReader, StreamId, Tag, TagDetails, TagRecord};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::IndexBuilder;
use crate::cache::{CompactionThresholds, FilterIndex};
use crate::convert_job::{self, ConvertOutcome};
use crate::converters::{converter_directory_entries, ConverterRegistry};
use crate::error::{ManagerError, Result};
use crate::import::{self, ImportOutcome};
use crate::indexes::{find_stream_in, IndexList};
use crate::merge::{self, MergeOutcome};
use crate::release_pool::{LockedIndexes, ReleasePool};
use crate::search::search_streams;
use crate::state::{self, PcapRecord, StateFile};
use crate::tag_registry::TagRegistry;
use crate::watcher::{is_executable, validate_new_converter, ConverterEvent, ConverterWatcher};
use crate::worker::{ConverterWorkerPool, FilterHandle, FilterWorker, StreamFetcher};

/// §6 `Status` summary.
#[derive(Debug, Clone)]
pub struct StatusSummary {
  pub stream_count: u64,
  pub packet_count: u64,
  pub index_count: usize,
  pub tag_count: usize,
  pub converter_count: usize,
  pub next_stream_id: StreamId,
  pub import_running: bool,
  pub merge_job_running: bool,
  pub tagging_job_running: bool,
  pub converter_job_running: bool,
  pub pending_imports: usize,
}

/// §6 `UpdateTag` sub-operations.
#[derive(Debug, Clone)]
pub enum TagOp {
  MarkAdd(Vec<StreamId>),
  MarkDel(Vec<StreamId>),
  SetColor(String),
  SetConverters(Vec<String>),
}

/// §4.9: a lock-counted snapshot for a View, handed to the manager/CLI
/// layer. The index lock must eventually come back via
/// [`SchedulerHandle::release_view`].
pub struct ViewSnapshot {
  pub locked: LockedIndexes,
  pub tags: Vec<TagDetails>,
  /// Converter name -> its cache handle, so `View::data` can read converted
  /// bytes for a stream without a further scheduler round trip.
  pub converters: std::collections::HashMap<String, Arc<crate::cache::ConverterCache>>,
}

enum Command {
  Status(oneshot::Sender<StatusSummary>),
  KnownPcaps(oneshot::Sender<Vec<PcapRecord>>),
  ImportPcap(PathBuf, oneshot::Sender<()>),
  ListTags(oneshot::Sender<Vec<TagDetails>>),
  AddTag { name: String, definition: String, color: String, reply: oneshot::Sender<Result<()>> },
  DelTag { name: String, reply: oneshot::Sender<Result<()>> },
  UpdateTag { name: String, op: TagOp, reply: oneshot::Sender<Result<()>> },
  ListConverters(oneshot::Sender<Vec<String>>),
  ResetConverter { name: String, reply: oneshot::Sender<Result<()>> },
  ConverterStderr { name: String, cursor: u64, reply: oneshot::Sender<Result<(Vec<String>, u64)>> },
  RestartFilter(oneshot::Sender<Result<()>>),
  GetView(oneshot::Sender<ViewSnapshot>),
  ReleaseView(LockedIndexes),
  WatcherEvent(ConverterEvent),
  ImportCompleted { files: Vec<PathBuf>, outcome: std::io::Result<ImportOutcome> },
  MergeCompleted { outcome: MergeOutcome, locked: LockedIndexes },
  TaggingCompleted { name: String, definition_snapshot: String, uncertain_snapshot: Bitmask, old_matches: Bitmask, new_matches: Bitmask, locked: LockedIndexes },
  ConversionCompleted { name: String, outcome: ConvertOutcome, locked: LockedIndexes },
  Close(oneshot::Sender<()>),
}

/// Cheap-to-clone front door onto the scheduler task. Every method is a
/// command-and-reply round trip over the unbounded queue (§5 "unbounded FIFO
/// job queue").
#[derive(Clone)]
pub struct SchedulerHandle {
  tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
  async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self.tx.send(build(reply_tx)).map_err(|_| ManagerError::SchedulerGone)?;
    Ok(reply_rx.await?)
  }

  pub async fn status(&self) -> Result<StatusSummary> {
    self.call(Command::Status).await
  }

  pub async fn known_pcaps(&self) -> Result<Vec<PcapRecord>> {
    self.call(Command::KnownPcaps).await
  }

  pub async fn import_pcap(&self, path: PathBuf) -> Result<()> {
    self.call(|reply| Command::ImportPcap(path, reply)).await
  }

  pub async fn list_tags(&self) -> Result<Vec<TagDetails>> {
    self.call(Command::ListTags).await
  }

  pub async fn add_tag(&self, name: String, definition: String, color: String) -> Result<()> {
    self.call(|reply| Command::AddTag { name, definition, color, reply }).await?
  }

  pub async fn del_tag(&self, name: String) -> Result<()> {
    self.call(|reply| Command::DelTag { name, reply }).await?
  }

  pub async fn update_tag(&self, name: String, op: TagOp) -> Result<()> {
    self.call(|reply| Command::UpdateTag { name, op, reply }).await?
  }

  pub async fn list_converters(&self) -> Result<Vec<String>> {
    self.call(Command::ListConverters).await
  }

  pub async fn reset_converter(&self, name: String) -> Result<()> {
    self.call(|reply| Command::ResetConverter { name, reply }).await?
  }

  pub async fn converter_stderr(&self, name: String, cursor: u64) -> Result<(Vec<String>, u64)> {
    self.call(|reply| Command::ConverterStderr { name, cursor, reply }).await?
  }

  /// §4.6 `RestartProcess` for the single configured filter subprocess.
  pub async fn restart_filter(&self) -> Result<()> {
    self.call(Command::RestartFilter).await?
  }

  pub async fn get_view(&self) -> Result<ViewSnapshot> {
    self.call(Command::GetView).await
  }

  /// Fire-and-forget: the scheduler decrements the refcount whenever it
  /// next drains the queue. No reply is needed, there is nothing to wait on.
  pub fn release_view(&self, locked: LockedIndexes) {
    let _ = self.tx.send(Command::ReleaseView(locked));
  }

  /// §SPEC_FULL.md §C.4 graceful shutdown: enqueues a final closure that
  /// shuts down the watcher and filter worker, then replies once every
  /// previously-enqueued command has drained.
  pub async fn close(&self) -> Result<()> {
    self.call(Command::Close).await
  }
}

pub struct Scheduler {
  directories: streamcore::config::Directories,
  builder: Arc<dyn IndexBuilder>,
  indexes: IndexList,
  index_snapshot: Arc<StdRwLock<Vec<Arc<dyn IndexReader>>>>,
  release_pool: ReleasePool,
  tags: TagRegistry,
  converters: ConverterRegistry,
  filter: Option<FilterHandle>,
  next_stream_id: StreamId,
  pending_imports: VecDeque<PathBuf>,
  import_running: bool,
  merge_job_running: bool,
  tagging_job_running: bool,
  converter_job_running: bool,
  /// §4.3: streams that arrived mid-tagging-job must re-invalidate whatever
  /// the job concludes, since it evaluated against a now-stale snapshot.
  added_during_tagging: Bitmask,
  updated_during_tagging: Bitmask,
  known_pcaps: Vec<PcapRecord>,
  current_state_path: Option<PathBuf>,
  rx: mpsc::UnboundedReceiver<Command>,
  self_tx: mpsc::UnboundedSender<Command>,
  watcher_cancel: CancellationToken,
  watcher_join: Option<tokio::task::JoinHandle<()>>,
  close_reply: Option<oneshot::Sender<()>>,
}

impl Scheduler {
  /// Starts the scheduler task: loads persisted state, registers whatever
  /// converters already sit in the converter directory, starts the
  /// directory watcher and (if configured) the filter worker, then spawns
  /// the run loop.
  pub fn spawn(config: Config, builder: Arc<dyn IndexBuilder>) -> (SchedulerHandle, tokio::task::JoinHandle<()>) {
    let directories = config.directories.clone();
    for dir in [&directories.pcap, &directories.index, &directories.snapshot, &directories.state, &directories.converter] {
      if let Err(err) = std::fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), %err, "failed to create manager directory");
      }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let self_tx = tx.clone();

    let mut tags = TagRegistry::new();
    let mut known_pcaps = Vec::new();
    let mut current_state_path = None;
    if let Some((path, state)) = state::load_latest_valid(&directories.state) {
      for record in state.tags {
        if let Ok(mut tag) = Tag::new(record.name.clone(), record.definition.clone(), record.color.clone()) {
          tag.converters = record.converters;
          tags.insert_restored(tag);
        }
      }
      known_pcaps = state.pcaps;
      current_state_path = Some(path);
    }

    let compaction = CompactionThresholds { min_free_bytes: config.cache.compact_min_free_bytes, min_free_ratio: config.cache.compact_min_free_ratio };
    let parallelism = config.conversion.max_parallel.unwrap_or_else(num_cpus::get);
    let mut converters = ConverterRegistry::new(
      directories.converter.clone(),
      parallelism,
      config.worker.stderr_ring_capacity,
      config.worker.restart_backoff_base_ms,
      config.worker.restart_backoff_max_ms,
      compaction,
    );
    if let Ok(entries) = converter_directory_entries(&directories.converter) {
      for (name, path) in entries {
        if validate_new_converter(&name, &path).is_ok()
          && let Err(err) = converters.add(name.clone(), path)
        {
          warn!(converter = %name, %err, "failed to register converter found at startup");
        }
      }
    }

    let index_snapshot = Arc::new(StdRwLock::new(Vec::new()));

    let filter = config.filter.program.as_ref().and_then(|program| {
      let fidx_path = directories.index.join("filterindex.fidx");
      let filter_index = match FilterIndex::open(&fidx_path) {
        Ok(index) => Arc::new(index),
        Err(err) => {
          warn!(path = %fidx_path.display(), %err, "failed to open filter index, filter disabled");
          return None;
        }
      };
      let snapshot_for_fetch = index_snapshot.clone();
      let fetch: StreamFetcher = Arc::new(move |id| {
        let indexes = snapshot_for_fetch.read().expect("index snapshot lock poisoned");
        find_stream_in(&indexes, id)
      });
      let (handle, _join) = FilterWorker::spawn(
        "filter".to_string(),
        program.clone(),
        filter_index,
        fetch,
        config.worker.filter_queue_capacity,
        config.worker.stderr_ring_capacity,
        config.worker.restart_backoff_base_ms,
        config.worker.restart_backoff_max_ms,
      );
      Some(handle)
    });

    let watcher_cancel = CancellationToken::new();
    let (watcher_tx, mut watcher_rx) = mpsc::channel(256);
    let watcher_join = match ConverterWatcher::spawn(directories.converter.clone(), Duration::from_millis(config.watcher.debounce_ms), watcher_cancel.clone(), watcher_tx) {
      Ok(join) => Some(join),
      Err(err) => {
        warn!(%err, "failed to start converter directory watcher");
        None
      }
    };
    {
      let bridge_tx = self_tx.clone();
      tokio::spawn(async move {
        while let Some(event) = watcher_rx.recv().await {
          if bridge_tx.send(Command::WatcherEvent(event)).is_err() {
            break;
          }
        }
      });
    }

    let scheduler = Scheduler {
      directories,
      builder,
      indexes: IndexList::new(),
      index_snapshot,
      release_pool: ReleasePool::new(),
      tags,
      converters,
      filter,
      next_stream_id: 0,
      pending_imports: VecDeque::new(),
      import_running: false,
      merge_job_running: false,
      tagging_job_running: false,
      converter_job_running: false,
      added_during_tagging: Bitmask::new(),
      updated_during_tagging: Bitmask::new(),
      known_pcaps,
      current_state_path,
      rx,
      self_tx,
      watcher_cancel,
      watcher_join,
      close_reply: None,
    };

    let join = tokio::spawn(scheduler.run());
    (SchedulerHandle { tx }, join)
  }

  async fn run(mut self) {
    info!("scheduler started");
    loop {
      let Some(command) = self.rx.recv().await else { break };
      if self.handle_command(command).await {
        break;
      }
      self.reconsider();
    }
    self.shutdown().await;
    if let Some(reply) = self.close_reply.take() {
      let _ = reply.send(());
    }
    info!("scheduler stopped");
  }

  async fn shutdown(&mut self) {
    self.watcher_cancel.cancel();
    if let Some(join) = self.watcher_join.take() {
      let _ = join.await;
    }
    if let Some(filter) = self.filter.take() {
      filter.shutdown().await;
    }
    // Every converter subprocess is spawned with its handle's Drop killing
    // the child (see worker::subprocess::Subprocess); dropping `self` below
    // when this task returns is what actually closes them.
  }

  /// Returns `true` once a `Close` was handled and the run loop should stop.
  async fn handle_command(&mut self, command: Command) -> bool {
    match command {
      Command::Status(reply) => {
        let _ = reply.send(StatusSummary {
          stream_count: self.indexes.total_streams(),
          packet_count: self.indexes.total_packets(),
          index_count: self.indexes.as_slice().len(),
          tag_count: self.tags.names().count(),
          converter_count: self.converters.names().count(),
          next_stream_id: self.next_stream_id,
          import_running: self.import_running,
          merge_job_running: self.merge_job_running,
          tagging_job_running: self.tagging_job_running,
          converter_job_running: self.converter_job_running,
          pending_imports: self.pending_imports.len(),
        });
      }
      Command::KnownPcaps(reply) => {
        let _ = reply.send(self.known_pcaps.clone());
      }
      Command::ImportPcap(path, reply) => {
        self.pending_imports.push_back(path);
        let _ = reply.send(());
      }
      Command::ListTags(reply) => {
        let _ = reply.send(self.tags.iter().map(Tag::to_details).collect());
      }
      Command::AddTag { name, definition, color, reply } => {
        let result = self.tags.add_tag(name, definition, color);
        let ok = result.is_ok();
        let _ = reply.send(result);
        if ok {
          self.persist_state();
        }
      }
      Command::DelTag { name, reply } => {
        let result = self.tags.delete_tag(&name).map(|_| ());
        let ok = result.is_ok();
        let _ = reply.send(result);
        if ok {
          self.persist_state();
        }
      }
      Command::UpdateTag { name, op, reply } => {
        let result = self.apply_tag_op(&name, op);
        let ok = result.is_ok();
        let _ = reply.send(result);
        if ok {
          self.persist_state();
        }
      }
      Command::ListConverters(reply) => {
        let _ = reply.send(self.converters.names().map(String::from).collect());
      }
      Command::ResetConverter { name, reply } => {
        let result = match self.converters.get(&name) {
          Some(entry) => entry.cache.reset().await.map_err(ManagerError::Io),
          None => Err(ManagerError::NotFound { entity: "converter", id: name }),
        };
        let _ = reply.send(result);
      }
      Command::ConverterStderr { name, cursor, reply } => {
        let result = match self.converters.get(&name) {
          Some(entry) => Ok(entry.pool.stderr_since(cursor).await),
          None => Err(ManagerError::NotFound { entity: "converter", id: name }),
        };
        let _ = reply.send(result);
      }
      Command::RestartFilter(reply) => {
        let result = match &self.filter {
          Some(filter) => {
            filter.request_restart();
            Ok(())
          }
          None => Err(ManagerError::Configuration("no filter program configured".to_string())),
        };
        let _ = reply.send(result);
      }
      Command::GetView(reply) => {
        let snapshot = self.indexes.snapshot();
        let locked = self.release_pool.lock(&snapshot);
        let tags = self.tags.iter().map(Tag::to_details).collect();
        let converters = self
          .converters
          .names()
          .filter_map(|name| self.converters.get(name).map(|entry| (name.to_string(), entry.cache.clone())))
          .collect();
        let _ = reply.send(ViewSnapshot { locked, tags, converters });
      }
      Command::ReleaseView(locked) => {
        self.release_pool.release(locked);
      }
      Command::WatcherEvent(event) => self.handle_watcher_event(event),
      Command::ImportCompleted { files, outcome } => self.handle_import_completed(files, outcome),
      Command::MergeCompleted { outcome, locked } => self.handle_merge_completed(outcome, locked),
      Command::TaggingCompleted { name, definition_snapshot, uncertain_snapshot, old_matches, new_matches, locked } => {
        self.handle_tagging_completed(name, definition_snapshot, uncertain_snapshot, old_matches, new_matches, locked)
      }
      Command::ConversionCompleted { name, outcome, locked } => self.handle_conversion_completed(name, outcome, locked),
      Command::Close(reply) => {
        self.close_reply = Some(reply);
        return true;
      }
    }
    false
  }

  fn apply_tag_op(&mut self, name: &str, op: TagOp) -> Result<()> {
    match op {
      TagOp::MarkAdd(ids) => self.tags.mark_add_del(name, &ids, &[], self.next_stream_id),
      TagOp::MarkDel(ids) => self.tags.mark_add_del(name, &[], &ids, self.next_stream_id),
      TagOp::SetColor(color) => self.tags.set_color(name, color),
      TagOp::SetConverters(requested) => {
        let (added, _removed) = self.tags.set_converters(name, requested)?;
        if !added.is_empty()
          && let Some(tag) = self.tags.get(name)
        {
          let matches = tag.matches.clone();
          for converter in added {
            self.converters.enqueue(&converter, &matches);
          }
        }
        Ok(())
      }
    }
  }

  fn handle_watcher_event(&mut self, event: ConverterEvent) {
    match event {
      ConverterEvent::Add { name, path } => {
        if let Err(err) = self.converters.add(name.clone(), path) {
          warn!(converter = %name, %err, "failed to register new converter");
        }
      }
      ConverterEvent::Restart { name } => {
        if let Some(entry) = self.converters.get(&name) {
          let program = entry.program.clone();
          self.converters.restart(&name, program);
        }
      }
      ConverterEvent::Remove { name } => {
        if let Some(entry) = self.converters.remove(&name) {
          for tag in self.tags.iter_mut() {
            tag.converters.retain(|c| c != &name);
          }
          tokio::spawn(async move {
            if let Err(err) = entry.cache.reset().await {
              warn!(converter = %name, %err, "failed to reset cache for removed converter");
            }
          });
        }
      }
      ConverterEvent::Rejected { path, reason } => {
        warn!(path = %path.display(), %reason, "rejected converter directory change");
      }
    }
  }

  fn handle_import_completed(&mut self, files: Vec<PathBuf>, outcome: std::io::Result<ImportOutcome>) {
    self.import_running = false;
    match outcome {
      Ok(outcome) => {
        self.release_pool.lock(&outcome.new_indexes);
        self.indexes.push_all(outcome.new_indexes);
        self.next_stream_id = self.next_stream_id.max(outcome.next_stream_id);
        self.tags.set_all_streams(Bitmask::range(self.next_stream_id));
        self.tags.invalidate_tags(&outcome.added, &outcome.updated);
        if self.tagging_job_running {
          self.added_during_tagging.or_with(&outcome.added);
          self.updated_during_tagging.or_with(&outcome.updated);
        }

        self.pending_imports.retain(|f| !files.contains(f));
        let imported_at = Utc::now();
        for f in &files {
          self.known_pcaps.push(PcapRecord { filename: f.display().to_string(), imported_at });
        }
        self.refresh_index_snapshot();
        self.persist_state();
      }
      Err(err) => {
        warn!(%err, files = files.len(), "import job failed, files left pending for retry");
      }
    }
  }

  fn handle_merge_completed(&mut self, outcome: MergeOutcome, locked: LockedIndexes) {
    self.merge_job_running = false;
    let removed_count = locked.readers.len();
    self.release_pool.release(locked);

    if outcome.merged.is_empty() {
      self.indexes.mark_unmergeable(outcome.offset);
      return;
    }

    let removed = self.indexes.apply_merge(outcome.offset, removed_count, outcome.merged.clone());
    self.release_pool.release(LockedIndexes { readers: removed });
    self.release_pool.lock(&outcome.merged);
    self.refresh_index_snapshot();
  }

  fn handle_tagging_completed(&mut self, name: String, definition_snapshot: String, uncertain_snapshot: Bitmask, old_matches: Bitmask, new_matches: Bitmask, locked: LockedIndexes) {
    self.tagging_job_running = false;
    self.release_pool.release(locked);

    if let Some(tag) = self.tags.get_mut(&name) {
      if tag.definition == definition_snapshot {
        let mut matches = old_matches;
        matches.sub_with(&uncertain_snapshot);
        matches.or_with(&new_matches);
        tag.matches = matches;
        tag.uncertain = Bitmask::new();

        let attached = tag.converters.clone();
        let committed = tag.matches.clone();
        for converter in attached {
          self.converters.enqueue(&converter, &committed);
        }

        // §3/§4.6: every tag's freshly-matched streams feed the filter
        // pipeline, which skips ones already in its `.fidx` cache.
        if let Some(filter) = &self.filter {
          for id in new_matches.iter() {
            if !filter.enqueue_stream(id) {
              warn!(tag = %name, stream = id, "filter queue full, stream dropped for this round");
            }
          }
        }
      } else {
        debug!(tag = %name, "tag definition changed mid-evaluation, discarding tagging result");
      }
    }

    if !self.added_during_tagging.is_zero() || !self.updated_during_tagging.is_zero() {
      let added = std::mem::take(&mut self.added_during_tagging);
      let updated = std::mem::take(&mut self.updated_during_tagging);
      self.tags.invalidate_tags(&added, &updated);
    }
    self.persist_state();
  }

  fn handle_conversion_completed(&mut self, name: String, outcome: ConvertOutcome, locked: LockedIndexes) {
    self.converter_job_running = false;
    self.release_pool.release(locked);

    if !self.converters.contains(&name) {
      debug!(converter = %name, "converter removed mid-flight, discarding conversion results");
      return;
    }

    self.converters.requeue(&name, outcome.failed);
    if !outcome.converted.is_zero() {
      for tag in self.tags.iter_mut() {
        if tag.features.main.contains(&FeatureKind::DataFilter) {
          tag.uncertain.or_with(&outcome.converted);
        }
      }
      self.tags.inherit_tag_uncertainty();
    }
  }

  fn refresh_index_snapshot(&self) {
    *self.index_snapshot.write().expect("index snapshot lock poisoned") = self.indexes.snapshot();
  }

  fn persist_state(&mut self) {
    let state = StateFile { saved: Utc::now(), tags: self.tags.iter().map(TagRecord::from).collect(), pcaps: self.known_pcaps.clone() };
    match state::save(&self.directories.state, &state, self.current_state_path.as_deref()) {
      Ok(path) => self.current_state_path = Some(path),
      Err(err) => warn!(%err, "failed to persist state"),
    }
  }

  /// §4.1: the exact four ordered scheduling rules, checked after every
  /// state transition.
  fn reconsider(&mut self) {
    if !self.import_running && !self.pending_imports.is_empty() {
      self.start_import();
    }
    if !self.tagging_job_running && self.tags.pick_tagging_candidate().is_some() {
      self.start_tagging();
    }
    if !self.converter_job_running && !self.tagging_job_running && self.converters.any_has_pending_work().is_some() {
      self.start_conversion();
    }
    if !self.merge_job_running && !self.tagging_job_running && !self.tags.any_uncertain() {
      self.start_merge();
    }
  }

  fn start_import(&mut self) {
    if self.pending_imports.is_empty() {
      return;
    }
    let files: Vec<PathBuf> = self.pending_imports.iter().cloned().collect();
    self.import_running = true;

    let builder = self.builder.clone();
    let next_stream_id = self.next_stream_id;
    let self_tx = self.self_tx.clone();
    let files_for_job = files.clone();
    tokio::spawn(async move {
      let outcome = import::run_import(builder, files_for_job.clone(), next_stream_id).await;
      let _ = self_tx.send(Command::ImportCompleted { files: files_for_job, outcome });
    });
  }

  fn start_tagging(&mut self) {
    let Some(name) = self.tags.pick_tagging_candidate() else { return };
    let Some(tag) = self.tags.get(&name) else { return };

    let definition_snapshot = tag.definition.clone();
    let uncertain_snapshot = tag.uncertain.clone();
    let old_matches = tag.matches.clone();
    let condition = tag.conditions.clone();

    let mut tag_matches = std::collections::HashMap::new();
    for referenced in tag.features.all_referenced_tags() {
      if let Some(t) = self.tags.get(&referenced) {
        tag_matches.insert(referenced, t.matches.clone());
      }
    }

    let snapshot = self.indexes.snapshot();
    let locked = self.release_pool.lock(&snapshot);
    self.tagging_job_running = true;

    let self_tx = self.self_tx.clone();
    let readers = locked.readers.clone();
    tokio::spawn(async move {
      let new_matches = search_streams(&readers, &uncertain_snapshot, &condition, &tag_matches);
      let _ = self_tx.send(Command::TaggingCompleted { name, definition_snapshot, uncertain_snapshot, old_matches, new_matches, locked });
    });
  }

  fn start_conversion(&mut self) {
    let Some(name) = self.converters.any_has_pending_work() else { return };
    let Some((pool, cache)) = self.converters.get(&name).map(|e| (e.pool.clone(), e.cache.clone())) else { return };
    let Some(queue) = self.converters.take_queue(&name) else { return };
    if queue.is_zero() {
      return;
    }

    let snapshot = self.indexes.snapshot();
    let locked = self.release_pool.lock(&snapshot);
    self.converter_job_running = true;

    let self_tx = self.self_tx.clone();
    let readers = locked.readers.clone();
    tokio::spawn(async move {
      let outcome = convert_job::run_conversion(pool, cache, readers, queue).await;
      let _ = self_tx.send(Command::ConversionCompleted { name, outcome, locked });
    });
  }

  fn start_merge(&mut self) {
    let Some((offset, range)) = self.indexes.find_merge_range() else { return };
    let locked = self.release_pool.lock(&range);
    self.merge_job_running = true;

    let builder = self.builder.clone();
    let self_tx = self.self_tx.clone();
    let readers = locked.readers.clone();
    tokio::spawn(async move {
      let outcome = merge::run_merge(builder, offset, readers).await;
      let _ = self_tx.send(Command::MergeCompleted { outcome, locked });
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::BuildResult;
  use chrono::{DateTime, TimeZone};
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
      Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }
    fn stream_by_id(&self, _id: StreamId) -> Option<Stream> {
      None
    }
    fn all_streams(&self, _callback: &mut dyn FnMut(&Stream)) {}
  }

  struct FakeBuilder;
  impl IndexBuilder for FakeBuilder {
    fn build(&self, _files: &[PathBuf], next_stream_id: StreamId) -> std::io::Result<BuildResult> {
      let reader: Arc<dyn IndexReader> = Arc::new(FakeReader { ids: BTreeSet::from([next_stream_id]) });
      Ok(BuildResult { processed_count: 1, new_indexes: vec![reader] })
    }
    fn merge(&self, _indexes: &[Arc<dyn IndexReader>]) -> std::io::Result<Vec<Arc<dyn IndexReader>>> {
      Ok(vec![])
    }
  }

  fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.directories.pcap = dir.join("pcap");
    config.directories.index = dir.join("index");
    config.directories.snapshot = dir.join("snapshot");
    config.directories.state = dir.join("state");
    config.directories.converter = dir.join("converter");
    config
  }

  #[tokio::test]
  async fn import_then_status_reflects_new_streams() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _join) = Scheduler::spawn(test_config(dir.path()), Arc::new(FakeBuilder));

    handle.import_pcap(PathBuf::from("a.pcap")).await.unwrap();
    // Give the off-scheduler import job + its completion command a moment.
    for _ in 0..50 {
      let status = handle.status().await.unwrap();
      if status.stream_count > 0 {
        assert_eq!(status.next_stream_id, 1);
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("import never completed");
  }

  #[tokio::test]
  async fn add_tag_then_list_tags_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _join) = Scheduler::spawn(test_config(dir.path()), Arc::new(FakeBuilder));

    handle.add_tag("tag/x".into(), "id:1,2".into(), "#fff".into()).await.unwrap();
    let tags = handle.list_tags().await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "tag/x");
  }

  #[tokio::test]
  async fn close_drains_outstanding_commands_before_replying() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, join) = Scheduler::spawn(test_config(dir.path()), Arc::new(FakeBuilder));

    handle.add_tag("tag/x".into(), "id:1".into(), "#fff".into()).await.unwrap();
    handle.close().await.unwrap();
    join.await.unwrap();
  }

  #[test]
  fn converter_startup_scan_skips_non_executable_entries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("upper"), b"").unwrap();
    assert!(validate_new_converter("upper", &dir.path().join("upper")).is_err());
    assert!(!is_executable(&dir.path().join("upper")));
  }
}
