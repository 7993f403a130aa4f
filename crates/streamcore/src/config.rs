//! Configuration (§6 directories, plus scheduler/worker tunables).
//!
//! Loaded from TOML with env-var overrides, mirroring the teacher's
//! `engram-core::config::Config` layering (project file, then user config
//! dir, then compiled defaults).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The five directories the manager needs rwx on (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Directories {
  pub pcap: PathBuf,
  pub index: PathBuf,
  pub snapshot: PathBuf,
  pub state: PathBuf,
  pub converter: PathBuf,
}

impl Default for Directories {
  fn default() -> Self {
    Self {
      pcap: PathBuf::from("./data/pcap"),
      index: PathBuf::from("./data/index"),
      snapshot: PathBuf::from("./data/snapshot"),
      state: PathBuf::from("./data/state"),
      converter: PathBuf::from("./data/converters"),
    }
  }
}

/// Converter/filter cache compaction thresholds (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Compact once cumulative free bytes reaches this size.
  pub compact_min_free_bytes: u64,
  /// ...and free bytes are at least this fraction of the file.
  pub compact_min_free_ratio: f64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      compact_min_free_bytes: 16 * 1024 * 1024,
      compact_min_free_ratio: 0.5,
    }
  }
}

/// Converter directory watcher tunables (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
  pub debounce_ms: u64,
}

impl Default for WatcherConfig {
  fn default() -> Self {
    Self { debounce_ms: 500 }
  }
}

/// Subprocess worker tunables (§4.6, §4.7, and the restart-backoff
/// supplement in SPEC_FULL.md §C.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  pub filter_queue_capacity: usize,
  pub stderr_ring_capacity: usize,
  pub restart_backoff_base_ms: u64,
  pub restart_backoff_max_ms: u64,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      filter_queue_capacity: 100,
      stderr_ring_capacity: 200,
      restart_backoff_base_ms: 100,
      restart_backoff_max_ms: 30_000,
    }
  }
}

/// Conversion job fan-out tunables (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
  /// Caps the parallel per-stream conversion fan-out; `None` uses available
  /// parallelism.
  pub max_parallel: Option<usize>,
}

impl Default for ConversionConfig {
  fn default() -> Self {
    Self { max_parallel: None }
  }
}

/// The single Filter subprocess (§4.6, §3 "Filter"). Unlike converters,
/// which are discovered dynamically from the converter directory, the
/// system has exactly one filter pipeline, configured statically: §4.8's
/// directory watcher and its add/restart/remove vocabulary only ever speak
/// of converters in spec.md, so the filter program is set up once at
/// startup rather than hot-swapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
  /// Executable path. The filter is disabled (no subprocess spawned, tags
  /// cannot enqueue into it) while this is `None`.
  pub program: Option<PathBuf>,
}

impl Default for FilterConfig {
  fn default() -> Self {
    Self { program: None }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
  pub directories: Directories,
  pub cache: CacheConfig,
  pub watcher: WatcherConfig,
  pub worker: WorkerConfig,
  pub conversion: ConversionConfig,
  pub filter: FilterConfig,
}

impl Config {
  /// Loads from `path` if it exists and parses, else falls back to the
  /// user config dir, else compiled defaults. Errors are swallowed the way
  /// the teacher's `Config::load_for_project` degrades gracefully — a
  /// missing/malformed config should never prevent the manager from
  /// starting with sane defaults.
  pub fn load(path: Option<&Path>) -> Self {
    if let Some(path) = path
      && let Ok(content) = std::fs::read_to_string(path)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }

    if let Some(user_path) = Self::user_config_path()
      && user_path.exists()
      && let Ok(content) = std::fs::read_to_string(&user_path)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }

    Self::default()
  }

  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("STREAM_MANAGER_CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }
    dirs::config_dir().map(|p| p.join("stream-manager").join("config.toml"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_sane() {
    let config = Config::default();
    assert_eq!(config.cache.compact_min_free_bytes, 16 * 1024 * 1024);
    assert_eq!(config.worker.filter_queue_capacity, 100);
  }

  #[test]
  fn load_falls_back_to_default_when_missing() {
    let config = Config::load(Some(Path::new("/nonexistent/stream-manager.toml")));
    assert_eq!(config.watcher.debounce_ms, 500);
  }

  #[test]
  fn round_trips_through_toml() {
    let config = Config::default();
    let s = toml::to_string(&config).unwrap();
    let parsed: Config = toml::from_str(&s).unwrap();
    assert_eq!(parsed.cache.compact_min_free_ratio, config.cache.compact_min_free_ratio);
  }
}
