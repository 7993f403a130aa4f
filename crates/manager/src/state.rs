//! State Persistence (§4.10). One `state.json`-shaped file per save, named
//! by timestamp; write-then-delete-previous rather than write-rename.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use streamcore::tag::{validate_tag_name, Tag};
use streamcore::TagRecord;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcapRecord {
  pub filename: String,
  pub imported_at: DateTime<Utc>,
}

/// Mirrors §6's `{Saved, Tags, Pcaps}` state file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
  pub saved: DateTime<Utc>,
  pub tags: Vec<TagRecord>,
  pub pcaps: Vec<PcapRecord>,
}

/// Writes a new state file, named by `saved`'s timestamp, then deletes
/// `previous` (§4.10: "the code writes the new file first, then deletes the
/// previously-active filename" — not write-rename).
pub fn save(dir: &Path, state: &StateFile, previous: Option<&Path>) -> std::io::Result<PathBuf> {
  std::fs::create_dir_all(dir)?;
  let filename = format!("{}.state.json", state.saved.format("%Y%m%dT%H%M%S%.3fZ"));
  let path = dir.join(filename);
  let json = serde_json::to_vec_pretty(state)?;
  std::fs::write(&path, json)?;

  if let Some(previous) = previous
    && previous != path
  {
    if let Err(e) = std::fs::remove_file(previous) {
      if e.kind() != std::io::ErrorKind::NotFound {
        warn!(file = %previous.display(), error = %e, "failed to remove previous state file");
      }
    }
  }
  debug!(file = %path.display(), "wrote state file");
  Ok(path)
}

/// Scans `dir` for state files, parses each candidate, and returns the one
/// with the latest `saved` timestamp whose tags parse and form an acyclic
/// dependency graph, ignoring older or malformed ones (§4.10).
pub fn load_latest_valid(dir: &Path) -> Option<(PathBuf, StateFile)> {
  let entries = std::fs::read_dir(dir).ok()?;
  let mut candidates: Vec<(PathBuf, StateFile)> = Vec::new();

  for entry in entries.flatten() {
    let path = entry.path();
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
      continue;
    }
    let Ok(content) = std::fs::read_to_string(&path) else { continue };
    let Ok(state) = serde_json::from_str::<StateFile>(&content) else {
      warn!(file = %path.display(), "skipping malformed state file");
      continue;
    };
    if !tags_are_valid(&state.tags) {
      warn!(file = %path.display(), "skipping state file with invalid or cyclic tag graph");
      continue;
    }
    candidates.push((path, state));
  }

  candidates.into_iter().max_by_key(|(_, state)| state.saved)
}

fn tags_are_valid(records: &[TagRecord]) -> bool {
  let mut tags = Vec::with_capacity(records.len());
  for record in records {
    if validate_tag_name(&record.name).is_err() {
      return false;
    }
    match Tag::new(record.name.clone(), record.definition.clone(), record.color.clone()) {
      Ok(tag) => tags.push(tag),
      Err(_) => return false,
    }
  }
  acyclic(&tags)
}

fn acyclic(tags: &[Tag]) -> bool {
  let names: std::collections::HashSet<&str> = tags.iter().map(|t| t.name.as_str()).collect();
  let mut resolved: std::collections::HashSet<&str> = std::collections::HashSet::new();
  let mut remaining: Vec<&Tag> = tags.iter().collect();

  loop {
    let before = remaining.len();
    remaining.retain(|tag| {
      let ready = tag.features.all_referenced_tags().iter().all(|r| resolved.contains(r.as_str()) || !names.contains(r.as_str()));
      if ready {
        resolved.insert(tag.name.as_str());
      }
      !ready
    });
    if remaining.is_empty() {
      return true;
    }
    if remaining.len() == before {
      return false;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn state_at(saved: DateTime<Utc>) -> StateFile {
    StateFile { saved, tags: vec![], pcaps: vec![] }
  }

  #[test]
  fn save_removes_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let first = save(dir.path(), &state_at(Utc::now()), None).unwrap();
    assert!(first.exists());

    let second = save(dir.path(), &state_at(Utc::now() + chrono::Duration::seconds(1)), Some(&first)).unwrap();
    assert!(second.exists());
    assert!(!first.exists());
  }

  #[test]
  fn load_latest_valid_picks_newest_and_skips_malformed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.json"), b"not json").unwrap();
    save(dir.path(), &state_at(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()), None).unwrap();
    let newer = save(dir.path(), &state_at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()), None).unwrap();

    let (path, state) = load_latest_valid(dir.path()).unwrap();
    assert_eq!(path, newer);
    assert_eq!(state.saved, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
  }

  #[test]
  fn load_latest_valid_rejects_cyclic_tag_graph() {
    let dir = tempfile::tempdir().unwrap();
    let cyclic = StateFile {
      saved: Utc::now(),
      tags: vec![
        TagRecord { name: "tag/a".into(), definition: "ref:tag/b".into(), color: "#fff".into(), converters: vec![] },
        TagRecord { name: "tag/b".into(), definition: "ref:tag/a".into(), color: "#fff".into(), converters: vec![] },
      ],
      pcaps: vec![],
    };
    save(dir.path(), &cyclic, None).unwrap();
    assert!(load_latest_valid(dir.path()).is_none());
  }
}
