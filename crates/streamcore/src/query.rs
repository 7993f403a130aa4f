//! Minimal tag-definition grammar and condition tree.
//!
//! §1 scopes the real query grammar/parser and the `SearchStreams` evaluation
//! engine out of this crate as external collaborators. The Tag Registry
//! still needs *some* concrete `conditions` type to store, validate, and walk
//! for feature extraction (§3, §4.3), so this module is a deliberately small
//! stand-in grammar: flat AND-of-atoms, `|`-separated OR groups, no
//! parentheses. It is enough to drive the scheduler and uncertainty
//! propagation end to end without reinventing the real capture-query
//! language.
//!
//! Grammar (no nested grouping — parentheses are a parse error):
//!
//! ```text
//! definition := orgroup ("|" orgroup)*
//! orgroup    := atom (whitespace atom)*
//! atom       := "id:" id ("," id)*
//!             | "data:" quoted-string
//!             | "since:" rfc3339 | "until:" rfc3339
//!             | "last:" duration            (relative time, e.g. "1h", "30m")
//!             | "ref:" tag-name             (main reference)
//!             | "subquery:" tag-name        (subquery reference)
//! ```

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::bitmask::Bitmask;
use crate::error::{Error, Result};
use crate::model::StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureKind {
  IdFilter,
  DataFilter,
  AbsoluteTime,
  RelativeTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
  IdSet(BTreeSet<StreamId>),
  Data(String),
  AbsoluteTime { from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>> },
  RelativeTime(chrono::Duration),
  TagRef { name: String, subquery: bool },
  And(Vec<Condition>),
  Or(Vec<Condition>),
}

impl fmt::Display for Condition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Condition::IdSet(ids) => {
        let joined = ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        write!(f, "id:{joined}")
      }
      Condition::Data(s) => write!(f, "data:\"{s}\""),
      Condition::AbsoluteTime { from, to } => {
        if let Some(from) = from {
          write!(f, "since:{}", from.to_rfc3339())?;
        }
        if let Some(to) = to {
          if from.is_some() {
            write!(f, " ")?;
          }
          write!(f, "until:{}", to.to_rfc3339())?;
        }
        Ok(())
      }
      Condition::RelativeTime(d) => write!(f, "last:{}s", d.num_seconds()),
      Condition::TagRef { name, subquery } => {
        if *subquery {
          write!(f, "subquery:{name}")
        } else {
          write!(f, "ref:{name}")
        }
      }
      Condition::And(parts) => {
        write!(f, "{}", parts.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(" "))
      }
      Condition::Or(parts) => {
        write!(f, "{}", parts.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(" | "))
      }
    }
  }
}

/// Renders a mark/generated tag's authoritative id list as a definition
/// string, per §4.3 "rebuilds the definition as an `id:` list".
pub fn id_list_definition(ids: &Bitmask) -> String {
  let joined = ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
  format!("id:{joined}")
}

pub fn parse_definition(def: &str) -> Result<Condition> {
  if def.contains('(') || def.contains(')') {
    return Err(Error::Parse("grouping is not supported in tag definitions".into()));
  }
  let trimmed = def.trim();
  if trimmed.is_empty() {
    return Err(Error::Parse("empty definition".into()));
  }

  let or_groups = split_top_level(trimmed, '|');
  let mut ors = Vec::with_capacity(or_groups.len());
  for group in or_groups {
    let atoms = split_whitespace_respecting_quotes(group.trim())?;
    if atoms.is_empty() {
      return Err(Error::Parse("empty clause in definition".into()));
    }
    let mut ands = Vec::with_capacity(atoms.len());
    for atom in atoms {
      ands.push(parse_atom(&atom)?);
    }
    ors.push(if ands.len() == 1 { ands.into_iter().next().unwrap() } else { Condition::And(ands) });
  }
  Ok(if ors.len() == 1 { ors.into_iter().next().unwrap() } else { Condition::Or(ors) })
}

fn split_top_level(s: &str, sep: char) -> Vec<String> {
  let mut parts = Vec::new();
  let mut current = String::new();
  let mut in_quotes = false;
  for c in s.chars() {
    if c == '"' {
      in_quotes = !in_quotes;
      current.push(c);
    } else if c == sep && !in_quotes {
      parts.push(std::mem::take(&mut current));
    } else {
      current.push(c);
    }
  }
  parts.push(current);
  parts
}

fn split_whitespace_respecting_quotes(s: &str) -> Result<Vec<String>> {
  let mut parts = Vec::new();
  let mut current = String::new();
  let mut in_quotes = false;
  for c in s.chars() {
    if c == '"' {
      in_quotes = !in_quotes;
      current.push(c);
    } else if c.is_whitespace() && !in_quotes {
      if !current.is_empty() {
        parts.push(std::mem::take(&mut current));
      }
    } else {
      current.push(c);
    }
  }
  if !current.is_empty() {
    parts.push(current);
  }
  if in_quotes {
    return Err(Error::Parse("unterminated quoted string".into()));
  }
  Ok(parts)
}

fn parse_atom(atom: &str) -> Result<Condition> {
  if let Some(rest) = atom.strip_prefix("id:") {
    let mut ids = BTreeSet::new();
    for part in rest.split(',') {
      let part = part.trim();
      if part.is_empty() {
        continue;
      }
      let id: StreamId = part.parse().map_err(|_| Error::Parse(format!("bad id: {part}")))?;
      ids.insert(id);
    }
    return Ok(Condition::IdSet(ids));
  }
  if let Some(rest) = atom.strip_prefix("data:") {
    let s = unquote(rest)?;
    return Ok(Condition::Data(s));
  }
  if let Some(rest) = atom.strip_prefix("since:") {
    let dt = DateTime::parse_from_rfc3339(rest)
      .map_err(|e| Error::Parse(format!("bad since timestamp: {e}")))?
      .with_timezone(&Utc);
    return Ok(Condition::AbsoluteTime { from: Some(dt), to: None });
  }
  if let Some(rest) = atom.strip_prefix("until:") {
    let dt = DateTime::parse_from_rfc3339(rest)
      .map_err(|e| Error::Parse(format!("bad until timestamp: {e}")))?
      .with_timezone(&Utc);
    return Ok(Condition::AbsoluteTime { from: None, to: Some(dt) });
  }
  if let Some(rest) = atom.strip_prefix("last:") {
    let d = parse_relative_duration(rest)?;
    return Ok(Condition::RelativeTime(d));
  }
  if let Some(rest) = atom.strip_prefix("subquery:") {
    return Ok(Condition::TagRef { name: rest.to_string(), subquery: true });
  }
  if let Some(rest) = atom.strip_prefix("ref:") {
    return Ok(Condition::TagRef { name: rest.to_string(), subquery: false });
  }
  Err(Error::Parse(format!("unrecognized atom: {atom}")))
}

fn unquote(s: &str) -> Result<String> {
  let s = s.trim();
  if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
    Ok(s[1..s.len() - 1].to_string())
  } else {
    Err(Error::Parse(format!("expected quoted string, got: {s}")))
  }
}

fn parse_relative_duration(s: &str) -> Result<chrono::Duration> {
  let s = s.trim();
  if s.is_empty() {
    return Err(Error::Parse("empty duration".into()));
  }
  let (num_part, unit) = s.split_at(s.len() - 1);
  let n: i64 = num_part.parse().map_err(|_| Error::Parse(format!("bad duration: {s}")))?;
  match unit {
    "s" => Ok(chrono::Duration::seconds(n)),
    "m" => Ok(chrono::Duration::minutes(n)),
    "h" => Ok(chrono::Duration::hours(n)),
    "d" => Ok(chrono::Duration::days(n)),
    _ => Err(Error::Parse(format!("bad duration unit in: {s}"))),
  }
}

/// Feature + dependency summary of a parsed condition (§3 `features`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFeatures {
  pub main: BTreeSet<FeatureKind>,
  pub subquery: BTreeSet<FeatureKind>,
  pub main_tags: Vec<String>,
  pub subquery_tags: Vec<String>,
}

impl TagFeatures {
  pub fn extract(condition: &Condition) -> Self {
    let mut out = TagFeatures::default();
    walk(condition, &mut out);
    out
  }

  /// True if evaluating this tag depends on another tag's current result via
  /// a subquery reference (§4.3 invalidation rule).
  pub fn uses_subquery(&self) -> bool {
    !self.subquery_tags.is_empty()
  }

  /// True if the only feature in play is the id filter (no data/time atoms).
  pub fn id_filter_only(&self) -> bool {
    self.main == BTreeSet::from([FeatureKind::IdFilter]) && self.subquery.is_empty() && self.subquery_tags.is_empty()
  }

  pub fn uses_data_or_time(&self) -> bool {
    self.main.contains(&FeatureKind::DataFilter)
      || self.main.contains(&FeatureKind::AbsoluteTime)
      || self.main.contains(&FeatureKind::RelativeTime)
  }

  pub fn all_referenced_tags(&self) -> Vec<String> {
    let mut all = self.main_tags.clone();
    all.extend(self.subquery_tags.iter().cloned());
    all
  }
}

fn walk(condition: &Condition, out: &mut TagFeatures) {
  match condition {
    Condition::IdSet(_) => {
      out.main.insert(FeatureKind::IdFilter);
    }
    Condition::Data(_) => {
      out.main.insert(FeatureKind::DataFilter);
    }
    Condition::AbsoluteTime { .. } => {
      out.main.insert(FeatureKind::AbsoluteTime);
    }
    Condition::RelativeTime(_) => {
      out.main.insert(FeatureKind::RelativeTime);
    }
    Condition::TagRef { name, subquery } => {
      if *subquery {
        out.subquery_tags.push(name.clone());
      } else {
        out.main_tags.push(name.clone());
      }
    }
    Condition::And(parts) | Condition::Or(parts) => {
      for part in parts {
        walk(part, out);
      }
    }
  }
}

/// Reduces a condition to an explicit id set, if it is one (mark/generated
/// tags require this, §4.3 Add tag).
pub fn as_id_set(condition: &Condition) -> Option<BTreeSet<StreamId>> {
  match condition {
    Condition::IdSet(ids) => Some(ids.clone()),
    Condition::Or(parts) => {
      let mut all = BTreeSet::new();
      for part in parts {
        all.extend(as_id_set(part)?);
      }
      Some(all)
    }
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_id_set() {
    let c = parse_definition("id:1,2,3").unwrap();
    assert_eq!(c, Condition::IdSet(BTreeSet::from([1, 2, 3])));
    assert_eq!(as_id_set(&c), Some(BTreeSet::from([1, 2, 3])));
  }

  #[test]
  fn parses_data_filter() {
    let c = parse_definition("data:\"GET\"").unwrap();
    assert_eq!(c, Condition::Data("GET".to_string()));
  }

  #[test]
  fn rejects_grouping() {
    assert!(parse_definition("(id:1)").is_err());
  }

  #[test]
  fn rejects_unrecognized_atom() {
    assert!(parse_definition("bogus:1").is_err());
  }

  #[test]
  fn extracts_subquery_reference() {
    let c = parse_definition("subquery:service/http").unwrap();
    let f = TagFeatures::extract(&c);
    assert!(f.uses_subquery());
    assert_eq!(f.subquery_tags, vec!["service/http".to_string()]);
    assert!(f.main_tags.is_empty());
  }

  #[test]
  fn extracts_main_reference_and_data() {
    let c = parse_definition("data:\"GET\" ref:mark/favs").unwrap();
    let f = TagFeatures::extract(&c);
    assert!(f.main.contains(&FeatureKind::DataFilter));
    assert_eq!(f.main_tags, vec!["mark/favs".to_string()]);
    assert!(!f.id_filter_only());
    assert!(f.uses_data_or_time());
  }

  #[test]
  fn id_filter_only_detection() {
    let c = parse_definition("id:1,2").unwrap();
    let f = TagFeatures::extract(&c);
    assert!(f.id_filter_only());
    assert!(!f.uses_data_or_time());
  }

  #[test]
  fn id_list_definition_roundtrips() {
    let bm = Bitmask::from_ids([3, 5, 7]);
    let def = id_list_definition(&bm);
    assert_eq!(def, "id:3,5,7");
    let c = parse_definition(&def).unwrap();
    assert_eq!(as_id_set(&c), Some(BTreeSet::from([3, 5, 7])));
  }
}
