//! Tag data model (§3).

use serde::{Deserialize, Serialize};

use crate::bitmask::Bitmask;
use crate::error::{Error, Result};
use crate::query::{parse_definition, Condition, TagFeatures};

pub const TAG_PREFIXES: &[&str] = &["tag/", "service/", "mark/", "generated/"];

pub fn validate_tag_name(name: &str) -> Result<()> {
  if !TAG_PREFIXES.iter().any(|p| name.starts_with(p)) {
    return Err(Error::Configuration(format!(
      "tag name {name:?} must start with one of {TAG_PREFIXES:?}"
    )));
  }
  if name.split('/').nth(1).is_none_or(str::is_empty) {
    return Err(Error::Configuration(format!("tag name {name:?} has no local part after the prefix")));
  }
  Ok(())
}

pub fn is_mark_like(name: &str) -> bool {
  name.starts_with("mark/") || name.starts_with("generated/")
}

/// A live, in-memory tag (§3). This is the manager's authoritative copy;
/// [`TagDetails`] is the by-value snapshot handed to views and workers.
#[derive(Debug, Clone)]
pub struct Tag {
  pub name: String,
  pub definition: String,
  pub conditions: Condition,
  pub features: TagFeatures,
  pub color: String,
  pub matches: Bitmask,
  pub uncertain: Bitmask,
  pub converters: Vec<String>,
}

impl Tag {
  pub fn new(name: String, definition: String, color: String) -> Result<Self> {
    validate_tag_name(&name)?;
    let conditions = parse_definition(&definition)?;
    let features = TagFeatures::extract(&conditions);
    Ok(Self {
      name,
      definition,
      conditions,
      features,
      color,
      matches: Bitmask::new(),
      uncertain: Bitmask::new(),
      converters: Vec::new(),
    })
  }

  pub fn set_definition(&mut self, definition: String) -> Result<()> {
    let conditions = parse_definition(&definition)?;
    self.features = TagFeatures::extract(&conditions);
    self.conditions = conditions;
    self.definition = definition;
    Ok(())
  }

  pub fn to_details(&self) -> TagDetails {
    TagDetails {
      name: self.name.clone(),
      definition: self.definition.clone(),
      conditions: self.conditions.clone(),
      features: self.features.clone(),
      color: self.color.clone(),
      matches: self.matches.clone(),
      uncertain: self.uncertain.clone(),
      converters: self.converters.clone(),
    }
  }

  pub fn matching_count(&self) -> u64 {
    self.matches.ones_count()
  }

  pub fn uncertain_count(&self) -> u64 {
    self.uncertain.ones_count()
  }
}

/// By-value snapshot of a [`Tag`], handed to views and background jobs so
/// they never touch the manager's live state directly (§4.9).
#[derive(Debug, Clone)]
pub struct TagDetails {
  pub name: String,
  pub definition: String,
  pub conditions: Condition,
  pub features: TagFeatures,
  pub color: String,
  pub matches: Bitmask,
  pub uncertain: Bitmask,
  pub converters: Vec<String>,
}

/// Serializable projection for `state.json` (§4.10, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRecord {
  pub name: String,
  pub definition: String,
  pub color: String,
  pub converters: Vec<String>,
}

impl From<&Tag> for TagRecord {
  fn from(tag: &Tag) -> Self {
    Self {
      name: tag.name.clone(),
      definition: tag.definition.clone(),
      color: tag.color.clone(),
      converters: tag.converters.clone(),
    }
  }
}
