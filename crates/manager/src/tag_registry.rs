//! Tag Registry (§4.3): tag CRUD, uncertainty propagation, and
//! stream-added/updated invalidation. Owned exclusively by the scheduler
//! task — no internal locking, same as [`crate::release_pool::ReleasePool`].

use std::collections::{HashMap, HashSet};

use streamcore::bitmask::Bitmask;
use streamcore::query::{as_id_set, id_list_definition, FeatureKind};
use streamcore::tag::{is_mark_like, validate_tag_name, Tag};
use streamcore::StreamId;

use crate::error::{ManagerError, Result};

#[derive(Default)]
pub struct TagRegistry {
  tags: HashMap<String, Tag>,
  /// `{0 .. nextStreamID-1}` (§3 `allStreams`), kept current by the
  /// scheduler via [`TagRegistry::set_all_streams`] whenever `nextStreamID`
  /// advances. Used to seed a new tag's `uncertain` and to fully invalidate
  /// a tag on the subquery rule.
  all_streams_snapshot: Bitmask,
}

impl TagRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_all_streams(&mut self, all_streams: Bitmask) {
    self.all_streams_snapshot = all_streams;
  }

  pub fn get(&self, name: &str) -> Option<&Tag> {
    self.tags.get(name)
  }

  pub fn get_mut(&mut self, name: &str) -> Option<&mut Tag> {
    self.tags.get_mut(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.tags.keys().map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Tag> {
    self.tags.values()
  }

  pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tag> {
    self.tags.values_mut()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.tags.contains_key(name)
  }

  /// Restores a previously-saved tag verbatim (§4.10 startup load), skipping
  /// the new-tag validation rules that only apply to fresh `Add tag` calls.
  pub fn insert_restored(&mut self, tag: Tag) {
    self.tags.insert(tag.name.clone(), tag);
  }

  /// §4.3 Add tag.
  pub fn add_tag(&mut self, name: String, definition: String, color: String) -> Result<()> {
    validate_tag_name(&name)?;
    if self.tags.contains_key(&name) {
      return Err(ManagerError::Configuration(format!("tag {name:?} already exists")));
    }

    let tag = Tag::new(name.clone(), definition, color)?;

    if tag.features.main.contains(&FeatureKind::RelativeTime) {
      return Err(ManagerError::Configuration(format!("tag {name:?}: relative-time conditions are not allowed")));
    }
    if tag.features.all_referenced_tags().iter().any(|r| r == &name) {
      return Err(ManagerError::Configuration(format!("tag {name:?} references itself")));
    }
    for referenced in tag.features.all_referenced_tags() {
      if !self.tags.contains_key(&referenced) {
        return Err(ManagerError::Configuration(format!("tag {name:?} references unknown tag {referenced:?}")));
      }
    }

    let mut tag = tag;
    if is_mark_like(&name) {
      let Some(ids) = as_id_set(&tag.conditions) else {
        return Err(ManagerError::Configuration(format!("tag {name:?} must reduce to an explicit id set")));
      };
      tag.matches = Bitmask::from_ids(ids);
      tag.uncertain = Bitmask::new();
    } else {
      tag.uncertain = self.all_streams_snapshot.clone();
    }

    self.tags.insert(name, tag);
    Ok(())
  }

  /// §4.3 Delete tag. Fails if any other tag still references it.
  pub fn delete_tag(&mut self, name: &str) -> Result<Tag> {
    if !self.tags.contains_key(name) {
      return Err(ManagerError::NotFound { entity: "tag", id: name.to_string() });
    }
    for (other_name, other) in &self.tags {
      if other_name == name {
        continue;
      }
      if other.features.all_referenced_tags().iter().any(|r| r == name) {
        return Err(ManagerError::Configuration(format!("tag {name:?} is still referenced by {other_name:?}")));
      }
    }
    Ok(self.tags.remove(name).expect("presence checked above"))
  }

  /// §4.3 Update tag: mark add/del. Rebuilds the `id:` definition, marks the
  /// touched ids uncertain, then re-inherits and clears this tag's own
  /// `uncertain` (marks are authoritative over their own matches).
  pub fn mark_add_del(&mut self, name: &str, add: &[StreamId], del: &[StreamId], next_stream_id: StreamId) -> Result<()> {
    let tag = self.tags.get_mut(name).ok_or(ManagerError::NotFound { entity: "tag", id: name.to_string() })?;
    if !is_mark_like(name) {
      return Err(ManagerError::Configuration(format!("{name:?} is not a mark/generated tag")));
    }
    for id in add.iter().chain(del) {
      if *id >= next_stream_id {
        return Err(ManagerError::Configuration(format!("id {id} has not been observed yet")));
      }
    }

    let mut touched = Bitmask::new();
    for id in add {
      tag.matches.set(*id);
      touched.set(*id);
    }
    for id in del {
      tag.matches.unset(*id);
      touched.set(*id);
    }

    let new_definition = id_list_definition(&tag.matches);
    tag.set_definition(new_definition)?;
    tag.uncertain.or_with(&touched);

    self.inherit_tag_uncertainty();
    // Marks are authoritative: always clear their own uncertain after
    // re-inheritance sees it, even though inherit_tag_uncertainty may have
    // just set it from the union above.
    if let Some(tag) = self.tags.get_mut(name) {
      tag.uncertain = Bitmask::new();
    }
    Ok(())
  }

  /// §4.3 Update tag: color only (no invalidation consequence).
  pub fn set_color(&mut self, name: &str, color: String) -> Result<()> {
    let tag = self.tags.get_mut(name).ok_or(ManagerError::NotFound { entity: "tag", id: name.to_string() })?;
    tag.color = color;
    Ok(())
  }

  /// §4.3 Update tag: converter set-update. Diffs current vs requested,
  /// detaching removed and attaching added, validating low complexity first.
  pub fn set_converters(&mut self, name: &str, requested: Vec<String>) -> Result<(Vec<String>, Vec<String>)> {
    let tag = self.tags.get(name).ok_or(ManagerError::NotFound { entity: "tag", id: name.to_string() })?;

    let requested_set: HashSet<&String> = requested.iter().collect();
    let current_set: HashSet<&String> = tag.converters.iter().collect();
    let added: Vec<String> = requested.iter().filter(|c| !current_set.contains(c)).cloned().collect();
    let removed: Vec<String> = tag.converters.iter().filter(|c| !requested_set.contains(c)).cloned().collect();

    if !added.is_empty() && !is_low_complexity_for_converter(tag) {
      return Err(ManagerError::TooComplex(name.to_string()));
    }

    let tag = self.tags.get_mut(name).expect("presence checked above");
    tag.converters = requested;
    Ok((added, removed))
  }

  /// §4.3 `inheritTagUncertainty`: processes tags in topological order of
  /// `referencedTags`. Cycle detection is the iterative peel-off described
  /// in §9 DESIGN NOTES: repeatedly process any tag whose referenced tags
  /// have already been processed; if a round makes no progress, the
  /// remaining tags form a cycle.
  pub fn inherit_tag_uncertainty(&mut self) {
    let order = match self.topological_order() {
      Ok(order) => order,
      Err(cycle) => {
        tracing::error!(?cycle, "tag dependency cycle detected during uncertainty propagation, skipping");
        return;
      }
    };

    for name in order {
      let (subquery_tags, main_tags) = {
        let tag = &self.tags[&name];
        (tag.features.subquery_tags.clone(), tag.features.main_tags.clone())
      };
      if subquery_tags.is_empty() && main_tags.is_empty() {
        continue;
      }

      let any_subquery_uncertain = subquery_tags.iter().any(|r| self.tags.get(r).is_some_and(|t| !t.uncertain.is_zero()));

      if any_subquery_uncertain {
        let all_streams = self.all_streams_bound();
        self.tags.get_mut(&name).expect("name from own keys").uncertain = all_streams;
        continue;
      }

      let mut union = Bitmask::new();
      for referenced in &main_tags {
        if let Some(t) = self.tags.get(referenced) {
          union.or_with(&t.uncertain);
        }
      }
      let tag = self.tags.get_mut(&name).expect("name from own keys");
      tag.uncertain.or_with(&union);
    }
  }

  /// §4.3 `invalidateTags`, called after an import with the sets of newly
  /// added and updated stream ids.
  pub fn invalidate_tags(&mut self, added: &Bitmask, updated: &Bitmask) {
    for tag in self.tags.values_mut() {
      if tag.features.uses_subquery() {
        tag.uncertain = self.all_streams_snapshot.clone();
        continue;
      }
      if tag.features.id_filter_only() {
        continue;
      }
      tag.uncertain.or_with(added);
      if tag.features.uses_data_or_time() {
        tag.uncertain.or_with(updated);
      }
    }
    self.inherit_tag_uncertainty();
  }

  /// Returns the topological processing order over `referencedTags`, or the
  /// names still unresolved (a cycle) as the error.
  fn topological_order(&self) -> std::result::Result<Vec<String>, Vec<String>> {
    let mut remaining: HashSet<String> = self.tags.keys().cloned().collect();
    let mut resolved: HashSet<String> = HashSet::new();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
      let ready: Vec<String> = remaining
        .iter()
        .filter(|name| {
          self.tags[*name].features.all_referenced_tags().iter().all(|r| resolved.contains(r) || !self.tags.contains_key(r))
        })
        .cloned()
        .collect();

      if ready.is_empty() {
        return Err(remaining.into_iter().collect());
      }
      for name in &ready {
        remaining.remove(name);
        resolved.insert(name.clone());
      }
      order.extend(ready);
    }
    Ok(order)
  }

  fn all_streams_bound(&self) -> Bitmask {
    self.all_streams_snapshot.clone()
  }

  /// §4.3 Tagging job selection: a tag with non-empty `uncertain` whose
  /// referenced tags (main and subquery) all have empty `uncertain`.
  pub fn pick_tagging_candidate(&self) -> Option<String> {
    self
      .tags
      .values()
      .find(|tag| {
        !tag.uncertain.is_zero()
          && tag
            .features
            .all_referenced_tags()
            .iter()
            .all(|r| self.tags.get(r).is_none_or(|t| t.uncertain.is_zero()))
      })
      .map(|tag| tag.name.clone())
  }

  /// §4.1 scheduling rule (4): merge may only start once no tag is
  /// uncertain.
  pub fn any_uncertain(&self) -> bool {
    self.tags.values().any(|t| !t.uncertain.is_zero())
  }
}

/// §3: "A tag with attached converters must have features ⊆ {id-filter} and
/// empty referencedTags". `TagFeatures::id_filter_only` alone does not rule
/// out a bare `ref:` atom (it contributes no `FeatureKind`), so main_tags is
/// checked explicitly here too.
fn is_low_complexity_for_converter(tag: &Tag) -> bool {
  tag.features.id_filter_only() && tag.features.main_tags.is_empty()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn registry_with_all_streams(count: u64) -> TagRegistry {
    let mut r = TagRegistry::new();
    r.all_streams_snapshot = Bitmask::range(count);
    r
  }

  #[test]
  fn add_tag_rejects_relative_time() {
    let mut r = registry_with_all_streams(0);
    let err = r.add_tag("tag/x".into(), "last:1h".into(), "#fff".into());
    assert!(err.is_err());
  }

  #[test]
  fn add_tag_rejects_self_reference() {
    let mut r = registry_with_all_streams(0);
    let err = r.add_tag("tag/x".into(), "ref:tag/x".into(), "#fff".into());
    assert!(err.is_err());
  }

  #[test]
  fn add_tag_rejects_unknown_reference() {
    let mut r = registry_with_all_streams(0);
    let err = r.add_tag("tag/x".into(), "ref:tag/missing".into(), "#fff".into());
    assert!(err.is_err());
  }

  #[test]
  fn mark_tag_matches_are_authoritative_and_uncertain_stays_empty() {
    let mut r = registry_with_all_streams(5);
    r.add_tag("mark/favs".into(), "id:1,2".into(), "#fff".into()).unwrap();
    assert!(r.get("mark/favs").unwrap().uncertain.is_zero());

    r.mark_add_del("mark/favs", &[3], &[1], 5).unwrap();
    let tag = r.get("mark/favs").unwrap();
    assert!(tag.matches.is_set(2));
    assert!(tag.matches.is_set(3));
    assert!(!tag.matches.is_set(1));
    assert!(tag.uncertain.is_zero());
  }

  #[test]
  fn delete_tag_fails_while_referenced() {
    let mut r = registry_with_all_streams(0);
    r.add_tag("service/http".into(), "data:\"GET\"".into(), "#fff".into()).unwrap();
    r.add_tag("tag/slow".into(), "subquery:service/http".into(), "#fff".into()).unwrap();
    assert!(r.delete_tag("service/http").is_err());
    r.delete_tag("tag/slow").unwrap();
    assert!(r.delete_tag("service/http").is_ok());
  }

  #[test]
  fn converter_attach_rejects_complex_tag() {
    let mut r = registry_with_all_streams(0);
    r.add_tag("tag/x".into(), "data:\"GET\"".into(), "#fff".into()).unwrap();
    let err = r.set_converters("tag/x", vec!["upper".into()]);
    assert!(matches!(err, Err(ManagerError::TooComplex(_))));
  }

  #[test]
  fn subquery_uncertainty_fully_invalidates_dependent() {
    let mut r = registry_with_all_streams(1);
    r.add_tag("service/http".into(), "data:\"GET\"".into(), "#fff".into()).unwrap();
    r.add_tag("tag/slow".into(), "subquery:service/http".into(), "#fff".into()).unwrap();
    // service/http starts fully uncertain (data filter, non-mark tag); slow
    // should inherit full invalidation because of the subquery rule.
    r.inherit_tag_uncertainty();
    assert!(!r.get("tag/slow").unwrap().uncertain.is_zero());
  }
}
