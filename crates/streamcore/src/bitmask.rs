//! Dense bitmask over [`StreamId`], per DESIGN NOTES §9.
//!
//! `matches`, `uncertain`, and `allStreams` are all instances of this type.
//! Backed by `roaring::RoaringBitmap`, which gives near-array density for the
//! mostly-contiguous, mostly-dense id ranges this domain produces while still
//! behaving reasonably for sparse mark-tag sets.
//!
//! `StreamId` is `u64` in the data model (§3) but the roaring backend keys on
//! `u32`. We assert rather than silently truncate: a capture with more than
//! `u32::MAX` streams is outside what this implementation supports, and
//! wrapping would corrupt tag state instead of failing loudly.

use roaring::RoaringBitmap;

use crate::model::StreamId;

fn to_key(id: StreamId) -> u32 {
  u32::try_from(id).expect("StreamId exceeds u32::MAX, unsupported by the roaring-backed Bitmask")
}

fn from_key(key: u32) -> StreamId {
  key as StreamId
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmask(RoaringBitmap);

impl Bitmask {
  pub fn new() -> Self {
    Self(RoaringBitmap::new())
  }

  /// `{0 .. count-1}`, used to build `allStreams` and full-invalidation masks.
  pub fn range(count: StreamId) -> Self {
    let mut bm = RoaringBitmap::new();
    if count > 0 {
      bm.insert_range(0..to_key(count));
    }
    Self(bm)
  }

  pub fn set(&mut self, id: StreamId) {
    self.0.insert(to_key(id));
  }

  pub fn unset(&mut self, id: StreamId) {
    self.0.remove(to_key(id));
  }

  pub fn is_set(&self, id: StreamId) -> bool {
    self.0.contains(to_key(id))
  }

  pub fn is_zero(&self) -> bool {
    self.0.is_empty()
  }

  pub fn ones_count(&self) -> u64 {
    self.0.len()
  }

  /// Smallest set id `>= from`, if any.
  pub fn trailing_zeros_from(&self, from: StreamId) -> Option<StreamId> {
    self.0.range(to_key(from)..).next().map(from_key)
  }

  pub fn or_with(&mut self, other: &Bitmask) {
    self.0 |= &other.0;
  }

  pub fn and_with(&mut self, other: &Bitmask) {
    self.0 &= &other.0;
  }

  /// Removes every id present in `other` (set subtraction, `self \ other`).
  pub fn sub_with(&mut self, other: &Bitmask) {
    self.0 -= &other.0;
  }

  pub fn union(&self, other: &Bitmask) -> Bitmask {
    Bitmask(&self.0 | &other.0)
  }

  pub fn intersection(&self, other: &Bitmask) -> Bitmask {
    Bitmask(&self.0 & &other.0)
  }

  pub fn difference(&self, other: &Bitmask) -> Bitmask {
    Bitmask(&self.0 - &other.0)
  }

  pub fn intersects(&self, other: &Bitmask) -> bool {
    !self.0.is_disjoint(&other.0)
  }

  pub fn iter(&self) -> impl Iterator<Item = StreamId> + '_ {
    self.0.iter().map(from_key)
  }

  pub fn from_ids(ids: impl IntoIterator<Item = StreamId>) -> Self {
    let mut bm = RoaringBitmap::new();
    for id in ids {
      bm.insert(to_key(id));
    }
    Self(bm)
  }
}

impl FromIterator<StreamId> for Bitmask {
  fn from_iter<T: IntoIterator<Item = StreamId>>(iter: T) -> Self {
    Self::from_ids(iter)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn range_contains_exactly_the_prefix() {
    let bm = Bitmask::range(5);
    for i in 0..5 {
      assert!(bm.is_set(i));
    }
    assert!(!bm.is_set(5));
  }

  #[test]
  fn set_unset_roundtrip() {
    let mut bm = Bitmask::new();
    bm.set(42);
    assert!(bm.is_set(42));
    bm.unset(42);
    assert!(!bm.is_set(42));
    assert!(bm.is_zero());
  }

  #[test]
  fn or_and_sub() {
    let a = Bitmask::from_ids([1, 2, 3]);
    let b = Bitmask::from_ids([3, 4, 5]);

    let mut u = a.clone();
    u.or_with(&b);
    assert_eq!(u, Bitmask::from_ids([1, 2, 3, 4, 5]));

    let mut i = a.clone();
    i.and_with(&b);
    assert_eq!(i, Bitmask::from_ids([3]));

    let mut d = a.clone();
    d.sub_with(&b);
    assert_eq!(d, Bitmask::from_ids([1, 2]));
  }

  #[test]
  fn trailing_zeros_from_finds_next_set_bit() {
    let bm = Bitmask::from_ids([10, 20, 30]);
    assert_eq!(bm.trailing_zeros_from(0), Some(10));
    assert_eq!(bm.trailing_zeros_from(11), Some(20));
    assert_eq!(bm.trailing_zeros_from(31), None);
  }

  #[test]
  fn ones_count_matches_cardinality() {
    let bm = Bitmask::from_ids([1, 2, 3]);
    assert_eq!(bm.ones_count(), 3);
  }
}
