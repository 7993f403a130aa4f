//! Bounded recent-stderr ring buffer for subprocess workers (§4.5 "per-process
//! recent stderr ring buffer"; cursor-based polling per SPEC_FULL.md §C.1).

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct StderrRing {
  capacity: usize,
  lines: VecDeque<String>,
  /// Total lines ever pushed, used as the polling cursor so repeated
  /// `since()` calls don't re-deliver lines already seen.
  total_pushed: u64,
}

impl StderrRing {
  pub fn new(capacity: usize) -> Self {
    Self { capacity, lines: VecDeque::with_capacity(capacity), total_pushed: 0 }
  }

  pub fn push(&mut self, line: String) {
    if self.lines.len() == self.capacity {
      self.lines.pop_front();
    }
    self.lines.push_back(line);
    self.total_pushed += 1;
  }

  /// Returns lines pushed after `cursor`, plus the cursor to pass next time.
  pub fn since(&self, cursor: u64) -> (Vec<String>, u64) {
    let dropped = self.total_pushed.saturating_sub(self.lines.len() as u64);
    let skip = cursor.saturating_sub(dropped).min(self.lines.len() as u64) as usize;
    let lines = self.lines.iter().skip(skip).cloned().collect();
    (lines, self.total_pushed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn since_zero_returns_everything_once() {
    let mut ring = StderrRing::new(10);
    ring.push("a".into());
    ring.push("b".into());
    let (lines, cursor) = ring.since(0);
    assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(cursor, 2);
  }

  #[test]
  fn repeated_poll_with_cursor_only_sees_new_lines() {
    let mut ring = StderrRing::new(10);
    ring.push("a".into());
    let (_, cursor) = ring.since(0);
    ring.push("b".into());
    let (lines, _) = ring.since(cursor);
    assert_eq!(lines, vec!["b".to_string()]);
  }

  #[test]
  fn eviction_is_reflected_in_the_cursor_math() {
    let mut ring = StderrRing::new(2);
    ring.push("a".into());
    ring.push("b".into());
    ring.push("c".into());
    let (lines, cursor) = ring.since(0);
    assert_eq!(lines, vec!["b".to_string(), "c".to_string()]);
    assert_eq!(cursor, 3);
  }
}
