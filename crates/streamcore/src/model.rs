//! Data model shared across the manager (§3).
//!
//! The PCAP parser and per-index builder (§1, external collaborators) own the
//! on-disk `.idx` format; this module only defines the interfaces the core
//! needs against that format (`IndexReader`) plus the in-memory shapes
//! (`Stream`, `Packet`, `Direction`) those readers hand back.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic stream identifier, unique within a manager instance (§3).
pub type StreamId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
  ClientToServer,
  ServerToClient,
}

impl Direction {
  pub fn as_wire_str(self) -> &'static str {
    match self {
      Direction::ClientToServer => "client-to-server",
      Direction::ServerToClient => "server-to-client",
    }
  }

  pub fn from_wire_str(s: &str) -> Option<Self> {
    match s {
      "client-to-server" => Some(Direction::ClientToServer),
      "server-to-client" => Some(Direction::ServerToClient),
      _ => None,
    }
  }

  pub fn toggle(self) -> Self {
    match self {
      Direction::ClientToServer => Direction::ServerToClient,
      Direction::ServerToClient => Direction::ClientToServer,
    }
  }
}

/// One packet's payload, in the direction it travelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
  pub direction: Direction,
  pub data: Vec<u8>,
}

impl Packet {
  pub fn new(direction: Direction, data: Vec<u8>) -> Self {
    Self { direction, data }
  }
}

/// The 4-tuple plus protocol identifying a reconstructed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowKey {
  pub client_host: String,
  pub client_port: u16,
  pub server_host: String,
  pub server_port: u16,
  pub protocol: String,
}

/// A reconstructed stream, as handed back by an [`IndexReader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
  pub id: StreamId,
  pub flow: FlowKey,
  pub packets: Vec<Packet>,
}

/// Reader over one immutable on-disk index file (§3, §6).
///
/// Owned by the builder (out of scope, §1); the core only consumes readers
/// through this interface, which is why it is a trait rather than a concrete
/// file format here.
pub trait IndexReader: Send + Sync {
  fn filename(&self) -> &str;
  fn stream_count(&self) -> u64;
  fn packet_count(&self) -> u64;
  fn min_stream_id(&self) -> StreamId;
  fn max_stream_id(&self) -> StreamId;
  fn stream_ids(&self) -> BTreeSet<StreamId>;
  fn reference_time(&self) -> DateTime<Utc>;
  fn stream_by_id(&self, id: StreamId) -> Option<Stream>;

  /// Invokes `callback` for every stream in ascending id order.
  fn all_streams(&self, callback: &mut dyn FnMut(&Stream));
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn direction_wire_roundtrip() {
    assert_eq!(Direction::from_wire_str("client-to-server"), Some(Direction::ClientToServer));
    assert_eq!(Direction::from_wire_str("server-to-client"), Some(Direction::ServerToClient));
    assert_eq!(Direction::from_wire_str("bogus"), None);
    assert_eq!(Direction::ClientToServer.as_wire_str(), "client-to-server");
  }

  #[test]
  fn direction_toggle() {
    assert_eq!(Direction::ClientToServer.toggle(), Direction::ServerToClient);
    assert_eq!(Direction::ServerToClient.toggle(), Direction::ClientToServer);
  }
}
