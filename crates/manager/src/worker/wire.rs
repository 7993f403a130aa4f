//! JSON wire shapes for the filter and converter subprocess protocols
//! (§4.6, §4.7). Field names are fixed by the protocol, not by Rust
//! convention, hence the explicit `rename_all = "PascalCase"`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use streamcore::{Direction, FlowKey, Packet};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FlowHeaderWire {
  pub client_host: String,
  pub client_port: u16,
  pub server_host: String,
  pub server_port: u16,
  pub protocol: String,
}

impl From<&FlowKey> for FlowHeaderWire {
  fn from(flow: &FlowKey) -> Self {
    Self {
      client_host: flow.client_host.clone(),
      client_port: flow.client_port,
      server_host: flow.server_host.clone(),
      server_port: flow.server_port,
      protocol: flow.protocol.clone(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PacketWire {
  pub direction: String,
  pub data: String,
}

impl From<&Packet> for PacketWire {
  fn from(packet: &Packet) -> Self {
    Self {
      direction: packet.direction.as_wire_str().to_string(),
      data: base64::engine::general_purpose::STANDARD.encode(&packet.data),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
  #[error("unrecognized packet direction {0:?}")]
  UnknownDirection(String),
  #[error("invalid base64 packet data: {0}")]
  Base64(#[from] base64::DecodeError),
}

impl PacketWire {
  pub fn into_packet(self) -> Result<Packet, WireError> {
    let direction = Direction::from_wire_str(&self.direction).ok_or(WireError::UnknownDirection(self.direction))?;
    let data = base64::engine::general_purpose::STANDARD.decode(self.data)?;
    Ok(Packet::new(direction, data))
  }
}

/// Metadata object terminating a filter worker's stdout stream (§4.6).
/// The protocol leaves its shape otherwise unspecified; the only field the
/// manager consumes today is whether the filter accepted the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilterMetadata {
  #[serde(default)]
  pub accepted: bool,
}

/// Response object from a converter worker for one stream (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConvertResponse {
  pub packets: Vec<PacketWire>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flow_header_serializes_with_pascal_case_fields() {
    let flow = FlowKey {
      client_host: "10.0.0.1".into(),
      client_port: 1234,
      server_host: "10.0.0.2".into(),
      server_port: 443,
      protocol: "tcp".into(),
    };
    let wire = FlowHeaderWire::from(&flow);
    let json = serde_json::to_string(&wire).unwrap();
    assert!(json.contains("\"ClientHost\":\"10.0.0.1\""));
    assert!(json.contains("\"ServerPort\":443"));
  }

  #[test]
  fn packet_wire_round_trips_through_base64() {
    let packet = Packet::new(Direction::ClientToServer, b"hello".to_vec());
    let wire = PacketWire::from(&packet);
    assert_eq!(wire.direction, "client-to-server");
    let back = wire.into_packet().unwrap();
    assert_eq!(back, packet);
  }

  #[test]
  fn unknown_direction_is_rejected() {
    let wire = PacketWire { direction: "sideways".into(), data: "aGVsbG8=".into() };
    assert!(matches!(wire.into_packet(), Err(WireError::UnknownDirection(_))));
  }
}
