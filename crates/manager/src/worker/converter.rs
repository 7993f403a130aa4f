//! Converter Worker (§4.7): a pool of `P` subprocess instances of the same
//! converter program, each doing independent request/response round trips
//! so the Conversion job can run up to `P` conversions concurrently.
//!
//! The wire protocol reuses the filter worker's framing (flow header, one
//! object per input packet, blank-line terminator) since the spec does not
//! define a separate shape for converters beyond "request/response round
//! trip" — documented as an Open Question resolution in DESIGN.md.

use std::path::PathBuf;

use streamcore::Stream;
use tokio::sync::Mutex;
use tracing::warn;

use super::subprocess::{Subprocess, SubprocessError};
use super::wire::{ConvertResponse, FlowHeaderWire, PacketWire};

pub struct ConverterWorkerPool {
  name: String,
  program: PathBuf,
  instances: Vec<Mutex<Subprocess>>,
}

impl ConverterWorkerPool {
  pub fn new(name: String, program: PathBuf, parallelism: usize, stderr_ring_capacity: usize, backoff_base_ms: u64, backoff_max_ms: u64) -> Self {
    let parallelism = parallelism.max(1);
    let instances = (0..parallelism)
      .map(|_| Mutex::new(Subprocess::new(program.clone(), vec![], stderr_ring_capacity, backoff_base_ms, backoff_max_ms)))
      .collect();
    Self { name, program, instances }
  }

  pub fn parallelism(&self) -> usize {
    self.instances.len()
  }

  /// Runs one stream through instance `slot % parallelism`. Callers
  /// (the Conversion job) are expected to hold at most `parallelism`
  /// concurrent calls in flight, one per distinct `slot`.
  pub async fn convert(&self, slot: usize, stream: &Stream) -> Result<Vec<streamcore::Packet>, SubprocessError> {
    let mut sub = self.instances[slot % self.instances.len()].lock().await;
    if sub.is_invalid() {
      sub.wait_backoff().await;
      sub.restart().await?;
    } else {
      sub.ensure_started().await?;
    }

    sub.write_json(&FlowHeaderWire::from(&stream.flow)).await?;
    for packet in &stream.packets {
      sub.write_json(&PacketWire::from(packet)).await?;
    }
    sub.write_blank_line().await?;

    let response: ConvertResponse = sub.read_json().await?;
    let mut out = Vec::with_capacity(response.packets.len());
    for wire in response.packets {
      match wire.into_packet() {
        Ok(packet) => out.push(packet),
        Err(err) => warn!(converter = %self.name, program = %self.program.display(), stream = stream.id, %err, "dropping malformed converted packet"),
      }
    }
    Ok(out)
  }

  /// Stderr for `ConverterStderr` (§6) comes from instance 0 only — with
  /// `P` independent subprocess instances there is no single combined
  /// stream, and operators overwhelmingly run with `P = 1`; documented as
  /// an Open Question resolution in DESIGN.md.
  pub async fn stderr_since(&self, cursor: u64) -> (Vec<String>, u64) {
    self.instances[0].lock().await.stderr_since(cursor)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use streamcore::{Direction, FlowKey, Packet};

  fn sample_stream() -> Stream {
    Stream {
      id: 1,
      flow: FlowKey { client_host: "a".into(), client_port: 1, server_host: "b".into(), server_port: 2, protocol: "tcp".into() },
      packets: vec![Packet::new(Direction::ClientToServer, b"hi".to_vec())],
    }
  }

  #[tokio::test]
  async fn pool_has_requested_parallelism() {
    let pool = ConverterWorkerPool::new("id".into(), PathBuf::from("/bin/true"), 4, 10, 10, 1000);
    assert_eq!(pool.parallelism(), 4);
    let _ = sample_stream();
  }

  #[test]
  fn parallelism_is_clamped_to_at_least_one() {
    let pool = ConverterWorkerPool::new("id".into(), PathBuf::from("/bin/true"), 0, 10, 10, 1000);
    assert_eq!(pool.parallelism(), 1);
  }
}
