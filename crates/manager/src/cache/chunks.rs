//! Packet <-> chunk-list conversion shared by the converter cache (§4.5) and
//! the filter index (§6), whose record bodies share this exact layout.

use streamcore::{Direction, Packet};

use super::varint::{read_varint, write_varint};

pub struct EncodedChunks {
  pub chunk_sizes: Vec<u8>,
  pub client_bytes: Vec<u8>,
  pub server_bytes: Vec<u8>,
}

/// Merges adjacent same-direction packets, then serializes the alternating,
/// zero-skip-terminated chunk-size varint list described in §4.5.
pub fn encode(packets: &[Packet]) -> EncodedChunks {
  let merged = merge_adjacent(packets);

  let mut chunk_sizes = Vec::new();
  let mut client_bytes = Vec::new();
  let mut server_bytes = Vec::new();

  let mut next_slot = Direction::ClientToServer;
  for (direction, data) in &merged {
    while *direction != next_slot {
      write_varint(&mut chunk_sizes, 0);
      next_slot = next_slot.toggle();
    }
    write_varint(&mut chunk_sizes, data.len() as u64);
    next_slot = next_slot.toggle();
    match direction {
      Direction::ClientToServer => client_bytes.extend_from_slice(data),
      Direction::ServerToClient => server_bytes.extend_from_slice(data),
    }
  }
  // Two consecutive zeros terminate the list.
  write_varint(&mut chunk_sizes, 0);
  write_varint(&mut chunk_sizes, 0);

  EncodedChunks { chunk_sizes, client_bytes, server_bytes }
}

fn merge_adjacent(packets: &[Packet]) -> Vec<(Direction, Vec<u8>)> {
  let mut merged: Vec<(Direction, Vec<u8>)> = Vec::new();
  for packet in packets {
    match merged.last_mut() {
      Some((dir, data)) if *dir == packet.direction => data.extend_from_slice(&packet.data),
      _ => merged.push((packet.direction, packet.data.clone())),
    }
  }
  merged
}

/// Cumulative (client_offset, server_offset) after each chunk, with a
/// leading `(0, 0)` entry — this is the shape `DataForSearch` returns (S1).
pub struct Decoded {
  pub packets: Vec<Packet>,
  pub client_bytes: Vec<u8>,
  pub server_bytes: Vec<u8>,
  pub offsets: Vec<(usize, usize)>,
}

/// Parses just the chunk-size varint list starting at `buf[*pos]`, advancing
/// `pos` past the two-zero terminator. Returns the per-chunk
/// `(direction, size)` sequence without touching any data bytes — this is
/// what a sequential file scan needs before it knows how many client/server
/// bytes follow.
pub fn parse_directions(buf: &[u8], pos: &mut usize) -> Option<Vec<(Direction, usize)>> {
  let mut directions = Vec::new();
  let mut next_slot = Direction::ClientToServer;
  let mut prev_zero = false;
  loop {
    let size = read_varint(buf, pos)?;
    if size == 0 {
      if prev_zero {
        break;
      }
      prev_zero = true;
      next_slot = next_slot.toggle();
      continue;
    }
    prev_zero = false;
    directions.push((next_slot, size as usize));
    next_slot = next_slot.toggle();
  }
  Some(directions)
}

pub fn total_lengths(directions: &[(Direction, usize)]) -> (usize, usize) {
  let client = directions.iter().filter(|(d, _)| *d == Direction::ClientToServer).map(|(_, s)| s).sum();
  let server = directions.iter().filter(|(d, _)| *d == Direction::ServerToClient).map(|(_, s)| s).sum();
  (client, server)
}

/// Splits `client_bytes`/`server_bytes` back into packets using an
/// already-parsed direction/size sequence.
pub fn assemble(directions: Vec<(Direction, usize)>, client_bytes: Vec<u8>, server_bytes: Vec<u8>) -> Option<Decoded> {
  let mut packets = Vec::with_capacity(directions.len());
  let mut client_cursor = 0usize;
  let mut server_cursor = 0usize;
  let mut offsets = vec![(0usize, 0usize)];

  for (direction, size) in directions {
    let data = match direction {
      Direction::ClientToServer => {
        let slice = client_bytes.get(client_cursor..client_cursor + size)?;
        client_cursor += size;
        slice.to_vec()
      }
      Direction::ServerToClient => {
        let slice = server_bytes.get(server_cursor..server_cursor + size)?;
        server_cursor += size;
        slice.to_vec()
      }
    };
    packets.push(Packet::new(direction, data));
    offsets.push((client_cursor, server_cursor));
  }

  Some(Decoded { packets, client_bytes, server_bytes, offsets })
}

/// Convenience entry point combining [`parse_directions`] and [`assemble`]
/// for callers (tests, in-memory search) that already have both byte blocks.
pub fn decode(buf: &[u8], pos: &mut usize, client_bytes: Vec<u8>, server_bytes: Vec<u8>) -> Option<Decoded> {
  let directions = parse_directions(buf, pos)?;
  assemble(directions, client_bytes, server_bytes)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn s1_round_trip_cache_example() {
    let packets = vec![
      Packet::new(Direction::ClientToServer, b"ab".to_vec()),
      Packet::new(Direction::ServerToClient, b"zz".to_vec()),
      Packet::new(Direction::ClientToServer, b"cd".to_vec()),
    ];
    let encoded = encode(&packets);
    assert_eq!(encoded.client_bytes, b"abcd");
    assert_eq!(encoded.server_bytes, b"zz");

    let mut pos = 0;
    let decoded = decode(&encoded.chunk_sizes, &mut pos, encoded.client_bytes.clone(), encoded.server_bytes.clone())
      .unwrap();
    assert_eq!(pos, encoded.chunk_sizes.len());
    assert_eq!(decoded.packets, packets);
    assert_eq!(decoded.offsets, vec![(0, 0), (2, 0), (2, 2), (4, 2)]);
  }

  #[test]
  fn merges_adjacent_same_direction_packets() {
    let packets = vec![
      Packet::new(Direction::ClientToServer, b"a".to_vec()),
      Packet::new(Direction::ClientToServer, b"b".to_vec()),
      Packet::new(Direction::ServerToClient, b"c".to_vec()),
    ];
    let encoded = encode(&packets);
    assert_eq!(encoded.client_bytes, b"ab");

    let mut pos = 0;
    let decoded = decode(&encoded.chunk_sizes, &mut pos, encoded.client_bytes.clone(), encoded.server_bytes.clone())
      .unwrap();
    assert_eq!(decoded.packets.len(), 2);
    assert_eq!(decoded.packets[0].data, b"ab");
  }

  #[test]
  fn leading_server_chunk_needs_a_skip_zero() {
    let packets = vec![Packet::new(Direction::ServerToClient, b"zz".to_vec())];
    let encoded = encode(&packets);
    let mut pos = 0;
    let decoded = decode(&encoded.chunk_sizes, &mut pos, encoded.client_bytes.clone(), encoded.server_bytes.clone())
      .unwrap();
    assert_eq!(decoded.packets, packets);
  }

  #[test]
  fn empty_packet_list_round_trips() {
    let encoded = encode(&[]);
    let mut pos = 0;
    let decoded = decode(&encoded.chunk_sizes, &mut pos, vec![], vec![]).unwrap();
    assert!(decoded.packets.is_empty());
    assert_eq!(decoded.offsets, vec![(0, 0)]);
  }
}
