//! Filter cache file `filterindex-<name>.fidx` (§6).
//!
//! ```text
//! record := [u64 StreamID little-endian] [u64 DataSize little-endian]
//!           [varint chunk sizes ... terminated by 0 0]
//!           [client-direction bytes] [server-direction bytes]
//! ```
//!
//! `DataSize` covers everything after the 16-byte header (chunk-size bytes +
//! data bytes), so a sequential scan can skip a record without parsing its
//! chunk list. `StreamID = 0xFFFFFFFFFFFFFFFF` marks a tombstoned record and
//! is skipped on load.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use streamcore::{Packet, StreamId};
use tokio::sync::RwLock;

use super::chunks;

pub const INVALID_STREAM_ID: StreamId = u64::MAX;
const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Location {
  offset: u64,
  len: u64,
}

struct Inner {
  file: std::fs::File,
  index: HashMap<StreamId, Location>,
  file_len: u64,
}

pub struct FilterIndex {
  inner: RwLock<Inner>,
}

impl FilterIndex {
  pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let mut file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
    let file_len = file.metadata()?.len();

    let mut buf = Vec::with_capacity(file_len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut buf)?;

    let mut index = HashMap::new();
    let mut pos = 0usize;
    while pos < buf.len() {
      let record_start = pos;
      if buf.len() - pos < HEADER_LEN {
        break;
      }
      let id = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
      let data_size = u64::from_le_bytes(buf[pos + 8..pos + 16].try_into().unwrap());
      let record_len = HEADER_LEN as u64 + data_size;
      if (buf.len() as u64) < record_start as u64 + record_len {
        break;
      }
      pos = record_start + record_len as usize;
      if id != INVALID_STREAM_ID {
        index.insert(id, Location { offset: record_start as u64, len: record_len });
      }
    }

    Ok(Self { inner: RwLock::new(Inner { file, index, file_len }) })
  }

  pub async fn contains(&self, id: StreamId) -> bool {
    self.inner.read().await.index.contains_key(&id)
  }

  pub async fn data(&self, id: StreamId) -> std::io::Result<Option<Vec<Packet>>> {
    let inner = self.inner.read().await;
    let Some(loc) = inner.index.get(&id).copied() else { return Ok(None) };
    let mut buf = vec![0u8; loc.len as usize];
    let mut file = inner.file.try_clone()?;
    file.seek(SeekFrom::Start(loc.offset))?;
    file.read_exact(&mut buf)?;

    let mut pos = HEADER_LEN;
    let directions = chunks::parse_directions(&buf, &mut pos).expect("validated at load time");
    let (client_len, server_len) = chunks::total_lengths(&directions);
    let client_bytes = buf[pos..pos + client_len].to_vec();
    let server_bytes = buf[pos + client_len..pos + client_len + server_len].to_vec();
    Ok(chunks::assemble(directions, client_bytes, server_bytes).map(|d| d.packets))
  }

  pub async fn set_data(&self, id: StreamId, packets: &[Packet]) -> std::io::Result<()> {
    let mut inner = self.inner.write().await;
    let encoded = chunks::encode(packets);
    let body_len = encoded.chunk_sizes.len() + encoded.client_bytes.len() + encoded.server_bytes.len();

    let mut record = Vec::with_capacity(HEADER_LEN + body_len);
    record.extend_from_slice(&id.to_le_bytes());
    record.extend_from_slice(&(body_len as u64).to_le_bytes());
    record.extend_from_slice(&encoded.chunk_sizes);
    record.extend_from_slice(&encoded.client_bytes);
    record.extend_from_slice(&encoded.server_bytes);

    let offset = inner.file_len;
    inner.file.seek(SeekFrom::Start(offset))?;
    inner.file.write_all(&record)?;
    inner.file.flush()?;
    inner.file_len += record.len() as u64;
    inner.index.insert(id, Location { offset, len: record.len() as u64 });
    Ok(())
  }

  /// Stubbed per §9 open question: the original's `InvalidateStream` has no
  /// defined re-filtering semantics. This marks the in-memory entry gone
  /// (so `contains` reports false and the stream is re-enqueued) without
  /// writing a tombstone record; a future implementation that decides the
  /// re-filter semantics can fill in the on-disk tombstone write here.
  pub async fn invalidate_stream(&self, id: StreamId) {
    self.inner.write().await.index.remove(&id);
  }
}

impl std::fmt::Debug for FilterIndex {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FilterIndex").finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use streamcore::Direction;

  #[tokio::test]
  async fn round_trips_and_skips_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let idx = FilterIndex::open(dir.path().join("x.fidx")).unwrap();

    let pkts = vec![Packet::new(Direction::ClientToServer, b"hello".to_vec())];
    idx.set_data(7, &pkts).await.unwrap();
    assert!(idx.contains(7).await);
    assert!(!idx.contains(8).await);
    assert_eq!(idx.data(7).await.unwrap().unwrap(), pkts);
  }

  #[tokio::test]
  async fn survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x.fidx");
    {
      let idx = FilterIndex::open(&path).unwrap();
      idx.set_data(1, &[Packet::new(Direction::ServerToClient, b"abc".to_vec())]).await.unwrap();
    }
    let reopened = FilterIndex::open(&path).unwrap();
    assert!(reopened.contains(1).await);
  }

  #[tokio::test]
  async fn invalidate_removes_from_index() {
    let dir = tempfile::tempdir().unwrap();
    let idx = FilterIndex::open(dir.path().join("x.fidx")).unwrap();
    idx.set_data(1, &[Packet::new(Direction::ClientToServer, b"x".to_vec())]).await.unwrap();
    idx.invalidate_stream(1).await;
    assert!(!idx.contains(1).await);
  }
}
