//! Splitting payloads into bounded frames and putting them back together.

use std::collections::HashMap;
use std::hash::Hash;

use bytes::{Bytes, BytesMut};

/// Frame size used for every chunked transfer between master and worker.
pub const CHUNK_SIZE: usize = 1024;

/// One slice of a larger payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<'a> {
  pub data: &'a [u8],
  pub is_last: bool,
}

/// Split `payload` into frames of at most `size` bytes.
///
/// Exactly one frame carries `is_last`; an empty payload still yields one
/// empty final frame. A `size` of zero is treated as one.
pub fn chunks(payload: &[u8], size: usize) -> Chunks<'_> {
  Chunks {
    payload,
    size: size.max(1),
    offset: 0,
    done: false,
  }
}

pub struct Chunks<'a> {
  payload: &'a [u8],
  size: usize,
  offset: usize,
  done: bool,
}

impl<'a> Iterator for Chunks<'a> {
  type Item = Chunk<'a>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    let end = (self.offset + self.size).min(self.payload.len());
    let data = &self.payload[self.offset..end];
    self.offset = end;
    let is_last = end == self.payload.len();
    self.done = is_last;
    Some(Chunk { data, is_last })
  }
}

/// Accumulates interleaved chunked transfers keyed by a correlation id.
///
/// An entry lives only until its final chunk arrives.
#[derive(Debug)]
pub struct Reassembler<K> {
  buffers: HashMap<K, BytesMut>,
}

impl<K: Hash + Eq> Reassembler<K> {
  pub fn new() -> Self {
    Self {
      buffers: HashMap::new(),
    }
  }

  /// Append a chunk. Returns the full payload once `is_last` is seen.
  pub fn push(&mut self, key: K, data: &[u8], is_last: bool) -> Option<Bytes> {
    if is_last {
      let mut buffer = self.buffers.remove(&key).unwrap_or_default();
      buffer.extend_from_slice(data);
      return Some(buffer.freeze());
    }
    self.buffers.entry(key).or_default().extend_from_slice(data);
    None
  }

  /// Transfers still waiting for their final chunk.
  pub fn pending(&self) -> usize {
    self.buffers.len()
  }

  pub fn discard(&mut self, key: &K) {
    self.buffers.remove(key);
  }
}

impl<K: Hash + Eq> Default for Reassembler<K> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn reassemble(payload: &[u8], size: usize) -> (Vec<u8>, usize) {
    let mut reassembler = Reassembler::new();
    let mut last_flags = 0;
    let mut result = None;
    for chunk in chunks(payload, size) {
      if chunk.is_last {
        last_flags += 1;
      }
      assert!(chunk.data.len() <= size.max(1));
      if let Some(bytes) = reassembler.push("k", chunk.data, chunk.is_last) {
        result = Some(bytes.to_vec());
      }
    }
    assert_eq!(reassembler.pending(), 0);
    (result.unwrap(), last_flags)
  }

  #[test]
  fn test_round_trip_various_sizes() {
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    for size in [1, 7, 1024, 4999, 5000, 5001, 65536] {
      let (out, last_flags) = reassemble(&payload, size);
      assert_eq!(out, payload, "size {size}");
      assert_eq!(last_flags, 1, "size {size}");
    }
  }

  #[test]
  fn test_empty_payload_emits_one_empty_final_frame() {
    let frames: Vec<_> = chunks(&[], CHUNK_SIZE).collect();
    assert_eq!(
      frames,
      vec![Chunk {
        data: &[],
        is_last: true
      }]
    );
  }

  #[test]
  fn test_exact_multiple_has_no_trailing_empty_frame() {
    let payload = vec![1u8; 2048];
    let frames: Vec<_> = chunks(&payload, 1024).collect();
    assert_eq!(frames.len(), 2);
    assert!(frames[1].is_last);
  }

  #[test]
  fn test_interleaved_transfers() {
    let mut reassembler = Reassembler::new();
    assert!(reassembler.push(1, b"he", false).is_none());
    assert!(reassembler.push(2, b"wo", false).is_none());
    assert!(reassembler.push(1, b"ll", false).is_none());
    assert_eq!(reassembler.pending(), 2);
    assert_eq!(&reassembler.push(2, b"rld", true).unwrap()[..], b"world");
    assert_eq!(&reassembler.push(1, b"o", true).unwrap()[..], b"hello");
    assert_eq!(reassembler.pending(), 0);
  }
}
