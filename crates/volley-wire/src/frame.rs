//! Frames carried on one master/worker connection.
//!
//! Every call gets a `call_id` chosen by the dialing side. A call opens with
//! [`FrameKind::Open`], exchanges [`FrameKind::Message`] payloads in both
//! directions, and is finished by the serving side with [`FrameKind::End`].
//! The dialing side signals the end of its own messages with
//! [`FrameKind::HalfClose`] and abandons a call with [`FrameKind::Cancel`].

use std::io;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::message::Method;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
  pub call_id: u64,
  pub kind: FrameKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
  Open(Method),
  Message(Vec<u8>),
  HalfClose,
  /// Terminal frame; carries the remote error message on failure.
  End(Option<String>),
  Cancel,
}

/// Length-delimited framing with bincode bodies.
pub struct FrameCodec {
  codec: LengthDelimitedCodec,
}

impl FrameCodec {
  pub fn new() -> Self {
    Self {
      codec: LengthDelimitedCodec::new(),
    }
  }
}

impl Default for FrameCodec {
  fn default() -> Self {
    Self::new()
  }
}

impl Encoder<Frame> for FrameCodec {
  type Error = io::Error;

  fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
    let bytes = bincode::serialize(&item).map_err(io::Error::other)?;
    self.codec.encode(Bytes::from(bytes), dst)
  }
}

impl Decoder for FrameCodec {
  type Item = Frame;
  type Error = io::Error;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    match self.codec.decode(src)? {
      Some(bytes) => bincode::deserialize(&bytes)
        .map(Some)
        .map_err(io::Error::other),
      None => Ok(None),
    }
  }
}
