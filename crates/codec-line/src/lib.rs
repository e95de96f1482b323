// SPDX-License-Identifier: BSD-3-Clause

//! A newline-delimited UTF-8 codec: one `String` payload per line.
//!
//! Deserialization is streaming: a line split across any number of TCP
//! segments reassembles into exactly one payload. Invalid UTF-8 in a frame
//! and embedded newlines in an outbound payload surface on the error queue
//! instead of producing frames.

use mooring_core::{CodecQueues, Serializer};
use mooring_util::Buffer;

/// Frames `String` payloads as `\n`-terminated lines.
#[derive(Default)]
pub struct LineCodec {
  partial: Vec<u8>,
  queues: CodecQueues<String>,
}

// ===== impl LineCodec =====

impl LineCodec {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Serializer for LineCodec {
  type Payload = String;

  fn serialize(&mut self, payload: &String) {
    if payload.contains('\n') {
      self.queues.push_error("payload contains an embedded newline");
      return;
    }

    let mut bytes = Vec::with_capacity(payload.len() + 1);
    bytes.extend_from_slice(payload.as_bytes());
    bytes.push(b'\n');
    self.queues.push_buffer(Buffer::from(bytes));
  }

  fn deserialize(&mut self, chunk: &[u8]) {
    let mut rest = chunk;
    while let Some(at) = rest.iter().position(|&b| b == b'\n') {
      self.partial.extend_from_slice(&rest[..at]);
      rest = &rest[at + 1..];

      let line = std::mem::take(&mut self.partial);
      match String::from_utf8(line) {
        Ok(payload) => self.queues.push_payload(payload),
        Err(e) => self.queues.push_error(format!("invalid utf-8 in frame: {e}")),
      }
    }
    self.partial.extend_from_slice(rest);
  }

  fn pop_payload(&mut self) -> Option<String> {
    self.queues.pop_payload()
  }

  fn pop_buffer(&mut self) -> Option<Buffer> {
    self.queues.pop_buffer()
  }

  fn pop_error(&mut self) -> Option<String> {
    self.queues.pop_error()
  }
}
