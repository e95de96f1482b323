// SPDX-License-Identifier: BSD-3-Clause

//! Test doubles shared by the unit tests: an identity byte codec and a
//! handler that ignores everything.

use mooring_util::Buffer;

use crate::event::ConnectionEvent;
use crate::handle::Handle;
use crate::handler::EventHandler;
use crate::serializer::{CodecQueues, Serializer};

/// The identity codec: every chunk read becomes one payload, every payload
/// written becomes one wire chunk.
pub(crate) struct IdentityCodec {
  queues: CodecQueues<Vec<u8>>,
}

impl IdentityCodec {
  pub(crate) fn new() -> Self {
    Self { queues: CodecQueues::new() }
  }
}

impl Serializer for IdentityCodec {
  type Payload = Vec<u8>;

  fn serialize(&mut self, payload: &Vec<u8>) {
    self.queues.push_buffer(Buffer::from(payload.clone()));
  }

  fn deserialize(&mut self, chunk: &[u8]) {
    self.queues.push_payload(chunk.to_vec());
  }

  fn pop_payload(&mut self) -> Option<Vec<u8>> {
    self.queues.pop_payload()
  }

  fn pop_buffer(&mut self) -> Option<Buffer> {
    self.queues.pop_buffer()
  }

  fn pop_error(&mut self) -> Option<String> {
    self.queues.pop_error()
  }
}

/// A handler that discards every event.
pub(crate) struct NullHandler;

impl EventHandler for NullHandler {
  type Codec = IdentityCodec;

  fn build_serializer(&self) -> IdentityCodec {
    IdentityCodec::new()
  }

  fn on_read(&self, _handle: Handle<Self>, _payload: Vec<u8>) {}

  fn on_connection_event(&self, _handle: Handle<Self>, _event: ConnectionEvent, _text: Option<&str>) {}
}
