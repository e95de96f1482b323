// SPDX-License-Identifier: BSD-3-Clause

use std::collections::VecDeque;

use mooring_util::Buffer;

/// The codec boundary between raw byte streams and typed payloads.
///
/// A serializer is user-supplied, built once per connection by
/// [`EventHandler::build_serializer`](crate::EventHandler::build_serializer),
/// and exclusively owned by that connection. It is a pure byte↔payload
/// transformer with queued output: it never sees the connection or the
/// manager.
///
/// Both directions report codec failures by pushing a descriptive string onto
/// the error queue; neither direction may panic on malformed input.
///
/// `deserialize` is a streaming state machine: it must consume every byte of
/// the chunk it is given and retain incomplete frames internally across
/// calls. The framework feeds it one freshly-read chunk at a time, so a
/// payload split across arbitrarily many TCP segments reassembles into
/// exactly one queued payload.
///
/// [`CodecQueues`] provides the queue bookkeeping most implementations need.
pub trait Serializer: Send + 'static {
  /// The application-level message type. Opaque to the core.
  type Payload: Send + 'static;

  /// Encodes a payload, pushing the produced wire buffers onto the buffer
  /// queue. On a codec error, pushes a description onto the error queue and
  /// produces no buffers.
  fn serialize(&mut self, payload: &Self::Payload);

  /// Decodes a freshly-read chunk, pushing zero or more completed payloads
  /// and/or errors. Partial frames are retained internally.
  fn deserialize(&mut self, chunk: &[u8]);

  /// Drains one decoded payload, transferring ownership to the caller.
  fn pop_payload(&mut self) -> Option<Self::Payload>;

  /// Drains one encoded wire buffer, transferring ownership to the write
  /// path, which destroys it once drained to the socket.
  fn pop_buffer(&mut self) -> Option<Buffer>;

  /// Drains one error description.
  fn pop_error(&mut self) -> Option<String>;
}

/// The three FIFO queues every serializer maintains: decoded payloads,
/// encoded wire buffers, and error descriptions.
pub struct CodecQueues<P> {
  payloads: VecDeque<P>,
  buffers: VecDeque<Buffer>,
  errors: VecDeque<String>,
}

// ===== impl CodecQueues =====

impl<P> Default for CodecQueues<P> {
  fn default() -> Self {
    Self { payloads: VecDeque::new(), buffers: VecDeque::new(), errors: VecDeque::new() }
  }
}

impl<P> CodecQueues<P> {
  /// Creates empty queues.
  pub fn new() -> Self {
    Self::default()
  }

  /// Queues a completed payload.
  pub fn push_payload(&mut self, payload: P) {
    self.payloads.push_back(payload);
  }

  /// Queues an encoded wire buffer.
  pub fn push_buffer(&mut self, buffer: Buffer) {
    self.buffers.push_back(buffer);
  }

  /// Queues an error description.
  pub fn push_error(&mut self, error: impl Into<String>) {
    self.errors.push_back(error.into());
  }

  pub fn pop_payload(&mut self) -> Option<P> {
    self.payloads.pop_front()
  }

  pub fn pop_buffer(&mut self) -> Option<Buffer> {
    self.buffers.pop_front()
  }

  pub fn pop_error(&mut self) -> Option<String> {
    self.errors.pop_front()
  }
}
