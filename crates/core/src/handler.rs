// SPDX-License-Identifier: BSD-3-Clause

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tracing::error;

use crate::event::{ConnectionEvent, ServerEvent};
use crate::handle::Handle;
use crate::manager::ManagerRef;
use crate::serializer::Serializer;

/// Identifier of a user-requested timer.
pub type TimerId = u64;

/// The payload type carried by a handler's codec.
pub type Payload<H> = <<H as EventHandler>::Codec as Serializer>::Payload;

/// The application-supplied callback surface.
///
/// One handler instance drives a whole manager. Callbacks for a single
/// connection are serialized (they run on that connection's worker loop), but
/// callbacks for different connections run on different worker threads in
/// parallel, so implementations must be `Sync` and treat cross-connection
/// state as racing.
///
/// Callbacks run to completion on their event loop; long-blocking work in a
/// callback stalls every connection sharing that worker. A panicking callback
/// is caught, logged and suppressed; it never tears down the loop.
pub trait EventHandler: Send + Sync + Sized + 'static {
  /// The codec used by this handler's connections.
  type Codec: Serializer;

  /// Builds a fresh serializer. Called once per new connection.
  fn build_serializer(&self) -> Self::Codec;

  /// Called once after the manager's loops are armed, before any connection
  /// exists. The [`ManagerRef`] can be retained for later control calls.
  fn on_start(&self, _manager: &ManagerRef<Self>) {}

  /// Called once after the manager's loops have stopped.
  fn on_stop(&self) {}

  /// A decoded payload arrived. Ownership of the payload transfers to the
  /// callback.
  fn on_read(&self, handle: Handle<Self>, payload: Payload<Self>);

  /// The connection's outbound queue was fully drained to the socket.
  fn on_write(&self, _handle: Handle<Self>) {}

  /// A connection lifecycle event. `text` carries the OS or codec error
  /// description for `DisconnectError` and `SerializationError`.
  fn on_connection_event(&self, handle: Handle<Self>, event: ConnectionEvent, text: Option<&str>);

  /// A manager-level event. `text` carries the reason for `ListenerError`
  /// and `RequestConnectFail`.
  fn on_event(&self, _event: ServerEvent, _text: Option<&str>) {}

  /// The manager tick fired; `elapsed` is the measured time since the
  /// previous tick.
  fn on_tick(&self, _elapsed: Duration) {}

  /// A timer registered with `add_timer` fired.
  fn on_timer(&self, _id: TimerId) {}
}

/// Invokes a user callback, trapping panics so they cannot unwind into an
/// event loop. Returns `None` when the callback panicked.
pub(crate) fn guard<R>(callback: &'static str, f: impl FnOnce() -> R) -> Option<R> {
  match catch_unwind(AssertUnwindSafe(f)) {
    Ok(value) => Some(value),
    Err(_) => {
      error!(callback, "user callback panicked; suppressed");
      None
    }
  }
}
