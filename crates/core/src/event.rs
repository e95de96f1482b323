// SPDX-License-Identifier: BSD-3-Clause

/// Per-connection events delivered through
/// [`EventHandler::on_connection_event`](crate::EventHandler::on_connection_event).
///
/// For a single connection, `Connect` precedes every read and write callback,
/// and a terminal `Disconnect` or `DisconnectError` succeeds them; no I/O
/// callback fires after a terminal event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
  /// The connection was established (inbound accept or outbound connect).
  Connect,

  /// The peer closed the connection, or the connection was closed by a
  /// manager shutdown. Terminal.
  Disconnect,

  /// The connection failed with an I/O error; the event text carries the OS
  /// error description. Terminal.
  DisconnectError,

  /// A configured read or write timeout elapsed. The connection stays open.
  Timeout,

  /// The connection's serializer reported a codec error; the event text
  /// carries the serializer's description. Non-fatal unless the handler
  /// closes the connection.
  SerializationError,
}

/// Manager-level events delivered through
/// [`EventHandler::on_event`](crate::EventHandler::on_event).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ServerEvent {
  /// A graceful shutdown was requested.
  Shutdown,

  /// The listener failed to accept a connection; the core keeps running.
  ListenerError,

  /// An outbound connect request failed; the event text carries the reason.
  /// The request is discarded.
  RequestConnectFail,
}
