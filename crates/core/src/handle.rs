// SPDX-License-Identifier: BSD-3-Clause

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::connection::{Connection, ConnectionId, UniqueId};
use crate::handler::{EventHandler, Payload};

/// A shared, cloneable, thread-safe, non-owning reference to a
/// [`Connection`].
///
/// Handles are what callbacks receive and what applications retain for later
/// writes. A handle never keeps its connection alive: the manager's map owns
/// the connection, and each handle method upgrades a weak reference for the
/// duration of the call. That upgrade is the liveness barrier: the
/// connection cannot be destroyed while a method is mid-call.
///
/// Once the connection has been destroyed the handle is *expired*: operations
/// become no-ops and accessors return sentinel values (zero id, empty
/// address, zero durations) without faulting.
pub struct Handle<H: EventHandler> {
  connection: Weak<Connection<H>>,
}

// ===== impl Handle =====

impl<H: EventHandler> Clone for Handle<H> {
  fn clone(&self) -> Self {
    Self { connection: self.connection.clone() }
  }
}

impl<H: EventHandler> Handle<H> {
  pub(crate) fn new(connection: Weak<Connection<H>>) -> Self {
    Self { connection }
  }

  /// Creates a handle that is expired from birth; returned when no live
  /// connection can back the handle.
  pub(crate) fn expired() -> Self {
    Self { connection: Weak::new() }
  }

  fn upgrade(&self) -> Option<Arc<Connection<H>>> {
    self.connection.upgrade()
  }

  /// `true` while the connection exists and has not started closing.
  pub fn is_open(&self) -> bool {
    self.upgrade().map(|c| c.is_open()).unwrap_or(false)
  }

  /// `true` once the connection has been destroyed.
  pub fn is_expired(&self) -> bool {
    self.connection.strong_count() == 0
  }

  /// Serializes and queues a payload for transmission. Returns promptly
  /// regardless of socket readiness; a no-op on a closed or expired handle.
  pub fn write(&self, payload: &Payload<H>) {
    if let Some(connection) = self.upgrade() {
      connection.write(payload);
    }
  }

  /// Requests the connection be closed. Idempotent; a no-op when expired.
  pub fn close(&self) {
    if let Some(connection) = self.upgrade() {
      connection.close();
    }
  }

  /// The connection identifier, or zero when expired.
  pub fn connection_id(&self) -> ConnectionId {
    self.upgrade().map(|c| c.id()).unwrap_or(0)
  }

  /// The user-supplied identifier from the originating connect request, or
  /// `None` when absent or expired.
  pub fn unique_id(&self) -> Option<UniqueId> {
    self.upgrade().and_then(|c| c.unique_id())
  }

  /// The peer address as text, or an empty string when expired.
  pub fn ip_address(&self) -> String {
    self.upgrade().map(|c| c.peer_addr().to_string()).unwrap_or_default()
  }

  /// Time since the connection was created, or zero when expired.
  pub fn uptime(&self) -> Duration {
    self.upgrade().map(|c| c.uptime()).unwrap_or(Duration::ZERO)
  }

  /// Time since the connection last completed a read or write, or zero when
  /// expired.
  pub fn idle_time(&self) -> Duration {
    self.upgrade().map(|c| c.idle_time()).unwrap_or(Duration::ZERO)
  }

  /// The number of handles currently observing the connection, or zero when
  /// expired.
  pub fn handle_count(&self) -> usize {
    // The connection keeps one weak self-reference for fabricating handles;
    // every other weak is a handle.
    self.upgrade().map(|c| Arc::weak_count(&c).saturating_sub(1)).unwrap_or(0)
  }
}

impl<H: EventHandler> std::fmt::Debug for Handle<H> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Handle")
      .field("connection_id", &self.connection_id())
      .field("expired", &self.is_expired())
      .finish()
  }
}
