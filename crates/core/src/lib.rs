// SPDX-License-Identifier: BSD-3-Clause

pub mod config;
pub mod connection;
pub mod event;
pub mod handle;
pub mod handler;
pub mod manager;
pub mod serializer;

mod sync;
#[cfg(test)]
mod testutil;
mod worker;

pub use config::{Config, ConfigError};
pub use connection::{Connection, ConnectionId, UniqueId};
pub use event::{ConnectionEvent, ServerEvent};
pub use handle::Handle;
pub use handler::{EventHandler, Payload, TimerId};
pub use manager::{Manager, ManagerRef, ManagerState};
pub use serializer::{CodecQueues, Serializer};

pub use mooring_util::Buffer;
