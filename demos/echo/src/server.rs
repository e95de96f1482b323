// SPDX-License-Identifier: BSD-3-Clause

//! Echoes every line a client sends straight back to it.
//!
//! Run with `cargo run --bin echo-server`, then talk to it with the demo
//! client or `nc localhost 7007`. Ctrl-C shuts it down gracefully.

use std::time::Duration;

use tracing::info;

use mooring_codec_line::LineCodec;
use mooring_core::{Config, ConnectionEvent, EventHandler, Handle, Manager};

struct EchoServer;

impl EventHandler for EchoServer {
  type Codec = LineCodec;

  fn build_serializer(&self) -> LineCodec {
    LineCodec::new()
  }

  fn on_read(&self, handle: Handle<Self>, payload: String) {
    info!(connection = handle.connection_id(), received = %payload, "echoing");
    handle.write(&payload);
  }

  fn on_connection_event(&self, handle: Handle<Self>, event: ConnectionEvent, text: Option<&str>) {
    match event {
      ConnectionEvent::Connect => {
        info!(connection = handle.connection_id(), peer = %handle.ip_address(), "client connected");
      }
      ConnectionEvent::Disconnect => {
        info!(connection = handle.connection_id(), "client disconnected");
      }
      ConnectionEvent::DisconnectError => {
        info!(connection = handle.connection_id(), error = text.unwrap_or(""), "client dropped");
      }
      _ => {}
    }
  }

  fn on_tick(&self, elapsed: Duration) {
    info!(elapsed_ms = elapsed.as_millis() as u64, "tick");
  }
}

fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
    .init();

  let config = Config { request_listener: true, port_number: 7007, ..Config::default() };

  Manager::new(config, EchoServer).run()
}
