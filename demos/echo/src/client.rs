// SPDX-License-Identifier: BSD-3-Clause

//! Connects to the demo echo server, sends one greeting, prints the echo and
//! shuts down.

use std::sync::OnceLock;

use tracing::info;

use mooring_codec_line::LineCodec;
use mooring_core::{Config, ConnectionEvent, EventHandler, Handle, Manager, ManagerRef, ServerEvent};

struct EchoClient {
  manager: OnceLock<ManagerRef<EchoClient>>,
}

impl EventHandler for EchoClient {
  type Codec = LineCodec;

  fn build_serializer(&self) -> LineCodec {
    LineCodec::new()
  }

  fn on_start(&self, manager: &ManagerRef<Self>) {
    let _ = self.manager.set(manager.clone());
    manager.connect_to("127.0.0.1", 7007, Some(1));
  }

  fn on_connection_event(&self, handle: Handle<Self>, event: ConnectionEvent, text: Option<&str>) {
    match event {
      ConnectionEvent::Connect => {
        info!(connection = handle.connection_id(), "connected; sending greeting");
        handle.write(&"Hello".to_string());
      }
      ConnectionEvent::Disconnect | ConnectionEvent::DisconnectError => {
        info!(error = text.unwrap_or(""), "server went away");
        if let Some(manager) = self.manager.get() {
          manager.shutdown();
        }
      }
      _ => {}
    }
  }

  fn on_read(&self, handle: Handle<Self>, payload: String) {
    info!(connection = handle.connection_id(), reply = %payload, "received echo");
    handle.close();
    if let Some(manager) = self.manager.get() {
      manager.shutdown();
    }
  }

  fn on_event(&self, event: ServerEvent, text: Option<&str>) {
    if event == ServerEvent::RequestConnectFail {
      info!(reason = text.unwrap_or(""), "connect failed");
      if let Some(manager) = self.manager.get() {
        manager.shutdown();
      }
    }
  }
}

fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
    .init();

  let config = Config { request_listener: false, ..Config::default() };

  Manager::new(config, EchoClient { manager: OnceLock::new() }).run()
}
