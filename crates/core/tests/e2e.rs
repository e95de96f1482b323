// SPDX-License-Identifier: BSD-3-Clause

//! End-to-end scenarios: a manager running on its own thread, exercised with
//! plain blocking sockets and a second framework instance.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use mooring_codec_line::LineCodec;
use mooring_core::{
  Config, ConnectionEvent, ConnectionId, EventHandler, Handle, Manager, ManagerRef, ManagerState, ServerEvent, TimerId,
};

#[derive(Debug)]
enum Ev {
  Start,
  Stop,
  Connect(Handle<TestHandler>),
  BurstDone(Duration),
  Conn(ConnectionEvent, ConnectionId, Option<String>),
  Read(ConnectionId, String),
  Write(ConnectionId),
  Server(ServerEvent, Option<String>),
  Tick(Duration),
  Timer(TimerId),
}

struct TestHandler {
  events: Mutex<Sender<Ev>>,
  echo: bool,
  write_on_connect: Vec<String>,
}

impl TestHandler {
  fn emit(&self, ev: Ev) {
    let _ = self.events.lock().unwrap().send(ev);
  }
}

impl EventHandler for TestHandler {
  type Codec = LineCodec;

  fn build_serializer(&self) -> LineCodec {
    LineCodec::new()
  }

  fn on_start(&self, _manager: &ManagerRef<Self>) {
    self.emit(Ev::Start);
  }

  fn on_stop(&self) {
    self.emit(Ev::Stop);
  }

  fn on_read(&self, handle: Handle<Self>, payload: String) {
    self.emit(Ev::Read(handle.connection_id(), payload.clone()));
    if self.echo {
      handle.write(&payload);
    }
  }

  fn on_write(&self, handle: Handle<Self>) {
    self.emit(Ev::Write(handle.connection_id()));
  }

  fn on_connection_event(&self, handle: Handle<Self>, event: ConnectionEvent, text: Option<&str>) {
    if event == ConnectionEvent::Connect {
      if !self.write_on_connect.is_empty() {
        let started = Instant::now();
        for payload in &self.write_on_connect {
          handle.write(payload);
        }
        self.emit(Ev::BurstDone(started.elapsed()));
      }
      self.emit(Ev::Connect(handle));
    } else {
      self.emit(Ev::Conn(event, handle.connection_id(), text.map(str::to_owned)));
    }
  }

  fn on_event(&self, event: ServerEvent, text: Option<&str>) {
    self.emit(Ev::Server(event, text.map(str::to_owned)));
  }

  fn on_tick(&self, elapsed: Duration) {
    self.emit(Ev::Tick(elapsed));
  }

  fn on_timer(&self, id: TimerId) {
    self.emit(Ev::Timer(id));
  }
}

fn test_handler() -> (TestHandler, Receiver<Ev>) {
  let (tx, rx) = channel();
  (TestHandler { events: Mutex::new(tx), echo: false, write_on_connect: Vec::new() }, rx)
}

fn test_config() -> Config {
  Config {
    port_number: 0,
    num_threads: 1,
    read_timeout: Duration::ZERO,
    write_timeout: Duration::ZERO,
    death_time: Duration::from_secs(5),
    request_listener: true,
    request_signal_handler: false,
    ..Config::default()
  }
}

/// Runs a manager on its own thread and waits until it is accepting work.
fn spawn_manager(
  config: Config,
  handler: TestHandler,
) -> (ManagerRef<TestHandler>, thread::JoinHandle<anyhow::Result<()>>) {
  let mut manager = Manager::new(config, handler);
  let control = manager.handle();
  let join = thread::spawn(move || manager.run());

  let deadline = Instant::now() + Duration::from_secs(5);
  while control.state() < ManagerState::Running {
    assert!(Instant::now() < deadline, "manager did not reach Running");
    thread::sleep(Duration::from_millis(5));
  }
  (control, join)
}

fn wait_for(rx: &Receiver<Ev>, timeout: Duration, pred: impl Fn(&Ev) -> bool) -> Ev {
  let deadline = Instant::now() + timeout;
  loop {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(remaining) {
      Ok(ev) if pred(&ev) => return ev,
      Ok(_) => continue,
      Err(_) => panic!("timed out waiting for event"),
    }
  }
}

/// Collects events, in order, up to and including the first one matching the
/// predicate.
fn collect_until(rx: &Receiver<Ev>, timeout: Duration, pred: impl Fn(&Ev) -> bool) -> Vec<Ev> {
  let deadline = Instant::now() + timeout;
  let mut events = Vec::new();
  loop {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(remaining) {
      Ok(ev) => {
        let done = pred(&ev);
        events.push(ev);
        if done {
          return events;
        }
      }
      Err(_) => panic!("timed out collecting events"),
    }
  }
}

fn connect_client(control: &ManagerRef<TestHandler>) -> TcpStream {
  let stream = TcpStream::connect(("127.0.0.1", control.port_number())).unwrap();
  stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
  stream
}

fn read_line(stream: &mut TcpStream) -> String {
  let mut line = Vec::new();
  let mut byte = [0u8; 1];
  loop {
    let n = stream.read(&mut byte).unwrap();
    assert!(n > 0, "peer closed before a full line arrived");
    if byte[0] == b'\n' {
      return String::from_utf8(line).unwrap();
    }
    line.push(byte[0]);
  }
}

fn shut_down(control: ManagerRef<TestHandler>, join: thread::JoinHandle<anyhow::Result<()>>) {
  control.shutdown();
  join.join().unwrap().unwrap();
  assert_eq!(control.state(), ManagerState::Stopped);
}

#[test]
fn test_echo_single_client() {
  let (mut handler, rx) = test_handler();
  handler.echo = true;
  let (control, join) = spawn_manager(test_config(), handler);

  let mut client = connect_client(&control);
  client.write_all(b"Hello\n").unwrap();

  assert_eq!(read_line(&mut client), "Hello");

  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Connect(_)));
  let read = wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Read(_, _)));
  match read {
    Ev::Read(id, payload) => {
      assert_ne!(id, 0);
      assert_eq!(payload, "Hello");
    }
    _ => unreachable!(),
  }

  shut_down(control, join);
}

#[test]
fn test_connect_precedes_reads_and_disconnect_is_last() {
  let (mut handler, rx) = test_handler();
  handler.echo = true;
  let (control, join) = spawn_manager(test_config(), handler);

  let mut client = connect_client(&control);
  client.write_all(b"one\n").unwrap();
  assert_eq!(read_line(&mut client), "one");
  drop(client);

  let events =
    collect_until(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Conn(ConnectionEvent::Disconnect, _, _)));

  // Replay this connection's event history and check the ordering contract.
  let mut saw_connect = false;
  let mut saw_read = false;
  let mut saw_disconnect = false;
  for ev in events {
    match ev {
      Ev::Connect(_) => {
        assert!(!saw_read && !saw_disconnect);
        saw_connect = true;
      }
      Ev::Read(_, _) => {
        assert!(saw_connect && !saw_disconnect, "read outside the Connect..Disconnect window");
        saw_read = true;
      }
      Ev::Write(_) => {
        assert!(saw_connect && !saw_disconnect, "write outside the Connect..Disconnect window");
      }
      Ev::Conn(ConnectionEvent::Disconnect, _, _) => saw_disconnect = true,
      _ => {}
    }
  }
  assert!(saw_connect && saw_read && saw_disconnect);

  shut_down(control, join);
}

#[test]
fn test_graceful_shutdown_closes_idle_connections() {
  let (handler, rx) = test_handler();
  let (control, join) = spawn_manager(test_config(), handler);

  let mut client = connect_client(&control);
  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Connect(_)));

  control.shutdown();

  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Server(ServerEvent::Shutdown, _)));
  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Conn(ConnectionEvent::Disconnect, _, _)));

  // The client observes EOF.
  let mut buf = [0u8; 16];
  assert_eq!(client.read(&mut buf).unwrap(), 0);

  join.join().unwrap().unwrap();
  assert_eq!(control.state(), ManagerState::Stopped);
  assert_eq!(control.num_connections(), 0);
  wait_for(&rx, Duration::from_secs(1), |ev| matches!(ev, Ev::Stop));
}

#[test]
fn test_abort_returns_promptly() {
  let (handler, rx) = test_handler();
  let (control, join) = spawn_manager(test_config(), handler);

  let _client = connect_client(&control);
  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Connect(_)));

  let started = Instant::now();
  control.abort();
  join.join().unwrap().unwrap();

  assert!(started.elapsed() < Duration::from_secs(3), "abort took too long");
  assert_eq!(control.state(), ManagerState::Stopped);
}

#[test]
fn test_death_timer_aborts_a_stalled_shutdown() {
  let (handler, rx) = test_handler();
  let config = Config {
    connection_close_on_shutdown: false,
    death_time: Duration::from_secs(1),
    ..test_config()
  };
  let (control, join) = spawn_manager(config, handler);

  // This client never goes away, so the drain can never finish on its own.
  let _client = connect_client(&control);
  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Connect(_)));

  let started = Instant::now();
  control.shutdown();
  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Server(ServerEvent::Shutdown, _)));

  join.join().unwrap().unwrap();
  let elapsed = started.elapsed();
  assert!(elapsed >= Duration::from_millis(900), "run returned before the grace period: {elapsed:?}");
  assert!(elapsed < Duration::from_secs(4), "death timer never fired: {elapsed:?}");
  assert_eq!(control.state(), ManagerState::Stopped);
}

#[test]
fn test_connect_failure_surfaces_without_connect_event() {
  let (handler, rx) = test_handler();
  let config = Config { request_listener: false, ..test_config() };
  let (control, join) = spawn_manager(config, handler);

  let pending = control.connect_to("no.such.host.invalid", 1, None);
  assert!(pending.is_expired());

  let failed = wait_for(&rx, Duration::from_secs(10), |ev| matches!(ev, Ev::Server(ServerEvent::RequestConnectFail, _)));
  match failed {
    Ev::Server(_, text) => assert!(text.unwrap().contains("no.such.host.invalid")),
    _ => unreachable!(),
  }

  // Nothing ever connected.
  while let Ok(ev) = rx.try_recv() {
    assert!(!matches!(ev, Ev::Connect(_)));
  }

  shut_down(control, join);
}

#[test]
fn test_fragmented_payload_reassembles_into_one_read() {
  let (handler, rx) = test_handler();
  let (control, join) = spawn_manager(test_config(), handler);

  let mut client = connect_client(&control);
  let payload = "a".repeat(10_000);
  let wire = format!("{payload}\n");
  for segment in wire.as_bytes().chunks(100) {
    client.write_all(segment).unwrap();
    client.flush().unwrap();
  }
  drop(client);

  let events =
    collect_until(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Conn(ConnectionEvent::Disconnect, _, _)));

  let mut reads = Vec::new();
  for ev in events {
    if let Ev::Read(_, payload) = ev {
      reads.push(payload);
    }
  }
  assert_eq!(reads.len(), 1, "expected exactly one reassembled payload");
  assert_eq!(reads[0].len(), 10_000);
  assert_eq!(reads[0], payload);

  shut_down(control, join);
}

#[test]
fn test_outbound_connect_reconciles_unique_id() {
  let (mut server_handler, _server_rx) = test_handler();
  server_handler.echo = true;
  let (server_control, server_join) = spawn_manager(test_config(), server_handler);
  let port = server_control.port_number();

  let (mut client_handler, client_rx) = test_handler();
  client_handler.write_on_connect = vec![String::from("ping")];
  let client_config = Config { request_listener: false, ..test_config() };
  let (client_control, client_join) = spawn_manager(client_config, client_handler);

  client_control.connect_to("127.0.0.1", port, Some(42));

  let connected = wait_for(&client_rx, Duration::from_secs(10), |ev| matches!(ev, Ev::Connect(_)));
  match connected {
    Ev::Connect(handle) => {
      assert_eq!(handle.unique_id(), Some(42));
      assert!(handle.is_open());
    }
    _ => unreachable!(),
  }

  // The greeting went out through the framework and came back echoed.
  let echoed = wait_for(&client_rx, Duration::from_secs(10), |ev| matches!(ev, Ev::Read(_, _)));
  match echoed {
    Ev::Read(_, payload) => assert_eq!(payload, "ping"),
    _ => unreachable!(),
  }

  shut_down(client_control, client_join);
  shut_down(server_control, server_join);
}

#[test]
fn test_connection_ids_are_unique() {
  let (handler, rx) = test_handler();
  let (control, join) = spawn_manager(test_config(), handler);

  let _first = connect_client(&control);
  let _second = connect_client(&control);

  let a = wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Connect(_)));
  let b = wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Connect(_)));
  match (a, b) {
    (Ev::Connect(a), Ev::Connect(b)) => {
      assert_ne!(a.connection_id(), 0);
      assert_ne!(b.connection_id(), 0);
      assert_ne!(a.connection_id(), b.connection_id());
    }
    _ => unreachable!(),
  }

  shut_down(control, join);
}

#[test]
fn test_handle_expires_after_destruction() {
  let (handler, rx) = test_handler();
  let (control, join) = spawn_manager(test_config(), handler);

  let client = connect_client(&control);
  let connected = wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Connect(_)));
  let handle = match connected {
    Ev::Connect(handle) => handle,
    _ => unreachable!(),
  };

  assert!(handle.is_open());
  assert_ne!(handle.connection_id(), 0);
  assert!(!handle.ip_address().is_empty());
  assert_eq!(handle.handle_count(), 1);

  drop(client);
  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Conn(ConnectionEvent::Disconnect, _, _)));

  // The map entry is removed right after the terminal event; once the last
  // strong reference drops the handle expires.
  let deadline = Instant::now() + Duration::from_secs(5);
  while !handle.is_expired() {
    assert!(Instant::now() < deadline, "handle never expired");
    thread::sleep(Duration::from_millis(5));
  }

  assert_eq!(handle.connection_id(), 0);
  assert_eq!(handle.ip_address(), "");
  assert_eq!(handle.uptime(), Duration::ZERO);
  assert_eq!(handle.idle_time(), Duration::ZERO);
  assert!(!handle.is_open());
  handle.write(&String::from("ignored"));
  handle.close();

  shut_down(control, join);
}

#[test]
fn test_slow_reader_does_not_block_writes() {
  let (mut handler, rx) = test_handler();
  handler.write_on_connect = (0..500).map(|i| format!("{i:04}{}", "x".repeat(60))).collect();
  let (control, join) = spawn_manager(test_config(), handler);

  let mut client = connect_client(&control);

  // The whole burst is queued from inside the Connect callback; it must
  // return promptly no matter how slowly this client reads.
  let burst = wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::BurstDone(_)));
  match burst {
    Ev::BurstDone(elapsed) => assert!(elapsed < Duration::from_secs(1), "write burst blocked: {elapsed:?}"),
    _ => unreachable!(),
  }

  for i in 0..500 {
    let line = read_line(&mut client);
    assert_eq!(&line[..4], format!("{i:04}").as_str(), "lines arrived out of order");
    assert_eq!(line.len(), 64);
    if i % 50 == 0 {
      thread::sleep(Duration::from_millis(10));
    }
  }

  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Write(_)));

  shut_down(control, join);
}

#[test]
fn test_zero_worker_mode_hosts_connections_on_the_manager() {
  let (mut handler, rx) = test_handler();
  handler.echo = true;
  let config = Config { num_threads: 0, ..test_config() };
  let (control, join) = spawn_manager(config, handler);

  let mut client = connect_client(&control);
  client.write_all(b"single threaded\n").unwrap();
  assert_eq!(read_line(&mut client), "single threaded");

  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Read(_, _)));

  shut_down(control, join);
}

#[test]
fn test_user_timers_fire_once_and_repeatedly() {
  let (handler, rx) = test_handler();
  let config = Config { request_listener: false, ..test_config() };
  let (control, join) = spawn_manager(config, handler);

  control.add_timer(7, Duration::from_millis(100), false);
  control.add_timer(9, Duration::from_millis(50), true);

  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Timer(7)));
  for _ in 0..3 {
    wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Timer(9)));
  }

  // The one-shot timer stays quiet from here on.
  thread::sleep(Duration::from_millis(300));
  let mut one_shot_fires = 0;
  while let Ok(ev) = rx.try_recv() {
    if matches!(ev, Ev::Timer(7)) {
      one_shot_fires += 1;
    }
  }
  assert_eq!(one_shot_fires, 0);

  shut_down(control, join);
}

#[test]
fn test_tick_fires_at_the_configured_cadence() {
  let (handler, rx) = test_handler();
  let config = Config { request_listener: false, ..test_config() };
  let (control, join) = spawn_manager(config, handler);

  let tick = wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Tick(_)));
  match tick {
    Ev::Tick(elapsed) => {
      assert!(elapsed >= Duration::from_millis(500), "tick fired far too early: {elapsed:?}");
      assert!(elapsed <= Duration::from_secs(3), "tick fired far too late: {elapsed:?}");
    }
    _ => unreachable!(),
  }

  shut_down(control, join);
}

#[test]
fn test_read_timeout_is_delivered_without_closing() {
  let (mut handler, rx) = test_handler();
  handler.echo = true;
  let config = Config { read_timeout: Duration::from_secs(1), ..test_config() };
  let (control, join) = spawn_manager(config, handler);

  let mut client = connect_client(&control);
  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Connect(_)));

  // Stay idle past the read timeout.
  wait_for(&rx, Duration::from_secs(5), |ev| matches!(ev, Ev::Conn(ConnectionEvent::Timeout, _, _)));

  // The connection survived the timeout.
  client.write_all(b"still here\n").unwrap();
  assert_eq!(read_line(&mut client), "still here");

  shut_down(control, join);
}
