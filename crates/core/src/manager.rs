// SPDX-License-Identifier: BSD-3-Clause

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Context};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, trace, warn};

use mooring_util::ChunkPool;

use crate::config::Config;
use crate::connection::{self, Connection, ConnectionId, UniqueId};
use crate::event::{ConnectionEvent, ServerEvent};
use crate::handle::Handle;
use crate::handler::{guard, EventHandler, TimerId};
use crate::sync::lock;
use crate::worker::WorkerPool;

const READ_POOL_CHUNKS: usize = 64;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Manager lifecycle states. Transitions only move forward.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ManagerState {
  Constructed = 0,
  Starting = 1,
  Running = 2,
  ShuttingDown = 3,
  Stopped = 4,
}

impl ManagerState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => ManagerState::Constructed,
      1 => ManagerState::Starting,
      2 => ManagerState::Running,
      3 => ManagerState::ShuttingDown,
      _ => ManagerState::Stopped,
    }
  }
}

/// Control requests funneled onto the manager loop from any thread.
enum Command {
  Connect { host: String, port: u16, unique_id: Option<UniqueId> },
  AddTimer { id: TimerId, period: Duration, repeat: bool },
  Shutdown,
}

/// State shared between the manager loop, the worker-hosted connection tasks
/// and every [`ManagerRef`].
pub(crate) struct Shared<H: EventHandler> {
  pub(crate) config: Config,
  pub(crate) handler: H,
  pub(crate) chunk_pool: ChunkPool,
  pub(crate) tracker: TaskTracker,

  /// Cancelled on shutdown when `connection_close_on_shutdown` is set;
  /// every connection task closes with a final `Disconnect`.
  pub(crate) shutdown_token: CancellationToken,

  /// Cancelled on abort; breaks every worker loop and the manager loop.
  pub(crate) abort_token: CancellationToken,

  /// Cancelled once the shutdown command has been processed; gates the
  /// manager loop's drain-and-exit path.
  shutdown_entered: CancellationToken,

  connections: Mutex<HashMap<ConnectionId, Arc<Connection<H>>>>,
  state: AtomicU8,
  command_tx: mpsc::UnboundedSender<Command>,
  started: Mutex<Option<(SystemTime, Instant)>>,
  local_addr: Mutex<Option<SocketAddr>>,
}

// ===== impl Shared =====

impl<H: EventHandler> Shared<H> {
  pub(crate) fn state(&self) -> ManagerState {
    ManagerState::from_u8(self.state.load(Ordering::Acquire))
  }

  fn set_state(&self, state: ManagerState) {
    self.state.store(state as u8, Ordering::Release);
  }

  fn try_transition(&self, from: ManagerState, to: ManagerState) -> bool {
    self.state.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire).is_ok()
  }

  pub(crate) fn num_connections(&self) -> usize {
    lock(&self.connections).len()
  }

  /// Registers a connection in the map, refusing once shutdown has begun.
  fn insert_connection(&self, connection: &Arc<Connection<H>>) -> bool {
    if self.state() > ManagerState::Running {
      return false;
    }
    lock(&self.connections).insert(connection.id(), connection.clone());
    true
  }

  /// Destroys the map entry; the connection object itself is freed once the
  /// last in-flight handle upgrade drops.
  pub(crate) fn remove_connection(&self, id: ConnectionId) {
    if lock(&self.connections).remove(&id).is_none() {
      warn!(id, "connection finished before it was registered");
    }
  }

  /// Moves to ShuttingDown and breaks every loop without waiting for
  /// connection drains.
  pub(crate) fn abort(&self) {
    let state = self.state();
    if state == ManagerState::Stopped {
      return;
    }
    if state < ManagerState::ShuttingDown {
      self.set_state(ManagerState::ShuttingDown);
    }
    info!("aborting");
    self.abort_token.cancel();
  }

  /// Invokes a user callback behind the panic guard.
  pub(crate) fn invoke(&self, callback: &'static str, f: impl FnOnce(&H)) {
    let _ = guard(callback, || f(&self.handler));
  }

  pub(crate) fn connection_event(&self, handle: Handle<H>, event: ConnectionEvent, text: Option<&str>) {
    self.invoke("on_connection_event", move |h| h.on_connection_event(handle, event, text));
  }

  pub(crate) fn server_event(&self, event: ServerEvent, text: Option<&str>) {
    self.invoke("on_event", move |h| h.on_event(event, text));
  }
}

/// The process-wide orchestrator: owns the listener, the worker pool, the
/// connection map, timers and the shutdown machinery.
///
/// Construct once, then call [`run`](Manager::run) on a dedicated thread; it
/// blocks until the manager reaches `Stopped`. All control from other threads
/// goes through a [`ManagerRef`] obtained from [`handle`](Manager::handle).
pub struct Manager<H: EventHandler> {
  shared: Arc<Shared<H>>,
  command_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

// ===== impl Manager =====

impl<H: EventHandler> Manager<H> {
  /// Creates a manager from a configuration and a handler. The configuration
  /// is validated when `run` is called.
  pub fn new(config: Config, handler: H) -> Self {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let chunk_pool = ChunkPool::with_capacity(READ_POOL_CHUNKS, config.buffer_size.max(1));

    let shared = Arc::new(Shared {
      config,
      handler,
      chunk_pool,
      tracker: TaskTracker::new(),
      shutdown_token: CancellationToken::new(),
      abort_token: CancellationToken::new(),
      shutdown_entered: CancellationToken::new(),
      connections: Mutex::new(HashMap::new()),
      state: AtomicU8::new(ManagerState::Constructed as u8),
      command_tx,
      started: Mutex::new(None),
      local_addr: Mutex::new(None),
    });

    Manager { shared, command_rx: Some(command_rx) }
  }

  /// Returns a cloneable control handle usable from any thread.
  pub fn handle(&self) -> ManagerRef<H> {
    ManagerRef::new(self.shared.clone())
  }

  /// Runs the manager until it stops.
  ///
  /// Blocks the calling thread for the manager's whole lifetime: binds the
  /// listener, spawns the worker pool, arms the tick and signal events,
  /// calls `on_start`, services events until shutdown or abort completes,
  /// calls `on_stop`, then joins the workers.
  ///
  /// # Errors
  ///
  /// Fails fatally on an invalid configuration, a failure to create an event
  /// loop, or a listener bind failure. `run` may be called at most once.
  pub fn run(&mut self) -> anyhow::Result<()> {
    self.shared.config.validate().context("invalid configuration")?;

    if !self.shared.try_transition(ManagerState::Constructed, ManagerState::Starting) {
      return Err(anyhow!("the manager has already been run"));
    }
    let command_rx = self.command_rx.take().ok_or_else(|| anyhow!("the manager has already been run"))?;

    *lock(&self.shared.started) = Some((SystemTime::now(), Instant::now()));

    let pool = Arc::new(WorkerPool::spawn(
      self.shared.config.num_threads,
      self.shared.config.worker_tick_time,
      self.shared.abort_token.clone(),
    ));

    let rt = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .context("could not create the manager event loop")?;
    let local = LocalSet::new();

    let result = local.block_on(&rt, run_loop(self.shared.clone(), pool.clone(), command_rx));
    if result.is_err() {
      self.shared.abort();
    }

    // Remaining local tasks drop with the LocalSet; dropping the pool closes
    // the submission channels and joins the worker threads.
    drop(local);
    info!("joining worker threads");
    drop(pool);

    lock(&self.shared.connections).clear();
    self.shared.set_state(ManagerState::Stopped);
    info!("manager stopped");

    result
  }

  /// See [`ManagerRef::shutdown`].
  pub fn shutdown(&self) {
    self.handle().shutdown();
  }

  /// See [`ManagerRef::abort`].
  pub fn abort(&self) {
    self.handle().abort();
  }

  /// See [`ManagerRef::connect_to`].
  pub fn connect_to(&self, host: impl Into<String>, port: u16, unique_id: Option<UniqueId>) -> Handle<H> {
    self.handle().connect_to(host, port, unique_id)
  }

  /// See [`ManagerRef::add_timer`].
  pub fn add_timer(&self, id: TimerId, period: Duration, repeat: bool) {
    self.handle().add_timer(id, period, repeat);
  }

  pub fn state(&self) -> ManagerState {
    self.shared.state()
  }

  pub fn num_connections(&self) -> usize {
    self.shared.num_connections()
  }

  pub fn ip_address(&self) -> String {
    self.handle().ip_address()
  }

  pub fn port_number(&self) -> u16 {
    self.handle().port_number()
  }

  pub fn start_time(&self) -> Option<SystemTime> {
    self.handle().start_time()
  }

  pub fn up_time(&self) -> Duration {
    self.handle().up_time()
  }
}

/// A cloneable, thread-safe control handle onto a running manager.
pub struct ManagerRef<H: EventHandler> {
  shared: Arc<Shared<H>>,
}

// ===== impl ManagerRef =====

impl<H: EventHandler> Clone for ManagerRef<H> {
  fn clone(&self) -> Self {
    Self { shared: self.shared.clone() }
  }
}

impl<H: EventHandler> ManagerRef<H> {
  pub(crate) fn new(shared: Arc<Shared<H>>) -> Self {
    Self { shared }
  }

  /// Requests a graceful shutdown: the listener stops, `on_event(Shutdown)`
  /// fires, open connections drain (or are closed when
  /// `connection_close_on_shutdown` is set), and the death timer arms; if
  /// it expires before the drain completes, the manager aborts. Only valid
  /// from `Running`; otherwise a no-op.
  pub fn shutdown(&self) {
    if !self.shared.try_transition(ManagerState::Running, ManagerState::ShuttingDown) {
      return;
    }
    let _ = self.shared.command_tx.send(Command::Shutdown);
  }

  /// Hard-stops the manager: breaks every worker loop and the manager loop
  /// without waiting for connections to drain. A superset of `shutdown`.
  pub fn abort(&self) {
    self.shared.abort();
  }

  /// Enqueues an outbound connect request, resolved and connected on the
  /// manager loop. Safe to call from any thread.
  ///
  /// The returned handle is expired: the live handle for a successful
  /// connect arrives with its `Connect` event, reconcilable through
  /// `unique_id`. Failures surface as `on_event(RequestConnectFail, reason)`.
  pub fn connect_to(&self, host: impl Into<String>, port: u16, unique_id: Option<UniqueId>) -> Handle<H> {
    let _ = self.shared.command_tx.send(Command::Connect { host: host.into(), port, unique_id });
    Handle::expired()
  }

  /// Registers a timer firing `on_timer(id)` after `period`, repeatedly when
  /// `repeat` is set.
  pub fn add_timer(&self, id: TimerId, period: Duration, repeat: bool) {
    let _ = self.shared.command_tx.send(Command::AddTimer { id, period, repeat });
  }

  pub fn state(&self) -> ManagerState {
    self.shared.state()
  }

  /// The number of open connections.
  pub fn num_connections(&self) -> usize {
    self.shared.num_connections()
  }

  /// The listener's bound IP address, or `0.0.0.0` when not listening.
  pub fn ip_address(&self) -> String {
    match *lock(&self.shared.local_addr) {
      Some(addr) => addr.ip().to_string(),
      None => String::from("0.0.0.0"),
    }
  }

  /// The listener's bound port, or the configured port when not listening.
  pub fn port_number(&self) -> u16 {
    match *lock(&self.shared.local_addr) {
      Some(addr) => addr.port(),
      None => self.shared.config.port_number,
    }
  }

  /// The wall-clock time `run` started, or `None` before that.
  pub fn start_time(&self) -> Option<SystemTime> {
    (*lock(&self.shared.started)).map(|(at, _)| at)
  }

  /// Time elapsed since `run` started, or zero before that.
  pub fn up_time(&self) -> Duration {
    (*lock(&self.shared.started)).map(|(_, at)| at.elapsed()).unwrap_or(Duration::ZERO)
  }
}

/// The manager loop body, driven by a current-thread runtime with a
/// `LocalSet`.
async fn run_loop<H: EventHandler>(
  shared: Arc<Shared<H>>,
  pool: Arc<WorkerPool>,
  command_rx: mpsc::UnboundedReceiver<Command>,
) -> anyhow::Result<()> {
  info!("configuring network logic");

  let listener_token = shared.abort_token.child_token();

  if shared.config.request_listener {
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], shared.config.port_number));
    let listener = TcpListener::bind(bind_addr)
      .await
      .with_context(|| format!("could not bind a listener on port {}", shared.config.port_number))?;
    let local_addr = listener.local_addr().context("listener local address")?;
    *lock(&shared.local_addr) = Some(local_addr);
    info!(port = local_addr.port(), "listener configured");

    tokio::task::spawn_local(accept_loop(listener, shared.clone(), pool.clone(), listener_token.clone()));
  }

  if shared.config.request_signal_handler {
    tokio::task::spawn_local(signal_loop(shared.clone()));
  }

  tokio::task::spawn_local(tick_loop(shared.clone()));
  tokio::task::spawn_local(command_loop(shared.clone(), pool.clone(), command_rx, listener_token));

  shared.set_state(ManagerState::Running);
  let manager = ManagerRef::new(shared.clone());
  shared.invoke("on_start", |h| h.on_start(&manager));
  info!("operation start");

  tokio::select! {
    _ = shared.abort_token.cancelled() => {
      info!("manager loop broken");
    }
    _ = drained(&shared) => {
      info!("all connections drained");
    }
  }

  shared.invoke("on_stop", |h| h.on_stop());
  info!("operation stopped");
  Ok(())
}

/// Resolves once shutdown has been processed and every connection task has
/// finished.
async fn drained<H: EventHandler>(shared: &Shared<H>) {
  shared.shutdown_entered.cancelled().await;
  shared.tracker.wait().await;
}

/// Accepts inbound connections until the listener token fires. Accept
/// failures surface as `ListenerError` and the loop keeps going.
async fn accept_loop<H: EventHandler>(
  listener: TcpListener,
  shared: Arc<Shared<H>>,
  pool: Arc<WorkerPool>,
  stop: CancellationToken,
) {
  loop {
    tokio::select! {
      _ = stop.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          trace!(peer = %peer, "accepted connection");
          install_connection(&shared, &pool, stream, None).await;
        }
        Err(e) => {
          warn!(error = %e, "listener accept failed");
          shared.server_event(ServerEvent::ListenerError, Some(&e.to_string()));
          // Persistent accept errors (fd exhaustion) would otherwise spin.
          tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
        }
      }
    }
  }
  info!("stopped accepting connections");
}

/// Services cross-thread control requests on the manager loop.
async fn command_loop<H: EventHandler>(
  shared: Arc<Shared<H>>,
  pool: Arc<WorkerPool>,
  mut command_rx: mpsc::UnboundedReceiver<Command>,
  listener_token: CancellationToken,
) {
  while let Some(command) = command_rx.recv().await {
    match command {
      Command::Connect { host, port, unique_id } => {
        process_connect(&shared, &pool, host, port, unique_id).await;
      }
      Command::AddTimer { id, period, repeat } => {
        tokio::task::spawn_local(timer_loop(shared.clone(), id, period, repeat));
      }
      Command::Shutdown => process_shutdown(&shared, &listener_token),
    }
  }
}

fn process_shutdown<H: EventHandler>(shared: &Arc<Shared<H>>, listener_token: &CancellationToken) {
  info!("shutdown requested");

  listener_token.cancel();

  // Arm the death timer: a drain that outlives the grace period is aborted.
  let death = shared.clone();
  tokio::task::spawn_local(async move {
    tokio::time::sleep(death.config.death_time).await;
    warn!("death timer expired");
    death.abort();
  });

  shared.server_event(ServerEvent::Shutdown, None);

  if shared.config.connection_close_on_shutdown {
    shared.shutdown_token.cancel();
  }

  shared.tracker.close();
  shared.shutdown_entered.cancel();
}

/// Resolves and connects one outbound request, then installs the connection
/// exactly like an accepted one.
async fn process_connect<H: EventHandler>(
  shared: &Arc<Shared<H>>,
  pool: &Arc<WorkerPool>,
  host: String,
  port: u16,
  unique_id: Option<UniqueId>,
) {
  if shared.state() > ManagerState::Running {
    shared.server_event(ServerEvent::RequestConnectFail, Some("manager is shutting down"));
    return;
  }

  info!(host = %host, port, "connecting to host");

  let mut addrs = match tokio::net::lookup_host((host.as_str(), port)).await {
    Ok(addrs) => addrs,
    Err(e) => {
      let reason = format!("could not resolve hostname {host}: {e}");
      warn!("{reason}");
      shared.server_event(ServerEvent::RequestConnectFail, Some(&reason));
      return;
    }
  };
  let addr = match addrs.next() {
    Some(addr) => addr,
    None => {
      let reason = format!("hostname {host} resolved to no addresses");
      shared.server_event(ServerEvent::RequestConnectFail, Some(&reason));
      return;
    }
  };

  match TcpStream::connect(addr).await {
    Ok(stream) => install_connection(shared, pool, stream, unique_id).await,
    Err(e) => {
      let reason = format!("failed to connect to {host}:{port}: {e}");
      warn!("{reason}");
      shared.server_event(ServerEvent::RequestConnectFail, Some(&reason));
    }
  }
}

/// Constructs a connection around a socket, registers it, emits `Connect`,
/// and ships its I/O task to a worker, or hosts it on the manager loop when
/// the pool is empty.
async fn install_connection<H: EventHandler>(
  shared: &Arc<Shared<H>>,
  pool: &Arc<WorkerPool>,
  stream: TcpStream,
  unique_id: Option<UniqueId>,
) {
  let peer = match stream.peer_addr() {
    Ok(peer) => peer,
    Err(e) => {
      warn!(error = %e, "could not read the peer address; dropping socket");
      return;
    }
  };

  // The socket changes event loops: detach it here, re-register on the
  // worker.
  let std_stream = match stream.into_std() {
    Ok(stream) => stream,
    Err(e) => {
      warn!(error = %e, "could not detach the socket; dropping it");
      return;
    }
  };

  let codec = match guard("build_serializer", || shared.handler.build_serializer()) {
    Some(codec) => codec,
    None => return,
  };

  let connection = Connection::new(shared.clone(), codec, peer, unique_id);
  if !shared.insert_connection(&connection) {
    trace!(id = connection.id(), "connection refused during shutdown");
    return;
  }
  trace!(id = connection.id(), peer = %peer, "connection registered");

  shared.connection_event(connection.request_handle(), ConnectionEvent::Connect, None);

  let task = shared.tracker.track_future(connection::run_io_std(connection, std_stream));
  if pool.is_empty() {
    tokio::task::spawn_local(task);
  } else {
    pool.submit(Box::pin(task)).await;
  }
}

/// The manager tick: fires `on_tick` with the measured elapsed time, then
/// re-arms with an interval that grows with the connection count.
async fn tick_loop<H: EventHandler>(shared: Arc<Shared<H>>) {
  let mut last = Instant::now();
  loop {
    let interval = shared.config.tick_interval(shared.num_connections());
    tokio::time::sleep(interval).await;

    let now = Instant::now();
    let elapsed = now.duration_since(last);
    last = now;

    shared.invoke("on_tick", |h| h.on_tick(elapsed));
  }
}

/// A user timer: fires `on_timer(id)` once, or on every period when
/// repeating.
async fn timer_loop<H: EventHandler>(shared: Arc<Shared<H>>, id: TimerId, period: Duration, repeat: bool) {
  loop {
    tokio::time::sleep(period).await;
    shared.invoke("on_timer", |h| h.on_timer(id));
    if !repeat {
      break;
    }
  }
}

/// The interrupt watcher: the first interrupt shuts down gracefully, a
/// second one aborts outright.
async fn signal_loop<H: EventHandler>(shared: Arc<Shared<H>>) {
  if tokio::signal::ctrl_c().await.is_err() {
    warn!("could not install the interrupt handler");
    return;
  }
  info!("interrupt received; shutting down");
  ManagerRef::new(shared.clone()).shutdown();

  if tokio::signal::ctrl_c().await.is_ok() {
    warn!("second interrupt; aborting");
    shared.abort();
  }
}
