// SPDX-License-Identifier: BSD-3-Clause

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use mooring_util::{Buffer, ChunkPool};

use crate::event::ConnectionEvent;
use crate::handle::Handle;
use crate::handler::{EventHandler, Payload};
use crate::manager::Shared;
use crate::serializer::Serializer;
use crate::sync::lock;

/// Process-unique identifier of a connection. Zero is the expired sentinel.
pub type ConnectionId = u64;

/// Optional user-supplied identifier, used to reconcile outbound connect
/// requests with their `Connect` events.
pub type UniqueId = i64;

// Monotone process-global counter; never reused for the process lifetime.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One live TCP session and all its per-session state.
///
/// The manager's connection map holds the only strong reference; every
/// [`Handle`] holds a weak one. A connection is destroyed only after its map
/// entry is removed and no handle is mid-call, which makes handle access safe
/// from any thread at any time.
pub struct Connection<H: EventHandler> {
  id: ConnectionId,
  unique_id: Option<UniqueId>,
  peer_addr: SocketAddr,
  created: Instant,
  last_access: Mutex<Instant>,
  closing: AtomicBool,
  codec: Mutex<H::Codec>,
  write_wake: Notify,
  close_token: CancellationToken,
  self_ref: Weak<Connection<H>>,
  shared: Arc<Shared<H>>,
}

// ===== impl Connection =====

impl<H: EventHandler> Connection<H> {
  /// Creates a connection around a freshly-built serializer.
  pub(crate) fn new(
    shared: Arc<Shared<H>>,
    codec: H::Codec,
    peer_addr: SocketAddr,
    unique_id: Option<UniqueId>,
  ) -> Arc<Self> {
    let now = Instant::now();

    Arc::new_cyclic(|self_ref| Connection {
      id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
      unique_id,
      peer_addr,
      created: now,
      last_access: Mutex::new(now),
      closing: AtomicBool::new(false),
      codec: Mutex::new(codec),
      write_wake: Notify::new(),
      close_token: CancellationToken::new(),
      self_ref: self_ref.clone(),
      shared,
    })
  }

  /// The process-unique connection identifier.
  pub fn id(&self) -> ConnectionId {
    self.id
  }

  /// The user-supplied identifier from the originating connect request.
  pub fn unique_id(&self) -> Option<UniqueId> {
    self.unique_id
  }

  /// The peer socket address.
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }

  /// `true` until the connection starts closing.
  pub fn is_open(&self) -> bool {
    !self.closing.load(Ordering::Acquire)
  }

  /// Time since the connection was constructed.
  pub fn uptime(&self) -> Duration {
    self.created.elapsed()
  }

  /// Time since the last successful read or write.
  pub fn idle_time(&self) -> Duration {
    lock(&self.last_access).elapsed()
  }

  /// Fabricates a new handle observing this connection.
  pub fn request_handle(&self) -> Handle<H> {
    Handle::new(self.self_ref.clone())
  }

  /// Serializes a payload under the codec mutex and wakes the connection's
  /// I/O task, which drains the produced wire buffers (and any serializer
  /// errors) on the owning worker loop. Never blocks: an unready socket
  /// simply grows the serializer's outbound queue, which is the framework's
  /// backpressure boundary. A no-op once the connection is closing.
  ///
  /// Callable from any thread; no callback runs on the caller.
  pub fn write(&self, payload: &Payload<H>) {
    if !self.is_open() {
      return;
    }

    lock(&self.codec).serialize(payload);
    self.write_wake.notify_one();
  }

  /// Requests the connection be closed and destroyed. Idempotent; later
  /// `write` calls are no-ops. A user-initiated close emits no event.
  pub fn close(&self) {
    let _ = self.begin_close();
  }

  /// Marks the connection closing and wakes its I/O task. Returns the
  /// previous closing state, so only the first caller emits the terminal
  /// event.
  pub(crate) fn begin_close(&self) -> bool {
    let was_closing = self.closing.swap(true, Ordering::AcqRel);
    if !was_closing {
      self.close_token.cancel();
    }
    was_closing
  }

  /// Records a successful read or write.
  pub(crate) fn touch_access(&self) {
    *lock(&self.last_access) = Instant::now();
  }

  /// Feeds a freshly-read chunk through the serializer and drains the
  /// resulting payloads and errors.
  fn ingest(&self, bytes: &[u8]) -> (Vec<Payload<H>>, Vec<String>) {
    let mut codec = lock(&self.codec);
    codec.deserialize(bytes);

    let mut payloads = Vec::new();
    while let Some(payload) = codec.pop_payload() {
      payloads.push(payload);
    }
    let mut errors = Vec::new();
    while let Some(text) = codec.pop_error() {
      errors.push(text);
    }
    (payloads, errors)
  }

  /// Pops the next queued wire buffer and drains any pending serializer
  /// errors. Called only from the connection's I/O task.
  fn take_outbound(&self) -> (Option<Buffer>, Vec<String>) {
    let mut codec = lock(&self.codec);

    let mut errors = Vec::new();
    while let Some(text) = codec.pop_error() {
      errors.push(text);
    }
    let buffer = loop {
      match codec.pop_buffer() {
        Some(buffer) if buffer.is_empty() => continue,
        other => break other,
      }
    };
    (buffer, errors)
  }

  pub(crate) fn close_token(&self) -> &CancellationToken {
    &self.close_token
  }
}

impl<H: EventHandler> std::fmt::Debug for Connection<H> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("id", &self.id)
      .field("unique_id", &self.unique_id)
      .field("peer_addr", &self.peer_addr)
      .field("open", &self.is_open())
      .finish()
  }
}

/// Outbound drain progress: the buffer currently being written and the byte
/// offset into its head chunk, so a partial write resumes where it stopped.
struct Drain {
  buffer: Buffer,
  offset: usize,
}

enum ReadStep {
  Data(Vec<u8>, usize),
  TimedOut,
  Eof,
  Failed(std::io::Error),
}

enum WriteStep {
  Progress,
  BufferDone,
  TimedOut,
  Stalled,
  Failed(std::io::Error),
}

/// Registers a socket shipped across runtimes and runs the connection's I/O
/// task on the current (worker) runtime.
pub(crate) async fn run_io_std<H: EventHandler>(connection: Arc<Connection<H>>, stream: std::net::TcpStream) {
  match tokio::net::TcpStream::from_std(stream) {
    Ok(stream) => run_io(connection, stream).await,
    Err(e) => {
      error!(id = connection.id(), error = %e, "could not register socket with the worker loop");
      let shared = connection.shared.clone();
      if !connection.begin_close() {
        shared.connection_event(connection.request_handle(), ConnectionEvent::DisconnectError, Some(&e.to_string()));
      }
      shared.remove_connection(connection.id());
    }
  }
}

/// The per-connection I/O task: one cooperative loop owning the socket.
/// Every callback for this connection runs here, so callbacks are serialized
/// no matter which thread queued the work.
///
/// `write` only serializes and wakes this loop; the top of each iteration is
/// the write-readiness pass that pulls the serializer's queued buffers and
/// errors. Each select services exactly one of: a read readiness, one
/// outbound chunk write, a write wake-up, a close request, or a manager
/// shutdown. Reads and writes therefore interleave fairly even while a slow
/// peer keeps the outbound queue non-empty.
pub(crate) async fn run_io<H, S>(connection: Arc<Connection<H>>, stream: S)
where
  H: EventHandler,
  S: AsyncRead + AsyncWrite + Unpin,
{
  let shared = connection.shared.clone();
  let read_timeout = shared.config.read_timeout_opt();
  let write_timeout = shared.config.write_timeout_opt();
  let close_on_shutdown = shared.config.connection_close_on_shutdown;

  let (mut reader, mut writer) = tokio::io::split(stream);
  let mut pending: Option<Drain> = None;
  let mut finished_buffer = false;

  loop {
    // Write-readiness pass: surface serializer errors and pick up the next
    // queued buffer. `on_write` fires once the whole queue has been flushed.
    if pending.is_none() {
      let (buffer, errors) = connection.take_outbound();
      for text in errors {
        shared.connection_event(connection.request_handle(), ConnectionEvent::SerializationError, Some(&text));
      }
      pending = buffer.map(|buffer| Drain { buffer, offset: 0 });

      if pending.is_none() && finished_buffer {
        finished_buffer = false;
        let handle = connection.request_handle();
        shared.invoke("on_write", move |h| h.on_write(handle));
        connection.touch_access();
      }
    }
    let draining = pending.is_some();

    tokio::select! {
      step = read_chunk(&mut reader, &shared.chunk_pool, read_timeout) => match step {
        ReadStep::Data(chunk, n) => {
          let (payloads, errors) = connection.ingest(&chunk[..n]);
          shared.chunk_pool.put(chunk);
          for payload in payloads {
            let handle = connection.request_handle();
            shared.invoke("on_read", move |h| h.on_read(handle, payload));
          }
          for text in errors {
            shared.connection_event(connection.request_handle(), ConnectionEvent::SerializationError, Some(&text));
          }
          connection.touch_access();
        }
        ReadStep::TimedOut => {
          shared.connection_event(connection.request_handle(), ConnectionEvent::Timeout, None);
        }
        ReadStep::Eof => {
          if !connection.begin_close() {
            shared.connection_event(connection.request_handle(), ConnectionEvent::Disconnect, None);
          }
          break;
        }
        ReadStep::Failed(e) => {
          if !connection.begin_close() {
            shared.connection_event(connection.request_handle(), ConnectionEvent::DisconnectError, Some(&e.to_string()));
          }
          break;
        }
      },

      // A writer called `write`; loop around so the write-readiness pass
      // picks up what it queued.
      _ = connection.write_wake.notified(), if !draining => {}

      step = write_chunk(&mut writer, pending.as_mut(), write_timeout), if draining => match step {
        WriteStep::Progress => {}
        WriteStep::BufferDone => {
          pending = None;
          finished_buffer = true;
        }
        WriteStep::TimedOut => {
          shared.connection_event(connection.request_handle(), ConnectionEvent::Timeout, None);
        }
        WriteStep::Stalled => {
          if !connection.begin_close() {
            shared.connection_event(
              connection.request_handle(),
              ConnectionEvent::DisconnectError,
              Some("zero-length write"),
            );
          }
          break;
        }
        WriteStep::Failed(e) => {
          if !connection.begin_close() {
            shared.connection_event(connection.request_handle(), ConnectionEvent::DisconnectError, Some(&e.to_string()));
          }
          break;
        }
      },

      _ = connection.close_token().cancelled() => break,

      _ = shared.shutdown_token.cancelled(), if close_on_shutdown => {
        if !connection.begin_close() {
          shared.connection_event(connection.request_handle(), ConnectionEvent::Disconnect, None);
        }
        break;
      }
    }
  }

  connection.begin_close();
  let _ = writer.shutdown().await;
  shared.remove_connection(connection.id());
  trace!(id = connection.id(), "connection task finished");
}

/// One read into a pooled chunk, bounded by the configured read timeout.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, pool: &ChunkPool, timeout: Option<Duration>) -> ReadStep {
  let mut chunk = pool.get();
  let result = match timeout {
    Some(limit) => match tokio::time::timeout(limit, reader.read(&mut chunk)).await {
      Ok(result) => result,
      Err(_) => {
        pool.put(chunk);
        return ReadStep::TimedOut;
      }
    },
    None => reader.read(&mut chunk).await,
  };

  match result {
    Ok(0) => ReadStep::Eof,
    Ok(n) => ReadStep::Data(chunk, n),
    Err(e) => ReadStep::Failed(e),
  }
}

/// Writes the remainder of the pending head chunk once, bounded by the
/// configured write timeout. On a partial write the offset advances and the
/// chunk stays at the head.
///
/// Called with `None` only when its select branch is disabled; parks forever
/// in that case rather than being polled.
async fn write_chunk<W: AsyncWrite + Unpin>(
  writer: &mut W,
  drain: Option<&mut Drain>,
  timeout: Option<Duration>,
) -> WriteStep {
  let drain = match drain {
    Some(drain) => drain,
    None => return std::future::pending().await,
  };

  let result = {
    let chunk = match drain.buffer.chunk() {
      Some(chunk) => chunk,
      None => return WriteStep::BufferDone,
    };
    let slice = &chunk[drain.offset..];
    match timeout {
      Some(limit) => match tokio::time::timeout(limit, writer.write(slice)).await {
        Ok(result) => result,
        Err(_) => return WriteStep::TimedOut,
      },
      None => writer.write(slice).await,
    }
  };

  match result {
    Ok(0) => WriteStep::Stalled,
    Ok(n) => {
      drain.offset += n;
      if drain.offset == drain.buffer.chunk_len() {
        drain.buffer.pop_chunk();
        drain.offset = 0;
        if drain.buffer.is_empty() {
          return WriteStep::BufferDone;
        }
      }
      WriteStep::Progress
    }
    Err(e) => WriteStep::Failed(e),
  }
}
