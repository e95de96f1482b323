// SPDX-License-Identifier: BSD-3-Clause

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use core_affinity::CoreId;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

const JOB_QUEUE_SIZE: usize = 1024;

/// A connection task shipped to a worker loop.
pub(crate) type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A worker that hosts a shard of connection tasks on a dedicated thread.
///
/// Each worker runs a single-threaded runtime with a `LocalSet`: within one
/// worker every callback is strictly serial, across workers they run in
/// parallel. The worker owns no connections, only their spawned I/O tasks.
pub(crate) struct Worker {
  tx: Option<mpsc::Sender<Job>>,
  handle: Option<thread::JoinHandle<()>>,
}

// ===== impl Worker =====

impl Worker {
  /// Spawns a worker thread, optionally pinned to a CPU core.
  fn spawn(index: usize, tick_time: Duration, break_token: CancellationToken, core: Option<CoreId>) -> Self {
    let (tx, rx) = mpsc::channel(JOB_QUEUE_SIZE);

    let handle = thread::spawn(move || Self::run(index, rx, tick_time, break_token, core));

    Worker { tx: Some(tx), handle: Some(handle) }
  }

  /// The worker loop: drain the submission channel, spawning each job
  /// locally, until the channel closes or the break token fires. The idle
  /// tick does nothing itself; it bounds how long the loop can sit in an
  /// indefinite wait before observing external signals.
  fn run(index: usize, mut rx: mpsc::Receiver<Job>, tick_time: Duration, break_token: CancellationToken, core: Option<CoreId>) {
    if let Some(core) = core {
      let _ = core_affinity::set_for_current(core);
    }

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
      Ok(rt) => rt,
      Err(e) => {
        error!(worker = index, error = %e, "could not build the worker runtime");
        return;
      }
    };

    let local = LocalSet::new();
    local.block_on(&rt, async {
      let mut tick = tokio::time::interval(tick_time);
      tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          job = rx.recv() => match job {
            Some(job) => {
              tokio::task::spawn_local(job);
            }
            None => break,
          },
          _ = break_token.cancelled() => break,
          _ = tick.tick() => {}
        }
      }
    });

    trace!(worker = index, "worker loop finished");
  }

  async fn submit(&self, job: Job) {
    if let Some(tx) = &self.tx {
      let _ = tx.send(job).await;
    }
  }
}

impl Drop for Worker {
  fn drop(&mut self) {
    // Closing the channel signals the worker thread to stop.
    if let Some(tx) = self.tx.take() {
      drop(tx);
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

/// The pool of worker loops connections are sharded across.
///
/// Assignment is strict round-robin over an atomic counter: with K
/// submissions across N workers, per-worker counts differ by at most one.
pub(crate) struct WorkerPool {
  workers: Vec<Worker>,
  next: AtomicUsize,
}

// ===== impl WorkerPool =====

impl WorkerPool {
  /// Spawns `count` workers, pinned round-robin across the available CPU
  /// cores (best-effort). A zero-sized pool is legal: the manager loop then
  /// hosts the connection tasks itself.
  pub(crate) fn spawn(count: usize, tick_time: Duration, break_token: CancellationToken) -> Self {
    let cores = core_affinity::get_core_ids().unwrap_or_default();

    if count > 0 {
      info!(workers = count, "initialising worker threads");
    }

    let workers = (0..count)
      .map(|index| {
        let core = if cores.is_empty() { None } else { Some(cores[index % cores.len()]) };
        Worker::spawn(index, tick_time, break_token.clone(), core)
      })
      .collect();

    WorkerPool { workers, next: AtomicUsize::new(0) }
  }

  pub(crate) fn len(&self) -> usize {
    self.workers.len()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.workers.is_empty()
  }

  /// Ships a job to the next worker in round-robin order.
  ///
  /// # Panics
  ///
  /// Panics on an empty pool; callers route jobs to the manager loop in that
  /// case.
  pub(crate) async fn submit(&self, job: Job) {
    let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
    self.workers[index].submit(job).await;
  }
}
