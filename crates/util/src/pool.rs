// SPDX-License-Identifier: BSD-3-Clause

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// A thread-safe, lock-free pool of fixed-size read chunks.
///
/// `ChunkPool` keeps a bounded set of `chunk_size`-byte vectors so the read
/// path can reuse allocations instead of allocating one per readiness event.
/// The pool can be cloned to create multiple references that share the same
/// underlying storage.
///
/// `get` never fails: when the pool is empty a fresh chunk is allocated.
/// `put` silently drops the chunk when the pool is already full.
pub struct ChunkPool {
  chunks: Arc<ArrayQueue<Vec<u8>>>,
  chunk_size: usize,
}

// ===== impl ChunkPool =====

impl Clone for ChunkPool {
  fn clone(&self) -> Self {
    Self { chunks: Arc::clone(&self.chunks), chunk_size: self.chunk_size }
  }
}

impl std::fmt::Debug for ChunkPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ChunkPool")
      .field("capacity", &self.chunks.capacity())
      .field("available", &self.chunks.len())
      .field("chunk_size", &self.chunk_size)
      .finish()
  }
}

impl ChunkPool {
  /// Creates a pool holding up to `capacity` chunks of `chunk_size` bytes.
  ///
  /// All chunks are preallocated.
  ///
  /// # Panics
  ///
  /// Panics if `capacity` or `chunk_size` is zero.
  pub fn with_capacity(capacity: usize, chunk_size: usize) -> Self {
    assert!(capacity > 0, "pool capacity must be non-zero");
    assert!(chunk_size > 0, "chunk size must be non-zero");

    let chunks = Arc::new(ArrayQueue::new(capacity));
    for _ in 0..capacity {
      let _ = chunks.push(vec![0u8; chunk_size]);
    }

    ChunkPool { chunks, chunk_size }
  }

  /// Retrieves a chunk from the pool, allocating a fresh one when empty.
  ///
  /// The returned vector always has length `chunk_size`.
  pub fn get(&self) -> Vec<u8> {
    self.chunks.pop().unwrap_or_else(|| vec![0u8; self.chunk_size])
  }

  /// Returns a chunk to the pool for reuse.
  ///
  /// Chunks that were resized, and chunks arriving while the pool is full,
  /// are dropped instead.
  pub fn put(&self, chunk: Vec<u8>) {
    if chunk.len() == self.chunk_size {
      let _ = self.chunks.push(chunk);
    }
  }

  /// The configured chunk size in bytes.
  pub fn chunk_size(&self) -> usize {
    self.chunk_size
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn test_get_returns_full_length_chunks() {
    let pool = ChunkPool::with_capacity(4, 128);

    for _ in 0..8 {
      let chunk = pool.get();
      assert_eq!(chunk.len(), 128);
    }
  }

  #[test]
  fn test_get_allocates_when_empty() {
    let pool = ChunkPool::with_capacity(1, 16);

    let first = pool.get();
    let second = pool.get();
    assert_eq!(first.len(), 16);
    assert_eq!(second.len(), 16);
  }

  #[test]
  fn test_put_returns_chunk_to_pool() {
    let pool = ChunkPool::with_capacity(1, 16);

    let mut chunk = pool.get();
    chunk[0] = 42;
    pool.put(chunk);

    // The same storage comes back.
    let chunk = pool.get();
    assert_eq!(chunk[0], 42);
  }

  #[test]
  fn test_put_drops_resized_chunks() {
    let pool = ChunkPool::with_capacity(2, 16);
    let _ = pool.get();
    let _ = pool.get();

    pool.put(vec![0u8; 8]);

    // The undersized chunk was not admitted; a fresh full-length one is
    // allocated instead.
    assert_eq!(pool.get().len(), 16);
  }

  #[test]
  fn test_clone_shares_storage() {
    let pool = ChunkPool::with_capacity(1, 16);
    let other = pool.clone();

    let chunk = pool.get();
    pool.put(chunk);
    assert_eq!(other.get().len(), 16);
  }

  #[test]
  fn test_concurrent_get_put() {
    let pool = ChunkPool::with_capacity(32, 64);
    let mut handles = Vec::new();

    for _ in 0..8 {
      let pool = pool.clone();
      handles.push(thread::spawn(move || {
        for _ in 0..200 {
          let chunk = pool.get();
          assert_eq!(chunk.len(), 64);
          pool.put(chunk);
        }
      }));
    }

    for handle in handles {
      handle.join().unwrap();
    }
  }
}
