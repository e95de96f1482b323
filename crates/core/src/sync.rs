// SPDX-License-Identifier: BSD-3-Clause

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard when a panicking thread poisoned it.
/// User callbacks are unwind-guarded, so poisoning can only originate from a
/// library bug; the protected state is still structurally valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
