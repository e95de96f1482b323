// SPDX-License-Identifier: BSD-3-Clause

use std::time::Duration;

/// The manager configuration.
///
/// All fields are plain data; `validate` is called at the top of
/// [`Manager::run`](crate::Manager::run) and rejects values the tick formula
/// cannot work with.
#[derive(Clone, Debug)]
pub struct Config {
  /// Listener bind port. Port 0 binds an ephemeral port; the bound port is
  /// reported by `port_number` once the manager is running.
  pub port_number: u16,

  /// Worker thread count. Zero collapses connection hosting onto the
  /// manager loop (single-threaded mode).
  pub num_threads: usize,

  /// Per-read chunk allocation size in bytes.
  pub buffer_size: usize,

  /// Per-read timeout. Zero disables; on expiry a `Timeout` event is
  /// delivered and the connection stays open.
  pub read_timeout: Duration,

  /// Per-write timeout. Zero disables.
  pub write_timeout: Duration,

  /// Minimum tick interval in seconds. Must be at least 1.
  pub min_tick_time: u64,

  /// Scales how the tick interval grows with the connection count.
  pub tick_time_modifier: f64,

  /// Grace period after `shutdown()` before the manager aborts outright.
  pub death_time: Duration,

  /// Worker wake-up cadence; bounds how long an idle worker loop waits
  /// before it can observe a break signal.
  pub worker_tick_time: Duration,

  /// Whether `shutdown()` force-closes open connections.
  pub connection_close_on_shutdown: bool,

  /// Whether to bind and run the listener.
  pub request_listener: bool,

  /// Whether to install the interrupt handler.
  pub request_signal_handler: bool,
}

/// A configuration value the manager cannot start with. Fails `run` fatally.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("minimum tick time cannot be less than 1s")]
  MinTickTime,

  #[error("tick time modifier cannot be small or negative")]
  TickTimeModifier,

  #[error("buffer size cannot be zero")]
  BufferSize,

  #[error("worker tick time cannot be zero")]
  WorkerTickTime,
}

// ===== impl Config =====

impl Default for Config {
  fn default() -> Self {
    Self {
      port_number: 7007,
      num_threads: 2,
      buffer_size: 4096,
      read_timeout: Duration::from_secs(3),
      write_timeout: Duration::from_secs(3),
      min_tick_time: 1,
      tick_time_modifier: 1.0,
      death_time: Duration::from_secs(5),
      worker_tick_time: Duration::from_secs(1),
      connection_close_on_shutdown: true,
      request_listener: false,
      request_signal_handler: true,
    }
  }
}

impl Config {
  /// Checks the invariants the tick formula and the read path rely on.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.min_tick_time < 1 {
      return Err(ConfigError::MinTickTime);
    }
    if self.tick_time_modifier < 1.0e-6 {
      return Err(ConfigError::TickTimeModifier);
    }
    if self.buffer_size == 0 {
      return Err(ConfigError::BufferSize);
    }
    if self.worker_tick_time.is_zero() {
      return Err(ConfigError::WorkerTickTime);
    }
    Ok(())
  }

  /// The tick interval for the given connection count:
  /// `min_tick_time + tick_time_modifier · log10(connections + 1)` seconds.
  pub fn tick_interval(&self, connections: usize) -> Duration {
    let scaled = self.tick_time_modifier * ((connections + 1) as f64).log10();
    Duration::from_secs_f64(self.min_tick_time as f64 + scaled)
  }

  /// The read timeout, with zero meaning disabled.
  pub fn read_timeout_opt(&self) -> Option<Duration> {
    (!self.read_timeout.is_zero()).then_some(self.read_timeout)
  }

  /// The write timeout, with zero meaning disabled.
  pub fn write_timeout_opt(&self) -> Option<Duration> {
    (!self.write_timeout.is_zero()).then_some(self.write_timeout)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config_is_valid() {
    assert!(Config::default().validate().is_ok());
  }

  #[test]
  fn test_zero_min_tick_time_is_rejected() {
    let config = Config { min_tick_time: 0, ..Config::default() };
    assert!(matches!(config.validate(), Err(ConfigError::MinTickTime)));
  }

  #[test]
  fn test_small_tick_modifier_is_rejected() {
    let config = Config { tick_time_modifier: 0.0, ..Config::default() };
    assert!(matches!(config.validate(), Err(ConfigError::TickTimeModifier)));
  }

  #[test]
  fn test_zero_buffer_size_is_rejected() {
    let config = Config { buffer_size: 0, ..Config::default() };
    assert!(matches!(config.validate(), Err(ConfigError::BufferSize)));
  }

  #[test]
  fn test_tick_interval_floor_is_min_tick_time() {
    let config = Config { min_tick_time: 2, tick_time_modifier: 1.0, ..Config::default() };
    assert_eq!(config.tick_interval(0), Duration::from_secs(2));
  }

  #[test]
  fn test_tick_interval_grows_logarithmically() {
    let config = Config { min_tick_time: 1, tick_time_modifier: 1.0, ..Config::default() };

    // 10_000 connections: 1 + log10(10_001) ≈ 5 seconds.
    let interval = config.tick_interval(10_000);
    assert!(interval >= Duration::from_secs(5));
    assert!(interval < Duration::from_secs_f64(5.01));
  }

  #[test]
  fn test_zero_timeouts_disable() {
    let config = Config { read_timeout: Duration::ZERO, write_timeout: Duration::ZERO, ..Config::default() };
    assert!(config.read_timeout_opt().is_none());
    assert!(config.write_timeout_opt().is_none());

    let config = Config::default();
    assert_eq!(config.read_timeout_opt(), Some(Duration::from_secs(3)));
  }
}
