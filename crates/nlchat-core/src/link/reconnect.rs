//! Bounded reconnection
//!
//! After the device disappears the session re-opens the last port on a fixed
//! interval. The supervisor only does the bookkeeping: whether it is armed,
//! when it fires next and how many attempts are left.

use std::time::Duration;
use tokio::time::Instant;

use super::{SerialConfig, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL};

/// What to do when the reconnect deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Try to open the port again
    Attempt {
        /// 1-based attempt number
        attempt: u32,
        /// Attempts allowed in total
        max: u32,
    },
    /// Out of attempts (or disabled), the supervisor is now disarmed
    Exhausted,
}

/// Reconnect timer and attempt counter
#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    enabled: bool,
    interval: Duration,
    max_attempts: u32,
    attempts: u32,
    next_fire: Option<Instant>,
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        Self::new(false, DEFAULT_RECONNECT_INTERVAL, DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }
}

impl ReconnectSupervisor {
    /// Create a disarmed supervisor
    pub fn new(enabled: bool, interval: Duration, max_attempts: u32) -> Self {
        Self {
            enabled,
            interval,
            max_attempts,
            attempts: 0,
            next_fire: None,
        }
    }

    /// Supervisor using the reconnect settings of `config`
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(
            config.auto_reconnect,
            config.reconnect_interval,
            config.max_reconnect_attempts,
        )
    }

    /// Replace the settings and reset the attempt counter.
    /// Disabling also disarms.
    pub fn configure(&mut self, enabled: bool, interval: Duration, max_attempts: u32) {
        self.enabled = enabled;
        self.interval = interval;
        self.max_attempts = max_attempts;
        self.attempts = 0;
        if !enabled {
            self.next_fire = None;
        }
    }

    /// Start a fresh round of attempts, the first one `interval` from `now`.
    /// Returns false (and stays disarmed) when auto-reconnect is off or the
    /// interval reaches past the end of the clock.
    pub fn arm(&mut self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        self.attempts = 0;
        self.next_fire = now.checked_add(self.interval);
        self.next_fire.is_some()
    }

    /// Advance after the deadline passed.
    /// The attempt after this one is only scheduled if its deadline is
    /// representable.
    pub fn on_fire(&mut self, now: Instant) -> ReconnectStep {
        if !self.enabled || self.attempts >= self.max_attempts {
            self.next_fire = None;
            return ReconnectStep::Exhausted;
        }
        self.attempts += 1;
        self.next_fire = now.checked_add(self.interval);
        ReconnectStep::Attempt {
            attempt: self.attempts,
            max: self.max_attempts,
        }
    }

    /// The port came back
    pub fn on_success(&mut self) {
        self.attempts = 0;
        self.next_fire = None;
    }

    /// Stop without touching the counter
    pub fn disarm(&mut self) {
        self.next_fire = None;
    }

    /// When the next attempt is due, if armed
    pub fn deadline(&self) -> Option<Instant> {
        self.next_fire
    }

    /// Whether an attempt is scheduled
    pub fn is_armed(&self) -> bool {
        self.next_fire.is_some()
    }

    /// Attempts made in the current round
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether auto-reconnect is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Attempts allowed per round
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay between attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }
}
