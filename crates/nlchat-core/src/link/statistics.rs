//! Link statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters for one session, reset explicitly by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Raw bytes read from the device
    pub bytes_received: u64,
    /// Framed bytes written to the device
    pub bytes_sent: u64,
    /// Packets decoded from the receive buffer
    pub packets_received: u64,
    /// Packets written
    pub packets_sent: u64,
    /// Errors surfaced to the user
    pub errors: u64,
    /// Reconnect attempts made
    pub reconnects: u64,
    /// When counting started
    pub started_at: DateTime<Utc>,
    /// Most recent read
    pub last_receive_at: Option<DateTime<Utc>>,
    /// Most recent write
    pub last_send_at: Option<DateTime<Utc>>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    /// Zeroed counters starting now
    pub fn new() -> Self {
        Self {
            bytes_received: 0,
            bytes_sent: 0,
            packets_received: 0,
            packets_sent: 0,
            errors: 0,
            reconnects: 0,
            started_at: Utc::now(),
            last_receive_at: None,
            last_send_at: None,
        }
    }

    /// Zero every counter and restart the clock
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// A read returned `len` bytes
    pub fn record_received(&mut self, len: usize) {
        self.bytes_received = self.bytes_received.saturating_add(len as u64);
        self.last_receive_at = Some(Utc::now());
    }

    /// One packet was decoded
    pub fn record_packet_received(&mut self) {
        self.packets_received = self.packets_received.saturating_add(1);
    }

    /// One framed packet of `len` bytes was written
    pub fn record_sent(&mut self, len: usize) {
        self.bytes_sent = self.bytes_sent.saturating_add(len as u64);
        self.packets_sent = self.packets_sent.saturating_add(1);
        self.last_send_at = Some(Utc::now());
    }

    /// An error was surfaced
    pub fn record_error(&mut self) {
        self.errors = self.errors.saturating_add(1);
    }

    /// A reconnect attempt started
    pub fn record_reconnect(&mut self) {
        self.reconnects = self.reconnects.saturating_add(1);
    }

    /// Time since counting started
    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut stats = Statistics::new();
        stats.record_received(10);
        stats.record_received(5);
        stats.record_packet_received();
        stats.record_sent(4);
        stats.record_error();
        stats.record_reconnect();

        assert_eq!(stats.bytes_received, 15);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.reconnects, 1);
        assert!(stats.last_receive_at.is_some());
        assert!(stats.last_send_at.is_some());
    }

    #[test]
    fn test_reset() {
        let mut stats = Statistics::new();
        let before = stats.started_at;
        stats.record_received(3);
        stats.reset();

        assert_eq!(stats.bytes_received, 0);
        assert!(stats.last_receive_at.is_none());
        assert!(stats.started_at >= before);
    }

    #[test]
    fn test_counters_saturate() {
        let mut stats = Statistics::new();
        stats.bytes_received = u64::MAX - 1;
        stats.record_received(10);
        assert_eq!(stats.bytes_received, u64::MAX);
    }

    #[test]
    fn test_serializes_timestamps() {
        let stats = Statistics::new();
        let json = serde_json::to_value(&stats).unwrap();
        assert!(json["started_at"].is_string());
        assert!(json["last_send_at"].is_null());
    }
}
