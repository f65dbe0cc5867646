//! Process-wide session counters.
//!
//! Every counter is a relaxed `AtomicU64`; readers take a
//! [`MetricsSnapshot`]. The pump records failures it logs and swallows here
//! (decode errors, dropped sends) so they stay visible without a subscriber.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Counter {
    ConnectionsOpened,
    ConnectionsActive,
    HandshakesStarted,
    HandshakesAccepted,
    HandshakesRefused,
    MessagesSent,
    MessagesReceived,
    BytesSent,
    BytesReceived,
    MessagesDropped,
    DecodeErrors,
    CompressionAttempts,
    CompressionWins,
    Relayed,
}

const COUNTERS: usize = Counter::Relayed as usize + 1;

/// Counter set shared by every session in the process
#[derive(Debug)]
pub struct Metrics {
    counters: [AtomicU64; COUNTERS],
    started: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            started: Instant::now(),
        }
    }

    fn add(&self, counter: Counter, n: u64) {
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn connection_established(&self) {
        self.add(Counter::ConnectionsOpened, 1);
        self.add(Counter::ConnectionsActive, 1);
    }

    /// The active gauge saturates at zero
    pub fn connection_closed(&self) {
        let _ = self.counters[Counter::ConnectionsActive as usize].fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |v| Some(v.saturating_sub(1)),
        );
    }

    pub fn handshake_attempt(&self) {
        self.add(Counter::HandshakesStarted, 1);
    }

    pub fn handshake_success(&self) {
        self.add(Counter::HandshakesAccepted, 1);
    }

    /// Refused for capacity or authentication
    pub fn handshake_failed(&self) {
        self.add(Counter::HandshakesRefused, 1);
    }

    /// A frame handed to the transport
    pub fn message_sent(&self, byte_count: u64) {
        self.add(Counter::MessagesSent, 1);
        self.add(Counter::BytesSent, byte_count);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.add(Counter::MessagesReceived, 1);
        self.add(Counter::BytesReceived, byte_count);
    }

    pub fn message_dropped(&self) {
        self.add(Counter::MessagesDropped, 1);
    }

    pub fn decode_error(&self) {
        self.add(Counter::DecodeErrors, 1);
    }

    pub fn compression_attempt(&self) {
        self.add(Counter::CompressionAttempts, 1);
    }

    /// Compression produced a strictly smaller frame
    pub fn compression_success(&self) {
        self.add(Counter::CompressionWins, 1);
    }

    pub fn relayed_message(&self) {
        self.add(Counter::Relayed, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.get(Counter::ConnectionsOpened),
            connections_active: self.get(Counter::ConnectionsActive),
            handshakes_total: self.get(Counter::HandshakesStarted),
            handshakes_success: self.get(Counter::HandshakesAccepted),
            handshakes_failed: self.get(Counter::HandshakesRefused),
            messages_sent: self.get(Counter::MessagesSent),
            messages_received: self.get(Counter::MessagesReceived),
            bytes_sent: self.get(Counter::BytesSent),
            bytes_received: self.get(Counter::BytesReceived),
            messages_dropped: self.get(Counter::MessagesDropped),
            decode_errors: self.get(Counter::DecodeErrors),
            compression_total: self.get(Counter::CompressionAttempts),
            compression_success: self.get(Counter::CompressionWins),
            relayed_messages: self.get(Counter::Relayed),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    /// Emit the current counters as one debug event
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        debug!(
            connections_active = s.connections_active,
            handshakes_failed = s.handshakes_failed,
            messages_sent = s.messages_sent,
            messages_received = s.messages_received,
            messages_dropped = s.messages_dropped,
            decode_errors = s.decode_errors,
            compression_ratio = s.compression_ratio(),
            relayed = s.relayed_messages,
            uptime_seconds = s.uptime_seconds,
            "Session metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_dropped: u64,
    pub decode_errors: u64,
    pub compression_total: u64,
    pub compression_success: u64,
    pub relayed_messages: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Share of compression attempts that shrank the frame
    pub fn compression_ratio(&self) -> f64 {
        if self.compression_total == 0 {
            0.0
        } else {
            self.compression_success as f64 / self.compression_total as f64
        }
    }
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
