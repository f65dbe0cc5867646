//! Fake packet loss and latency for testing under adverse network conditions.
//!
//! Loss only ever applies to unreliable sends: reliable delivery is the
//! transport's promise and the conditioner does not break it. Latency applies
//! to everything and is constant, so per-link ordering is preserved.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TransportConfig;
use crate::transport::SendFlags;

/// Applies artificial loss and latency to outgoing messages
#[derive(Debug)]
pub struct LinkConditioner {
    loss_percent: f32,
    latency: Duration,
    rng: StdRng,
}

impl LinkConditioner {
    /// Create a conditioner from a loss percentage (0-100) and a one-way latency
    pub fn new(loss_percent: f32, latency_ms: u32) -> Self {
        Self {
            loss_percent: loss_percent.clamp(0.0, 100.0),
            latency: Duration::from_millis(u64::from(latency_ms)),
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic variant for tests
    pub fn seeded(loss_percent: f32, latency_ms: u32, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(loss_percent, latency_ms)
        }
    }

    /// A conditioner that never drops or delays
    pub fn disabled() -> Self {
        Self::new(0.0, 0)
    }

    /// Build from the transport's fault-injection settings
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.fake_packet_loss_percent, config.fake_latency_ms)
    }

    /// Whether any condition is applied at all
    pub fn is_active(&self) -> bool {
        self.loss_percent > 0.0 || !self.latency.is_zero()
    }

    /// One-way latency applied to each send
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Decide whether this send is lost
    pub fn should_drop(&mut self, flags: SendFlags) -> bool {
        if flags.is_reliable() || self.loss_percent <= 0.0 {
            return false;
        }
        self.rng.random::<f32>() * 100.0 < self.loss_percent
    }

    /// When a message sent at `now` becomes visible to the receiver
    pub fn delivery_time(&self, now: Instant) -> Instant {
        now + self.latency
    }
}

impl Default for LinkConditioner {
    fn default() -> Self {
        Self::disabled()
    }
}
