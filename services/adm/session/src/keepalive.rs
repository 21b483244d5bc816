//! Heartbeat supervision.
//!
//! The device pings every `effective_interval` and declares the hub dead
//! after two intervals without a sign of life, mirroring the hub's own
//! two-missed-heartbeats rule. The hub may impose another interval at any
//! time; the next ping is rescheduled immediately.

use crate::config::Liveness;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Missed intervals before the connection is declared dead
pub const MISSED_INTERVALS: u32 = 2;

/// Heartbeat timing state for one connection
#[derive(Debug, Clone)]
pub struct HeartbeatSupervisor {
    requested: Duration,
    effective: Duration,
    liveness: Liveness,
    next_ping_at: Instant,
    last_sent_at: Option<Instant>,
    last_ack_at: Option<Instant>,
    last_alive_at: Instant,
}

impl HeartbeatSupervisor {
    /// Start supervising a connection established at `now`
    pub fn new(requested: Duration, liveness: Liveness, now: Instant) -> Self {
        let requested = requested.max(Duration::from_secs(1));
        Self {
            requested,
            effective: requested,
            liveness,
            next_ping_at: now + requested,
            last_sent_at: None,
            last_ack_at: None,
            last_alive_at: now,
        }
    }

    /// Interval the device asked for
    pub fn requested_interval(&self) -> Duration {
        self.requested
    }

    /// Interval currently in force
    pub fn effective_interval(&self) -> Duration {
        self.effective
    }

    /// When the next ping is due
    pub fn next_ping_at(&self) -> Instant {
        self.next_ping_at
    }

    /// When the last ping went out
    pub fn last_sent_at(&self) -> Option<Instant> {
        self.last_sent_at
    }

    /// When the hub last acknowledged
    pub fn last_ack_at(&self) -> Option<Instant> {
        self.last_ack_at
    }

    /// One and a half intervals of silence: the connection is suspect
    pub fn suspect_at(&self) -> Instant {
        self.last_alive_at + self.effective + self.effective / 2
    }

    /// Two intervals of silence: the connection is dead
    pub fn dead_at(&self) -> Instant {
        self.last_alive_at + self.effective * MISSED_INTERVALS
    }

    /// Whether the hub has been silent too long
    pub fn is_dead(&self, now: Instant) -> bool {
        now >= self.dead_at()
    }

    /// Silence tolerated before declaring the hub dead
    pub fn timeout(&self) -> Duration {
        self.effective * MISSED_INTERVALS
    }

    /// A ping was handed to the writer
    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
        self.next_ping_at = now + self.effective;
    }

    /// The hub acknowledged a heartbeat
    pub fn on_ack(&mut self, now: Instant) {
        self.last_ack_at = Some(now);
        self.last_alive_at = now;
    }

    /// Any envelope arrived from the hub
    pub fn on_traffic(&mut self, now: Instant) {
        if self.liveness == Liveness::AnyTraffic {
            self.last_alive_at = now;
        }
    }

    /// Apply a hub-imposed interval and reschedule the next ping from `now`
    pub fn apply_override(&mut self, interval: Duration, now: Instant) {
        if interval.is_zero() {
            debug!("Ignoring zero heartbeat interval");
            return;
        }
        if interval != self.effective {
            info!(
                "Hub set heartbeat interval to {:?} (requested {:?})",
                interval, self.requested
            );
        }
        self.effective = interval;
        self.next_ping_at = now + interval;
    }
}
