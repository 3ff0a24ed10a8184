//! Periodic liveness watchdog.
//!
//! A [`Pulse`] counts silent ticks: any inbound block resets the counter,
//! and when the counter climbs past the configured limit the tick reports
//! `true` so the owner can take its role-specific action (the service kicks
//! the peer, the bot sends a proactive heartbeat). The pulse is designed to
//! live inside the connection's `select!` loop; it never spawns a task of
//! its own.

use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Role-driven tick counter over a periodic timer.
pub struct Pulse {
    interval: Interval,
    count: u32,
    limit: u32,
    active: bool,
}

impl Pulse {
    /// Create a pulse firing every `period`, tolerating `limit` silent
    /// ticks before reporting.
    ///
    /// The bot role passes `limit = 0` so every silent tick reports; the
    /// service role passes its configured limit so the report comes after
    /// `limit + 1` silent ticks.
    pub fn new(period: Duration, limit: u32) -> Self {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            count: 0,
            limit,
            active: true,
        }
    }

    /// Wait for the next tick. Returns `true` when the silent-tick counter
    /// exceeded the limit (the counter is then zeroed).
    ///
    /// After [`clear`](Self::clear) this pends forever, which parks the
    /// pulse arm of a `select!` loop.
    pub async fn tick(&mut self) -> bool {
        if !self.active {
            return std::future::pending().await;
        }

        self.interval.tick().await;
        self.count += 1;
        if self.count > self.limit {
            self.count = 0;
            true
        } else {
            false
        }
    }

    /// Zero the silent-tick counter. Called on every inbound block.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Stop the watchdog and zero the counter. Idempotent.
    pub fn clear(&mut self) {
        self.count = 0;
        self.active = false;
    }

    /// Current silent-tick count.
    #[cfg(test)]
    fn count(&self) -> u32 {
        self.count
    }
}
