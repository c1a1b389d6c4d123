//! Connection health: periodic liveness audit plus the bounded
//! auto-reconnect policy for a participant that lost its only channel.
//! This type only decides; the session executes.

use std::time::Duration;

use crate::scheduler::{Scheduler, TimerToken};

/// Interval between liveness audits while a session is active.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// Auto-reconnect triggers allowed before giving up for good.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

pub struct HealthMonitor {
    active: bool,
    reconnect_attempts: u32,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            active: false,
            reconnect_attempts: 0,
        }
    }

    /// Arm the periodic audit. Idempotent: calling again only re-arms the
    /// tick timer.
    pub fn start(&mut self, scheduler: &dyn Scheduler) {
        self.active = true;
        scheduler.schedule_after(TimerToken::HealthTick, HEALTH_INTERVAL);
    }

    /// Cancel the audit. A no-op when not running.
    pub fn stop(&mut self, scheduler: &dyn Scheduler) {
        if self.active {
            scheduler.cancel(&TimerToken::HealthTick);
            self.active = false;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Re-arm after a tick was handled. Does nothing once stopped.
    pub fn rearm(&self, scheduler: &dyn Scheduler) {
        if self.active {
            scheduler.schedule_after(TimerToken::HealthTick, HEALTH_INTERVAL);
        }
    }

    /// Consume one reconnect attempt. Returns the attempt number to run, or
    /// `None` once the bound is spent. The counter survives a successful
    /// reconnect; only an explicit manual join clears it.
    pub fn next_reconnect(&mut self) -> Option<u32> {
        if self.reconnect_attempts < MAX_RECONNECT_ATTEMPTS {
            self.reconnect_attempts += 1;
            Some(self.reconnect_attempts)
        } else {
            None
        }
    }

    /// A fresh manual join starts the reconnect budget over.
    pub fn reset_attempts(&mut self) {
        self.reconnect_attempts = 0;
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
