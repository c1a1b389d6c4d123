//! Timer seam: the core never sleeps, it asks the host to fire tokens back.

use std::time::Duration;

use crate::registry::ParticipantId;

/// Identifies a pending timer. Scheduling an already pending token re-arms
/// it; there is never more than one live timer per token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerToken {
    /// Per-attempt deadline while a join is outstanding.
    JoinTimeout,
    /// Periodic liveness audit.
    HealthTick,
    /// Inter-chunk pacing delay for one destination's outbound queue.
    ChunkPace(ParticipantId),
}

/// One-shot timers on the host's control loop. When a timer fires the host
/// calls back into the session with the token; a cancelled token must never
/// be delivered afterwards.
pub trait Scheduler: Send {
    fn schedule_after(&self, token: TimerToken, after: Duration);
    fn cancel(&self, token: &TimerToken);
}
