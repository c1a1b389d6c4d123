//! Pixdrop session/protocol layer: connection lifecycle, a versioned message
//! protocol, chunked transfers over message channels, and connection health.
//! No I/O of its own; the host owns sockets and timers and drives this crate
//! through notifications.

pub mod events;
pub mod health;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transfer;
pub mod version;
pub mod wire;

pub use events::{EventSink, Status};
pub use health::{HealthMonitor, HEALTH_INTERVAL, MAX_RECONNECT_ATTEMPTS};
pub use protocol::{Message, APP_VERSION, MIN_COMPAT_VERSION};
pub use registry::{Channel, ChannelError, ChannelRegistry, ParticipantId};
pub use scheduler::{Scheduler, TimerToken};
pub use session::{
    SessionError, SessionManager, Transport, TransportError, JOIN_MAX_ATTEMPTS, JOIN_TIMEOUT,
};
pub use transfer::{TransferEngine, CHUNK_PACE_DELAY, CHUNK_THRESHOLD};
pub use version::{classify, Compatibility, SemVer};
pub use wire::{decode_frame, encode_frame, WireError};

#[cfg(test)]
pub(crate) mod testutil;
