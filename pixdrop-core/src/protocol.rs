//! Pixdrop wire protocol: message types and announced versions.

use serde::{Deserialize, Serialize};

use crate::version::SemVer;

/// Version this build announces to every new channel.
pub const APP_VERSION: SemVer = SemVer::new(1, 1, 0);

/// Oldest peer version this build will fully interoperate with.
pub const MIN_COMPAT_VERSION: SemVer = SemVer::new(1, 0, 0);

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
/// Exactly one message crosses the transport boundary per frame; nothing here holds UI state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Sent once per new channel, by either side: announced version plus the
    /// oldest version the sender still accepts.
    Version {
        version: String,
        min_compatible: String,
    },
    /// Reply to `Version`: whether the receiver considers both sides compatible.
    VersionAck { compatible: bool },
    /// Liveness probe.
    Test { message: String, timestamp: u64 },
    /// Reply to `Test`, echoing the probe text.
    TestAck { message: String, timestamp: u64 },
    /// Host-only greeting after a channel opens.
    HostAck { message: String, timestamp: u64 },
    /// Whole payload small enough to skip chunking.
    Image { image_data: Vec<u8>, timestamp: u64 },
    /// Announces an incoming chunk series.
    ChunksInfo { total_chunks: u32, timestamp: u64 },
    /// Reply to `ChunksInfo`.
    ChunksInfoAck { message: String, timestamp: u64 },
    /// One piece of a chunked payload.
    Chunk {
        index: u32,
        total: u32,
        data: Vec<u8>,
        timestamp: u64,
    },
    /// Reply once a chunked payload has been fully reassembled.
    ImageAck { message: String, timestamp: u64 },
}

/// Milliseconds since the Unix epoch, for message timestamps. Saturates to 0
/// on a clock before the epoch rather than failing.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
