//! Presentation seam: the session reports through this interface and never
//! touches UI state directly.

use std::fmt;

use crate::registry::ParticipantId;
use crate::version::Compatibility;

/// Everything the embedding UI needs to hear from the session layer.
pub trait EventSink: Send {
    fn status_changed(&self, status: Status);
    /// A complete inbound payload, ready to display.
    fn image_ready(&self, from: &ParticipantId, image: Vec<u8>);
    fn peer_count_changed(&self, count: usize);
}

/// User-visible session status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    SessionCreated { address: String },
    Connecting { address: String, attempt: u32 },
    PeerConnected { participant: ParticipantId },
    PeerDisconnected { participant: ParticipantId },
    JoinFailed,
    Reconnecting { attempt: u32 },
    ReconnectFailed,
    NothingToSend,
    VersionMismatch {
        remote: String,
        compatibility: Compatibility,
    },
    ChannelError {
        participant: ParticipantId,
        detail: String,
    },
    SendFailed { detail: String },
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::SessionCreated { address } => {
                write!(f, "session created, share this address: {address}")
            }
            Status::Connecting { address, attempt } => {
                write!(f, "connecting to {address} (attempt {attempt})")
            }
            Status::PeerConnected { participant } => {
                write!(f, "participant connected: {participant}")
            }
            Status::PeerDisconnected { participant } => {
                write!(f, "participant disconnected: {participant}")
            }
            Status::JoinFailed => f.write_str("could not join session: no response from host"),
            Status::Reconnecting { attempt } => {
                write!(f, "connection lost, reconnecting (attempt {attempt})")
            }
            Status::ReconnectFailed => f.write_str("reconnection failed, giving up"),
            Status::NothingToSend => f.write_str("no connected participants, image not sent"),
            Status::VersionMismatch {
                remote,
                compatibility,
            } => write!(f, "peer announces version {remote}: {compatibility}"),
            Status::ChannelError {
                participant,
                detail,
            } => write!(f, "channel error with {participant}: {detail}"),
            Status::SendFailed { detail } => write!(f, "image could not be sent: {detail}"),
        }
    }
}
