//! Channel registry: one entry per remote participant, keyed by the
//! transport-assigned id. Holds the live channel handle and any in-progress
//! reassembly for that participant.

use std::collections::HashMap;
use std::fmt;

use crate::transfer::ReassemblyBuffer;

/// Opaque participant identifier assigned by the transport. Stable for the
/// lifetime of a channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

/// One established message path to a participant. Sends are non-blocking and
/// fire-and-forget; delivery failures surface asynchronously through the
/// transport's close/error notifications.
pub trait Channel: Send {
    fn send(&self, frame: &[u8]) -> Result<(), ChannelError>;
    fn is_open(&self) -> bool;
}

/// Per-participant state: the channel itself plus an optional in-flight
/// reassembly. The buffer dies with the entry, so a closed channel can never
/// leak a partial payload.
pub struct RegistryEntry {
    pub(crate) channel: Box<dyn Channel>,
    pub(crate) reassembly: Option<ReassemblyBuffer>,
}

impl RegistryEntry {
    pub fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }
}

/// All live participants. At most one entry per id: an open for an already
/// registered participant replaces the old entry outright.
#[derive(Default)]
pub struct ChannelRegistry {
    entries: HashMap<ParticipantId, RegistryEntry>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing (never duplicating) any previous entry
    /// for the same participant. A replaced entry's reassembly state is
    /// dropped with it.
    pub fn insert(&mut self, id: ParticipantId, channel: Box<dyn Channel>) {
        self.entries.insert(
            id,
            RegistryEntry {
                channel,
                reassembly: None,
            },
        );
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<RegistryEntry> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn channel(&self, id: &ParticipantId) -> Option<&dyn Channel> {
        self.entries.get(id).map(|e| e.channel.as_ref())
    }

    pub(crate) fn entry_mut(&mut self, id: &ParticipantId) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(id)
    }

    /// Ids of all registered participants, in no particular order.
    pub fn participants(&self) -> Vec<ParticipantId> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &RegistryEntry)> {
        self.entries.iter()
    }

    /// Drop every entry whose channel no longer reports open, returning the
    /// pruned ids. Entries removed here are treated as already closed.
    pub fn prune_closed(&mut self) -> Vec<ParticipantId> {
        let dead: Vec<ParticipantId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.channel.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            self.entries.remove(id);
        }
        dead
    }
}
