//! Chunked transfer engine: split outbound payloads and pace their
//! transmission per destination; reassemble inbound pieces per sender.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{unix_millis, Message};
use crate::registry::{ChannelRegistry, ParticipantId};
use crate::scheduler::{Scheduler, TimerToken};
use crate::wire::{encode_frame, WireError};

/// Payloads at or below this size travel as a single `Image` message.
pub const CHUNK_THRESHOLD: usize = 16 * 1024;

/// Fixed delay between consecutive chunks on one destination channel.
pub const CHUNK_PACE_DELAY: Duration = Duration::from_millis(100);

/// Ceiling on an announced chunk count; a header above this is ignored
/// rather than allocating an absurd buffer.
pub const MAX_TOTAL_CHUNKS: u32 = 4096;

/// Split a payload into consecutive slices of at most `chunk_size` bytes
/// (the last slice may be shorter). A zero size falls back to the default
/// threshold.
pub fn split_chunks(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let size = if chunk_size == 0 {
        CHUNK_THRESHOLD
    } else {
        chunk_size
    };
    payload.chunks(size).map(|c| c.to_vec()).collect()
}

/// Result of offering one chunk to a reassembly buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; more chunks outstanding.
    Stored,
    /// Stored and the buffer is now complete.
    Completed,
    /// Index at or past the announced total; rejected, not stored.
    OutOfRange,
    /// Slot already filled; ignored so a replay cannot skew the count.
    Duplicate,
}

/// Per-sender accumulator for one in-flight chunked payload.
/// `received_count` can never exceed the announced total: out-of-range and
/// duplicate chunks are refused before counting.
pub struct ReassemblyBuffer {
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl ReassemblyBuffer {
    pub fn new(expected_chunks: usize) -> Self {
        Self {
            slots: vec![None; expected_chunks],
            received: 0,
        }
    }

    pub fn expected_chunks(&self) -> usize {
        self.slots.len()
    }

    pub fn received_count(&self) -> usize {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    pub fn insert(&mut self, index: usize, data: Vec<u8>) -> ChunkOutcome {
        let Some(slot) = self.slots.get_mut(index) else {
            return ChunkOutcome::OutOfRange;
        };
        if slot.is_some() {
            return ChunkOutcome::Duplicate;
        }
        *slot = Some(data);
        self.received += 1;
        if self.is_complete() {
            ChunkOutcome::Completed
        } else {
            ChunkOutcome::Stored
        }
    }

    /// Concatenate all slots in index order. Call only once complete.
    pub fn assemble(self) -> Vec<u8> {
        self.slots.into_iter().flatten().flatten().collect()
    }
}

/// A chunk-count header arrived: allocate a fresh buffer for that sender,
/// discarding any unfinished one. Returns false when the header is ignored
/// (unknown sender or unusable count).
pub fn accept_chunks_info(
    registry: &mut ChannelRegistry,
    from: &ParticipantId,
    total_chunks: u32,
) -> bool {
    let Some(entry) = registry.entry_mut(from) else {
        tracing::debug!(%from, "chunk header from unregistered participant, ignoring");
        return false;
    };
    if total_chunks == 0 || total_chunks > MAX_TOTAL_CHUNKS {
        tracing::debug!(%from, total_chunks, "unusable chunk count, ignoring");
        return false;
    }
    if let Some(old) = &entry.reassembly {
        tracing::debug!(
            %from,
            received = old.received_count(),
            expected = old.expected_chunks(),
            "new chunk series replaces an unfinished one"
        );
    }
    entry.reassembly = Some(ReassemblyBuffer::new(total_chunks as usize));
    true
}

/// One chunk arrived: store it if a buffer is collecting, and return the
/// full payload once the last piece lands. Premature, out-of-range and
/// duplicate chunks are dropped silently (logged at debug only).
pub fn accept_chunk(
    registry: &mut ChannelRegistry,
    from: &ParticipantId,
    index: u32,
    data: Vec<u8>,
) -> Option<Vec<u8>> {
    let entry = registry.entry_mut(from)?;
    let Some(buffer) = entry.reassembly.as_mut() else {
        tracing::debug!(%from, index, "chunk before its header, dropping");
        return None;
    };
    match buffer.insert(index as usize, data) {
        ChunkOutcome::Completed => entry.reassembly.take().map(ReassemblyBuffer::assemble),
        ChunkOutcome::Stored => None,
        ChunkOutcome::OutOfRange => {
            tracing::debug!(%from, index, "chunk index out of range, dropping");
            None
        }
        ChunkOutcome::Duplicate => {
            tracing::debug!(%from, index, "duplicate chunk, dropping");
            None
        }
    }
}

struct OutboundQueue {
    /// Pre-encoded chunk frames, shared across destinations.
    frames: Arc<Vec<Vec<u8>>>,
    next: usize,
}

/// Outbound side of the engine: one paced queue per destination. Queues for
/// different destinations drain independently; losing a chunk is never
/// retried here.
#[derive(Default)]
pub struct TransferEngine {
    outbound: HashMap<ParticipantId, OutboundQueue>,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan a payload out to every open registry entry. Small payloads go as
    /// one `Image` message; larger ones as a header plus a paced chunk
    /// series. A new broadcast replaces any chunks still queued for a
    /// destination.
    pub fn broadcast(
        &mut self,
        payload: &[u8],
        registry: &ChannelRegistry,
        scheduler: &dyn Scheduler,
    ) -> Result<(), WireError> {
        if payload.len() <= CHUNK_THRESHOLD {
            let frame = encode_frame(&Message::Image {
                image_data: payload.to_vec(),
                timestamp: unix_millis(),
            })?;
            for (id, entry) in registry.iter() {
                if !entry.channel().is_open() {
                    continue;
                }
                if let Err(err) = entry.channel().send(&frame) {
                    tracing::warn!(%id, %err, "image send failed");
                }
            }
            return Ok(());
        }

        let chunks = split_chunks(payload, CHUNK_THRESHOLD);
        let total = chunks.len() as u32;
        let header = encode_frame(&Message::ChunksInfo {
            total_chunks: total,
            timestamp: unix_millis(),
        })?;
        let mut frames = Vec::with_capacity(chunks.len());
        for (index, data) in chunks.into_iter().enumerate() {
            frames.push(encode_frame(&Message::Chunk {
                index: index as u32,
                total,
                data,
                timestamp: unix_millis(),
            })?);
        }
        let frames = Arc::new(frames);

        for (id, entry) in registry.iter() {
            if !entry.channel().is_open() {
                continue;
            }
            if let Err(err) = entry.channel().send(&header) {
                tracing::warn!(%id, %err, "chunk header send failed, skipping destination");
                continue;
            }
            self.outbound.insert(
                id.clone(),
                OutboundQueue {
                    frames: Arc::clone(&frames),
                    next: 0,
                },
            );
            scheduler.schedule_after(TimerToken::ChunkPace(id.clone()), CHUNK_PACE_DELAY);
        }
        Ok(())
    }

    /// Pace timer fired for one destination: send its next chunk and re-arm
    /// until the queue drains. A destination that disappeared mid-transfer
    /// just loses its queue.
    pub fn on_pace_timer(
        &mut self,
        peer: &ParticipantId,
        registry: &ChannelRegistry,
        scheduler: &dyn Scheduler,
    ) {
        if !self.outbound.contains_key(peer) {
            return;
        }
        let Some(channel) = registry.channel(peer).filter(|c| c.is_open()) else {
            self.outbound.remove(peer);
            return;
        };
        let more = match self.outbound.get_mut(peer) {
            Some(queue) => {
                if let Some(frame) = queue.frames.get(queue.next) {
                    if let Err(err) = channel.send(frame) {
                        tracing::warn!(%peer, %err, "chunk send failed");
                    }
                    queue.next += 1;
                }
                queue.next < queue.frames.len()
            }
            None => return,
        };
        if more {
            scheduler.schedule_after(TimerToken::ChunkPace(peer.clone()), CHUNK_PACE_DELAY);
        } else {
            self.outbound.remove(peer);
        }
    }

    /// Whether chunks are still queued for a destination.
    pub fn has_outbound(&self, peer: &ParticipantId) -> bool {
        self.outbound.contains_key(peer)
    }

    /// Forget any queued chunks for a destination (its channel closed).
    pub fn clear_outbound(&mut self, peer: &ParticipantId) {
        self.outbound.remove(peer);
    }
}
