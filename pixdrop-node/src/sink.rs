//! Presentation sink: status lines go to the log, received images land in
//! the inbox directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use pixdrop_core::protocol::unix_millis;
use pixdrop_core::{EventSink, ParticipantId, Status};

pub struct InboxSink {
    inbox: PathBuf,
    seq: AtomicU64,
}

impl InboxSink {
    pub fn new(inbox: PathBuf) -> Self {
        Self {
            inbox,
            seq: AtomicU64::new(0),
        }
    }
}

impl EventSink for InboxSink {
    fn status_changed(&self, status: Status) {
        tracing::info!("{status}");
    }

    fn image_ready(&self, from: &ParticipantId, image: Vec<u8>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}-{}-{}.{}",
            unix_millis(),
            from,
            seq,
            extension_for(&image)
        );
        let path = self.inbox.join(name);
        let stored = std::fs::create_dir_all(&self.inbox).and_then(|()| std::fs::write(&path, &image));
        match stored {
            Ok(()) => {
                tracing::info!(path = %path.display(), bytes = image.len(), "image received")
            }
            Err(err) => tracing::warn!(%err, "could not store received image"),
        }
    }

    fn peer_count_changed(&self, count: usize) {
        tracing::info!(count, "participants connected");
    }
}

/// Pick a file extension from the payload's magic bytes.
fn extension_for(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else if data.starts_with(&[0xff, 0xd8, 0xff]) {
        "jpg"
    } else if data.starts_with(b"GIF8") {
        "gif"
    } else {
        "bin"
    }
}
