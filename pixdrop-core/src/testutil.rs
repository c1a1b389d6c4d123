//! Recording doubles for the host-facing seams, shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::events::{EventSink, Status};
use crate::protocol::Message;
use crate::registry::{Channel, ChannelError, ParticipantId};
use crate::scheduler::{Scheduler, TimerToken};
use crate::session::{Transport, TransportError};
use crate::wire::decode_frame;

#[derive(Clone)]
pub(crate) struct FakeChannel {
    open: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeChannel {
    pub(crate) fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
            failing: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Relaxed);
    }

    pub(crate) fn fail_sends(&self) {
        self.failing.store(true, Ordering::Relaxed);
    }

    pub(crate) fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("lock poisoned").clone()
    }
}

impl Channel for FakeChannel {
    fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().expect("lock poisoned").push(frame.to_vec());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/// Decode every frame a fake channel recorded.
pub(crate) fn decode_sent(channel: &FakeChannel) -> Vec<Message> {
    channel
        .sent_frames()
        .iter()
        .map(|f| decode_frame(f).expect("recorded frame must decode").0)
        .collect()
}

#[derive(Clone)]
pub(crate) struct FakeScheduler {
    scheduled: Arc<Mutex<Vec<(TimerToken, Duration)>>>,
    cancelled: Arc<Mutex<Vec<TimerToken>>>,
}

impl FakeScheduler {
    pub(crate) fn new() -> Self {
        Self {
            scheduled: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn scheduled(&self) -> Vec<(TimerToken, Duration)> {
        self.scheduled.lock().expect("lock poisoned").clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<TimerToken> {
        self.cancelled.lock().expect("lock poisoned").clone()
    }
}

impl Scheduler for FakeScheduler {
    fn schedule_after(&self, token: TimerToken, after: Duration) {
        self.scheduled
            .lock()
            .expect("lock poisoned")
            .push((token, after));
    }

    fn cancel(&self, token: &TimerToken) {
        self.cancelled
            .lock()
            .expect("lock poisoned")
            .push(token.clone());
    }
}

#[derive(Clone)]
pub(crate) struct FakeTransport {
    address: String,
    failing: Arc<AtomicBool>,
    opens: Arc<Mutex<u32>>,
    connects: Arc<Mutex<Vec<String>>>,
    closes: Arc<Mutex<u32>>,
}

impl FakeTransport {
    pub(crate) fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            failing: Arc::new(AtomicBool::new(false)),
            opens: Arc::new(Mutex::new(0)),
            connects: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(Mutex::new(0)),
        }
    }

    pub(crate) fn failing(address: &str) -> Self {
        let t = Self::new(address);
        t.failing.store(true, Ordering::Relaxed);
        t
    }

    pub(crate) fn connects(&self) -> Vec<String> {
        self.connects.lock().expect("lock poisoned").clone()
    }

    pub(crate) fn close_count(&self) -> u32 {
        *self.closes.lock().expect("lock poisoned")
    }
}

impl Transport for FakeTransport {
    fn open_endpoint(&mut self) -> Result<String, TransportError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(TransportError::Unavailable("endpoint refused".into()));
        }
        *self.opens.lock().expect("lock poisoned") += 1;
        Ok(self.address.clone())
    }

    fn connect(&mut self, address: &str) {
        self.connects
            .lock()
            .expect("lock poisoned")
            .push(address.to_string());
    }

    fn close_endpoint(&mut self) {
        *self.closes.lock().expect("lock poisoned") += 1;
    }
}

#[derive(Clone)]
pub(crate) struct FakeSink {
    statuses: Arc<Mutex<Vec<Status>>>,
    images: Arc<Mutex<Vec<(ParticipantId, Vec<u8>)>>>,
    counts: Arc<Mutex<Vec<usize>>>,
}

impl FakeSink {
    pub(crate) fn new() -> Self {
        Self {
            statuses: Arc::new(Mutex::new(Vec::new())),
            images: Arc::new(Mutex::new(Vec::new())),
            counts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn statuses(&self) -> Vec<Status> {
        self.statuses.lock().expect("lock poisoned").clone()
    }

    pub(crate) fn images(&self) -> Vec<(ParticipantId, Vec<u8>)> {
        self.images.lock().expect("lock poisoned").clone()
    }

    pub(crate) fn counts(&self) -> Vec<usize> {
        self.counts.lock().expect("lock poisoned").clone()
    }
}

impl EventSink for FakeSink {
    fn status_changed(&self, status: Status) {
        self.statuses.lock().expect("lock poisoned").push(status);
    }

    fn image_ready(&self, from: &ParticipantId, image: Vec<u8>) {
        self.images
            .lock()
            .expect("lock poisoned")
            .push((from.clone(), image));
    }

    fn peer_count_changed(&self, count: usize) {
        self.counts.lock().expect("lock poisoned").push(count);
    }
}
