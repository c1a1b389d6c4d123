//! Session manager: lifecycle orchestration, connection wiring and inbound
//! message dispatch. The host feeds transport notifications and fired timers
//! in; everything else flows out through the channel handles, the scheduler
//! and the event sink.

use std::time::Duration;

use crate::events::{EventSink, Status};
use crate::health::HealthMonitor;
use crate::protocol::{unix_millis, Message, APP_VERSION, MIN_COMPAT_VERSION};
use crate::registry::{Channel, ChannelRegistry, ParticipantId};
use crate::scheduler::{Scheduler, TimerToken};
use crate::transfer::{self, TransferEngine};
use crate::version::{classify, Compatibility, SemVer};
use crate::wire;

/// Per-attempt deadline while dialing a session.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect attempts per join call, counting the first.
pub const JOIN_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
}

/// The point-to-point transport, consumed as an opaque capability. Channel
/// opens, closes, errors and inbound frames come back asynchronously through
/// the session's `on_*` notification methods.
pub trait Transport: Send {
    /// Open the local endpoint and return its address. Idempotent: an
    /// already-open endpoint returns its existing address.
    fn open_endpoint(&mut self) -> Result<String, TransportError>;
    /// Start dialing a remote endpoint. Fire-and-forget: success arrives
    /// later as a channel-open notification, failure as silence (the join
    /// timeout covers it).
    fn connect(&mut self, address: &str);
    /// Tear the local endpoint down.
    fn close_endpoint(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    TransportUnavailable(#[from] TransportError),
    #[error("a join attempt is already in progress")]
    JoinInProgress,
    #[error("a session is already active")]
    AlreadyActive,
}

struct JoinState {
    address: String,
    attempt: u32,
}

pub struct SessionManager {
    transport: Box<dyn Transport>,
    scheduler: Box<dyn Scheduler>,
    sink: Box<dyn EventSink>,
    registry: ChannelRegistry,
    engine: TransferEngine,
    monitor: HealthMonitor,
    is_host: bool,
    /// The session identifier: our own address when hosting, the host's
    /// address when joined. Survives a lost connection so reconnection knows
    /// where to go.
    session_address: Option<String>,
    join: Option<JoinState>,
    local_version: SemVer,
    local_min: SemVer,
    peer_compat: Option<Compatibility>,
}

impl SessionManager {
    pub fn new(
        transport: Box<dyn Transport>,
        scheduler: Box<dyn Scheduler>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        Self::with_versions(transport, scheduler, sink, APP_VERSION, MIN_COMPAT_VERSION)
    }

    pub fn with_versions(
        transport: Box<dyn Transport>,
        scheduler: Box<dyn Scheduler>,
        sink: Box<dyn EventSink>,
        local_version: SemVer,
        local_min: SemVer,
    ) -> Self {
        Self {
            transport,
            scheduler,
            sink,
            registry: ChannelRegistry::new(),
            engine: TransferEngine::new(),
            monitor: HealthMonitor::new(),
            is_host: false,
            session_address: None,
            join: None,
            local_version,
            local_min,
            peer_compat: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn session_address(&self) -> Option<&str> {
        self.session_address.as_deref()
    }

    pub fn participant_count(&self) -> usize {
        self.registry.len()
    }

    /// Compatibility of the most recently negotiated peer, if any.
    pub fn peer_compatibility(&self) -> Option<Compatibility> {
        self.peer_compat
    }

    /// Open the local endpoint and become host. The returned address is the
    /// session identifier other participants join with.
    pub fn create_session(&mut self) -> Result<String, SessionError> {
        if self.session_address.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        let address = self.transport.open_endpoint()?;
        self.is_host = true;
        self.session_address = Some(address.clone());
        self.monitor.start(self.scheduler.as_ref());
        tracing::info!(%address, "session created");
        self.sink.status_changed(Status::SessionCreated {
            address: address.clone(),
        });
        Ok(address)
    }

    /// Join the session at `address`. One join at a time; a fresh manual
    /// join also restores the auto-reconnect budget.
    pub fn join_session(&mut self, address: &str) -> Result<(), SessionError> {
        if self.is_host {
            return Err(SessionError::AlreadyActive);
        }
        if self.join.is_some() {
            return Err(SessionError::JoinInProgress);
        }
        self.monitor.reset_attempts();
        self.start_join(address)
    }

    fn start_join(&mut self, address: &str) -> Result<(), SessionError> {
        if self.join.is_some() {
            return Err(SessionError::JoinInProgress);
        }
        let local = self.transport.open_endpoint()?;
        tracing::debug!(%local, %address, "dialing session host");
        self.session_address = Some(address.to_string());
        self.join = Some(JoinState {
            address: address.to_string(),
            attempt: 1,
        });
        self.transport.connect(address);
        self.scheduler
            .schedule_after(TimerToken::JoinTimeout, JOIN_TIMEOUT);
        self.sink.status_changed(Status::Connecting {
            address: address.to_string(),
            attempt: 1,
        });
        Ok(())
    }

    /// Broadcast a payload to every connected participant.
    pub fn broadcast_image(&mut self, payload: &[u8]) {
        if self.registry.is_empty() {
            self.sink.status_changed(Status::NothingToSend);
            return;
        }
        if let Err(err) = self
            .engine
            .broadcast(payload, &self.registry, self.scheduler.as_ref())
        {
            tracing::warn!(%err, "broadcast failed");
            self.sink.status_changed(Status::SendFailed {
                detail: err.to_string(),
            });
        }
    }

    /// Fire a liveness probe at every connected participant.
    pub fn send_test_probe(&mut self) {
        let msg = Message::Test {
            message: "ping".to_string(),
            timestamp: unix_millis(),
        };
        for id in self.registry.participants() {
            self.send_to(&id, &msg);
        }
    }

    /// Transport notification: a channel to `id` finished opening, whether
    /// we dialed or accepted. Replaces any previous entry for the same id.
    pub fn on_channel_opened(&mut self, id: ParticipantId, channel: Box<dyn Channel>) {
        if self.join.take().is_some() {
            self.scheduler.cancel(&TimerToken::JoinTimeout);
        }
        self.registry.insert(id.clone(), channel);
        tracing::info!(%id, peers = self.registry.len(), "channel open");
        self.send_to(
            &id,
            &Message::Version {
                version: self.local_version.to_string(),
                min_compatible: self.local_min.to_string(),
            },
        );
        if self.is_host {
            self.send_to(
                &id,
                &Message::HostAck {
                    message: "welcome".to_string(),
                    timestamp: unix_millis(),
                },
            );
        }
        if !self.monitor.is_active() {
            self.monitor.start(self.scheduler.as_ref());
        }
        self.sink.peer_count_changed(self.registry.len());
        self.sink
            .status_changed(Status::PeerConnected { participant: id });
    }

    /// Transport notification: the channel to `id` closed. Reassembly state
    /// dies with the entry; a joiner left with no channels starts the
    /// reconnection path.
    pub fn on_channel_closed(&mut self, id: &ParticipantId) {
        if self.registry.remove(id).is_none() {
            return;
        }
        self.engine.clear_outbound(id);
        self.scheduler.cancel(&TimerToken::ChunkPace(id.clone()));
        tracing::info!(%id, peers = self.registry.len(), "channel closed");
        self.sink.peer_count_changed(self.registry.len());
        self.sink.status_changed(Status::PeerDisconnected {
            participant: id.clone(),
        });
        if self.should_reconnect() {
            self.try_reconnect();
        }
    }

    /// Transport notification: channel-level error. Surfaced only; whether
    /// the channel survives is the transport's call.
    pub fn on_channel_error(&mut self, id: &ParticipantId, detail: &str) {
        tracing::warn!(%id, detail, "channel error");
        self.sink.status_changed(Status::ChannelError {
            participant: id.clone(),
            detail: detail.to_string(),
        });
    }

    /// Transport notification: one inbound frame from `id`. Undecodable
    /// frames (including kinds newer than this build) are ignored.
    pub fn on_frame(&mut self, from: &ParticipantId, bytes: &[u8]) {
        match wire::decode_frame(bytes) {
            Ok((msg, _)) => self.dispatch(from, msg),
            Err(err) => {
                tracing::debug!(%from, %err, "undecodable frame, ignoring");
            }
        }
    }

    /// A timer the session armed earlier has fired. Stale tokens (cancelled
    /// after firing, or for state that no longer exists) are harmless.
    pub fn on_timer(&mut self, token: TimerToken) {
        match token {
            TimerToken::JoinTimeout => self.on_join_timeout(),
            TimerToken::HealthTick => self.on_health_tick(),
            TimerToken::ChunkPace(peer) => {
                self.engine
                    .on_pace_timer(&peer, &self.registry, self.scheduler.as_ref());
            }
        }
    }

    /// Tear the session down: stop monitoring, drop every channel, close the
    /// endpoint.
    pub fn shutdown(&mut self) {
        self.monitor.stop(self.scheduler.as_ref());
        if self.join.take().is_some() {
            self.scheduler.cancel(&TimerToken::JoinTimeout);
        }
        for id in self.registry.participants() {
            self.scheduler.cancel(&TimerToken::ChunkPace(id.clone()));
            self.engine.clear_outbound(&id);
            self.registry.remove(&id);
        }
        self.transport.close_endpoint();
        self.session_address = None;
        self.is_host = false;
    }

    fn dispatch(&mut self, from: &ParticipantId, msg: Message) {
        match msg {
            Message::Version {
                version,
                min_compatible,
            } => self.on_version(from, &version, &min_compatible),
            Message::VersionAck { compatible } => {
                tracing::debug!(%from, compatible, "version acknowledged");
            }
            Message::Test { message, .. } => {
                self.send_to(
                    from,
                    &Message::TestAck {
                        message,
                        timestamp: unix_millis(),
                    },
                );
            }
            Message::TestAck { message, .. } => {
                tracing::debug!(%from, %message, "test acknowledged");
            }
            Message::HostAck { message, .. } => {
                tracing::info!(%from, %message, "host greeting");
            }
            Message::Image { image_data, .. } => {
                self.sink.image_ready(from, image_data);
            }
            Message::ChunksInfo { total_chunks, .. } => {
                if transfer::accept_chunks_info(&mut self.registry, from, total_chunks) {
                    self.send_to(
                        from,
                        &Message::ChunksInfoAck {
                            message: "ready".to_string(),
                            timestamp: unix_millis(),
                        },
                    );
                }
            }
            Message::ChunksInfoAck { .. } => {
                tracing::debug!(%from, "chunk header acknowledged");
            }
            Message::Chunk { index, data, .. } => {
                if let Some(payload) = transfer::accept_chunk(&mut self.registry, from, index, data)
                {
                    self.sink.image_ready(from, payload);
                    self.send_to(
                        from,
                        &Message::ImageAck {
                            message: "image received".to_string(),
                            timestamp: unix_millis(),
                        },
                    );
                }
            }
            Message::ImageAck { .. } => {
                tracing::debug!(%from, "image acknowledged");
            }
        }
    }

    fn on_version(&mut self, from: &ParticipantId, version: &str, min_compatible: &str) {
        let compat = match (SemVer::parse(version), SemVer::parse(min_compatible)) {
            (Ok(remote), Ok(remote_min)) => {
                classify(self.local_version, self.local_min, remote, remote_min)
            }
            _ => {
                tracing::warn!(%from, %version, "peer announced a malformed version");
                Compatibility::Incompatible
            }
        };
        self.peer_compat = Some(compat);
        self.send_to(
            from,
            &Message::VersionAck {
                compatible: compat == Compatibility::Compatible,
            },
        );
        // Degraded-but-connected: a mismatch warns, it never drops the channel.
        if compat != Compatibility::Compatible {
            self.sink.status_changed(Status::VersionMismatch {
                remote: version.to_string(),
                compatibility: compat,
            });
        }
    }

    fn on_join_timeout(&mut self) {
        let Some(join) = self.join.as_mut() else {
            return;
        };
        if join.attempt < JOIN_MAX_ATTEMPTS {
            join.attempt += 1;
            let attempt = join.attempt;
            let address = join.address.clone();
            tracing::info!(%address, attempt, "join timed out, retrying");
            self.transport.connect(&address);
            self.scheduler
                .schedule_after(TimerToken::JoinTimeout, JOIN_TIMEOUT);
            self.sink
                .status_changed(Status::Connecting { address, attempt });
        } else {
            self.join = None;
            self.transport.close_endpoint();
            tracing::warn!("join attempts exhausted");
            self.sink.status_changed(Status::JoinFailed);
        }
    }

    fn on_health_tick(&mut self) {
        if !self.monitor.is_active() {
            return;
        }
        let pruned = self.registry.prune_closed();
        if !pruned.is_empty() {
            for id in &pruned {
                self.engine.clear_outbound(id);
                self.scheduler.cancel(&TimerToken::ChunkPace(id.clone()));
                tracing::info!(%id, "pruned dead channel");
                self.sink.status_changed(Status::PeerDisconnected {
                    participant: id.clone(),
                });
            }
            self.sink.peer_count_changed(self.registry.len());
        }
        if self.should_reconnect() {
            self.try_reconnect();
        }
        self.monitor.rearm(self.scheduler.as_ref());
    }

    fn should_reconnect(&self) -> bool {
        !self.is_host
            && self.join.is_none()
            && self.registry.is_empty()
            && self.session_address.is_some()
    }

    fn try_reconnect(&mut self) {
        let Some(address) = self.session_address.clone() else {
            return;
        };
        match self.monitor.next_reconnect() {
            Some(attempt) => {
                tracing::info!(%address, attempt, "attempting reconnect");
                self.sink.status_changed(Status::Reconnecting { attempt });
                if let Err(err) = self.start_join(&address) {
                    tracing::warn!(%err, "reconnect could not start");
                }
            }
            None => {
                self.monitor.stop(self.scheduler.as_ref());
                tracing::warn!("reconnect attempts exhausted");
                self.sink.status_changed(Status::ReconnectFailed);
            }
        }
    }

    fn send_to(&self, id: &ParticipantId, msg: &Message) {
        let frame = match wire::encode_frame(msg) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(%err, "frame encode failed");
                return;
            }
        };
        let Some(channel) = self.registry.channel(id) else {
            return;
        };
        if let Err(err) = channel.send(&frame) {
            tracing::warn!(%id, %err, "send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{decode_sent, FakeChannel, FakeScheduler, FakeSink, FakeTransport};
    use crate::transfer::CHUNK_THRESHOLD;
    use crate::wire::encode_frame;

    fn make_session(address: &str) -> (SessionManager, FakeTransport, FakeScheduler, FakeSink) {
        let transport = FakeTransport::new(address);
        let scheduler = FakeScheduler::new();
        let sink = FakeSink::new();
        let session = SessionManager::new(
            Box::new(transport.clone()),
            Box::new(scheduler.clone()),
            Box::new(sink.clone()),
        );
        (session, transport, scheduler, sink)
    }

    fn frame(msg: &Message) -> Vec<u8> {
        encode_frame(msg).unwrap()
    }

    fn peer(id: &str) -> ParticipantId {
        ParticipantId::from(id)
    }

    #[test]
    fn create_session_reports_address_and_monitors() {
        let (mut session, _transport, scheduler, sink) = make_session("abc123");
        let address = session.create_session().unwrap();
        assert_eq!(address, "abc123");
        assert!(session.is_host());
        assert_eq!(session.session_address(), Some("abc123"));
        assert!(sink.statuses().contains(&Status::SessionCreated {
            address: "abc123".into()
        }));
        assert!(scheduler
            .scheduled()
            .iter()
            .any(|(t, _)| *t == TimerToken::HealthTick));
    }

    #[test]
    fn create_session_twice_is_rejected() {
        let (mut session, _, _, _) = make_session("abc123");
        session.create_session().unwrap();
        assert!(matches!(
            session.create_session(),
            Err(SessionError::AlreadyActive)
        ));
    }

    #[test]
    fn create_session_surfaces_transport_failure() {
        let transport = FakeTransport::failing("abc123");
        let scheduler = FakeScheduler::new();
        let sink = FakeSink::new();
        let mut session = SessionManager::new(
            Box::new(transport),
            Box::new(scheduler),
            Box::new(sink.clone()),
        );
        assert!(matches!(
            session.create_session(),
            Err(SessionError::TransportUnavailable(_))
        ));
        assert!(session.session_address().is_none());
        assert!(sink.statuses().is_empty());
    }

    #[test]
    fn join_issues_exactly_three_attempts() {
        let (mut session, transport, _, sink) = make_session("local");
        session.join_session("abc123").unwrap();
        assert_eq!(transport.connects(), vec!["abc123"]);

        session.on_timer(TimerToken::JoinTimeout);
        session.on_timer(TimerToken::JoinTimeout);
        assert_eq!(transport.connects().len(), 3);

        // Third timeout exhausts the budget: endpoint torn down, terminal status.
        session.on_timer(TimerToken::JoinTimeout);
        assert_eq!(transport.connects().len(), 3);
        assert_eq!(transport.close_count(), 1);
        assert!(sink.statuses().contains(&Status::JoinFailed));

        // A stale timeout after the join died does nothing.
        session.on_timer(TimerToken::JoinTimeout);
        assert_eq!(transport.connects().len(), 3);
    }

    #[test]
    fn concurrent_join_is_rejected() {
        let (mut session, _, _, _) = make_session("local");
        session.join_session("abc123").unwrap();
        assert!(matches!(
            session.join_session("abc123"),
            Err(SessionError::JoinInProgress)
        ));
    }

    #[test]
    fn channel_open_cancels_join_and_announces_version() {
        let (mut session, _, scheduler, sink) = make_session("local");
        session.join_session("abc123").unwrap();

        let channel = FakeChannel::new();
        session.on_channel_opened(peer("host-id"), Box::new(channel.clone()));

        assert!(scheduler.cancelled().contains(&TimerToken::JoinTimeout));
        let sent = decode_sent(&channel);
        assert_eq!(sent.len(), 1); // joiner announces its version, no greeting
        match &sent[0] {
            Message::Version {
                version,
                min_compatible,
            } => {
                assert_eq!(version, &APP_VERSION.to_string());
                assert_eq!(min_compatible, &MIN_COMPAT_VERSION.to_string());
            }
            other => panic!("expected Version, got {other:?}"),
        }
        assert_eq!(sink.counts(), vec![1]);
        // Joiner starts monitoring once connected.
        assert!(scheduler
            .scheduled()
            .iter()
            .any(|(t, _)| *t == TimerToken::HealthTick));
    }

    #[test]
    fn host_greets_after_open() {
        let (mut session, _, _, _) = make_session("abc123");
        session.create_session().unwrap();
        let channel = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(channel.clone()));

        let sent = decode_sent(&channel);
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Message::Version { .. }));
        assert!(matches!(sent[1], Message::HostAck { .. }));
    }

    #[test]
    fn duplicate_open_keeps_single_entry_with_new_channel() {
        let (mut session, _, _, _) = make_session("abc123");
        session.create_session().unwrap();
        let first = FakeChannel::new();
        let second = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(first.clone()));
        session.on_channel_opened(peer("joiner-id"), Box::new(second.clone()));

        assert_eq!(session.participant_count(), 1);
        // Both opens announced the version, each on its own channel.
        assert_eq!(decode_sent(&first).len(), 2);
        assert_eq!(decode_sent(&second).len(), 2);
    }

    #[test]
    fn version_exchange_acks_compatible_peer() {
        let (mut session, _, _, sink) = make_session("abc123");
        session.create_session().unwrap();
        let channel = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(channel.clone()));

        session.on_frame(
            &peer("joiner-id"),
            &frame(&Message::Version {
                version: "1.1.0".into(),
                min_compatible: "1.0.0".into(),
            }),
        );

        assert_eq!(session.peer_compatibility(), Some(Compatibility::Compatible));
        let sent = decode_sent(&channel);
        match sent.last() {
            Some(Message::VersionAck { compatible }) => assert!(*compatible),
            other => panic!("expected VersionAck, got {other:?}"),
        }
        assert!(!sink
            .statuses()
            .iter()
            .any(|s| matches!(s, Status::VersionMismatch { .. })));
    }

    #[test]
    fn version_mismatch_warns_but_keeps_channel() {
        let (mut session, _, _, sink) = make_session("abc123");
        session.create_session().unwrap();
        let channel = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(channel.clone()));

        session.on_frame(
            &peer("joiner-id"),
            &frame(&Message::Version {
                version: "0.9.0".into(),
                min_compatible: "0.9.0".into(),
            }),
        );

        assert_eq!(session.peer_compatibility(), Some(Compatibility::Warning));
        let sent = decode_sent(&channel);
        match sent.last() {
            Some(Message::VersionAck { compatible }) => assert!(!*compatible),
            other => panic!("expected VersionAck, got {other:?}"),
        }
        assert!(sink
            .statuses()
            .iter()
            .any(|s| matches!(s, Status::VersionMismatch { .. })));
        assert_eq!(session.participant_count(), 1);
    }

    #[test]
    fn malformed_version_is_treated_as_incompatible() {
        let (mut session, _, _, _) = make_session("abc123");
        session.create_session().unwrap();
        let channel = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(channel));

        session.on_frame(
            &peer("joiner-id"),
            &frame(&Message::Version {
                version: "latest".into(),
                min_compatible: "1.0.0".into(),
            }),
        );
        assert_eq!(
            session.peer_compatibility(),
            Some(Compatibility::Incompatible)
        );
        assert_eq!(session.participant_count(), 1);
    }

    #[test]
    fn test_probe_is_echoed() {
        let (mut session, _, _, _) = make_session("abc123");
        session.create_session().unwrap();
        let channel = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(channel.clone()));

        session.on_frame(
            &peer("joiner-id"),
            &frame(&Message::Test {
                message: "hello?".into(),
                timestamp: 42,
            }),
        );
        match decode_sent(&channel).last() {
            Some(Message::TestAck { message, .. }) => assert_eq!(message, "hello?"),
            other => panic!("expected TestAck, got {other:?}"),
        }
    }

    #[test]
    fn broadcast_without_peers_reports_nothing_to_send() {
        let (mut session, _, scheduler, sink) = make_session("abc123");
        session.create_session().unwrap();
        session.broadcast_image(&[1, 2, 3]);
        assert!(sink.statuses().contains(&Status::NothingToSend));
        assert!(!scheduler
            .scheduled()
            .iter()
            .any(|(t, _)| matches!(t, TimerToken::ChunkPace(_))));
    }

    #[test]
    fn small_image_arrives_without_ack() {
        let (mut session, _, _, sink) = make_session("abc123");
        session.create_session().unwrap();
        let channel = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(channel.clone()));
        let before = decode_sent(&channel).len();

        let payload = vec![9u8; 1000];
        session.on_frame(
            &peer("joiner-id"),
            &frame(&Message::Image {
                image_data: payload.clone(),
                timestamp: 1,
            }),
        );

        assert_eq!(sink.images(), vec![(peer("joiner-id"), payload)]);
        // The small path replies nothing.
        assert_eq!(decode_sent(&channel).len(), before);
    }

    #[test]
    fn chunked_receive_out_of_order_acks_exactly_once() {
        let (mut session, _, _, sink) = make_session("abc123");
        session.create_session().unwrap();
        let channel = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(channel.clone()));

        let pieces = vec![vec![1u8; 10], vec![2u8; 10], vec![3u8; 4]];
        session.on_frame(
            &peer("joiner-id"),
            &frame(&Message::ChunksInfo {
                total_chunks: 3,
                timestamp: 1,
            }),
        );
        for index in [2u32, 0, 1] {
            assert!(sink.images().is_empty() || index == 1);
            session.on_frame(
                &peer("joiner-id"),
                &frame(&Message::Chunk {
                    index,
                    total: 3,
                    data: pieces[index as usize].clone(),
                    timestamp: 1,
                }),
            );
        }

        let expected: Vec<u8> = pieces.concat();
        assert_eq!(sink.images(), vec![(peer("joiner-id"), expected)]);
        let sent = decode_sent(&channel);
        assert!(sent.iter().any(|m| matches!(m, Message::ChunksInfoAck { .. })));
        let acks = sent
            .iter()
            .filter(|m| matches!(m, Message::ImageAck { .. }))
            .count();
        assert_eq!(acks, 1);
    }

    #[test]
    fn close_while_collecting_discards_partial_payload() {
        let (mut session, _, _, sink) = make_session("abc123");
        session.create_session().unwrap();
        let channel = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(channel));

        session.on_frame(
            &peer("joiner-id"),
            &frame(&Message::ChunksInfo {
                total_chunks: 2,
                timestamp: 1,
            }),
        );
        session.on_frame(
            &peer("joiner-id"),
            &frame(&Message::Chunk {
                index: 0,
                total: 2,
                data: vec![1, 2],
                timestamp: 1,
            }),
        );
        session.on_channel_closed(&peer("joiner-id"));

        // Reconnected, but the remaining chunk has no header to attach to.
        session.on_channel_opened(peer("joiner-id"), Box::new(FakeChannel::new()));
        session.on_frame(
            &peer("joiner-id"),
            &frame(&Message::Chunk {
                index: 1,
                total: 2,
                data: vec![3, 4],
                timestamp: 1,
            }),
        );
        assert!(sink.images().is_empty());
    }

    #[test]
    fn broadcast_large_paces_through_session_timers() {
        let (mut session, _, scheduler, _) = make_session("abc123");
        session.create_session().unwrap();
        let channel = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(channel.clone()));

        let payload: Vec<u8> = (0..50_000u32).map(|i| i as u8).collect();
        session.broadcast_image(&payload);

        let pace = TimerToken::ChunkPace(peer("joiner-id"));
        assert!(scheduler.scheduled().iter().any(|(t, _)| *t == pace));
        for _ in 0..4 {
            session.on_timer(pace.clone());
        }

        let sent = decode_sent(&channel);
        let infos = sent
            .iter()
            .filter_map(|m| match m {
                Message::ChunksInfo { total_chunks, .. } => Some(*total_chunks),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(infos, vec![4]);
        let indices: Vec<u32> = sent
            .iter()
            .filter_map(|m| match m {
                Message::Chunk { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        // Drained: one more fire is a no-op.
        session.on_timer(pace);
        let after = decode_sent(&channel);
        assert_eq!(after.len(), sent.len());
    }

    #[test]
    fn stale_pace_timer_is_harmless() {
        let (mut session, _, _, _) = make_session("abc123");
        session.on_timer(TimerToken::ChunkPace(peer("ghost")));
    }

    #[test]
    fn joiner_reconnects_after_losing_only_channel() {
        let (mut session, transport, _, sink) = make_session("local");
        session.join_session("abc123").unwrap();
        session.on_channel_opened(peer("host-id"), Box::new(FakeChannel::new()));
        assert_eq!(transport.connects().len(), 1);

        session.on_channel_closed(&peer("host-id"));
        assert!(sink
            .statuses()
            .contains(&Status::Reconnecting { attempt: 1 }));
        assert_eq!(transport.connects().len(), 2);
        assert_eq!(transport.connects()[1], "abc123");
        // The reconnect runs as a join: another join call is refused meanwhile.
        assert!(matches!(
            session.join_session("abc123"),
            Err(SessionError::JoinInProgress)
        ));
    }

    #[test]
    fn reconnect_budget_is_spent_after_three_triggers() {
        let (mut session, transport, scheduler, sink) = make_session("local");
        session.join_session("abc123").unwrap();

        for attempt in 1..=3u32 {
            session.on_channel_opened(peer("host-id"), Box::new(FakeChannel::new()));
            session.on_channel_closed(&peer("host-id"));
            assert!(sink.statuses().contains(&Status::Reconnecting { attempt }));
        }
        assert_eq!(transport.connects().len(), 4); // initial join + 3 reconnects

        // Fourth loss: budget gone, monitoring stops for good.
        session.on_channel_opened(peer("host-id"), Box::new(FakeChannel::new()));
        session.on_channel_closed(&peer("host-id"));
        assert!(sink.statuses().contains(&Status::ReconnectFailed));
        assert_eq!(transport.connects().len(), 4);
        assert!(scheduler.cancelled().contains(&TimerToken::HealthTick));
    }

    #[test]
    fn host_never_auto_reconnects() {
        let (mut session, transport, _, sink) = make_session("abc123");
        session.create_session().unwrap();
        session.on_channel_opened(peer("joiner-id"), Box::new(FakeChannel::new()));
        session.on_channel_closed(&peer("joiner-id"));
        assert!(transport.connects().is_empty());
        assert!(!sink
            .statuses()
            .iter()
            .any(|s| matches!(s, Status::Reconnecting { .. })));
    }

    #[test]
    fn health_tick_prunes_dead_channels() {
        let (mut session, _, scheduler, sink) = make_session("abc123");
        session.create_session().unwrap();
        let alive = FakeChannel::new();
        let dead = FakeChannel::new();
        session.on_channel_opened(peer("alive"), Box::new(alive));
        session.on_channel_opened(peer("dead"), Box::new(dead.clone()));
        dead.set_open(false);

        let ticks_before = scheduler
            .scheduled()
            .iter()
            .filter(|(t, _)| *t == TimerToken::HealthTick)
            .count();
        session.on_timer(TimerToken::HealthTick);

        assert_eq!(session.participant_count(), 1);
        assert!(sink.statuses().contains(&Status::PeerDisconnected {
            participant: peer("dead")
        }));
        // The audit re-armed itself.
        let ticks_after = scheduler
            .scheduled()
            .iter()
            .filter(|(t, _)| *t == TimerToken::HealthTick)
            .count();
        assert_eq!(ticks_after, ticks_before + 1);
    }

    #[test]
    fn health_tick_reconnects_joiner_with_no_channels() {
        let (mut session, transport, _, sink) = make_session("local");
        session.join_session("abc123").unwrap();
        let channel = FakeChannel::new();
        session.on_channel_opened(peer("host-id"), Box::new(channel.clone()));

        channel.set_open(false);
        session.on_timer(TimerToken::HealthTick);

        assert_eq!(session.participant_count(), 0);
        assert!(sink
            .statuses()
            .contains(&Status::Reconnecting { attempt: 1 }));
        assert_eq!(transport.connects().len(), 2);
    }

    #[test]
    fn shutdown_tears_everything_down() {
        let (mut session, transport, scheduler, _) = make_session("abc123");
        session.create_session().unwrap();
        session.on_channel_opened(peer("joiner-id"), Box::new(FakeChannel::new()));

        session.shutdown();
        assert_eq!(transport.close_count(), 1);
        assert!(scheduler.cancelled().contains(&TimerToken::HealthTick));
        assert!(session.session_address().is_none());
        assert_eq!(session.participant_count(), 0);

        // A tick that was already in flight when we stopped is ignored.
        session.on_timer(TimerToken::HealthTick);
    }

    // End-to-end shape of the whole exchange, host side.
    #[test]
    fn scenario_joiner_sends_chunked_image_to_host() {
        let (mut session, _, _, sink) = make_session("abc123");
        let address = session.create_session().unwrap();
        assert_eq!(address, "abc123");

        let channel = FakeChannel::new();
        session.on_channel_opened(peer("joiner-id"), Box::new(channel.clone()));
        assert_eq!(session.participant_count(), 1);

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let chunks = crate::transfer::split_chunks(&payload, CHUNK_THRESHOLD);
        assert_eq!(chunks.len(), 4);

        session.on_frame(
            &peer("joiner-id"),
            &frame(&Message::ChunksInfo {
                total_chunks: 4,
                timestamp: 1,
            }),
        );
        for (index, data) in chunks.into_iter().enumerate() {
            session.on_frame(
                &peer("joiner-id"),
                &frame(&Message::Chunk {
                    index: index as u32,
                    total: 4,
                    data,
                    timestamp: 1,
                }),
            );
        }

        let images = sink.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].0, peer("joiner-id"));
        assert_eq!(images[0].1, payload);
        assert!(decode_sent(&channel)
            .iter()
            .any(|m| matches!(m, Message::ImageAck { .. })));
    }
}
