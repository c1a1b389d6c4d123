//! TCP transport: listener for the local endpoint, dialer for joins, a
//! fixed-size identity handshake per connection, then sealed
//! length-prefixed frames. Channel opens, closes, errors and inbound frames
//! are forwarded to the control loop as events.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pixdrop_core::wire::MAX_FRAME_LEN;
use pixdrop_core::{Channel, ChannelError, ParticipantId, Transport, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::identity::{self, NodeIdentity, TRANSPORT_VERSION};
use crate::LoopEvent;

// version byte + participant id + public key, both directions.
const HANDSHAKE_LEN: usize = 1 + 16 + 32;
const LEN_BYTES: usize = 4;
// Sealing adds a 16-byte tag on top of the inner frame.
const MAX_SEALED_LEN: u32 = MAX_FRAME_LEN + 64;

/// Notifications out of the transport, consumed by the control loop.
pub enum TransportEvent {
    Opened {
        id: ParticipantId,
        channel: Box<dyn Channel>,
    },
    Closed {
        id: ParticipantId,
    },
    Frame {
        id: ParticipantId,
        bytes: Vec<u8>,
    },
    Error {
        id: ParticipantId,
        detail: String,
    },
}

/// Channel handle the session owns: sends queue onto the connection's writer
/// task and never block.
pub struct TcpChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

impl Channel for TcpChannel {
    fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| ChannelError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

struct Endpoint {
    address: String,
    accept_task: JoinHandle<()>,
}

pub struct TcpTransport {
    identity: Arc<NodeIdentity>,
    listen_port: u16,
    events: mpsc::UnboundedSender<LoopEvent>,
    endpoint: Option<Endpoint>,
}

impl TcpTransport {
    pub fn new(
        identity: Arc<NodeIdentity>,
        listen_port: u16,
        events: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        Self {
            identity,
            listen_port,
            events,
            endpoint: None,
        }
    }
}

impl Transport for TcpTransport {
    fn open_endpoint(&mut self) -> Result<String, TransportError> {
        if let Some(ep) = &self.endpoint {
            return Ok(ep.address.clone());
        }
        let listener = bind_listener(self.listen_port)
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?
            .port();
        let address = format!("{}:{}", advertised_ip(), port);
        tracing::info!(%address, "endpoint listening");

        let identity = Arc::clone(&self.identity);
        let events = self.events.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tracing::debug!(%remote, "inbound connection");
                        let identity = Arc::clone(&identity);
                        let events = events.clone();
                        tokio::spawn(async move {
                            let mut stream = stream;
                            match handshake_accept(&mut stream, &identity).await {
                                Ok((id, key)) => run_connection(stream, id, key, events).await,
                                Err(err) => tracing::debug!(%remote, %err, "handshake failed"),
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed, endpoint stops");
                        break;
                    }
                }
            }
        });
        self.endpoint = Some(Endpoint {
            address: address.clone(),
            accept_task,
        });
        Ok(address)
    }

    fn connect(&mut self, address: &str) {
        let identity = Arc::clone(&self.identity);
        let events = self.events.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            match TcpStream::connect(&address).await {
                Ok(mut stream) => match handshake_connect(&mut stream, &identity).await {
                    Ok((id, key)) => run_connection(stream, id, key, events).await,
                    Err(err) => tracing::debug!(%address, %err, "handshake failed"),
                },
                // The join timeout drives retries; a failed dial is just quiet.
                Err(err) => tracing::debug!(%address, %err, "dial failed"),
            }
        });
    }

    fn close_endpoint(&mut self) {
        if let Some(ep) = self.endpoint.take() {
            ep.accept_task.abort();
            tracing::info!("endpoint closed");
        }
    }
}

fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let std_listener = match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => l,
        // Port taken (another node on this machine): use an ephemeral one.
        Err(_) => std::net::TcpListener::bind(("0.0.0.0", 0))?,
    };
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

/// Best-effort LAN address for the shareable session string. The socket is
/// never used to send anything.
fn advertised_ip() -> IpAddr {
    std::net::UdpSocket::bind(("0.0.0.0", 0))
        .and_then(|s| {
            s.connect(("8.8.8.8", 80))?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or_else(|_| IpAddr::from([127, 0, 0, 1]))
}

fn handshake_bytes(identity: &NodeIdentity) -> [u8; HANDSHAKE_LEN] {
    let mut out = [0u8; HANDSHAKE_LEN];
    out[0] = TRANSPORT_VERSION;
    out[1..17].copy_from_slice(&identity.id_bytes());
    out[17..49].copy_from_slice(identity.public_key());
    out
}

fn parse_handshake(
    buf: &[u8; HANDSHAKE_LEN],
    identity: &NodeIdentity,
) -> std::io::Result<(ParticipantId, [u8; 32])> {
    if buf[0] != TRANSPORT_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported transport version",
        ));
    }
    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&buf[1..17]);
    let mut peer_public = [0u8; 32];
    peer_public.copy_from_slice(&buf[17..49]);
    let id = ParticipantId::new(Uuid::from_bytes(id_bytes).to_string());
    let key = identity.session_key(&peer_public);
    Ok((id, key))
}

async fn handshake_accept(
    stream: &mut TcpStream,
    identity: &NodeIdentity,
) -> std::io::Result<(ParticipantId, [u8; 32])> {
    let (mut r, mut w) = stream.split();
    let mut buf = [0u8; HANDSHAKE_LEN];
    r.read_exact(&mut buf).await?;
    let parsed = parse_handshake(&buf, identity)?;
    w.write_all(&handshake_bytes(identity)).await?;
    w.flush().await?;
    Ok(parsed)
}

async fn handshake_connect(
    stream: &mut TcpStream,
    identity: &NodeIdentity,
) -> std::io::Result<(ParticipantId, [u8; 32])> {
    let (mut r, mut w) = stream.split();
    w.write_all(&handshake_bytes(identity)).await?;
    w.flush().await?;
    let mut buf = [0u8; HANDSHAKE_LEN];
    r.read_exact(&mut buf).await?;
    parse_handshake(&buf, identity)
}

async fn run_connection(
    stream: TcpStream,
    id: ParticipantId,
    session_key: [u8; 32],
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let open = Arc::new(AtomicBool::new(true));
    let channel = TcpChannel {
        tx,
        open: Arc::clone(&open),
    };
    if events
        .send(LoopEvent::Transport(TransportEvent::Opened {
            id: id.clone(),
            channel: Box::new(channel),
        }))
        .is_err()
    {
        return;
    }

    let write_key = session_key;
    let writer_task = tokio::spawn(async move {
        let mut nonce: u64 = 0;
        while let Some(frame) = rx.recv().await {
            match identity::seal_frame(&write_key, nonce, &frame) {
                Ok(sealed) => {
                    nonce = nonce.saturating_add(1);
                    if writer
                        .write_all(&(sealed.len() as u32).to_le_bytes())
                        .await
                        .is_err()
                        || writer.write_all(&sealed).await.is_err()
                    {
                        break;
                    }
                    let _ = writer.flush().await;
                }
                Err(err) => {
                    tracing::warn!(%err, "seal failed, dropping connection");
                    break;
                }
            }
        }
    });

    let mut nonce: u64 = 0;
    loop {
        let mut len_buf = [0u8; LEN_BYTES];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_SEALED_LEN {
            let _ = events.send(LoopEvent::Transport(TransportEvent::Error {
                id: id.clone(),
                detail: "oversized frame".to_string(),
            }));
            break;
        }
        let mut sealed = vec![0u8; len as usize];
        if reader.read_exact(&mut sealed).await.is_err() {
            break;
        }
        match identity::open_frame(&session_key, nonce, &sealed) {
            Ok(frame) => {
                nonce = nonce.saturating_add(1);
                if events
                    .send(LoopEvent::Transport(TransportEvent::Frame {
                        id: id.clone(),
                        bytes: frame,
                    }))
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                let _ = events.send(LoopEvent::Transport(TransportEvent::Error {
                    id: id.clone(),
                    detail: err.to_string(),
                }));
                break;
            }
        }
    }
    open.store(false, Ordering::Relaxed);
    writer_task.abort();
    let _ = events.send(LoopEvent::Transport(TransportEvent::Closed { id }));
}
