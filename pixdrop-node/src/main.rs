// Pixdrop node: TCP transport, timer scheduler and control loop around the
// session core. `host` creates a session, `join <address>` connects to one;
// stdin takes `send <path>`, `test` and `quit`.

mod config;
mod identity;
mod sink;
mod transport;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use pixdrop_core::{Scheduler, SessionManager, TimerToken};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use crate::transport::{TcpTransport, TransportEvent};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything the control loop reacts to, in arrival order.
pub enum LoopEvent {
    Transport(TransportEvent),
    Timer(TimerToken),
    Command(Command),
}

pub enum Command {
    Send(PathBuf),
    Probe,
    Quit,
}

enum Mode {
    Host,
    Join(String),
}

fn main() -> anyhow::Result<()> {
    let Some(mode) = parse_args() else {
        return Ok(());
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(mode, cfg))
}

fn parse_args() -> Option<Mode> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("--version") | Some("-V") => {
            println!("pixdrop-node {}", VERSION);
            None
        }
        Some("host") => Some(Mode::Host),
        Some("join") => match args.next() {
            Some(address) => Some(Mode::Join(address)),
            None => {
                eprintln!("usage: pixdrop-node join <address>");
                None
            }
        },
        _ => {
            eprintln!("usage: pixdrop-node [host | join <address> | --version]");
            None
        }
    }
}

async fn run(mode: Mode, cfg: config::Config) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let identity = Arc::new(identity::NodeIdentity::generate());
    tracing::info!(id = %identity.participant_id(), "node identity ready");

    let transport = TcpTransport::new(Arc::clone(&identity), cfg.listen_port, tx.clone());
    let scheduler = TokioScheduler::new(tx.clone());
    let sink = sink::InboxSink::new(cfg.inbox_dir.clone());
    let mut session =
        SessionManager::new(Box::new(transport), Box::new(scheduler), Box::new(sink));

    match mode {
        Mode::Host => {
            let address = session
                .create_session()
                .context("could not create session")?;
            tracing::info!(%address, "hosting; participants join with this address");
        }
        Mode::Join(address) => {
            session
                .join_session(&address)
                .context("could not start join")?;
        }
    }

    spawn_stdin_commands(tx.clone());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    LoopEvent::Transport(TransportEvent::Opened { id, channel }) => {
                        session.on_channel_opened(id, channel);
                    }
                    LoopEvent::Transport(TransportEvent::Closed { id }) => {
                        session.on_channel_closed(&id);
                    }
                    LoopEvent::Transport(TransportEvent::Frame { id, bytes }) => {
                        session.on_frame(&id, &bytes);
                    }
                    LoopEvent::Transport(TransportEvent::Error { id, detail }) => {
                        session.on_channel_error(&id, &detail);
                    }
                    LoopEvent::Timer(token) => session.on_timer(token),
                    LoopEvent::Command(Command::Send(path)) => match load_payload(&path) {
                        Ok(payload) => session.broadcast_image(&payload),
                        Err(err) => {
                            tracing::warn!(path = %path.display(), %err, "could not read image");
                        }
                    },
                    LoopEvent::Command(Command::Probe) => session.send_test_probe(),
                    LoopEvent::Command(Command::Quit) => break,
                }
            }
        }
    }
    session.shutdown();
    Ok(())
}

/// Media acquisition: the encoded bytes of a user-chosen file.
fn load_payload(path: &Path) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}

fn spawn_stdin_commands(tx: mpsc::UnboundedSender<LoopEvent>) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            let cmd = if let Some(path) = line.strip_prefix("send ") {
                Command::Send(PathBuf::from(path.trim()))
            } else if line == "test" {
                Command::Probe
            } else if line == "quit" || line == "exit" {
                Command::Quit
            } else if line.is_empty() {
                continue;
            } else {
                tracing::info!("commands: send <path> | test | quit");
                continue;
            };
            if tx.send(LoopEvent::Command(cmd)).is_err() {
                break;
            }
        }
    });
}

/// One-shot timers over tokio sleeps. Re-arming a token replaces its pending
/// task; cancelling aborts it so a dead timer can never fire.
struct TokioScheduler {
    events: mpsc::UnboundedSender<LoopEvent>,
    pending: Mutex<HashMap<TimerToken, tokio::task::JoinHandle<()>>>,
}

impl TokioScheduler {
    fn new(events: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self {
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<TimerToken, tokio::task::JoinHandle<()>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, token: TimerToken, after: Duration) {
        let mut pending = self.lock_pending();
        if let Some(old) = pending.remove(&token) {
            old.abort();
        }
        let events = self.events.clone();
        let fire = token.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(LoopEvent::Timer(fire));
        });
        pending.insert(token, handle);
    }

    fn cancel(&self, token: &TimerToken) {
        if let Some(handle) = self.lock_pending().remove(token) {
            handle.abort();
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
