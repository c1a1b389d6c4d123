//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/pixdrop/config.toml or
/// /etc/pixdrop/config.toml. Env overrides: PIXDROP_LISTEN_PORT,
/// PIXDROP_INBOX_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port for the local endpoint (default 46464). If taken,
    /// the transport falls back to an ephemeral port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Directory received images are written into.
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: PathBuf,
}

fn default_listen_port() -> u16 {
    46464
}

fn default_inbox_dir() -> PathBuf {
    PathBuf::from("pixdrop-inbox")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            inbox_dir: default_inbox_dir(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("PIXDROP_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("PIXDROP_INBOX_DIR") {
        if !s.is_empty() {
            c.inbox_dir = PathBuf::from(s);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pixdrop/config.toml"));
    }
    out.push(PathBuf::from("/etc/pixdrop/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
