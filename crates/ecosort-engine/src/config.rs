use std::env;
use std::path::PathBuf;

use anyhow::{bail, Result};

/// How this client carries its session identity. The backend has shipped
/// three incompatible schemes; the active one is fixed at startup and
/// state left behind by another scheme is ignored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionTransport {
    /// Identifier cached in a local token file and sent explicitly.
    LocalToken,
    /// Identifier issued by the server per process, held in memory only.
    ServerIssued,
    /// Identity rides on an HTTP cookie; nothing is sent explicitly.
    CookieSession,
}

impl SessionTransport {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "local-token" => Ok(Self::LocalToken),
            "server-issued" => Ok(Self::ServerIssued),
            "cookie" | "cookie-session" => Ok(Self::CookieSession),
            other => bail!("unknown session transport '{other}' (expected local-token, server-issued, or cookie)"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalToken => "local-token",
            Self::ServerIssued => "server-issued",
            Self::CookieSession => "cookie",
        }
    }

    /// Whether sends carry the session identifier explicitly.
    pub fn sends_identifier(&self) -> bool {
        matches!(self, Self::LocalToken | Self::ServerIssued)
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub base_url: String,
    pub socket_url: String,
    pub transport: SessionTransport,
    pub state_dir: PathBuf,
    pub typing_interval_ms: u64,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let base_url = non_empty_env("ECOSORT_BASE_URL")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "http://127.0.0.1:5000".to_string());
        let socket_url =
            non_empty_env("ECOSORT_SOCKET_URL").unwrap_or_else(|| derive_socket_url(&base_url));
        let transport = match non_empty_env("ECOSORT_SESSION_TRANSPORT") {
            Some(raw) => SessionTransport::parse(&raw)?,
            None => SessionTransport::LocalToken,
        };
        let state_dir = non_empty_env("ECOSORT_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir);
        let typing_interval_ms = env::var("ECOSORT_TYPING_INTERVAL_MS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(|value| value.clamp(1, 1000))
            .unwrap_or(30);

        Ok(Self {
            base_url,
            socket_url,
            transport,
            state_dir,
            typing_interval_ms,
        })
    }

    pub fn set_base_url(&mut self, base_url: &str) {
        self.base_url = base_url.trim_end_matches('/').to_string();
        if non_empty_env("ECOSORT_SOCKET_URL").is_none() {
            self.socket_url = derive_socket_url(&self.base_url);
        }
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join("events.jsonl")
    }

    pub fn session_token_path(&self) -> PathBuf {
        self.state_dir.join("session_token.json")
    }
}

/// The realtime endpoint lives next to the HTTP one; swap the scheme and
/// append the socket path.
pub fn derive_socket_url(base_url: &str) -> String {
    if let Ok(mut url) = reqwest::Url::parse(base_url) {
        let scheme = if url.scheme() == "https" {
            "wss".to_string()
        } else if url.scheme() == "http" {
            "ws".to_string()
        } else {
            url.scheme().to_string()
        };
        let _ = url.set_scheme(&scheme);
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{path}/socket"));
        return url.to_string();
    }
    "ws://127.0.0.1:5000/socket".to_string()
}

fn default_state_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ecosort")
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
