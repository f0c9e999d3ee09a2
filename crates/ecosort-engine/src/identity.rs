use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use ecosort_contracts::events::{now_utc_iso, EventWriter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::backend::BackendClient;
use crate::config::{EngineConfig, SessionTransport};
use crate::json_object;

/// Where the active identifier lives between runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageMedium {
    /// Memory only; gone when the process exits.
    None,
    /// The token file under the state directory.
    LocalToken,
    /// The backend's cookie, held by the HTTP client's jar.
    ServerCookie,
}

impl StorageMedium {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageMedium::None => "none",
            StorageMedium::LocalToken => "local-token",
            StorageMedium::ServerCookie => "server-cookie",
        }
    }
}

/// The one active session. `durable` is false only for a synthesized
/// fallback identifier the backend has never confirmed. `last_activity`
/// is server-held; it is known only when a history reply echoed it.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub id: String,
    pub created: String,
    pub last_activity: Option<String>,
    pub medium: StorageMedium,
    pub durable: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionToken {
    session_id: String,
    #[serde(default)]
    created: String,
}

enum Verify {
    /// The backend echoed the identifier; session metadata came with it.
    Valid {
        created: Option<String>,
        last_activity: Option<String>,
    },
    Invalid,
    Unreachable,
}

/// Owns session identity across the three transport generations: verify or
/// issue a token, take whatever the server issued this run, or discover
/// the cookie-held identifier. There is never more than one active
/// session, and replacing it is a single swap.
pub struct IdentityStore {
    transport: SessionTransport,
    token_path: PathBuf,
    backend: BackendClient,
    events: EventWriter,
    session: Mutex<Option<Session>>,
}

impl IdentityStore {
    pub fn new(config: &EngineConfig, backend: BackendClient, events: EventWriter) -> Self {
        Self {
            transport: config.transport,
            token_path: config.session_token_path(),
            backend,
            events,
            session: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> SessionTransport {
        self.transport
    }

    pub fn current_id(&self) -> Option<String> {
        self.session
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|session| session.id.clone()))
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|slot| slot.clone())
    }

    /// Establish the session for this run. Identifier-bearing transports
    /// always end up with an id (a synthesized one if the backend cannot
    /// be reached); cookie authority may legitimately stay empty until
    /// the backend echoes an identifier.
    pub fn resolve(&self) -> Option<String> {
        let resolved = match self.transport {
            SessionTransport::LocalToken => Some(self.resolve_local_token()),
            SessionTransport::ServerIssued => Some(self.issue_or_synthesize()),
            SessionTransport::CookieSession => self.discover_cookie_session(),
        };
        if let Ok(mut slot) = self.session.lock() {
            *slot = resolved.clone();
        }
        match resolved {
            Some(session) => {
                let _ = self.events.emit(
                    "session_resolved",
                    json_object(json!({
                        "session_id": session.id,
                        "medium": session.medium.as_str(),
                        "durable": session.durable,
                    })),
                );
                Some(session.id)
            }
            None => None,
        }
    }

    /// Adopt an identifier echoed by the backend mid-conversation. A
    /// matching echo is a no-op; a different one replaces the active
    /// session and, on the token transport, rewrites the token file.
    pub fn adopt_echoed(&self, echoed: &str) {
        if echoed.is_empty() {
            return;
        }
        let adopted = Session {
            id: echoed.to_string(),
            created: now_utc_iso(),
            last_activity: None,
            medium: self.resident_medium(),
            durable: true,
        };
        let previous = {
            let Ok(mut slot) = self.session.lock() else {
                return;
            };
            if let Some(session) = slot.as_ref() {
                if session.id == echoed {
                    return;
                }
            }
            slot.replace(adopted.clone())
        };
        if self.transport == SessionTransport::LocalToken {
            self.persist(&adopted);
        }
        let _ = self.events.emit(
            "session_migrated",
            json_object(json!({
                "from": previous.map(|session| session.id),
                "to": echoed,
            })),
        );
    }

    /// Discard the active session and establish a fresh one. The swap is
    /// a single assignment, so observers never see a half-replaced state.
    pub fn reset(&self) -> Option<String> {
        if self.transport == SessionTransport::LocalToken {
            let _ = fs::remove_file(&self.token_path);
        }
        let fresh = match self.transport {
            SessionTransport::LocalToken | SessionTransport::ServerIssued => {
                Some(self.issue_or_synthesize())
            }
            SessionTransport::CookieSession => self.discover_cookie_session(),
        };
        if let Ok(mut slot) = self.session.lock() {
            *slot = fresh.clone();
        }
        let _ = self.events.emit(
            "session_reset",
            json_object(json!({
                "session_id": fresh.as_ref().map(|session| session.id.clone()),
            })),
        );
        fresh.map(|session| session.id)
    }

    fn resolve_local_token(&self) -> Session {
        if let Some(token) = self.load_token() {
            match self.verify(&token.session_id) {
                Verify::Valid {
                    created,
                    last_activity,
                } => {
                    // The server's record wins over the cached copy.
                    let created = created
                        .or_else(|| (!token.created.is_empty()).then(|| token.created.clone()))
                        .unwrap_or_else(now_utc_iso);
                    return Session {
                        id: token.session_id,
                        created,
                        last_activity,
                        medium: StorageMedium::LocalToken,
                        durable: true,
                    };
                }
                Verify::Invalid => {
                    let _ = self.events.emit(
                        "session_token_invalid",
                        json_object(json!({"session_id": token.session_id})),
                    );
                }
                Verify::Unreachable => {
                    // A server-issued id is never dropped over a network
                    // blip; keep it and try again next run.
                    eprintln!(
                        "ecosort: backend unreachable while verifying the cached session; keeping it"
                    );
                    let created = if token.created.is_empty() {
                        now_utc_iso()
                    } else {
                        token.created
                    };
                    return Session {
                        id: token.session_id,
                        created,
                        last_activity: None,
                        medium: StorageMedium::LocalToken,
                        durable: true,
                    };
                }
            }
        }
        self.issue_or_synthesize()
    }

    fn issue_or_synthesize(&self) -> Session {
        match self.backend.new_session() {
            Ok(reply) => {
                if reply.success {
                    if let Some(id) = reply.session_id.filter(|id| !id.is_empty()) {
                        let session = Session {
                            id,
                            created: now_utc_iso(),
                            last_activity: None,
                            medium: self.resident_medium(),
                            durable: true,
                        };
                        if self.transport == SessionTransport::LocalToken {
                            self.persist(&session);
                        }
                        return session;
                    }
                }
                let reason = reply
                    .error
                    .unwrap_or_else(|| "new-session reply carried no session_id".to_string());
                self.fall_back(&reason)
            }
            Err(err) => self.fall_back(&format!("{err:#}")),
        }
    }

    fn discover_cookie_session(&self) -> Option<Session> {
        match self.backend.fetch_history(None) {
            Ok(reply) if !reply.is_error() => reply.session_id.map(|id| Session {
                id,
                created: reply.created.unwrap_or_else(now_utc_iso),
                last_activity: reply.last_activity,
                medium: StorageMedium::ServerCookie,
                durable: true,
            }),
            Ok(reply) => {
                let _ = self.events.emit(
                    "session_discovery_failed",
                    json_object(json!({"error": reply.error})),
                );
                None
            }
            Err(err) => {
                eprintln!("ecosort: cookie session discovery failed ({err:#})");
                let _ = self.events.emit(
                    "session_discovery_failed",
                    json_object(json!({"error": format!("{err:#}")})),
                );
                None
            }
        }
    }

    fn fall_back(&self, reason: &str) -> Session {
        eprintln!("ecosort: session issuance failed ({reason}); using a local fallback id");
        let _ = self.events.emit(
            "session_fallback",
            json_object(json!({"reason": reason})),
        );
        synthesize_session()
    }

    fn verify(&self, session_id: &str) -> Verify {
        match self.backend.fetch_history(Some(session_id)) {
            Ok(reply) => {
                let echoed_matches = reply.session_id.as_deref() == Some(session_id);
                if !reply.is_error() && echoed_matches {
                    Verify::Valid {
                        created: reply.created,
                        last_activity: reply.last_activity,
                    }
                } else {
                    Verify::Invalid
                }
            }
            Err(_) => Verify::Unreachable,
        }
    }

    fn load_token(&self) -> Option<SessionToken> {
        let raw = fs::read_to_string(&self.token_path).ok()?;
        let token: SessionToken = serde_json::from_str(&raw).ok()?;
        if token.session_id.is_empty() {
            return None;
        }
        Some(token)
    }

    fn persist(&self, session: &Session) {
        let token = SessionToken {
            session_id: session.id.clone(),
            created: session.created.clone(),
        };
        if let Err(err) = write_token(&self.token_path, &token) {
            eprintln!("ecosort: failed to persist the session token ({err:#})");
        }
    }

    fn resident_medium(&self) -> StorageMedium {
        match self.transport {
            SessionTransport::LocalToken => StorageMedium::LocalToken,
            SessionTransport::ServerIssued => StorageMedium::None,
            SessionTransport::CookieSession => StorageMedium::ServerCookie,
        }
    }
}

fn synthesize_session() -> Session {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    Session {
        id: format!("local-{millis}-{suffix}"),
        created: now_utc_iso(),
        last_activity: None,
        medium: StorageMedium::None,
        durable: false,
    }
}

fn write_token(path: &PathBuf, token: &SessionToken) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let serialized =
        serde_json::to_string_pretty(token).context("failed to serialize the session token")?;
    fs::write(path, serialized).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn spawn_server(routes: Vec<(&'static str, String)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}", server.server_addr().to_ip().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        thread::spawn(move || {
            for request in server.incoming_requests() {
                log.lock().unwrap().push(request.url().to_string());
                let path = request.url().split('?').next().unwrap_or("").to_string();
                let body = routes
                    .iter()
                    .find(|(route, _)| *route == path)
                    .map(|(_, body)| body.clone())
                    .unwrap_or_else(|| "{}".to_string());
                let header = tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    &b"application/json"[..],
                )
                .unwrap();
                let _ = request.respond(
                    tiny_http::Response::from_string(body).with_header(header),
                );
            }
        });
        (base, seen)
    }

    struct Fixture {
        store: IdentityStore,
        _state_dir: tempfile::TempDir,
        token_path: PathBuf,
    }

    fn fixture(base_url: &str, transport: SessionTransport) -> Fixture {
        let state_dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            base_url: base_url.to_string(),
            socket_url: "ws://127.0.0.1:1/socket".to_string(),
            transport,
            state_dir: state_dir.path().to_path_buf(),
            typing_interval_ms: 1,
        };
        let backend = BackendClient::new(&config).unwrap();
        let events = EventWriter::new(
            state_dir.path().join("events.jsonl"),
            "test-run",
        );
        let token_path = config.session_token_path();
        Fixture {
            store: IdentityStore::new(&config, backend, events),
            _state_dir: state_dir,
            token_path,
        }
    }

    fn write_cached_token(path: &PathBuf, session_id: &str) {
        write_token(
            path,
            &SessionToken {
                session_id: session_id.to_string(),
                created: "2024-05-01T10:00:00+00:00".to_string(),
            },
        )
        .unwrap();
    }

    #[test]
    fn cached_token_is_verified_and_adopted() {
        let (base, _seen) = spawn_server(vec![(
            "/historial",
            r#"{"session_id": "tok-1", "conversations": []}"#.to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::LocalToken);
        write_cached_token(&fx.token_path, "tok-1");

        let id = fx.store.resolve();
        assert_eq!(id.as_deref(), Some("tok-1"));
        let session = fx.store.session().unwrap();
        assert_eq!(session.medium, StorageMedium::LocalToken);
        assert!(session.durable);
        // The reply carried no metadata, so the cached copy stands.
        assert_eq!(session.created, "2024-05-01T10:00:00+00:00");
        assert_eq!(session.last_activity, None);
    }

    #[test]
    fn verified_token_adopts_the_server_session_metadata() {
        let (base, _seen) = spawn_server(vec![(
            "/historial",
            r#"{
                "session_id": "tok-1",
                "created": "2024-04-01T08:00:00+00:00",
                "last_activity": "2024-06-01T10:30:00+00:00",
                "conversations": []
            }"#
            .to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::LocalToken);
        write_cached_token(&fx.token_path, "tok-1");

        fx.store.resolve();
        let session = fx.store.session().unwrap();
        assert_eq!(session.created, "2024-04-01T08:00:00+00:00");
        assert_eq!(
            session.last_activity.as_deref(),
            Some("2024-06-01T10:30:00+00:00")
        );
    }

    #[test]
    fn rejected_token_triggers_a_fresh_issuance() {
        let (base, seen) = spawn_server(vec![
            (
                "/historial",
                r#"{"error": "Sesión no encontrada"}"#.to_string(),
            ),
            (
                "/new-session",
                r#"{"success": true, "session_id": "srv-2"}"#.to_string(),
            ),
        ]);
        let fx = fixture(&base, SessionTransport::LocalToken);
        write_cached_token(&fx.token_path, "tok-stale");

        let id = fx.store.resolve();
        assert_eq!(id.as_deref(), Some("srv-2"));
        // The token file now holds the reissued identifier.
        let raw = fs::read_to_string(&fx.token_path).unwrap();
        assert!(raw.contains("srv-2"));
        let urls = seen.lock().unwrap();
        assert!(urls.iter().any(|url| url.contains("session_id=tok-stale")));
        assert!(urls.iter().any(|url| url == "/new-session"));
    }

    #[test]
    fn echo_of_a_different_identifier_is_invalid() {
        let (base, _seen) = spawn_server(vec![
            (
                "/historial",
                r#"{"session_id": "otro", "conversations": []}"#.to_string(),
            ),
            (
                "/new-session",
                r#"{"success": true, "session_id": "srv-3"}"#.to_string(),
            ),
        ]);
        let fx = fixture(&base, SessionTransport::LocalToken);
        write_cached_token(&fx.token_path, "tok-1");
        assert_eq!(fx.store.resolve().as_deref(), Some("srv-3"));
    }

    #[test]
    fn unreachable_backend_keeps_the_cached_token() {
        let fx = fixture("http://127.0.0.1:9", SessionTransport::LocalToken);
        write_cached_token(&fx.token_path, "tok-keep");
        let id = fx.store.resolve();
        assert_eq!(id.as_deref(), Some("tok-keep"));
        assert!(fx.store.session().unwrap().durable);
    }

    #[test]
    fn unreachable_backend_without_a_cache_synthesizes_an_identifier() {
        let fx = fixture("http://127.0.0.1:9", SessionTransport::LocalToken);
        let id = fx.store.resolve().unwrap();
        assert!(id.starts_with("local-"));
        let session = fx.store.session().unwrap();
        assert!(!session.durable);
        assert_eq!(session.medium, StorageMedium::None);
        // The synthesized id is never written to the token file.
        assert!(!fx.token_path.exists());
    }

    #[test]
    fn server_issued_transport_asks_for_a_session_every_run() {
        let (base, seen) = spawn_server(vec![(
            "/new-session",
            r#"{"success": true, "session_id": "srv-9"}"#.to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::ServerIssued);
        assert_eq!(fx.store.resolve().as_deref(), Some("srv-9"));
        let session = fx.store.session().unwrap();
        assert_eq!(session.medium, StorageMedium::None);
        assert!(session.durable);
        assert!(!fx.token_path.exists());
        assert_eq!(seen.lock().unwrap().as_slice(), ["/new-session"]);
    }

    #[test]
    fn cookie_discovery_adopts_the_echoed_identifier() {
        let (base, seen) = spawn_server(vec![(
            "/historial",
            r#"{"session_id": "ck-9", "last_activity": "2024-06-01T10:30:00+00:00", "conversations": []}"#
                .to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::CookieSession);
        assert_eq!(fx.store.resolve().as_deref(), Some("ck-9"));
        let session = fx.store.session().unwrap();
        assert_eq!(session.medium, StorageMedium::ServerCookie);
        assert_eq!(
            session.last_activity.as_deref(),
            Some("2024-06-01T10:30:00+00:00")
        );
        // Discovery is read-only: no issuance call.
        assert_eq!(seen.lock().unwrap().as_slice(), ["/historial"]);
    }

    #[test]
    fn cookie_discovery_failure_leaves_no_identifier() {
        let fx = fixture("http://127.0.0.1:9", SessionTransport::CookieSession);
        assert_eq!(fx.store.resolve(), None);
        assert_eq!(fx.store.current_id(), None);
    }

    #[test]
    fn adopting_an_echoed_identifier_replaces_and_persists() {
        let (base, _seen) = spawn_server(vec![(
            "/new-session",
            r#"{"success": true, "session_id": "srv-1"}"#.to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::LocalToken);
        fx.store.resolve();

        fx.store.adopt_echoed("srv-1");
        assert_eq!(fx.store.current_id().as_deref(), Some("srv-1"));

        fx.store.adopt_echoed("srv-nueva");
        assert_eq!(fx.store.current_id().as_deref(), Some("srv-nueva"));
        let raw = fs::read_to_string(&fx.token_path).unwrap();
        assert!(raw.contains("srv-nueva"));
    }

    #[test]
    fn reset_discards_the_cache_and_issues_a_fresh_identifier() {
        let (base, _seen) = spawn_server(vec![(
            "/new-session",
            r#"{"success": true, "session_id": "srv-fresh"}"#.to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::LocalToken);
        write_cached_token(&fx.token_path, "tok-old");
        if let Ok(mut slot) = fx.store.session.lock() {
            *slot = Some(Session {
                id: "tok-old".to_string(),
                created: now_utc_iso(),
                last_activity: None,
                medium: StorageMedium::LocalToken,
                durable: true,
            });
        }

        let id = fx.store.reset();
        assert_eq!(id.as_deref(), Some("srv-fresh"));
        let raw = fs::read_to_string(&fx.token_path).unwrap();
        assert!(raw.contains("srv-fresh"));
        assert!(!raw.contains("tok-old"));
    }

    #[test]
    fn reset_still_yields_an_identifier_when_the_backend_is_down() {
        let fx = fixture("http://127.0.0.1:9", SessionTransport::ServerIssued);
        let id = fx.store.reset().unwrap();
        assert!(id.starts_with("local-"));
    }
}
