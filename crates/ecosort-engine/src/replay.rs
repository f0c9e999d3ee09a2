use std::sync::{Arc, Mutex};

use ecosort_contracts::events::EventWriter;
use ecosort_contracts::history::{bot_turn_text, conversations_from_reply, ImageKind};
use serde_json::json;

use crate::backend::BackendClient;
use crate::identity::IdentityStore;
use crate::json_object;
use crate::transcript::{Transcript, UserImage};

/// What a completed replay put back on screen, plus the session metadata
/// the reply carried. Rendered as the one-line session indicator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub session_id: Option<String>,
    pub created: Option<String>,
    pub last_activity: Option<String>,
    pub total_images_analyzed: u64,
}

/// One-shot transcript reconstruction from the server's history. Runs once
/// at startup, after the session identity is resolved and before the REPL
/// accepts input.
pub struct HistoryReplay {
    backend: BackendClient,
    identity: Arc<IdentityStore>,
    transcript: Arc<Mutex<Transcript>>,
    events: EventWriter,
}

impl HistoryReplay {
    pub fn new(
        backend: BackendClient,
        identity: Arc<IdentityStore>,
        transcript: Arc<Mutex<Transcript>>,
        events: EventWriter,
    ) -> Self {
        Self {
            backend,
            identity,
            transcript,
            events,
        }
    }

    /// Fetch the session's history and rebuild the transcript from it.
    ///
    /// Every failure mode (fetch error, error reply, legacy shape) leaves
    /// the welcome-only transcript untouched and is reported through the
    /// event log only; startup never blocks on a broken history.
    pub fn load(&self) -> ReplaySummary {
        let explicit_id = self.identity.transport().sends_identifier();
        let session_id = self.identity.current_id();
        if explicit_id && session_id.is_none() {
            let _ = self.events.emit(
                "history_unavailable",
                json_object(json!({"reason": "no session identifier"})),
            );
            return ReplaySummary::default();
        }
        // Cookie-borne sessions never send the identifier; the jar does.
        let query_id = if explicit_id { session_id } else { None };

        let reply = match self.backend.fetch_history(query_id.as_deref()) {
            Ok(reply) => reply,
            Err(err) => {
                let _ = self.events.emit(
                    "history_fetch_failed",
                    json_object(json!({"error": format!("{err:#}")})),
                );
                return ReplaySummary::default();
            }
        };
        if reply.is_error() {
            let _ = self.events.emit(
                "history_fetch_failed",
                json_object(json!({"error": reply.error})),
            );
            return ReplaySummary::default();
        }

        if let Some(echoed) = reply.session_id.as_deref() {
            self.identity.adopt_echoed(echoed);
        }

        let summary = ReplaySummary {
            replayed: 0,
            session_id: reply.session_id.clone(),
            created: reply.created.clone(),
            last_activity: reply.last_activity.clone(),
            total_images_analyzed: reply.total_images_analyzed,
        };

        if reply.is_legacy() {
            // Results without user messages; nothing renderable survives.
            let _ = self.events.emit(
                "history_legacy",
                json_object(json!({
                    "session_id": summary.session_id,
                    "analyses": reply.legacy_analyses,
                })),
            );
            return summary;
        }

        let conversations = conversations_from_reply(&reply);
        let mut replayed = 0usize;
        if let Ok(mut transcript) = self.transcript.lock() {
            for conversation in &conversations {
                let images: Vec<UserImage> = conversation
                    .user_message
                    .images
                    .iter()
                    .map(|image| UserImage {
                        display: image.display_url.clone(),
                        from_file: image.kind != ImageKind::ExternalUrl,
                    })
                    .collect();
                transcript.push_user(&conversation.user_message.text, images);
                if !conversation.bot_responses.is_empty() {
                    transcript.push_bot(&bot_turn_text(&conversation.bot_responses));
                }
                replayed += 1;
            }
        }

        let _ = self.events.emit(
            "history_replayed",
            json_object(json!({
                "session_id": summary.session_id,
                "conversations": replayed,
            })),
        );
        ReplaySummary { replayed, ..summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crate::config::{EngineConfig, SessionTransport};
    use crate::transcript::{EntryKind, NullView, RevealMarker};

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
        replay: HistoryReplay,
        identity: Arc<IdentityStore>,
        transcript: Arc<Mutex<Transcript>>,
        _state_dir: tempfile::TempDir,
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
        let events = EventWriter::new(state_dir.path().join("events.jsonl"), "test-run");
        let identity = Arc::new(IdentityStore::new(&config, backend.clone(), events.clone()));
        let transcript = Arc::new(Mutex::new(Transcript::new(Arc::new(NullView))));
        Fixture {
            replay: HistoryReplay::new(backend, Arc::clone(&identity), Arc::clone(&transcript), events),
            identity,
            transcript,
            _state_dir: state_dir,
        }
    }

    fn two_conversations_out_of_order() -> String {
        // The newer exchange is listed first; replay must reorder.
        r#"{
            "session_id": "srv-9",
            "created": "2024-06-01T09:00:00+00:00",
            "last_activity": "2024-06-01T10:30:00+00:00",
            "total_images_analyzed": 3,
            "conversations": [
                {
                    "timestamp": "2024-06-01T10:30:00+00:00",
                    "user_message": {"text": "¿Y esta botella?", "images": [
                        {"tipo": "archivo_subido", "filename": "botella.jpg", "url_relativa": "/static/uploads/botella.jpg"}
                    ]},
                    "bot_responses": [
                        {"resultado": {"etiqueta": "Plástico", "confianza": 0.93},
                         "recomendacion": "Deposítala en el contenedor amarillo."}
                    ]
                },
                {
                    "timestamp": "2024-06-01T09:15:00+00:00",
                    "user_message": {"text": "hola", "images": []},
                    "bot_responses": []
                }
            ]
        }"#
        .to_string()
    }

    #[test]
    fn fresh_session_keeps_the_welcome_only_transcript() {
        let (base, _seen) = spawn_server(vec![(
            "/historial",
            r#"{"session_id": "srv-1", "created": "2024-06-01T09:00:00+00:00", "conversations": []}"#
                .to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::CookieSession);

        let summary = fx.replay.load();
        assert_eq!(summary.replayed, 0);
        assert_eq!(summary.session_id.as_deref(), Some("srv-1"));
        assert!(fx.transcript.lock().unwrap().is_welcome_only());
    }

    #[test]
    fn conversations_are_replayed_oldest_first() {
        let (base, _seen) = spawn_server(vec![("/historial", two_conversations_out_of_order())]);
        let fx = fixture(&base, SessionTransport::CookieSession);

        let summary = fx.replay.load();
        assert_eq!(summary.replayed, 2);
        assert_eq!(summary.total_images_analyzed, 3);

        let transcript = fx.transcript.lock().unwrap();
        let entries = transcript.entries();
        // welcome, then hola (no bot turn), then the photo exchange.
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].kind, EntryKind::User);
        assert_eq!(entries[1].text, "hola");
        assert_eq!(entries[2].kind, EntryKind::User);
        assert_eq!(entries[2].text, "¿Y esta botella?");
        assert_eq!(entries[3].kind, EntryKind::Bot);
        assert!(entries[3].text.contains("Imagen 1:"));
        assert!(entries[3].text.contains("Material identificado: Plástico"));
        assert!(entries[3].text.contains("Porcentaje de confianza: 93.0%"));
        assert!(entries[3].text.contains("💡 Deposítala en el contenedor amarillo."));
        // Replayed turns render in full, no typed reveal.
        assert_eq!(entries[3].reveal, RevealMarker::Instant);
    }

    #[test]
    fn uploaded_files_and_external_urls_keep_their_origin() {
        let (base, _seen) = spawn_server(vec![(
            "/historial",
            r#"{
                "session_id": "srv-2",
                "conversations": [{
                    "timestamp": "2024-06-01T09:00:00+00:00",
                    "user_message": {"text": "", "images": [
                        {"tipo": "archivo_subido", "filename": "lata.png", "url_relativa": "/static/uploads/lata.png"},
                        {"tipo": "url_externa", "url_original": "https://img.example/caja.jpg"}
                    ]},
                    "bot_responses": []
                }]
            }"#
            .to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::CookieSession);

        fx.replay.load();
        let transcript = fx.transcript.lock().unwrap();
        let images = &transcript.entries()[1].images;
        assert_eq!(images.len(), 2);
        assert!(images[0].from_file);
        assert_eq!(images[0].display, "/static/uploads/lata.png");
        assert!(!images[1].from_file);
        assert_eq!(images[1].display, "https://img.example/caja.jpg");
    }

    #[test]
    fn fetch_failure_is_silent() {
        // Nothing listens on this port.
        let fx = fixture("http://127.0.0.1:9", SessionTransport::CookieSession);

        let summary = fx.replay.load();
        assert_eq!(summary, ReplaySummary::default());
        assert!(fx.transcript.lock().unwrap().is_welcome_only());
    }

    #[test]
    fn error_reply_is_silent() {
        let (base, _seen) = spawn_server(vec![(
            "/historial",
            r#"{"error": "Sesión no encontrada"}"#.to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::CookieSession);

        let summary = fx.replay.load();
        assert_eq!(summary, ReplaySummary::default());
        assert!(fx.transcript.lock().unwrap().is_welcome_only());
    }

    #[test]
    fn legacy_shape_reports_counts_without_rendering() {
        let (base, _seen) = spawn_server(vec![(
            "/historial",
            r#"{"session_id": "srv-3", "total_images_analyzed": 5, "analyses": [1, 2, 3]}"#
                .to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::CookieSession);

        let summary = fx.replay.load();
        assert_eq!(summary.replayed, 0);
        assert_eq!(summary.session_id.as_deref(), Some("srv-3"));
        assert_eq!(summary.total_images_analyzed, 5);
        assert!(fx.transcript.lock().unwrap().is_welcome_only());
    }

    #[test]
    fn identifier_transports_skip_the_fetch_without_an_id() {
        let (base, seen) = spawn_server(vec![]);
        let fx = fixture(&base, SessionTransport::ServerIssued);
        // resolve() was never called, so there is no identifier to send.

        let summary = fx.replay.load();
        assert_eq!(summary, ReplaySummary::default());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn identifier_transports_query_with_the_resolved_id() {
        let (base, seen) = spawn_server(vec![
            (
                "/new-session",
                r#"{"success": true, "session_id": "srv-7"}"#.to_string(),
            ),
            (
                "/historial",
                r#"{"session_id": "srv-7", "conversations": []}"#.to_string(),
            ),
        ]);
        let fx = fixture(&base, SessionTransport::ServerIssued);
        fx.identity.resolve();

        let summary = fx.replay.load();
        assert_eq!(summary.session_id.as_deref(), Some("srv-7"));
        let urls = seen.lock().unwrap();
        assert!(urls
            .iter()
            .any(|url| url.starts_with("/historial") && url.contains("session_id=srv-7")));
    }

    #[test]
    fn cookie_discovery_adopts_the_replied_identifier() {
        let (base, seen) = spawn_server(vec![(
            "/historial",
            r#"{"session_id": "cookie-4", "conversations": []}"#.to_string(),
        )]);
        let fx = fixture(&base, SessionTransport::CookieSession);

        fx.replay.load();
        assert_eq!(fx.identity.current_id().as_deref(), Some("cookie-4"));
        let urls = seen.lock().unwrap();
        assert!(urls.iter().all(|url| !url.contains("session_id=")));
    }
}
