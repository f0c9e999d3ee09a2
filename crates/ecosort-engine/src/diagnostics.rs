use anyhow::Result;
use ecosort_contracts::api::{
    CleanupSessionsReply, CombinedStats, DetailedStats, LiveHistory, SessionDetailRow,
};

use crate::backend::BackendClient;
use crate::config::SessionTransport;
use crate::identity::Session;
use crate::replay::ReplaySummary;

/// Read-only admin queries plus their terminal renderings. Everything
/// here is observation; nothing mutates a session.
pub struct Diagnostics {
    backend: BackendClient,
}

impl Diagnostics {
    pub fn new(backend: BackendClient) -> Self {
        Self { backend }
    }

    pub fn combined_stats(&self) -> Result<CombinedStats> {
        self.backend.combined_stats()
    }

    pub fn detailed_stats(&self) -> Result<DetailedStats> {
        self.backend.detailed_stats()
    }

    pub fn live_history(&self) -> Result<LiveHistory> {
        self.backend.live_history()
    }

    pub fn cleanup_sessions(&self) -> Result<CleanupSessionsReply> {
        self.backend.cleanup_sessions()
    }
}

/// The one-line session indicator printed after replay.
pub fn render_session_line(summary: &ReplaySummary, fallback_id: Option<&str>) -> String {
    let id = match summary.session_id.as_deref().or(fallback_id) {
        Some(id) => short_id(id),
        None => "desconocida",
    };
    let mut line = format!("Sesión {id}");
    if let Some(created) = summary.created.as_deref() {
        line.push_str(&format!(" · creada {created}"));
    }
    if let Some(last) = summary.last_activity.as_deref() {
        line.push_str(&format!(" · última actividad {last}"));
    }
    line.push_str(&format!(
        " · {} imágenes analizadas",
        summary.total_images_analyzed
    ));
    line
}

/// Full detail for the `/session` command.
pub fn render_session_detail(session: &Session, transport: SessionTransport) -> String {
    let durable = if session.durable {
        "persistente"
    } else {
        "volátil"
    };
    let mut out = format!(
        "Sesión: {}\nTransporte: {}\nAlmacenamiento: {}\nCreada: {}",
        session.id,
        transport.as_str(),
        session.medium.as_str(),
        session.created,
    );
    if let Some(last) = session.last_activity.as_deref() {
        out.push_str(&format!("\nÚltima actividad: {last}"));
    }
    out.push_str(&format!("\nIdentidad: {durable}"));
    out
}

pub fn render_combined_stats(stats: &CombinedStats) -> String {
    let live = if stats.live_available {
        format!("{} (disponible)", stats.live_total)
    } else {
        format!("{} (no disponible)", stats.live_total)
    };
    format!(
        "Sesiones activas: {}\nAnálisis en sesiones: {}\nLimpieza automática: cada {} h\nAnálisis en vivo: {live}\nTotal general: {}",
        stats.active_sessions, stats.session_analyses, stats.cleanup_hours, stats.grand_total,
    )
}

pub fn render_detailed_stats(stats: &DetailedStats) -> String {
    let mut out = format!(
        "Sesiones activas: {} · análisis: {} · en vivo: {} · limpieza cada {} h",
        stats.active_sessions, stats.session_analyses, stats.live_analyses, stats.cleanup_hours,
    );
    for row in &stats.sessions {
        out.push('\n');
        out.push_str(&render_session_row(row));
    }
    out
}

fn render_session_row(row: &SessionDetailRow) -> String {
    let id = row.session_id.as_deref().unwrap_or("desconocida");
    let mut line = format!("  {}", short_id(id));
    if let Some(created) = row.created.as_deref() {
        line.push_str(&format!("  creada {created}"));
    }
    if let Some(last) = row.last_activity.as_deref() {
        line.push_str(&format!("  última {last}"));
    }
    line.push_str(&format!("  análisis {}", row.total_analyses));
    line
}

/// Rendered oldest-first, truncated to the `limit` most recent entries.
pub fn render_live_history(history: &LiveHistory, limit: usize) -> String {
    let mut out = format!(
        "Historial en vivo · {} imágenes analizadas",
        history.total_images_analyzed
    );
    if let Some(created) = history.created.as_deref() {
        out.push_str(&format!(" · desde {created}"));
    }
    let start = history.entries.len().saturating_sub(limit);
    for entry in &history.entries[start..] {
        out.push('\n');
        let ts = entry.timestamp.as_deref().unwrap_or("");
        out.push_str(&format!(
            "  {ts}  {}  {}",
            entry.etiqueta, entry.confianza_porcentaje
        ));
    }
    if start > 0 {
        out.push_str(&format!("\n  ({} anteriores omitidas)", start));
    }
    out
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use ecosort_contracts::api::LiveHistoryEntry;

    use crate::config::EngineConfig;
    use crate::identity::StorageMedium;

    #[test]
    fn session_line_prefers_the_reply_identifier() {
        let summary = ReplaySummary {
            replayed: 2,
            session_id: Some("abcdef1234567890".to_string()),
            created: Some("2024-06-01T09:00:00+00:00".to_string()),
            last_activity: Some("2024-06-01T10:30:00+00:00".to_string()),
            total_images_analyzed: 3,
        };
        assert_eq!(
            render_session_line(&summary, Some("other")),
            "Sesión abcdef12 · creada 2024-06-01T09:00:00+00:00 · \
             última actividad 2024-06-01T10:30:00+00:00 · 3 imágenes analizadas"
        );
    }

    #[test]
    fn session_line_falls_back_to_the_resolved_identifier() {
        let summary = ReplaySummary::default();
        assert_eq!(
            render_session_line(&summary, Some("local-17")),
            "Sesión local-17 · 0 imágenes analizadas"
        );
        assert_eq!(
            render_session_line(&summary, None),
            "Sesión desconocida · 0 imágenes analizadas"
        );
    }

    #[test]
    fn session_detail_lists_every_field() {
        let session = Session {
            id: "srv-9".to_string(),
            created: "2024-06-01T09:00:00+00:00".to_string(),
            last_activity: Some("2024-06-01T10:30:00+00:00".to_string()),
            medium: StorageMedium::LocalToken,
            durable: true,
        };
        let detail = render_session_detail(&session, SessionTransport::LocalToken);
        assert!(detail.contains("Sesión: srv-9"));
        assert!(detail.contains("Transporte: local-token"));
        assert!(detail.contains("Almacenamiento: local-token"));
        assert!(detail.contains("Última actividad: 2024-06-01T10:30:00+00:00"));
        assert!(detail.contains("Identidad: persistente"));
    }

    #[test]
    fn session_detail_omits_unknown_activity() {
        let session = Session {
            id: "local-17".to_string(),
            created: "2024-06-01T09:00:00+00:00".to_string(),
            last_activity: None,
            medium: StorageMedium::None,
            durable: false,
        };
        let detail = render_session_detail(&session, SessionTransport::ServerIssued);
        assert!(!detail.contains("Última actividad"));
        assert!(detail.contains("Identidad: volátil"));
    }

    #[test]
    fn combined_stats_render_covers_both_stores() {
        let stats = CombinedStats {
            active_sessions: 3,
            session_analyses: 12,
            cleanup_hours: 24,
            live_total: 7,
            live_available: true,
            grand_total: 19,
            error: None,
        };
        let rendered = render_combined_stats(&stats);
        assert!(rendered.contains("Sesiones activas: 3"));
        assert!(rendered.contains("Análisis en sesiones: 12"));
        assert!(rendered.contains("cada 24 h"));
        assert!(rendered.contains("Análisis en vivo: 7 (disponible)"));
        assert!(rendered.contains("Total general: 19"));
    }

    #[test]
    fn detailed_stats_render_shortens_session_ids() {
        let stats = DetailedStats {
            active_sessions: 1,
            session_analyses: 5,
            live_analyses: 2,
            cleanup_hours: 24,
            sessions: vec![SessionDetailRow {
                session_id: Some("0123456789abcdef".to_string()),
                created: Some("2024-06-01T09:00:00".to_string()),
                last_activity: None,
                total_analyses: 5,
            }],
            error: None,
        };
        let rendered = render_detailed_stats(&stats);
        assert!(rendered.contains("  01234567  creada 2024-06-01T09:00:00  análisis 5"));
        assert!(!rendered.contains("0123456789abcdef"));
    }

    #[test]
    fn live_history_render_keeps_the_most_recent() {
        let history = LiveHistory {
            created: Some("2024-05-01".to_string()),
            total_images_analyzed: 3,
            entries: vec![
                LiveHistoryEntry {
                    timestamp: Some("t1".to_string()),
                    etiqueta: "Plástico".to_string(),
                    confianza_porcentaje: "93.0%".to_string(),
                },
                LiveHistoryEntry {
                    timestamp: Some("t2".to_string()),
                    etiqueta: "Vidrio".to_string(),
                    confianza_porcentaje: "88.0%".to_string(),
                },
                LiveHistoryEntry {
                    timestamp: Some("t3".to_string()),
                    etiqueta: "Metal".to_string(),
                    confianza_porcentaje: "71.0%".to_string(),
                },
            ],
            error: None,
        };
        let rendered = render_live_history(&history, 2);
        assert!(!rendered.contains("Plástico"));
        assert!(rendered.contains("t2  Vidrio  88.0%"));
        assert!(rendered.contains("t3  Metal  71.0%"));
        assert!(rendered.contains("(1 anteriores omitidas)"));
    }

    #[test]
    fn queries_delegate_to_the_backend() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}", server.server_addr().to_ip().unwrap());
        thread::spawn(move || {
            for request in server.incoming_requests() {
                let body = r#"{"sesiones": {"sesiones_activas": 2, "total_analisis_sesiones": 8, "horas_limpieza": 24}, "live": {"total": 4, "disponible": true}, "total_general": 12}"#;
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
        let config = EngineConfig {
            base_url: base,
            socket_url: "ws://127.0.0.1:1/socket".to_string(),
            transport: SessionTransport::CookieSession,
            state_dir: std::env::temp_dir(),
            typing_interval_ms: 1,
        };
        let diagnostics = Diagnostics::new(BackendClient::new(&config).unwrap());

        let stats = diagnostics.combined_stats().unwrap();
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.grand_total, 12);
    }
}
