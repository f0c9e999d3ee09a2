use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply to `POST /new-session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSessionReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Reply to `POST /` (multipart analyze).
///
/// `resultado` carries the backend's rendered answer with `<br>` line
/// breaks; `session_id` echoes the session the analysis was recorded
/// under, which may differ from the one submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeReply {
    #[serde(default)]
    pub resultado: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Reply to `GET /analizar_url`.
///
/// Three disjoint shapes share this struct: an `error` reply, a direct
/// result (`etiqueta` + `confianza`, no `inicio_analisis`), and a
/// deferred acknowledgement (`inicio_analisis: true`, result arrives on
/// the realtime channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeUrlReply {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub inicio_analisis: Option<bool>,
    #[serde(default)]
    pub etiqueta: Option<String>,
    #[serde(default)]
    pub confianza: Option<f64>,
}

/// Reply to `POST /reiniciar_historial`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetHistoryReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Reply to `POST /admin/limpiar_sesiones`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupSessionsReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Session history as returned by `GET /historial`.
///
/// The backend has shipped two record layouts: the current one carries
/// `conversations` (full user + bot exchanges); sessions written by older
/// deployments carry only `analyses` (bot results with no user messages).
/// A not-found session is an HTTP 200 reply whose body is just `{"error"}`,
/// so callers must check [`HistoryReply::is_error`] before trusting fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryReply {
    pub session_id: Option<String>,
    pub created: Option<String>,
    pub last_activity: Option<String>,
    pub total_images_analyzed: u64,
    pub conversations: Vec<WireConversation>,
    pub legacy_analyses: u64,
    pub error: Option<String>,
}

impl HistoryReply {
    /// Parse the tolerant way: absent fields default, unknown fields are
    /// ignored, malformed conversation entries are skipped.
    pub fn from_value(payload: &Value) -> Self {
        let mut reply = Self::default();
        let Some(obj) = payload.as_object() else {
            reply.error = Some("respuesta no es un objeto".to_string());
            return reply;
        };

        reply.error = obj
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        reply.session_id = obj
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        reply.created = obj
            .get("created")
            .and_then(Value::as_str)
            .map(str::to_string);
        reply.last_activity = obj
            .get("last_activity")
            .and_then(Value::as_str)
            .map(str::to_string);
        reply.total_images_analyzed = obj
            .get("total_images_analyzed")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if let Some(conversations) = obj.get("conversations").and_then(Value::as_array) {
            for item in conversations {
                if let Ok(parsed) = serde_json::from_value::<WireConversation>(item.clone()) {
                    reply.conversations.push(parsed);
                }
            }
        }
        if let Some(analyses) = obj.get("analyses").and_then(Value::as_array) {
            reply.legacy_analyses = analyses.len() as u64;
        }
        reply
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Old-format session: results were recorded without user messages,
    /// so there is nothing to replay.
    pub fn is_legacy(&self) -> bool {
        self.conversations.is_empty() && self.legacy_analyses > 0
    }
}

/// One recorded exchange inside a history reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireConversation {
    pub timestamp: String,
    pub user_message: WireUserMessage,
    #[serde(default)]
    pub bot_responses: Vec<WireBotResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireUserMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub images: Vec<WireImage>,
}

/// Raw image record. Which of the optional fields are present depends on
/// `tipo` (`archivo_subido`, `url_externa`, `ruta_local`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireImage {
    pub tipo: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub url_original: Option<String>,
    #[serde(default)]
    pub ruta_original: Option<String>,
    #[serde(default)]
    pub url_relativa: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBotResponse {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub resultado: WireResultado,
    #[serde(default)]
    pub recomendacion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResultado {
    pub etiqueta: String,
    #[serde(default)]
    pub confianza: f64,
    #[serde(default)]
    pub confianza_porcentaje: Option<String>,
}

/// Combined stats from `GET /estadisticas_historial`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CombinedStats {
    pub active_sessions: u64,
    pub session_analyses: u64,
    pub cleanup_hours: u64,
    pub live_total: u64,
    pub live_available: bool,
    pub grand_total: u64,
    pub error: Option<String>,
}

impl CombinedStats {
    pub fn from_value(payload: &Value) -> Self {
        let mut stats = Self::default();
        let Some(obj) = payload.as_object() else {
            return stats;
        };
        stats.error = obj
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(sesiones) = obj.get("sesiones").and_then(Value::as_object) {
            stats.active_sessions = sesiones
                .get("sesiones_activas")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            stats.session_analyses = sesiones
                .get("total_analisis_sesiones")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            stats.cleanup_hours = sesiones
                .get("horas_limpieza")
                .and_then(Value::as_u64)
                .unwrap_or(0);
        }
        if let Some(live) = obj.get("live").and_then(Value::as_object) {
            stats.live_total = live.get("total").and_then(Value::as_u64).unwrap_or(0);
            stats.live_available = live
                .get("disponible")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }
        stats.grand_total = obj
            .get("total_general")
            .and_then(Value::as_u64)
            .unwrap_or(stats.session_analyses + stats.live_total);
        stats
    }
}

/// One row of `GET /admin/estadisticas_detalladas`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDetailRow {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub last_activity: Option<String>,
    #[serde(default)]
    pub total_analyses: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetailedStats {
    pub active_sessions: u64,
    pub session_analyses: u64,
    pub live_analyses: u64,
    pub cleanup_hours: u64,
    pub sessions: Vec<SessionDetailRow>,
    pub error: Option<String>,
}

impl DetailedStats {
    pub fn from_value(payload: &Value) -> Self {
        let mut stats = Self::default();
        let Some(obj) = payload.as_object() else {
            return stats;
        };
        stats.error = obj
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(sesiones) = obj.get("sesiones").and_then(Value::as_object) {
            stats.active_sessions = sesiones
                .get("total_activas")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            stats.session_analyses = sesiones
                .get("total_analisis")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if let Some(rows) = sesiones.get("detalles").and_then(Value::as_array) {
                for row in rows {
                    if let Ok(parsed) = serde_json::from_value::<SessionDetailRow>(row.clone()) {
                        stats.sessions.push(parsed);
                    }
                }
            }
        }
        if let Some(live) = obj.get("live").and_then(Value::as_object) {
            stats.live_analyses = live
                .get("total_analisis")
                .and_then(Value::as_u64)
                .unwrap_or(0);
        }
        if let Some(sistema) = obj.get("sistema").and_then(Value::as_object) {
            stats.cleanup_hours = sistema
                .get("cleanup_hours")
                .and_then(Value::as_u64)
                .unwrap_or(0);
        }
        stats
    }
}

/// The persistent live-analysis history from `GET /historial_live`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LiveHistory {
    pub created: Option<String>,
    pub total_images_analyzed: u64,
    pub entries: Vec<LiveHistoryEntry>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveHistoryEntry {
    pub timestamp: Option<String>,
    pub etiqueta: String,
    pub confianza_porcentaje: String,
}

impl LiveHistory {
    pub fn from_value(payload: &Value) -> Self {
        let mut history = Self::default();
        let Some(obj) = payload.as_object() else {
            return history;
        };
        history.error = obj
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        history.created = obj
            .get("created")
            .and_then(Value::as_str)
            .map(str::to_string);
        history.total_images_analyzed = obj
            .get("total_images_analyzed")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if let Some(analyses) = obj.get("analyses").and_then(Value::as_array) {
            for item in analyses {
                let Some(entry) = item.as_object() else {
                    continue;
                };
                let Some(resultado) = entry.get("resultado").and_then(Value::as_object) else {
                    continue;
                };
                let Some(etiqueta) = resultado.get("etiqueta").and_then(Value::as_str) else {
                    continue;
                };
                history.entries.push(LiveHistoryEntry {
                    timestamp: entry
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    etiqueta: etiqueta.to_string(),
                    confianza_porcentaje: resultado
                        .get("confianza_porcentaje")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                });
            }
        }
        history
    }
}
