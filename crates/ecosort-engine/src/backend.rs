use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ecosort_contracts::api::{
    AnalyzeReply, AnalyzeUrlReply, CleanupSessionsReply, CombinedStats, DetailedStats,
    HistoryReply, LiveHistory, NewSessionReply, ResetHistoryReply,
};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;

use crate::config::{EngineConfig, SessionTransport};

/// Blocking client for the classification backend. Cheap to clone; the
/// underlying connection pool (and cookie jar, when one is enabled) is
/// shared across clones.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    http: HttpClient,
}

/// One analysis submission: staged files and URL refs in send order plus
/// the free text and, on identifier-bearing transports, the session id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalyzeRequest {
    pub files: Vec<PathBuf>,
    pub urls: Vec<String>,
    pub user_text: Option<String>,
    pub session_id: Option<String>,
}

impl BackendClient {
    /// Requests run without a client-side timeout: a hung analysis keeps
    /// the send cycle in its in-flight state rather than failing early.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        // Title-case header serialization keeps `X-Requested-With` on the
        // wire exactly as the source page sends it.
        let mut builder = HttpClient::builder()
            .timeout(None::<Duration>)
            .http1_title_case_headers();
        if config.transport == SessionTransport::CookieSession {
            builder = builder.cookie_store(true);
        }
        let http = builder.build().context("failed to build HTTP client")?;
        Ok(Self {
            base_url: config.base_url.clone(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST /new-session
    pub fn new_session(&self) -> Result<NewSessionReply> {
        let response = self
            .http
            .post(self.endpoint("/new-session"))
            .send()
            .context("new-session request failed")?;
        let payload = json_or_http_error("new-session", response)?;
        serde_json::from_value(payload).context("new-session reply did not match the expected shape")
    }

    /// GET /historial, with the session id as a query parameter on
    /// identifier-bearing transports and bare under cookie authority.
    pub fn fetch_history(&self, session_id: Option<&str>) -> Result<HistoryReply> {
        let mut request = self.http.get(self.endpoint("/historial"));
        if let Some(session_id) = session_id {
            request = request.query(&[("session_id", session_id)]);
        }
        let response = request.send().context("historial request failed")?;
        let payload = json_or_http_error("historial", response)?;
        Ok(HistoryReply::from_value(&payload))
    }

    /// POST /, the multipart submission of the staged images and text.
    pub fn analyze(&self, request: &AnalyzeRequest) -> Result<AnalyzeReply> {
        let mut form = MultipartForm::new();
        for path in &request.files {
            let bytes =
                fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("imagen")
                .to_string();
            let mut part = MultipartPart::bytes(bytes).file_name(file_name);
            if let Some(mime) = mime_for_path(path) {
                part = part
                    .mime_str(mime)
                    .with_context(|| format!("invalid mime type for {}", path.display()))?;
            }
            form = form.part("imagen", part);
        }
        for url in &request.urls {
            form = form.text("imagen_url", url.clone());
        }
        if let Some(text) = &request.user_text {
            form = form.text("user_text", text.clone());
        }
        if let Some(session_id) = &request.session_id {
            form = form.text("session_id", session_id.clone());
        }
        let response = self
            .http
            .post(self.endpoint("/"))
            .header("X-Requested-With", "XMLHttpRequest")
            .multipart(form)
            .send()
            .context("analyze request failed")?;
        let payload = json_or_http_error("analyze", response)?;
        serde_json::from_value(payload).context("analyze reply did not match the expected shape")
    }

    /// GET /analizar_url, the external trigger's direct analysis path.
    /// Failures come back as JSON error bodies on 4xx/5xx statuses, so the
    /// body is parsed before the status is judged.
    pub fn analyze_url(&self, url: &str) -> Result<AnalyzeUrlReply> {
        let response = self
            .http
            .get(self.endpoint("/analizar_url"))
            .query(&[("url", url)])
            .send()
            .context("analizar_url request failed")?;
        let status = response.status();
        let body = response
            .text()
            .context("failed reading analizar_url response body")?;
        match serde_json::from_str::<AnalyzeUrlReply>(&body) {
            Ok(reply) => Ok(reply),
            Err(_) if !status.is_success() => bail!(
                "analizar_url request failed with HTTP {}: {}",
                status.as_u16(),
                truncate_text(body.trim(), 512)
            ),
            Err(err) => {
                Err(err).context("analizar_url reply did not match the expected shape")
            }
        }
    }

    /// POST /reiniciar_historial
    pub fn reset_history(&self) -> Result<ResetHistoryReply> {
        let response = self
            .http
            .post(self.endpoint("/reiniciar_historial"))
            .send()
            .context("reiniciar_historial request failed")?;
        let payload = json_or_http_error("reiniciar_historial", response)?;
        serde_json::from_value(payload)
            .context("reiniciar_historial reply did not match the expected shape")
    }

    /// GET /estadisticas_historial
    pub fn combined_stats(&self) -> Result<CombinedStats> {
        let response = self
            .http
            .get(self.endpoint("/estadisticas_historial"))
            .send()
            .context("estadisticas_historial request failed")?;
        let payload = json_or_http_error("estadisticas_historial", response)?;
        Ok(CombinedStats::from_value(&payload))
    }

    /// GET /admin/estadisticas_detalladas
    pub fn detailed_stats(&self) -> Result<DetailedStats> {
        let response = self
            .http
            .get(self.endpoint("/admin/estadisticas_detalladas"))
            .send()
            .context("estadisticas_detalladas request failed")?;
        let payload = json_or_http_error("estadisticas_detalladas", response)?;
        Ok(DetailedStats::from_value(&payload))
    }

    /// GET /historial_live
    pub fn live_history(&self) -> Result<LiveHistory> {
        let response = self
            .http
            .get(self.endpoint("/historial_live"))
            .send()
            .context("historial_live request failed")?;
        let payload = json_or_http_error("historial_live", response)?;
        Ok(LiveHistory::from_value(&payload))
    }

    /// POST /admin/limpiar_sesiones
    pub fn cleanup_sessions(&self) -> Result<CleanupSessionsReply> {
        let response = self
            .http
            .post(self.endpoint("/admin/limpiar_sesiones"))
            .send()
            .context("limpiar_sesiones request failed")?;
        let payload = json_or_http_error("limpiar_sesiones", response)?;
        serde_json::from_value(payload)
            .context("limpiar_sesiones reply did not match the expected shape")
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn json_or_http_error(endpoint: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("failed reading {endpoint} response body"))?;
    if !status.is_success() {
        bail!(
            "{endpoint} request failed with HTTP {}: {}",
            status.as_u16(),
            truncate_text(body.trim(), 512)
        );
    }
    serde_json::from_str(&body)
        .with_context(|| format!("{endpoint} returned a body that is not valid JSON"))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let truncated: String = value.chars().take(max_chars).collect();
    format!("{truncated}…")
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        "avif" => Some("image/avif"),
        _ => None,
    }
}
