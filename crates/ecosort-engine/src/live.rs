use std::sync::{Arc, Mutex};

use ecosort_contracts::events::EventWriter;
use serde_json::json;

use crate::backend::BackendClient;
use crate::json_object;
use crate::state::{ConnectionSignal, ConnectionState};

/// What the live surface shows when the URL fetch itself fails; the
/// server never got to say anything more specific.
pub const LIVE_FETCH_ERROR: &str = "Error al procesar la imagen";

/// Render sink for the live surface: the status chip plus the result
/// cards. The CLI prints lines; tests record calls.
pub trait LiveView: Send + Sync {
    fn status_changed(&self, state: ConnectionState);
    fn analysis_started(&self);
    fn result_rendered(&self, url: &str, label: &str, confidence: f64);
    fn error_rendered(&self, message: &str);
}

/// View that swallows everything.
pub struct NullLiveView;

impl LiveView for NullLiveView {
    fn status_changed(&self, _state: ConnectionState) {}
    fn analysis_started(&self) {}
    fn result_rendered(&self, _url: &str, _label: &str, _confidence: f64) {}
    fn error_rendered(&self, _message: &str) {}
}

/// The live surface's status chip. All transitions funnel through
/// [`ConnectionState::apply`], so transport noise cannot overwrite an
/// analysis that is on screen.
pub struct StatusPanel {
    state: Mutex<ConnectionState>,
    view: Arc<dyn LiveView>,
}

impl StatusPanel {
    pub fn new(view: Arc<dyn LiveView>) -> Self {
        view.status_changed(ConnectionState::Connecting);
        Self {
            state: Mutex::new(ConnectionState::Connecting),
            view,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Error)
    }

    pub fn transport_connected(&self) {
        self.signal(ConnectionSignal::TransportUp);
    }

    pub fn transport_disconnected(&self) {
        self.signal(ConnectionSignal::TransportDown);
    }

    /// An analysis is underway; the chip shows it until a result or an
    /// error lands.
    pub fn show_analyzing(&self) {
        self.view.analysis_started();
        self.signal(ConnectionSignal::AnalysisStarted);
    }

    /// Render a finished classification. The result card goes out before
    /// the chip flips back, so observers never see Connected without the
    /// result that ended the analysis.
    pub fn show_result(&self, url: &str, label: &str, confidence: f64) {
        self.view.result_rendered(url, label, confidence);
        self.signal(ConnectionSignal::AnalysisCompleted);
    }

    pub fn show_error(&self, message: &str) {
        self.view.error_rendered(message);
        self.signal(ConnectionSignal::AnalysisFailed);
    }

    fn signal(&self, signal: ConnectionSignal) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(next) = state.apply(signal) {
                if next != *state {
                    *state = next;
                    self.view.status_changed(next);
                }
            }
        }
    }
}

/// A classification request that arrived while the realtime channel was
/// down, parked until the channel comes back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAnalysis {
    pub source_url: String,
}

/// Single-slot queue: at most one analysis waits, and a re-trigger
/// replaces it. Whoever connects drains it exactly once.
#[derive(Default)]
pub struct PendingSlot {
    slot: Mutex<Option<PendingAnalysis>>,
}

impl PendingSlot {
    pub fn put(&self, analysis: PendingAnalysis) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(analysis);
        }
    }

    pub fn take(&self) -> Option<PendingAnalysis> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }
}

/// Answers whether the realtime channel is up right now.
pub trait ChannelReadinessProbe: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Work the channel worker hands back to whoever parked it, invoked on
/// every (re)connect before the status flips to connected.
pub trait PendingQueueDrainer: Send + Sync {
    fn drain(&self);
}

/// Drives URL analyses triggered from outside the chat: issues the HTTP
/// request when the channel is up, parks the request when it is not.
pub struct LiveAnalyzer {
    backend: BackendClient,
    panel: Arc<StatusPanel>,
    probe: Arc<dyn ChannelReadinessProbe>,
    pending: PendingSlot,
    events: EventWriter,
}

impl LiveAnalyzer {
    pub fn new(
        backend: BackendClient,
        panel: Arc<StatusPanel>,
        probe: Arc<dyn ChannelReadinessProbe>,
        events: EventWriter,
    ) -> Self {
        Self {
            backend,
            panel,
            probe,
            pending: PendingSlot::default(),
            events,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_pending()
    }

    /// Entry point for a URL handed in from outside (startup argument).
    /// Shows busy feedback immediately either way; only the network call
    /// waits for the channel.
    pub fn handle_external_trigger(&self, url: &str) {
        let url = url.trim();
        if url.is_empty() {
            return;
        }
        if self.probe.is_connected() {
            self.process_analysis(url);
        } else {
            self.pending.put(PendingAnalysis {
                source_url: url.to_string(),
            });
            self.panel.show_analyzing();
            let _ = self.events.emit(
                "live_trigger_deferred",
                json_object(json!({"url": url})),
            );
        }
    }

    /// Ask the server to classify the image behind `url` and render the
    /// outcome. Three reply shapes: an error message, a direct result,
    /// or an accepted hand-off whose result arrives over the socket.
    pub fn process_analysis(&self, url: &str) {
        self.panel.show_analyzing();
        let _ = self.events.emit(
            "live_analysis_requested",
            json_object(json!({"url": url})),
        );
        match self.backend.analyze_url(url) {
            Ok(reply) => {
                if let Some(error) = reply.error {
                    self.panel.show_error(&error);
                    let _ = self.events.emit(
                        "live_analysis_failed",
                        json_object(json!({"url": url, "error": error})),
                    );
                } else if reply.inicio_analisis == Some(true) {
                    // Accepted; the socket announces progress and delivers
                    // the result, so the chip stays on Analizando.
                    let _ = self.events.emit(
                        "live_analysis_accepted",
                        json_object(json!({"url": url})),
                    );
                } else {
                    let label = reply.etiqueta.unwrap_or_default();
                    let confidence = reply.confianza.unwrap_or(0.0);
                    self.panel.show_result(url, &label, confidence);
                    let _ = self.events.emit(
                        "live_analysis_rendered",
                        json_object(json!({
                            "url": url,
                            "etiqueta": label,
                            "confianza": confidence,
                        })),
                    );
                }
            }
            Err(err) => {
                self.panel.show_error(LIVE_FETCH_ERROR);
                let _ = self.events.emit(
                    "live_analysis_failed",
                    json_object(json!({"url": url, "error": format!("{err:#}")})),
                );
            }
        }
    }
}

impl PendingQueueDrainer for LiveAnalyzer {
    /// Take-then-process: the slot is emptied atomically, so a second
    /// drain (or a reconnect racing a trigger) finds nothing to repeat.
    fn drain(&self) {
        if let Some(parked) = self.pending.take() {
            self.process_analysis(&parked.source_url);
        }
    }
}
