use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// A typed event from the realtime analysis channel.
///
/// Frames arrive as `{"event": <name>, "data": {...}}`. Transport-level
/// connect/disconnect are not frames; the channel reports those through
/// its own status signal.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    AnalysisStarted,
    AnalysisCompleted {
        url: String,
        label: String,
        confidence: f64,
    },
    AnalysisFailed {
        message: String,
    },
}

impl ChannelEvent {
    /// Parse one frame. Unknown event names and frames without an event
    /// field are ignored so protocol additions never break the client.
    pub fn parse_frame(raw: &str) -> Option<Self> {
        let payload: Value = serde_json::from_str(raw).ok()?;
        let obj = payload.as_object()?;
        let event = obj.get("event").and_then(Value::as_str)?;
        let data = obj.get("data").and_then(Value::as_object);
        match event {
            "inicio_analisis" => Some(Self::AnalysisStarted),
            "nueva_imagen" => {
                let data = data?;
                Some(Self::AnalysisCompleted {
                    url: data
                        .get("url")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    label: data
                        .get("etiqueta")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    confidence: data
                        .get("confianza")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                })
            }
            "analisis_error" => Some(Self::AnalysisFailed {
                message: data
                    .and_then(|data| data.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            }),
            _ => None,
        }
    }
}

/// Append-only writer for `events.jsonl`.
///
/// Default fields are `type`, `run_id`, `ts`; the caller payload is merged
/// last and can override them. One compact JSON object per line.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
