use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use ecosort_contracts::events::{ChannelEvent, EventPayload, EventWriter};
use serde_json::json;
use tungstenite::client::IntoClientRequest;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

use crate::json_object;
use crate::live::{ChannelReadinessProbe, PendingQueueDrainer, StatusPanel};

const READ_TIMEOUT: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_BASE_MS: u64 = 500;
const RECONNECT_BACKOFF_CAP_MS: u64 = 5000;

/// Receive-only websocket to the analysis channel. Reconnects with a
/// growing backoff for as long as the process runs; frames are relayed
/// to the status panel, connect/disconnect flips the panel's chip.
pub struct SocketTransport {
    socket_url: String,
    events: EventWriter,
    panel: Arc<StatusPanel>,
    connected: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Cheap handle answering "is the channel up?"; handed to whoever must
/// decide between sending now and parking work.
#[derive(Clone)]
pub struct SocketProbe {
    connected: Arc<AtomicBool>,
}

impl ChannelReadinessProbe for SocketProbe {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl SocketTransport {
    pub fn new(socket_url: &str, events: EventWriter, panel: Arc<StatusPanel>) -> Self {
        Self {
            socket_url: socket_url.to_string(),
            events,
            panel,
            connected: Arc::new(AtomicBool::new(false)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// The probe can be taken before `start`, which is what breaks the
    /// construction cycle between the transport and the analyzer.
    pub fn probe(&self) -> SocketProbe {
        SocketProbe {
            connected: Arc::clone(&self.connected),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Spawn the worker thread. `drainer` runs on every (re)connect,
    /// before the connected status goes out.
    pub fn start(&self, drainer: Arc<dyn PendingQueueDrainer>) -> Result<()> {
        let mut slot = self
            .handle
            .lock()
            .map_err(|_| anyhow::anyhow!("socket worker slot poisoned"))?;
        if slot
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
        {
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        let worker = SocketWorker {
            socket_url: self.socket_url.clone(),
            events: self.events.clone(),
            panel: Arc::clone(&self.panel),
            connected: Arc::clone(&self.connected),
            stop_flag: Arc::clone(&self.stop_flag),
            drainer,
        };
        let handle = thread::Builder::new()
            .name("ecosort-live-socket".to_string())
            .spawn(move || worker.run())
            .context("failed to spawn the socket worker")?;
        *slot = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
        }
    }
}

struct SocketWorker {
    socket_url: String,
    events: EventWriter,
    panel: Arc<StatusPanel>,
    connected: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    drainer: Arc<dyn PendingQueueDrainer>,
}

impl SocketWorker {
    fn run(self) {
        let mut attempt = 0usize;
        while !self.stop_flag.load(Ordering::SeqCst) {
            match self.open_socket() {
                Ok(mut ws) => {
                    attempt = 0;
                    self.pump(&mut ws);
                    let _ = ws.close(None);
                }
                Err(err) => {
                    let _ = self.events.emit(
                        "socket_connect_failed",
                        json_object(json!({"error": format!("{err:#}")})),
                    );
                }
            }
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            attempt += 1;
            self.sleep_with_stop(reconnect_backoff(attempt));
        }
    }

    fn open_socket(&self) -> Result<WebSocket<MaybeTlsStream<TcpStream>>> {
        let request = self
            .socket_url
            .as_str()
            .into_client_request()
            .context("invalid socket url")?;
        let (mut ws, _) = websocket_connect(request)
            .with_context(|| format!("failed to connect {}", self.socket_url))?;
        set_socket_read_timeout(&mut ws, Some(READ_TIMEOUT));
        Ok(ws)
    }

    /// One connected stretch: relay frames until the transport drops.
    /// Parked work drains before the chip flips to connected, so nobody
    /// observes Conectado with their trigger still waiting.
    fn pump(&self, ws: &mut WebSocket<MaybeTlsStream<TcpStream>>) {
        self.connected.store(true, Ordering::SeqCst);
        self.drainer.drain();
        self.panel.transport_connected();
        let _ = self.events.emit("socket_connected", EventPayload::new());

        while !self.stop_flag.load(Ordering::SeqCst) {
            let message = match ws.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(_) => break,
            };
            let raw = match message {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                WsMessage::Close(_) => break,
                _ => continue,
            };
            if let Some(event) = ChannelEvent::parse_frame(&raw) {
                self.dispatch(event);
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        self.panel.transport_disconnected();
        let _ = self.events.emit("socket_disconnected", EventPayload::new());
    }

    fn dispatch(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::AnalysisStarted => {
                self.panel.show_analyzing();
                let _ = self
                    .events
                    .emit("live_analysis_started", EventPayload::new());
            }
            ChannelEvent::AnalysisCompleted {
                url,
                label,
                confidence,
            } => {
                self.panel.show_result(&url, &label, confidence);
                let _ = self.events.emit(
                    "live_analysis_rendered",
                    json_object(json!({
                        "url": url,
                        "etiqueta": label,
                        "confianza": confidence,
                    })),
                );
            }
            ChannelEvent::AnalysisFailed { message } => {
                self.panel.show_error(&message);
                let _ = self.events.emit(
                    "live_analysis_failed",
                    json_object(json!({"error": message})),
                );
            }
        }
    }

    fn sleep_with_stop(&self, total: Duration) {
        let slice = Duration::from_millis(100);
        let mut remaining = total;
        while !self.stop_flag.load(Ordering::SeqCst) && remaining > Duration::ZERO {
            let step = remaining.min(slice);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}

fn reconnect_backoff(attempt: usize) -> Duration {
    let multiplier = u64::try_from(attempt.max(1)).unwrap_or(u64::MAX);
    Duration::from_millis(
        RECONNECT_BACKOFF_BASE_MS
            .saturating_mul(multiplier)
            .min(RECONNECT_BACKOFF_CAP_MS),
    )
}

fn set_socket_read_timeout(
    ws: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    timeout: Option<Duration>,
) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}
