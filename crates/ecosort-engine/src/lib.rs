pub mod backend;
pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod flow;
pub mod identity;
pub mod live;
pub mod replay;
pub mod state;
pub mod transcript;
pub mod typing;

pub use backend::{AnalyzeRequest, BackendClient};
pub use channel::SocketTransport;
pub use config::{EngineConfig, SessionTransport};
pub use flow::{MessageFlow, SendOutcome};
pub use identity::IdentityStore;
pub use live::{LiveAnalyzer, StatusPanel};
pub use replay::HistoryReplay;
pub use state::{ButtonGate, ButtonMode, ConnectionSignal, ConnectionState};
pub use transcript::{StagedImages, Transcript, TranscriptView};
pub use typing::TypingReveal;

/// Flatten a `json!` object literal into an event payload map.
pub(crate) fn json_object(value: serde_json::Value) -> ecosort_contracts::events::EventPayload {
    value.as_object().cloned().unwrap_or_default()
}
