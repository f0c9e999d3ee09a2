use std::sync::{Arc, Mutex};

use ecosort_contracts::events::EventWriter;
use ecosort_contracts::history::normalize_bot_text;
use serde_json::json;

use crate::backend::{AnalyzeRequest, BackendClient};
use crate::identity::IdentityStore;
use crate::json_object;
use crate::state::{ButtonGate, ButtonMode};
use crate::transcript::{StagedImages, Transcript};
use crate::typing::{RevealStep, TypingReveal};

/// The turn appended when a send fails; fixed wording, no error details.
pub const SEND_ERROR_MESSAGE: &str =
    "Lo siento, hubo un error al procesar la imagen. Intenta de nuevo.";

/// How a send attempt ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    /// Nothing to send: no text and no staged images.
    EmptyInput,
    /// Another cycle holds the button; the composer input is kept.
    Busy,
    /// The answer is on screen and revealing.
    Revealing,
    /// The cycle ended in the fixed error turn.
    Failed,
}

/// The send cycle: one user turn in, one bot turn out, with the button
/// gate marking the phases. At most one cycle runs at a time; the gate
/// transition that opens the cycle is also the lock that rejects overlap.
pub struct MessageFlow {
    backend: BackendClient,
    identity: Arc<IdentityStore>,
    transcript: Arc<Mutex<Transcript>>,
    gate: ButtonGate,
    typing: TypingReveal,
    events: EventWriter,
}

impl MessageFlow {
    pub fn new(
        backend: BackendClient,
        identity: Arc<IdentityStore>,
        transcript: Arc<Mutex<Transcript>>,
        gate: ButtonGate,
        typing: TypingReveal,
        events: EventWriter,
    ) -> Self {
        Self {
            backend,
            identity,
            transcript,
            gate,
            typing,
            events,
        }
    }

    /// Run one full send cycle with `text` and whatever is staged.
    ///
    /// The user turn renders and the composer clears before the request
    /// leaves; the busy placeholder lives exactly as long as the network
    /// call. Blocks until the reply (or the error) has been appended.
    pub fn send_message(&self, text: &str, staged: &mut StagedImages) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() && staged.is_empty() {
            return SendOutcome::EmptyInput;
        }
        if !self.gate.transition(ButtonMode::CancelDisabled) {
            return SendOutcome::Busy;
        }

        let (files, urls) = staged.ordered_for_send();
        let sent_images = staged.sent_images();
        let busy_id = {
            let Ok(mut transcript) = self.transcript.lock() else {
                let _ = self.gate.transition(ButtonMode::Send);
                return SendOutcome::Failed;
            };
            transcript.push_user(text, sent_images);
            staged.clear();
            transcript.push_busy()
        };
        let _ = self.events.emit(
            "message_sent",
            json_object(json!({
                "text_chars": text.chars().count(),
                "files": files.len(),
                "urls": urls.len(),
            })),
        );

        let request = AnalyzeRequest {
            files,
            urls,
            user_text: (!text.is_empty()).then(|| text.to_string()),
            session_id: self
                .identity
                .transport()
                .sends_identifier()
                .then(|| self.identity.current_id())
                .flatten(),
        };

        match self.backend.analyze(&request) {
            Ok(reply) => {
                if let Some(echoed) = reply.session_id.as_deref() {
                    self.identity.adopt_echoed(echoed);
                }
                let answer = normalize_bot_text(&reply.resultado.unwrap_or_default());
                if answer.is_empty() {
                    // A 200 with nothing to show reads as a failure.
                    return self.fail_cycle(busy_id, "respuesta vacía");
                }

                let entry = {
                    let Ok(mut transcript) = self.transcript.lock() else {
                        let _ = self.gate.transition(ButtonMode::Send);
                        return SendOutcome::Failed;
                    };
                    transcript.remove(busy_id);
                    transcript.begin_bot_entry()
                };
                let _ = self.gate.transition(ButtonMode::CancelEnabled);
                if let Err(err) = self.typing.start(entry, &answer) {
                    // No worker thread; run the reveal to completion here.
                    while self.typing.advance() == RevealStep::Revealed {}
                    let _ = self.events.emit(
                        "reveal_worker_failed",
                        json_object(json!({"error": format!("{err:#}")})),
                    );
                }
                let _ = self.events.emit(
                    "message_answered",
                    json_object(json!({"answer_chars": answer.chars().count()})),
                );
                SendOutcome::Revealing
            }
            Err(err) => self.fail_cycle(busy_id, &format!("{err:#}")),
        }
    }

    /// Close the cycle on the error path: busy placeholder out, the fixed
    /// error turn in, button straight back to Send.
    fn fail_cycle(&self, busy_id: u64, error: &str) -> SendOutcome {
        if let Ok(mut transcript) = self.transcript.lock() {
            transcript.remove(busy_id);
            transcript.push_bot(SEND_ERROR_MESSAGE);
        }
        let _ = self.gate.transition(ButtonMode::Send);
        let _ = self.events.emit(
            "send_failed",
            json_object(json!({"error": error})),
        );
        SendOutcome::Failed
    }
}
