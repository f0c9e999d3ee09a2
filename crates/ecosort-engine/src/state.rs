use std::sync::{Arc, Mutex};

/// The send button's mutually exclusive modes. Exactly one is active at a
/// time and every change goes through [`ButtonGate::transition`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ButtonMode {
    /// Ready to accept a new message.
    Send,
    /// A send is in flight; nothing can be cancelled yet.
    CancelDisabled,
    /// The answer is being revealed and can be interrupted.
    CancelEnabled,
}

impl ButtonMode {
    /// Legal edges of the send cycle: Send → CancelDisabled (send
    /// accepted), CancelDisabled → CancelEnabled (answer arrived, reveal
    /// running), CancelDisabled → Send (send failed), CancelEnabled →
    /// Send (reveal finished or cancelled). Everything else is rejected.
    pub fn can_transition(self, next: ButtonMode) -> bool {
        matches!(
            (self, next),
            (ButtonMode::Send, ButtonMode::CancelDisabled)
                | (ButtonMode::CancelDisabled, ButtonMode::CancelEnabled)
                | (ButtonMode::CancelDisabled, ButtonMode::Send)
                | (ButtonMode::CancelEnabled, ButtonMode::Send)
        )
    }
}

/// Shared owner of the current [`ButtonMode`]. The message flow and the
/// typing reveal are its only writers; an edge outside the cycle leaves
/// the mode untouched.
#[derive(Clone, Debug)]
pub struct ButtonGate {
    inner: Arc<Mutex<ButtonMode>>,
}

impl Default for ButtonGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ButtonGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ButtonMode::Send)),
        }
    }

    pub fn current(&self) -> ButtonMode {
        self.inner
            .lock()
            .map(|mode| *mode)
            .unwrap_or(ButtonMode::Send)
    }

    pub fn can_send(&self) -> bool {
        self.current() == ButtonMode::Send
    }

    /// Apply one edge. Returns false when the edge is not part of the
    /// cycle, and the mode stays as it was.
    pub fn transition(&self, next: ButtonMode) -> bool {
        let Ok(mut mode) = self.inner.lock() else {
            return false;
        };
        if !mode.can_transition(next) {
            return false;
        }
        *mode = next;
        true
    }
}

/// States of the realtime connection panel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Analyzing,
    Error,
}

/// What just happened, as opposed to where the panel should end up.
/// Transport signals come from the socket itself; analysis signals come
/// from the analysis pipeline (HTTP reply or channel event).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionSignal {
    TransportUp,
    TransportDown,
    AnalysisStarted,
    AnalysisCompleted,
    AnalysisFailed,
}

impl ConnectionState {
    pub fn status_text(self) -> &'static str {
        match self {
            Self::Connecting => "Conectando...",
            Self::Connected => "Conectado",
            Self::Disconnected => "Desconectado",
            Self::Analyzing => "Analizando...",
            Self::Error => "Error",
        }
    }

    /// The panel's single transition function. Transport up/down signals
    /// are dropped while an analysis is on screen so a socket blip cannot
    /// overwrite it; analysis signals always apply.
    pub fn apply(self, signal: ConnectionSignal) -> Option<ConnectionState> {
        match signal {
            ConnectionSignal::TransportUp | ConnectionSignal::TransportDown
                if self == Self::Analyzing =>
            {
                None
            }
            ConnectionSignal::TransportUp => Some(Self::Connected),
            ConnectionSignal::TransportDown => Some(Self::Disconnected),
            ConnectionSignal::AnalysisStarted => Some(Self::Analyzing),
            ConnectionSignal::AnalysisCompleted => Some(Self::Connected),
            ConnectionSignal::AnalysisFailed => Some(Self::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_cycle_edges_are_the_only_legal_ones() {
        let legal = [
            (ButtonMode::Send, ButtonMode::CancelDisabled),
            (ButtonMode::CancelDisabled, ButtonMode::CancelEnabled),
            (ButtonMode::CancelDisabled, ButtonMode::Send),
            (ButtonMode::CancelEnabled, ButtonMode::Send),
        ];
        let all = [
            ButtonMode::Send,
            ButtonMode::CancelDisabled,
            ButtonMode::CancelEnabled,
        ];
        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to));
                assert_eq!(from.can_transition(to), expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn gate_rejects_skipping_to_cancel_enabled() {
        let gate = ButtonGate::new();
        assert!(!gate.transition(ButtonMode::CancelEnabled));
        assert_eq!(gate.current(), ButtonMode::Send);

        assert!(gate.transition(ButtonMode::CancelDisabled));
        assert!(gate.transition(ButtonMode::CancelEnabled));
        assert!(gate.transition(ButtonMode::Send));
        assert!(gate.can_send());
    }

    #[test]
    fn gate_error_path_returns_directly_to_send() {
        let gate = ButtonGate::new();
        assert!(gate.transition(ButtonMode::CancelDisabled));
        assert!(gate.transition(ButtonMode::Send));
        assert!(gate.can_send());
    }

    #[test]
    fn gate_clones_share_state() {
        let gate = ButtonGate::new();
        let clone = gate.clone();
        assert!(gate.transition(ButtonMode::CancelDisabled));
        assert_eq!(clone.current(), ButtonMode::CancelDisabled);
        assert!(!clone.can_send());
    }

    #[test]
    fn transport_signals_never_override_analyzing() {
        assert_eq!(
            ConnectionState::Analyzing.apply(ConnectionSignal::TransportUp),
            None
        );
        assert_eq!(
            ConnectionState::Analyzing.apply(ConnectionSignal::TransportDown),
            None
        );
        assert_eq!(
            ConnectionState::Disconnected.apply(ConnectionSignal::TransportUp),
            Some(ConnectionState::Connected)
        );
        assert_eq!(
            ConnectionState::Error.apply(ConnectionSignal::TransportDown),
            Some(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn analysis_signals_apply_from_any_state() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Analyzing,
            ConnectionState::Error,
        ] {
            assert_eq!(
                state.apply(ConnectionSignal::AnalysisStarted),
                Some(ConnectionState::Analyzing)
            );
            assert_eq!(
                state.apply(ConnectionSignal::AnalysisCompleted),
                Some(ConnectionState::Connected)
            );
            assert_eq!(
                state.apply(ConnectionSignal::AnalysisFailed),
                Some(ConnectionState::Error)
            );
        }
    }

    #[test]
    fn status_texts_match_the_panel_labels() {
        assert_eq!(ConnectionState::Connecting.status_text(), "Conectando...");
        assert_eq!(ConnectionState::Connected.status_text(), "Conectado");
        assert_eq!(ConnectionState::Disconnected.status_text(), "Desconectado");
        assert_eq!(ConnectionState::Analyzing.status_text(), "Analizando...");
        assert_eq!(ConnectionState::Error.status_text(), "Error");
    }
}
