use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::state::{ButtonGate, ButtonMode};
use crate::transcript::Transcript;

/// Character-by-character reveal of a bot answer. At most one reveal is
/// active; starting a new one cancels the previous one first, and a
/// generation counter keeps a stale worker from touching the transcript
/// after it has been replaced.
#[derive(Clone)]
pub struct TypingReveal {
    inner: Arc<RevealInner>,
}

struct RevealInner {
    transcript: Arc<Mutex<Transcript>>,
    gate: ButtonGate,
    interval: Duration,
    state: Mutex<RevealState>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

#[derive(Default)]
struct RevealState {
    generation: u64,
    active: Option<ActiveReveal>,
}

struct ActiveReveal {
    entry: u64,
    chars: Vec<char>,
    next: usize,
}

/// Outcome of one reveal tick.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RevealStep {
    /// One character was appended.
    Revealed,
    /// The text ran out; the entry is sealed and the button is back on Send.
    Completed,
    /// Nothing to do: no active reveal, or this driver has been replaced.
    Idle,
}

impl TypingReveal {
    pub fn new(transcript: Arc<Mutex<Transcript>>, gate: ButtonGate, interval_ms: u64) -> Self {
        Self {
            inner: Arc::new(RevealInner {
                transcript,
                gate,
                interval: Duration::from_millis(interval_ms.max(1)),
                state: Mutex::new(RevealState::default()),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn is_revealing(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.active.is_some())
            .unwrap_or(false)
    }

    /// Reveal `text` into the transcript entry, one character per tick on
    /// a background thread. Any reveal already running is cancelled and
    /// its worker joined before the new one starts.
    pub fn start(&self, entry: u64, text: &str) -> Result<()> {
        self.cancel();
        let generation = self.begin(entry, text);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("ecosort-typing".to_string())
            .spawn(move || inner.run(generation))
            .context("failed to spawn typing reveal worker")?;
        if let Ok(mut slot) = self.inner.worker.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Stop the active reveal, keeping the revealed prefix as the entry's
    /// final text, and hand the button back to Send. Safe to call when no
    /// reveal is running.
    pub fn cancel(&self) {
        let cancelled = match self.inner.state.lock() {
            Ok(mut state) => {
                state.generation = state.generation.wrapping_add(1);
                state.active.take()
            }
            Err(_) => None,
        };
        if let Some(active) = cancelled {
            if let Ok(mut transcript) = self.inner.transcript.lock() {
                transcript.finish_reveal(active.entry, false);
            }
            let _ = self.inner.gate.transition(ButtonMode::Send);
        }
        if let Ok(mut slot) = self.inner.worker.lock() {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
        }
    }

    /// Arm a reveal without spawning the worker. Returns the generation a
    /// driver must present on every tick.
    fn begin(&self, entry: u64, text: &str) -> u64 {
        match self.inner.state.lock() {
            Ok(mut state) => {
                state.generation = state.generation.wrapping_add(1);
                state.active = Some(ActiveReveal {
                    entry,
                    chars: text.chars().collect(),
                    next: 0,
                });
                state.generation
            }
            Err(_) => 0,
        }
    }

    /// One tick of the current reveal, for callers that drive the clock
    /// themselves.
    pub(crate) fn advance(&self) -> RevealStep {
        let generation = self
            .inner
            .state
            .lock()
            .map(|state| state.generation)
            .unwrap_or(0);
        self.inner.step(generation)
    }
}

impl RevealInner {
    fn run(&self, generation: u64) {
        loop {
            thread::sleep(self.interval);
            match self.step(generation) {
                RevealStep::Revealed => continue,
                RevealStep::Completed | RevealStep::Idle => break,
            }
        }
    }

    fn step(&self, generation: u64) -> RevealStep {
        let Ok(mut state) = self.state.lock() else {
            return RevealStep::Idle;
        };
        if state.generation != generation {
            return RevealStep::Idle;
        }
        let Some(active) = state.active.as_mut() else {
            return RevealStep::Idle;
        };
        if active.next < active.chars.len() {
            let ch = active.chars[active.next];
            let entry = active.entry;
            active.next += 1;
            if let Ok(mut transcript) = self.transcript.lock() {
                transcript.append_reveal_char(entry, ch);
            }
            RevealStep::Revealed
        } else {
            let entry = active.entry;
            state.active = None;
            drop(state);
            if let Ok(mut transcript) = self.transcript.lock() {
                transcript.finish_reveal(entry, true);
            }
            let _ = self.gate.transition(ButtonMode::Send);
            RevealStep::Completed
        }
    }
}
