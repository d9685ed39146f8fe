//! Voice activity gate
//!
//! Classifies wire-format chunks as loud or quiet by RMS energy and turns the
//! classification stream into debounced speech start/end events. Timers are
//! explicit deadlines held in the state itself, so a transition that
//! invalidates a timer drops it in the same assignment.

use std::time::{Duration, Instant};

use super::convert::bytes_to_samples;

/// RMS level (on the 16-bit sample scale) above which a chunk counts as loud
pub const DEFAULT_ENERGY_THRESHOLD: f32 = 500.0;

/// Timing and threshold settings for the gate
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    /// Continuous loudness needed before speech is confirmed
    pub speech_confirm: Duration,
    /// Continuous quiet needed before speech is declared over
    pub silence_confirm: Duration,
    /// Give up waiting if nothing loud arrives for this long
    pub inactivity: Duration,
    /// RMS threshold on the 16-bit scale
    pub energy_threshold: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            speech_confirm: Duration::from_millis(500),
            silence_confirm: Duration::from_millis(3000),
            inactivity: Duration::from_millis(20_000),
            energy_threshold: DEFAULT_ENERGY_THRESHOLD,
        }
    }
}

/// Observable state of the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    /// No speech; nothing pending
    Silence,
    /// Loud audio seen, waiting for it to persist
    PendingSpeech,
    /// Speech confirmed
    Speech,
}

/// Edge-triggered gate output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// Speech confirmed after the speech-confirm window
    SpeechStart,
    /// Speech followed by a full silence-confirm window
    SpeechEnd,
    /// Nothing loud for the inactivity window; listening has ended
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Silence,
    PendingSpeech { confirm_at: Instant },
    Speech { silence_at: Option<Instant> },
}

impl Phase {
    const fn deadline(self) -> Option<Instant> {
        match self {
            Self::Silence | Self::Speech { silence_at: None } => None,
            Self::PendingSpeech { confirm_at } => Some(confirm_at),
            Self::Speech { silence_at } => silence_at,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Listening {
    phase: Phase,
    inactivity_at: Instant,
}

/// Debounced speech detector driven by chunk arrivals and deadlines
#[derive(Debug)]
pub struct VoiceGate {
    config: GateConfig,
    listening: Option<Listening>,
}

impl VoiceGate {
    #[must_use]
    pub const fn new(config: GateConfig) -> Self {
        Self {
            config,
            listening: None,
        }
    }

    /// Begin listening from a clean Silence state with a fresh inactivity timer
    pub fn start_listening(&mut self, now: Instant) {
        self.listening = Some(Listening {
            phase: Phase::Silence,
            inactivity_at: now + self.config.inactivity,
        });
        tracing::debug!("voice gate listening");
    }

    /// Stop listening and drop every pending timer
    pub fn stop_listening(&mut self) {
        if self.listening.take().is_some() {
            tracing::debug!("voice gate stopped");
        }
    }

    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.listening.is_some()
    }

    /// Current state; `Silence` when not listening
    #[must_use]
    pub const fn state(&self) -> VoiceState {
        match self.listening {
            None
            | Some(Listening {
                phase: Phase::Silence,
                ..
            }) => VoiceState::Silence,
            Some(Listening {
                phase: Phase::PendingSpeech { .. },
                ..
            }) => VoiceState::PendingSpeech,
            Some(Listening {
                phase: Phase::Speech { .. },
                ..
            }) => VoiceState::Speech,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Earliest armed deadline, if any
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let listening = self.listening?;
        Some(
            listening
                .phase
                .deadline()
                .map_or(listening.inactivity_at, |d| d.min(listening.inactivity_at)),
        )
    }

    /// Fire every timer due at or before `now`, earliest first
    pub fn poll(&mut self, now: Instant) -> Vec<GateEvent> {
        let mut events = Vec::new();

        while let Some(listening) = self.listening.as_mut() {
            let phase_due = listening.phase.deadline().filter(|d| *d <= now);
            let inactivity_due = (listening.inactivity_at <= now).then_some(listening.inactivity_at);

            match (phase_due, inactivity_due) {
                (None, None) => break,
                (Some(phase_at), Some(idle_at)) if idle_at < phase_at => {
                    self.expire_inactivity(&mut events);
                }
                (None, Some(_)) => self.expire_inactivity(&mut events),
                (Some(_), _) => {
                    match listening.phase {
                        Phase::PendingSpeech { .. } => {
                            listening.phase = Phase::Speech { silence_at: None };
                            tracing::debug!("speech started");
                            events.push(GateEvent::SpeechStart);
                        }
                        Phase::Speech { .. } => {
                            listening.phase = Phase::Silence;
                            tracing::debug!("speech ended");
                            events.push(GateEvent::SpeechEnd);
                        }
                        Phase::Silence => break,
                    }
                }
            }
        }

        events
    }

    fn expire_inactivity(&mut self, events: &mut Vec<GateEvent>) {
        self.listening = None;
        tracing::debug!("no speech before inactivity timeout");
        events.push(GateEvent::Timeout);
    }

    /// Classify a block of 16-bit samples observed at `now`
    ///
    /// Timers that fell due before `now` are applied first.
    pub fn process(&mut self, samples: &[i16], now: Instant) -> Vec<GateEvent> {
        let mut events = self.poll(now);
        let Some(listening) = self.listening.as_mut() else {
            return events;
        };

        let energy = calculate_energy(samples);
        let loud = energy > self.config.energy_threshold;
        tracing::trace!(energy, loud, "gate chunk");

        if loud {
            listening.inactivity_at = now + self.config.inactivity;
            listening.phase = match listening.phase {
                Phase::Silence => Phase::PendingSpeech {
                    confirm_at: now + self.config.speech_confirm,
                },
                pending @ Phase::PendingSpeech { .. } => pending,
                Phase::Speech { .. } => Phase::Speech { silence_at: None },
            };
        } else {
            listening.phase = match listening.phase {
                Phase::Silence | Phase::PendingSpeech { .. } => Phase::Silence,
                Phase::Speech { silence_at: None } => Phase::Speech {
                    silence_at: Some(now + self.config.silence_confirm),
                },
                armed @ Phase::Speech { .. } => armed,
            };
        }

        // A zero-length confirm window fires on the chunk that armed it
        events.extend(self.poll(now));
        events
    }

    /// Classify a wire-format byte buffer observed at `now`
    pub fn process_bytes(&mut self, bytes: &[u8], now: Instant) -> Vec<GateEvent> {
        self.process(&bytes_to_samples(bytes), now)
    }
}

/// Root-mean-square of 16-bit samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
#[must_use]
pub fn calculate_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}
