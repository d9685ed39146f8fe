//! Daemon - the voice session service
//!
//! Wires the voice gate, the audio pipeline and the session engine together.
//! Every callback from those components is turned into a [`DaemonEvent`] and
//! handled on one task, so all state changes happen in one place.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::config::Config;
use crate::session::{ConnectionState, ConversationInit, OutboundMessage, SessionEngine, ToolCall};
use crate::tools::{AudioActivity, SystemTools, ToolBridge};
use crate::voice::{
    AudioChunk, AudioDevices, AudioPipeline, CaptureEvent, CpalDevices, GateEvent,
    RenderComplete, VoiceGate, VoiceState,
};
use crate::{Error, Result};

/// Wait before reopening a capture device that failed
const CAPTURE_RETRY: Duration = Duration::from_secs(1);

/// Something that happened somewhere in the system
#[derive(Debug)]
pub enum DaemonEvent {
    /// Socket opened and the conversation was initiated
    Connected,
    /// Open socket dropped
    Disconnected,
    /// Recoverable fault; the engine keeps reconnecting on its own
    Fault(String),
    /// Fault that ends the run
    Fatal(Error),
    /// Agent speech, wire-format PCM
    AgentAudio { pcm: Vec<u8>, event_id: u64 },
    /// User barged in; audio up to this id is stale
    Interruption(u64),
    ToolCall(ToolCall),
    Transcript(String),
    AgentResponse { text: String, is_correction: bool },
    VadScore(f64),
    /// Output of the capture stream started as number `stream`
    Capture { stream: u64, event: CaptureEvent },
}

/// Outbound half of the session as the orchestrator sees it
pub trait SessionLink {
    /// Queue a message for the service
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` unless the session is open
    fn send(&self, message: OutboundMessage) -> Result<()>;

    fn is_open(&self) -> bool;
}

impl SessionLink for SessionEngine {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        Self::send(self, message)
    }

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

/// Conversation policy: who may capture, when audio flows, when to resume
///
/// Capture and playback never overlap. Agent audio stops capture; once the
/// playback queue drains, capture resumes after the settle delay.
pub struct Orchestrator<D: AudioDevices, L: SessionLink> {
    pipeline: AudioPipeline<D>,
    gate: VoiceGate,
    link: L,
    tools: Box<dyn ToolBridge>,
    activity: Arc<AudioActivity>,
    events: mpsc::UnboundedSender<DaemonEvent>,
    wire_rate: u32,
    settle_delay: Duration,
    /// Captured audio is forwarded to the service while set
    listening: bool,
    /// Chunks captured while speech is pending confirmation
    preroll: Vec<Vec<u8>>,
    resume_at: Option<Instant>,
    interrupted_through: Option<u64>,
    /// Bumped on every capture start; events from older streams are stale
    capture_stream: u64,
}

impl<D: AudioDevices, L: SessionLink> Orchestrator<D, L> {
    /// Capture events are posted back to `events`
    pub fn new(
        pipeline: AudioPipeline<D>,
        gate: VoiceGate,
        link: L,
        wire_rate: u32,
        events: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Self {
        let activity = Arc::new(AudioActivity::default());
        Self {
            pipeline,
            gate,
            link,
            tools: Box::new(SystemTools::new(Arc::clone(&activity))),
            activity,
            events,
            wire_rate,
            settle_delay: Duration::from_millis(300),
            listening: false,
            preroll: Vec::new(),
            resume_at: None,
            interrupted_through: None,
            capture_stream: 0,
        }
    }

    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Box<dyn ToolBridge>) -> Self {
        self.tools = tools;
        self
    }

    /// Flags read by the device-status tool
    #[must_use]
    pub fn activity(&self) -> Arc<AudioActivity> {
        Arc::clone(&self.activity)
    }

    #[must_use]
    pub const fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    #[must_use]
    pub const fn pipeline(&self) -> &AudioPipeline<D> {
        &self.pipeline
    }

    #[must_use]
    pub const fn gate(&self) -> &VoiceGate {
        &self.gate
    }

    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.listening
    }

    #[must_use]
    pub const fn resume_at(&self) -> Option<Instant> {
        self.resume_at
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do
    #[must_use]
    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.resume_at, self.gate.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Handle one event
    ///
    /// # Errors
    ///
    /// Returns the fatal error that should end the run
    pub fn handle_event(&mut self, event: DaemonEvent, now: Instant) -> Result<()> {
        match event {
            DaemonEvent::Connected => {
                tracing::info!("conversation ready");
                self.interrupted_through = None;
                self.resume_capture(now);
            }
            DaemonEvent::Disconnected => {
                tracing::warn!("conversation lost, waiting for reconnect");
                self.suspend_capture();
                self.listening = false;
                self.resume_at = None;
            }
            DaemonEvent::Fault(message) => {
                tracing::warn!(error = %message, "session fault");
                self.suspend_capture();
            }
            DaemonEvent::Fatal(error) => return Err(error),
            DaemonEvent::AgentAudio { pcm, event_id } => self.on_agent_audio(pcm, event_id, now),
            DaemonEvent::Interruption(event_id) => {
                let dropped = self.pipeline.discard_pending();
                self.interrupted_through = Some(
                    self.interrupted_through
                        .map_or(event_id, |prev| prev.max(event_id)),
                );
                tracing::debug!(event_id, dropped, "playback interrupted");
            }
            DaemonEvent::ToolCall(call) => self.on_tool_call(&call),
            DaemonEvent::Transcript(text) => tracing::info!(%text, "user"),
            DaemonEvent::AgentResponse { text, is_correction } => {
                if is_correction {
                    tracing::info!(%text, "agent (corrected)");
                } else {
                    tracing::info!(%text, "agent");
                }
            }
            DaemonEvent::VadScore(score) => tracing::trace!(score, "vad score"),
            DaemonEvent::Capture { stream, .. }
                if stream != self.capture_stream || !self.pipeline.is_capturing() =>
            {
                tracing::trace!(stream, "dropping output of a stopped capture");
            }
            DaemonEvent::Capture {
                event: CaptureEvent::Chunk(chunk),
                ..
            } => self.on_captured(chunk, now),
            DaemonEvent::Capture {
                event: CaptureEvent::Fault(message),
                ..
            } => {
                tracing::warn!(error = %message, "capture device fault, retrying");
                self.suspend_capture();
                self.resume_at = Some(now + CAPTURE_RETRY);
            }
        }

        Ok(())
    }

    /// A chunk finished rendering
    pub fn on_render_complete(&mut self, done: RenderComplete, now: Instant) {
        if self.pipeline.on_render_complete(done) {
            self.activity.set_playing(false);
            self.schedule_resume(now);
        }
    }

    /// Fire whatever timers are due at `now`
    pub fn tick(&mut self, now: Instant) {
        if self.resume_at.is_some_and(|at| at <= now) {
            self.resume_at = None;
            self.resume_capture(now);
        }

        let events = self.gate.poll(now);
        self.apply_gate_events(events, now);
    }

    /// Stop capture and discard playback; safe to call repeatedly
    pub fn shutdown(&mut self) {
        self.resume_at = None;
        self.listening = false;
        self.preroll.clear();
        self.gate.stop_listening();
        self.pipeline.cleanup();
        self.activity.set_capturing(false);
        self.activity.set_playing(false);
    }

    fn on_captured(&mut self, chunk: AudioChunk, now: Instant) {
        let events = self.gate.process_bytes(&chunk.data, now);
        self.apply_gate_events(events, now);

        if self.listening {
            self.forward(chunk.data);
        } else if self.gate.state() == VoiceState::PendingSpeech {
            self.preroll.push(chunk.data);
        } else {
            self.preroll.clear();
        }
    }

    fn apply_gate_events(&mut self, events: Vec<GateEvent>, now: Instant) {
        for event in events {
            match event {
                GateEvent::SpeechStart => {
                    tracing::debug!("listening window opened");
                    self.resume_capture(now);
                    self.listening = true;
                    if let Err(e) = self.link.send(OutboundMessage::UserActivity) {
                        tracing::trace!(error = %e, "activity signal not sent");
                    }
                    for pcm in std::mem::take(&mut self.preroll) {
                        self.forward(pcm);
                    }
                }
                GateEvent::SpeechEnd => tracing::debug!("speech ended"),
                GateEvent::Timeout => {
                    tracing::debug!("no speech for a while, closing listening window");
                    self.listening = false;
                    self.preroll.clear();
                    if self.pipeline.is_capturing() {
                        self.gate.start_listening(now);
                    }
                }
            }
        }
    }

    fn forward(&self, pcm: Vec<u8>) {
        if !self.link.is_open() {
            return;
        }
        if let Err(e) = self.link.send(OutboundMessage::AudioChunk(pcm)) {
            tracing::trace!(error = %e, "dropped captured audio");
        }
    }

    fn on_agent_audio(&mut self, pcm: Vec<u8>, event_id: u64, now: Instant) {
        if self.interrupted_through.is_some_and(|through| event_id <= through) {
            tracing::debug!(event_id, "dropping audio from an interrupted response");
            return;
        }

        self.suspend_capture();
        self.resume_at = None;
        self.pipeline
            .enqueue_playback(AudioChunk::wire(pcm, self.wire_rate));

        if self.pipeline.is_playing() {
            self.activity.set_playing(true);
        } else {
            self.schedule_resume(now);
        }
    }

    fn on_tool_call(&self, call: &ToolCall) {
        let outcome = self.tools.call(&call.tool_name, &call.parameters);
        tracing::info!(
            tool = %call.tool_name,
            is_error = outcome.is_error,
            "tool call answered"
        );

        let reply = OutboundMessage::ToolResult {
            tool_call_id: call.tool_call_id.clone(),
            result: outcome.result,
            is_error: outcome.is_error,
        };
        if let Err(e) = self.link.send(reply) {
            tracing::warn!(tool = %call.tool_name, error = %e, "tool result not delivered");
        }
    }

    fn schedule_resume(&mut self, now: Instant) {
        self.resume_at = Some(now + self.settle_delay);
    }

    fn suspend_capture(&mut self) {
        self.pipeline.stop_capture();
        self.gate.stop_listening();
        self.preroll.clear();
        self.activity.set_capturing(false);
    }

    fn resume_capture(&mut self, now: Instant) {
        if !self.link.is_open() || self.pipeline.is_playing() || self.resume_at.is_some() {
            return;
        }

        if !self.pipeline.is_capturing() {
            let events = self.events.clone();
            let stream = self.capture_stream.wrapping_add(1);
            let started = self.pipeline.start_capture(move |event| {
                let _ = events.send(DaemonEvent::Capture { stream, event });
            });
            if let Err(e) = started {
                tracing::warn!(error = %e, "could not start capture, retrying");
                self.resume_at = Some(now + CAPTURE_RETRY);
                return;
            }
            self.capture_stream = stream;
        }

        self.activity.set_capturing(true);
        if !self.gate.is_listening() {
            self.gate.start_listening(now);
        }
    }
}

/// Post engine callbacks onto the daemon's event queue
pub fn forward_session_events(engine: &SessionEngine, events: &mpsc::UnboundedSender<DaemonEvent>) {
    let handlers = engine.handlers();

    let tx = events.clone();
    handlers.set_on_connect(move || {
        let _ = tx.send(DaemonEvent::Connected);
    });
    let tx = events.clone();
    handlers.set_on_disconnect(move || {
        let _ = tx.send(DaemonEvent::Disconnected);
    });
    let tx = events.clone();
    handlers.set_on_fault(move |error| {
        let event = match error {
            Error::ReconnectExhausted { attempts } => DaemonEvent::Fatal(Error::ReconnectExhausted {
                attempts: *attempts,
            }),
            Error::Config(message) => DaemonEvent::Fatal(Error::Config(message.clone())),
            other => DaemonEvent::Fault(other.to_string()),
        };
        let _ = tx.send(event);
    });
    let tx = events.clone();
    handlers.set_on_audio(move |pcm, event_id| {
        let _ = tx.send(DaemonEvent::AgentAudio { pcm, event_id });
    });
    let tx = events.clone();
    handlers.set_on_interruption(move |event_id| {
        let _ = tx.send(DaemonEvent::Interruption(event_id));
    });
    let tx = events.clone();
    handlers.set_on_tool_call(move |call| {
        let _ = tx.send(DaemonEvent::ToolCall(call));
    });
    let tx = events.clone();
    handlers.set_on_transcript(move |text| {
        let _ = tx.send(DaemonEvent::Transcript(text));
    });
    let tx = events.clone();
    handlers.set_on_agent_response(move |text, is_correction| {
        let _ = tx.send(DaemonEvent::AgentResponse { text, is_correction });
    });
    let tx = events.clone();
    handlers.set_on_vad_score(move |score| {
        let _ = tx.send(DaemonEvent::VadScore(score));
    });
}

/// The voxlink daemon - one live conversation with the agent
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C or a fatal fault
    ///
    /// Both paths run the same shutdown: stop capture, discard playback,
    /// close the socket, release the devices.
    ///
    /// # Errors
    ///
    /// Returns error if the audio devices cannot be opened or the session
    /// fails for good
    #[allow(clippy::future_not_send)]
    pub async fn run(self) -> Result<()> {
        let Config {
            session,
            audio,
            gate,
            dynamic_variables,
        } = self.config;

        let devices = CpalDevices::open(&audio)?;
        tracing::info!(
            speech_confirm_ms = duration_ms(gate.speech_confirm),
            silence_confirm_ms = duration_ms(gate.silence_confirm),
            inactivity_ms = duration_ms(gate.inactivity),
            settle_ms = duration_ms(audio.settle_delay),
            "voice session starting"
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (render_tx, mut render_rx) = mpsc::unbounded_channel();

        let engine = SessionEngine::new(session).with_init(ConversationInit {
            dynamic_variables,
            conversation_config_override: None,
        });
        forward_session_events(&engine, &events_tx);

        let pipeline = AudioPipeline::new(devices, audio.wire_sample_rate, render_tx);
        let mut orchestrator = Orchestrator::new(
            pipeline,
            VoiceGate::new(gate),
            engine,
            audio.wire_sample_rate,
            events_tx,
        )
        .with_settle_delay(audio.settle_delay);

        // Set up shutdown signal
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });

        orchestrator.link_mut().connect();

        let outcome = loop {
            let wakeup = orchestrator.next_wakeup();
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                Some(event) = events_rx.recv() => {
                    if let Err(e) = orchestrator.handle_event(event, Instant::now()) {
                        tracing::error!(error = %e, "session cannot continue");
                        break Err(e);
                    }
                }
                Some(done) = render_rx.recv() => {
                    orchestrator.on_render_complete(done, Instant::now());
                }
                () = sleep_until(wakeup) => {
                    orchestrator.tick(Instant::now());
                }
            }
        };

        orchestrator.shutdown();
        orchestrator.link_mut().disconnect().await;
        drop(orchestrator);
        tracing::info!("voice session stopped");

        outcome
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
