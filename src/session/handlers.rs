//! Upward event surface of the session engine
//!
//! One slot per event. Setting a handler replaces whatever was there; handlers
//! never accumulate.

use std::sync::{Arc, PoisonError, RwLock};

use crate::Error;
use crate::session::messages::ToolCall;

pub type ConnectHandler = dyn Fn() + Send + Sync;
pub type DisconnectHandler = dyn Fn() + Send + Sync;
pub type FaultHandler = dyn Fn(&Error) + Send + Sync;
/// Decoded wire-format PCM and its correlation id
pub type AudioHandler = dyn Fn(Vec<u8>, u64) + Send + Sync;
pub type TranscriptHandler = dyn Fn(String) + Send + Sync;
/// Response text and whether it corrects an earlier response
pub type AgentResponseHandler = dyn Fn(String, bool) + Send + Sync;
pub type ToolCallHandler = dyn Fn(ToolCall) + Send + Sync;
pub type VadScoreHandler = dyn Fn(f64) + Send + Sync;
pub type InterruptionHandler = dyn Fn(u64) + Send + Sync;

struct Slot<F: ?Sized> {
    handler: RwLock<Option<Arc<F>>>,
}

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Self {
            handler: RwLock::new(None),
        }
    }
}

impl<F: ?Sized> Slot<F> {
    /// Install `handler`; returns `true` if it replaced another one
    fn set(&self, handler: Arc<F>) -> bool {
        let mut slot = self.handler.write().unwrap_or_else(PoisonError::into_inner);
        slot.replace(handler).is_some()
    }

    fn clear(&self) {
        let mut slot = self.handler.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    // Cloned out so the lock is not held while the handler runs
    fn get(&self) -> Option<Arc<F>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handler table shared between the engine task and its owner
#[derive(Default)]
pub struct EventHandlers {
    connect: Slot<ConnectHandler>,
    disconnect: Slot<DisconnectHandler>,
    fault: Slot<FaultHandler>,
    audio: Slot<AudioHandler>,
    transcript: Slot<TranscriptHandler>,
    agent_response: Slot<AgentResponseHandler>,
    tool_call: Slot<ToolCallHandler>,
    vad_score: Slot<VadScoreHandler>,
    interruption: Slot<InterruptionHandler>,
}

macro_rules! handler_methods {
    ($($set:ident, $emit:ident, $slot:ident, $ty:ty, ($($arg:ident: $arg_ty:ty),*);)*) => {
        $(
            pub fn $set<F>(&self, handler: F)
            where
                F: Fn($($arg_ty),*) + Send + Sync + 'static,
            {
                let handler: Arc<$ty> = Arc::new(handler);
                if self.$slot.set(handler) {
                    tracing::debug!(event = stringify!($slot), "handler replaced");
                }
            }

            pub(crate) fn $emit(&self, $($arg: $arg_ty),*) -> bool {
                match self.$slot.get() {
                    Some(handler) => {
                        handler($($arg),*);
                        true
                    }
                    None => false,
                }
            }
        )*
    };
}

impl EventHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    handler_methods! {
        set_on_connect, emit_connect, connect, ConnectHandler, ();
        set_on_disconnect, emit_disconnect, disconnect, DisconnectHandler, ();
        set_on_audio, emit_audio, audio, AudioHandler, (pcm: Vec<u8>, event_id: u64);
        set_on_transcript, emit_transcript, transcript, TranscriptHandler, (text: String);
        set_on_agent_response, emit_agent_response, agent_response, AgentResponseHandler, (text: String, is_correction: bool);
        set_on_tool_call, emit_tool_call, tool_call, ToolCallHandler, (call: ToolCall);
        set_on_vad_score, emit_vad_score, vad_score, VadScoreHandler, (score: f64);
        set_on_interruption, emit_interruption, interruption, InterruptionHandler, (event_id: u64);
    }

    pub fn set_on_fault<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        let handler: Arc<FaultHandler> = Arc::new(handler);
        if self.fault.set(handler) {
            tracing::debug!(event = "fault", "handler replaced");
        }
    }

    pub(crate) fn emit_fault(&self, error: &Error) -> bool {
        match self.fault.get() {
            Some(handler) => {
                handler(error);
                true
            }
            None => false,
        }
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.connect.clear();
        self.disconnect.clear();
        self.fault.clear();
        self.audio.clear();
        self.transcript.clear();
        self.agent_response.clear();
        self.tool_call.clear();
        self.vad_score.clear();
        self.interruption.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_without_handler_is_a_no_op() {
        let handlers = EventHandlers::new();
        assert!(!handlers.emit_connect());
        assert!(!handlers.emit_audio(vec![1, 2], 3));
        assert!(!handlers.emit_fault(&Error::NotConnected));
    }

    #[test]
    fn set_replaces_previous_handler() {
        let handlers = EventHandlers::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        handlers.set_on_connect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&second);
        handlers.set_on_connect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handlers.emit_connect());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_receive_arguments() {
        let handlers = EventHandlers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        handlers.set_on_agent_response(move |text, is_correction| {
            sink.lock().unwrap().push((text, is_correction));
        });

        handlers.emit_agent_response("hello".to_string(), false);
        handlers.emit_agent_response("hi".to_string(), true);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("hello".to_string(), false), ("hi".to_string(), true)]
        );
    }

    #[test]
    fn handler_may_reregister_itself() {
        let handlers = Arc::new(EventHandlers::new());
        let inner = Arc::clone(&handlers);
        handlers.set_on_vad_score(move |_| {
            inner.set_on_vad_score(|_| {});
        });

        // Would deadlock if the slot lock were held during the call
        assert!(handlers.emit_vad_score(0.5));
        assert!(handlers.emit_vad_score(0.5));
    }

    #[test]
    fn clear_removes_everything() {
        let handlers = EventHandlers::new();
        handlers.set_on_transcript(|_| {});
        handlers.set_on_fault(|_| {});
        handlers.clear();

        assert!(!handlers.emit_transcript("x".to_string()));
        assert!(!handlers.emit_fault(&Error::NotConnected));
    }
}
