//! Session protocol engine
//!
//! A background task owns the websocket and the [`Session`] value. It performs
//! the handshake, answers keep-alive pings ahead of anything else, dispatches
//! inbound frames to the registered handlers, and reconnects with a linear
//! backoff until the attempt cap is exceeded.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Uri};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::handlers::EventHandlers;
use super::messages::{self, ConversationInit, InboundMessage, OutboundMessage};
use super::state::{ConnectionState, ReconnectDecision, Session};
use crate::config::SessionConfig;
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;

/// Handle to the protocol engine
///
/// Owns the background task; dropping the handle stops it.
pub struct SessionEngine {
    config: Arc<SessionConfig>,
    init: ConversationInit,
    handlers: Arc<EventHandlers>,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: Option<mpsc::UnboundedSender<OutboundMessage>>,
    queued: Arc<AtomicUsize>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl SessionEngine {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config: Arc::new(config),
            init: ConversationInit::default(),
            handlers: Arc::new(EventHandlers::new()),
            state: Arc::new(state),
            outbound: None,
            queued: Arc::new(AtomicUsize::new(0)),
            shutdown: None,
            task: None,
        }
    }

    /// Client data sent on every open; takes effect on the next connection
    #[must_use]
    pub fn with_init(mut self, init: ConversationInit) -> Self {
        self.init = init;
        self
    }

    /// Handler table; each `set_on_*` replaces the previous handler
    #[must_use]
    pub fn handlers(&self) -> &EventHandlers {
        &self.handlers
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Messages accepted by [`send`](Self::send) but not yet written
    #[must_use]
    pub fn pending_sends(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Start the engine task; a no-op while it is already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self) {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.queued.store(0, Ordering::Release);

        let worker = Worker {
            config: Arc::clone(&self.config),
            init: self.init.clone(),
            handlers: Arc::clone(&self.handlers),
            state: Arc::clone(&self.state),
            outbound: outbound_rx,
            queued: Arc::clone(&self.queued),
            shutdown: shutdown_rx,
            session: Session::new(),
        };

        self.outbound = Some(outbound_tx);
        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(worker.run()));
    }

    /// Queue `message` for the open socket
    ///
    /// Nothing is buffered across connections: a message offered while the
    /// socket is not open is rejected, and one accepted just before a drop is
    /// discarded on the next open.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` unless the socket is open
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(Error::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(Error::NotConnected)?;

        self.queued.fetch_add(1, Ordering::AcqRel);
        if outbound.send(message).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::NotConnected);
        }

        Ok(())
    }

    /// Close the socket and stop reconnecting; safe to call repeatedly
    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.outbound = None;

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "session task ended abnormally");
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

/// How a connected session ended
enum Ending {
    Shutdown,
    Dropped(Error),
}

struct Worker {
    config: Arc<SessionConfig>,
    init: ConversationInit,
    handlers: Arc<EventHandlers>,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    queued: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
    session: Session,
}

impl Worker {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);
            tracing::debug!(
                endpoint = %self.config.endpoint,
                attempt = self.session.reconnect_attempt,
                "connecting"
            );

            let opened = tokio::select! {
                biased;
                () = stopped(&mut self.shutdown) => break,
                result = open_socket(&self.config) => result,
            };

            match opened {
                Ok(socket) => {
                    self.session.on_open();
                    tracing::info!("session connected");

                    match self.drive(socket).await {
                        Ending::Shutdown => break,
                        Ending::Dropped(e) => {
                            tracing::warn!(error = %e, "session dropped");
                            self.session.on_disconnect();
                            self.set_state(ConnectionState::Disconnected);
                            self.handlers.emit_disconnect();
                            self.handlers.emit_fault(&e);
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "cannot open session");
                    self.handlers.emit_fault(&e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connection attempt failed");
                    self.session.on_disconnect();
                    self.set_state(ConnectionState::Disconnected);
                    self.handlers.emit_fault(&e);
                }
            }

            match self.session.record_failure(&self.config.reconnect) {
                ReconnectDecision::Retry { attempt, delay } => {
                    tracing::info!(
                        attempt,
                        max_attempts = self.config.reconnect.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "reconnecting"
                    );
                    tokio::select! {
                        biased;
                        () = stopped(&mut self.shutdown) => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                ReconnectDecision::Exhausted { attempts } => {
                    let error = Error::ReconnectExhausted { attempts };
                    tracing::error!(error = %error, "giving up on session");
                    self.handlers.emit_fault(&error);
                    break;
                }
            }
        }

        self.session.on_disconnect();
        self.set_state(ConnectionState::Disconnected);
        tracing::debug!("session task stopped");
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.session.state = state;
        self.state.send_replace(state);
    }

    async fn drive(&mut self, socket: Socket) -> Ending {
        let (mut sink, mut stream) = socket.split();

        let stale = self.drain_outbound();
        if stale > 0 {
            tracing::debug!(dropped = stale, "discarded messages queued before reconnect");
        }

        let init = OutboundMessage::ConversationInit(self.init.clone());
        if let Err(e) = write(&mut sink, &init).await {
            return Ending::Dropped(e);
        }
        self.set_state(ConnectionState::Open);
        self.handlers.emit_connect();

        loop {
            tokio::select! {
                biased;
                () = stopped(&mut self.shutdown) => {
                    self.set_state(ConnectionState::Closing);
                    close(&mut sink).await;
                    return Ending::Shutdown;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.on_text(text.as_str(), &mut sink).await {
                            return Ending::Dropped(e);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            return Ending::Dropped(e.into());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "no close frame".to_string(),
                            |f| format!("{} {}", u16::from(f.code), f.reason.as_str()),
                        );
                        return Ending::Dropped(Error::Connection(format!(
                            "server closed the session: {reason}"
                        )));
                    }
                    Some(Ok(other)) => {
                        tracing::trace!(len = other.len(), "ignoring non-text frame");
                    }
                    Some(Err(e)) => return Ending::Dropped(e.into()),
                    None => {
                        return Ending::Dropped(Error::Connection("socket closed".to_string()));
                    }
                },
                Some(message) = self.outbound.recv() => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    if let Err(e) = write(&mut sink, &message).await {
                        return Ending::Dropped(e);
                    }
                }
            }
        }
    }

    async fn on_text(&mut self, text: &str, sink: &mut SocketSink) -> Result<()> {
        let message = match messages::decode(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                return Ok(());
            }
        };
        tracing::trace!(kind = message.kind(), "received frame");

        // The ack goes out before the frame is dispatched or anything else is written
        if let InboundMessage::Ping { event_id, .. } = message {
            write(sink, &OutboundMessage::Pong { event_id }).await?;
        }

        self.dispatch(message);
        Ok(())
    }

    fn dispatch(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::InitMetadata(meta) => {
                tracing::info!(
                    conversation_id = %meta.conversation_id,
                    output_format = meta.agent_output_audio_format.as_deref().unwrap_or("unspecified"),
                    "conversation started"
                );
                self.session.conversation_id = Some(meta.conversation_id);
            }
            InboundMessage::Audio { pcm, event_id } => {
                tracing::trace!(event_id, bytes = pcm.len(), "agent audio");
                self.handlers.emit_audio(pcm, event_id);
            }
            InboundMessage::UserTranscript(text) => {
                tracing::debug!(transcript = %text, "user transcript");
                self.handlers.emit_transcript(text);
            }
            InboundMessage::AgentResponse(text) => {
                tracing::debug!(response = %text, "agent response");
                self.handlers.emit_agent_response(text, false);
            }
            InboundMessage::AgentResponseCorrection { original, corrected } => {
                tracing::debug!(
                    original = original.as_deref().unwrap_or_default(),
                    corrected = %corrected,
                    "agent response corrected"
                );
                self.handlers.emit_agent_response(corrected, true);
            }
            InboundMessage::Ping { event_id, ping_ms } => {
                tracing::trace!(event_id, ping_ms, "keep-alive acknowledged");
            }
            InboundMessage::ToolCall(call) => {
                tracing::debug!(tool = %call.tool_name, id = %call.tool_call_id, "tool call");
                self.handlers.emit_tool_call(call);
            }
            InboundMessage::VadScore(score) => {
                self.handlers.emit_vad_score(score);
            }
            InboundMessage::Interruption { event_id } => {
                tracing::debug!(event_id, "agent interrupted");
                self.handlers.emit_interruption(event_id);
            }
            InboundMessage::TentativeResponse(text) => {
                tracing::debug!(response = %text, "tentative agent response");
            }
            InboundMessage::Unknown(tag) => {
                tracing::debug!(kind = %tag, "ignoring unhandled message type");
            }
        }
    }

    fn drain_outbound(&mut self) -> usize {
        let mut dropped = 0;
        while self.outbound.try_recv().is_ok() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            dropped += 1;
        }
        dropped
    }
}

/// Resolve once shutdown is requested or the engine handle is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn open_socket(config: &SessionConfig) -> Result<Socket> {
    let url = handshake_url(&config.endpoint, &config.agent_id)?;

    let mut request = url.into_client_request()?;
    let key = HeaderValue::from_str(config.api_key.expose_secret())
        .map_err(|_| Error::Config("api key is not a valid header value".to_string()))?;
    request.headers_mut().insert("xi-api-key", key);

    let (socket, response) = tokio::time::timeout(config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "handshake timed out after {}ms",
                config.connect_timeout.as_millis()
            ))
        })??;
    tracing::debug!(status = %response.status(), "websocket handshake complete");

    Ok(socket)
}

/// Endpoint with `agent_id` added to its query; an empty path becomes `/`
fn handshake_url(endpoint: &str, agent_id: &str) -> Result<String> {
    let uri: Uri = endpoint
        .parse()
        .map_err(|e| Error::Config(format!("invalid endpoint {endpoint}: {e}")))?;
    let scheme = uri
        .scheme_str()
        .ok_or_else(|| Error::Config(format!("endpoint has no scheme: {endpoint}")))?;
    let authority = uri
        .authority()
        .ok_or_else(|| Error::Config(format!("endpoint has no host: {endpoint}")))?;
    let path = match uri.path() {
        "" => "/",
        path => path,
    };
    let query = match uri.query() {
        Some(query) if !query.is_empty() => format!("{query}&agent_id={agent_id}"),
        _ => format!("agent_id={agent_id}"),
    };

    Ok(format!("{scheme}://{authority}{path}?{query}"))
}

async fn write(sink: &mut SocketSink, message: &OutboundMessage) -> Result<()> {
    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(kind = message.kind(), error = %e, "dropping unserializable message");
            return Ok(());
        }
    };
    tracing::trace!(kind = message.kind(), "sending frame");
    sink.send(Message::text(json)).await?;
    Ok(())
}

async fn close(sink: &mut SocketSink) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "client shutdown".into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "close frame not delivered");
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::ReconnectPolicy;
    use secrecy::SecretString;
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig {
            endpoint: "ws://127.0.0.1:9".to_string(),
            agent_id: "agent".to_string(),
            api_key: SecretString::from("key"),
            reconnect: ReconnectPolicy {
                max_attempts: 0,
                base_delay: Duration::from_millis(1),
            },
            connect_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn send_before_connect_is_rejected() {
        let engine = SessionEngine::new(config());
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert!(matches!(
            engine.send(OutboundMessage::UserActivity),
            Err(Error::NotConnected)
        ));
        assert_eq!(engine.pending_sends(), 0);
    }

    #[test]
    fn handshake_url_adds_agent_to_any_endpoint() {
        assert_eq!(
            handshake_url("ws://127.0.0.1:8080", "a1").unwrap(),
            "ws://127.0.0.1:8080/?agent_id=a1"
        );
        assert_eq!(
            handshake_url("wss://api.example.com/v1/convai/conversation", "a1").unwrap(),
            "wss://api.example.com/v1/convai/conversation?agent_id=a1"
        );
        assert_eq!(
            handshake_url("ws://localhost:9000/chat?x=1", "a1").unwrap(),
            "ws://localhost:9000/chat?x=1&agent_id=a1"
        );
    }

    #[test]
    fn handshake_url_rejects_endpoint_without_host() {
        assert!(matches!(
            handshake_url("/just/a/path", "a1"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_harmless() {
        let mut engine = SessionEngine::new(config());
        engine.disconnect().await;
        engine.disconnect().await;
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }
}
