//! Shared test utilities

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

use voxlink::config::SessionConfig;
use voxlink::session::ReconnectPolicy;
use voxlink::voice::{
    AudioChunk, AudioDevices, CaptureInput, CaptureStream, FrameCallback, PcmFormat,
    RenderCallback,
};
use voxlink::{Error, Result};

/// What the scripted devices have been asked to do
#[derive(Default)]
pub struct Script {
    pub capture: Option<FrameCallback>,
    pub capture_opens: usize,
    pub capture_closes: usize,
    pub fail_capture: bool,
    pub rendered: Vec<AudioChunk>,
    pub in_flight: Option<RenderCallback>,
    pub cancels: usize,
}

/// In-memory microphone/speaker pair driven by the test
#[derive(Clone)]
pub struct ScriptedDevices {
    pub format: PcmFormat,
    pub script: Arc<Mutex<Script>>,
}

impl ScriptedDevices {
    pub fn new(format: PcmFormat) -> Self {
        Self {
            format,
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Deliver a native buffer as if the microphone produced it
    pub fn push_frames(&self, bytes: Vec<u8>) -> bool {
        self.deliver(CaptureInput::Frames(bytes))
    }

    /// Fail the open capture stream
    pub fn fail_capture_stream(&self, message: &str) -> bool {
        self.deliver(CaptureInput::Error(message.to_string()))
    }

    /// Finish the chunk currently on the speaker
    pub fn complete_render(&self) -> bool {
        let done = self.script.lock().unwrap().in_flight.take();
        match done {
            Some(done) => {
                done(Ok(()));
                true
            }
            None => false,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.script.lock().unwrap().capture.is_some()
    }

    pub fn rendered(&self) -> Vec<AudioChunk> {
        self.script.lock().unwrap().rendered.clone()
    }

    pub fn capture_opens(&self) -> usize {
        self.script.lock().unwrap().capture_opens
    }

    fn deliver(&self, input: CaptureInput) -> bool {
        let callback = self.script.lock().unwrap().capture.take();
        let Some(mut callback) = callback else {
            return false;
        };
        callback(input);

        let mut script = self.script.lock().unwrap();
        if script.capture.is_none() && script.capture_opens > script.capture_closes {
            script.capture = Some(callback);
        }
        true
    }
}

struct StreamGuard(Arc<Mutex<Script>>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut script = self.0.lock().unwrap();
        script.capture = None;
        script.capture_closes += 1;
    }
}

impl AudioDevices for ScriptedDevices {
    fn capture_format(&self) -> PcmFormat {
        self.format
    }

    fn open_capture(&mut self, on_input: FrameCallback) -> Result<CaptureStream> {
        let mut script = self.script.lock().unwrap();
        if script.fail_capture {
            return Err(Error::Audio("scripted capture failure".to_string()));
        }
        script.capture_opens += 1;
        script.capture = Some(on_input);
        Ok(CaptureStream::new(StreamGuard(Arc::clone(&self.script))))
    }

    fn render(&mut self, chunk: AudioChunk, on_done: RenderCallback) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.rendered.push(chunk);
        script.in_flight = Some(on_done);
        Ok(())
    }

    fn cancel_playback(&mut self) {
        let mut script = self.script.lock().unwrap();
        script.in_flight = None;
        script.cancels += 1;
    }
}

/// 16-bit mono PCM bytes with every sample set to `amplitude`
pub fn tone(amplitude: i16, samples: usize) -> Vec<u8> {
    std::iter::repeat_n(amplitude, samples)
        .flat_map(i16::to_le_bytes)
        .collect()
}

/// A websocket accepted by the test server, with what the client presented
pub struct Accepted {
    pub socket: WebSocketStream<TcpStream>,
    pub uri: String,
    pub api_key: Option<String>,
}

/// Start a websocket server on a random local port
///
/// Every accepted connection is handed to the test through the receiver.
pub async fn ws_server() -> (String, mpsc::UnboundedReceiver<Accepted>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let captured = Arc::new(Mutex::new((String::new(), None)));
            let sink = Arc::clone(&captured);
            let callback = move |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
                let key = request
                    .headers()
                    .get("xi-api-key")
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                *sink.lock().unwrap() = (request.uri().to_string(), key);
                Ok(response)
            };

            let Ok(socket) = accept_hdr_async(stream, callback).await else {
                continue;
            };
            let (uri, api_key) = captured.lock().unwrap().clone();
            if tx.send(Accepted { socket, uri, api_key }).is_err() {
                break;
            }
        }
    });

    (url, rx)
}

/// Next accepted connection, failing the test after a few seconds
pub async fn next_accepted(rx: &mut mpsc::UnboundedReceiver<Accepted>) -> Accepted {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("server stopped")
}

/// Next text frame from the client, parsed as JSON
pub async fn next_json(socket: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Engine settings pointing at `endpoint` with fast retries
pub fn session_config(endpoint: &str, max_attempts: u32) -> SessionConfig {
    SessionConfig {
        endpoint: endpoint.to_string(),
        agent_id: "agent_test".to_string(),
        api_key: "test-key".into(),
        reconnect: ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
        },
        connect_timeout: Duration::from_secs(2),
    }
}
