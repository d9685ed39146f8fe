//! Audio I/O pipeline
//!
//! Owns at most one capture stream and one FIFO playback queue. Capture and
//! playback are independent primitives here; keeping them mutually exclusive
//! is the orchestrator's job.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::UnboundedSender;

use super::convert;
use super::device::{
    AudioChunk, AudioDevices, CaptureInput, CaptureStream, FrameCallback, RenderCallback,
};
use crate::Result;

/// Output of a running capture
#[derive(Debug)]
pub enum CaptureEvent {
    /// Wire-format audio, in capture order
    Chunk(AudioChunk),
    /// The capture stream failed; nothing further will be delivered
    Fault(String),
}

/// Completion notice for one rendered chunk
#[derive(Debug)]
pub struct RenderComplete {
    generation: u64,
    result: Result<()>,
}

impl RenderComplete {
    #[must_use]
    pub const fn result(&self) -> &Result<()> {
        &self.result
    }
}

/// Chunks waiting for the output device, plus whether one is on it now
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    pending: VecDeque<AudioChunk>,
    rendering: bool,
}

impl PlaybackQueue {
    pub fn push(&mut self, chunk: AudioChunk) {
        self.pending.push_back(chunk);
    }

    /// Take the head for rendering if the device is free
    pub fn start_next(&mut self) -> Option<AudioChunk> {
        if self.rendering {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.rendering = true;
        Some(next)
    }

    /// Mark the chunk on the device as done
    pub fn finish(&mut self) {
        self.rendering = false;
    }

    /// Drop everything not yet rendering; returns how many chunks were dropped
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.rendering = false;
    }

    #[must_use]
    pub const fn is_rendering(&self) -> bool {
        self.rendering
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.rendering && self.pending.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

struct ActiveCapture {
    _stream: CaptureStream,
    active: Arc<AtomicBool>,
}

/// Capture stream plus playback queue over a set of [`AudioDevices`]
pub struct AudioPipeline<D: AudioDevices> {
    devices: D,
    wire_rate: u32,
    capture: Option<ActiveCapture>,
    queue: PlaybackQueue,
    generation: u64,
    completions: UnboundedSender<RenderComplete>,
}

impl<D: AudioDevices> AudioPipeline<D> {
    /// Create a pipeline; render completions are delivered on `completions`
    pub fn new(devices: D, wire_rate: u32, completions: UnboundedSender<RenderComplete>) -> Self {
        Self {
            devices,
            wire_rate,
            capture: None,
            queue: PlaybackQueue::default(),
            generation: 0,
            completions,
        }
    }

    /// Start capturing; every native buffer is converted to wire format and
    /// handed to `on_chunk`. A no-op while already capturing.
    ///
    /// # Errors
    ///
    /// Returns error if the capture device cannot be opened
    pub fn start_capture<F>(&mut self, on_chunk: F) -> Result<()>
    where
        F: FnMut(CaptureEvent) + Send + 'static,
    {
        if self.capture.is_some() {
            return Ok(());
        }

        let native = self.devices.capture_format();
        let wire_rate = self.wire_rate;
        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);
        let mut on_chunk = on_chunk;

        let callback: FrameCallback = Box::new(move |input| {
            if !flag.load(Ordering::Acquire) {
                return;
            }
            match input {
                CaptureInput::Frames(bytes) => {
                    let native_chunk = AudioChunk::native(bytes, native);
                    let conversion =
                        convert::to_wire(&native_chunk.data, native_chunk.pcm_format(), wire_rate);
                    if let Some(fault) = conversion.fault {
                        tracing::warn!(?fault, "capture buffer only partly converted");
                    }
                    if !conversion.data.is_empty() {
                        on_chunk(CaptureEvent::Chunk(AudioChunk::wire(conversion.data, wire_rate)));
                    }
                }
                CaptureInput::Error(message) => {
                    flag.store(false, Ordering::Release);
                    on_chunk(CaptureEvent::Fault(message));
                }
            }
        });

        let stream = self.devices.open_capture(callback)?;
        self.capture = Some(ActiveCapture {
            _stream: stream,
            active,
        });
        tracing::debug!(sample_rate = native.sample_rate, channels = native.channels, "capture started");

        Ok(())
    }

    /// Stop capturing and release the input device; a no-op when idle
    pub fn stop_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.active.store(false, Ordering::Release);
            drop(capture);
            tracing::debug!("capture stopped");
        }
    }

    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Append a wire-format chunk; starts rendering at once if the device is free
    pub fn enqueue_playback(&mut self, chunk: AudioChunk) {
        if chunk.is_empty() {
            tracing::trace!("skipping empty playback chunk");
            return;
        }
        self.queue.push(chunk);
        self.pump();
    }

    /// Feed a completion back in; returns `true` when playback has gone idle
    pub fn on_render_complete(&mut self, done: RenderComplete) -> bool {
        if done.generation != self.generation {
            tracing::trace!("ignoring completion from a previous playback generation");
            return false;
        }
        if let Err(e) = &done.result {
            tracing::warn!(error = %e, "chunk playback failed");
        }

        self.queue.finish();
        self.pump();
        self.queue.is_idle()
    }

    /// Drop queued chunks that have not started rendering
    pub fn discard_pending(&mut self) -> usize {
        self.queue.discard_pending()
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        !self.queue.is_idle()
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stop capture, discard playback, and reset; safe to call repeatedly
    pub fn cleanup(&mut self) {
        self.stop_capture();
        if self.queue.is_rendering() {
            self.devices.cancel_playback();
        }
        self.queue.clear();
        self.generation += 1;
        tracing::debug!("audio pipeline cleaned up");
    }

    #[must_use]
    pub const fn devices(&self) -> &D {
        &self.devices
    }

    fn pump(&mut self) {
        while let Some(chunk) = self.queue.start_next() {
            let completions = self.completions.clone();
            let generation = self.generation;
            let on_done: RenderCallback = Box::new(move |result| {
                let _ = completions.send(RenderComplete { generation, result });
            });

            match self.devices.render(chunk, on_done) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "could not start chunk playback, skipping");
                    self.queue.finish();
                }
            }
        }
    }
}
