//! cpal-backed implementation of [`AudioDevices`]

use super::capture::AudioCapture;
use super::device::{
    AudioChunk, AudioDevices, CaptureStream, FrameCallback, PcmFormat, RenderCallback,
};
use super::playback::AudioPlayback;
use crate::Result;
use crate::config::AudioConfig;

/// The local microphone/speaker pair
pub struct CpalDevices {
    capture: AudioCapture,
    playback: AudioPlayback,
}

impl CpalDevices {
    /// Open both endpoints described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if either device cannot be opened
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let capture = AudioCapture::new(
            config.input_device.as_deref(),
            config.capture_sample_rate,
            config.capture_channels,
        )?;
        let playback = AudioPlayback::new(config.output_device.as_deref(), config.wire_sample_rate)?;

        Ok(Self { capture, playback })
    }
}

impl AudioDevices for CpalDevices {
    fn capture_format(&self) -> PcmFormat {
        self.capture.format()
    }

    fn open_capture(&mut self, on_input: FrameCallback) -> Result<CaptureStream> {
        self.capture.open(on_input)
    }

    fn render(&mut self, chunk: AudioChunk, on_done: RenderCallback) -> Result<()> {
        self.playback.submit(chunk, on_done)
    }

    fn cancel_playback(&mut self) {
        self.playback.cancel();
    }
}
