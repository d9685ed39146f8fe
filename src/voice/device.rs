//! Audio formats, chunks, and the device seam used by the pipeline

use std::any::Any;

use crate::Result;

/// Sample encoding of a PCM buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Signed 16-bit little-endian
    I16,
    /// 32-bit float little-endian, nominal range [-1.0, 1.0]
    F32,
}

impl SampleEncoding {
    /// Bytes per sample
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::I16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Shape of an interleaved PCM buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl PcmFormat {
    /// Mono 16-bit at `sample_rate`, the shape the remote service speaks
    #[must_use]
    pub const fn wire(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            encoding: SampleEncoding::I16,
        }
    }

    /// Bytes per interleaved frame (0 when the format is degenerate)
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.channels as usize * self.encoding.bytes()
    }
}

/// Which side of the converter a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFormat {
    /// As delivered by the capture device
    Native(PcmFormat),
    /// Mono 16-bit little-endian at the given rate
    Wire(u32),
}

/// A block of PCM bytes plus the format it is encoded in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub format: ChunkFormat,
}

impl AudioChunk {
    /// Wrap wire-format bytes
    #[must_use]
    pub const fn wire(data: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            data,
            format: ChunkFormat::Wire(sample_rate),
        }
    }

    /// Wrap bytes straight from the capture device
    #[must_use]
    pub const fn native(data: Vec<u8>, format: PcmFormat) -> Self {
        Self {
            data,
            format: ChunkFormat::Native(format),
        }
    }

    /// Concrete PCM layout of this chunk
    #[must_use]
    pub const fn pcm_format(&self) -> PcmFormat {
        match self.format {
            ChunkFormat::Native(format) => format,
            ChunkFormat::Wire(rate) => PcmFormat::wire(rate),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playback length of this chunk in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        let format = self.pcm_format();
        let frame = format.frame_bytes() as u64;
        if frame == 0 || format.sample_rate == 0 {
            return 0;
        }
        (self.data.len() as u64 / frame) * 1000 / u64::from(format.sample_rate)
    }
}

/// Raw input delivered by a capture stream
#[derive(Debug)]
pub enum CaptureInput {
    /// Interleaved native-format bytes
    Frames(Vec<u8>),
    /// The stream failed and will deliver nothing further
    Error(String),
}

/// Callback invoked from the device thread for every capture buffer
pub type FrameCallback = Box<dyn FnMut(CaptureInput) + Send + 'static>;

/// Callback invoked once a rendered chunk has finished (or failed)
pub type RenderCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Open capture stream; dropping it releases the device handle
pub struct CaptureStream {
    _inner: Box<dyn Any>,
}

impl CaptureStream {
    /// Wrap whatever keeps the underlying stream alive
    #[must_use]
    pub fn new<T: Any>(inner: T) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for CaptureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStream").finish_non_exhaustive()
    }
}

/// Input and output endpoints the pipeline drives
///
/// The pipeline never touches the OS audio API directly; it goes through this
/// trait so the capture/playback policy can run against scripted devices.
pub trait AudioDevices {
    /// Format of the buffers `open_capture` delivers
    fn capture_format(&self) -> PcmFormat;

    /// Open the input device and deliver buffers to `on_input` until the
    /// returned stream is dropped
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    fn open_capture(&mut self, on_input: FrameCallback) -> Result<CaptureStream>;

    /// Start rendering `chunk` on the output device and call `on_done` once the
    /// device has consumed it
    ///
    /// # Errors
    ///
    /// Returns error if the chunk could not be handed to the device
    fn render(&mut self, chunk: AudioChunk, on_done: RenderCallback) -> Result<()>;

    /// Abort any in-flight render without invoking its completion callback
    fn cancel_playback(&mut self);
}
