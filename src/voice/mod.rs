//! Voice processing module
//!
//! Handles sample conversion, voice activity gating, and the capture/playback
//! pipeline. The remote agent does transcription and synthesis; nothing here
//! understands speech beyond its energy.

mod capture;
pub mod convert;
mod device;
mod gate;
mod hardware;
mod pipeline;
mod playback;

pub use capture::AudioCapture;
pub use convert::{Conversion, ConversionFault, to_wire};
pub use device::{
    AudioChunk, AudioDevices, CaptureInput, CaptureStream, ChunkFormat, FrameCallback, PcmFormat,
    RenderCallback, SampleEncoding,
};
pub use gate::{
    DEFAULT_ENERGY_THRESHOLD, GateConfig, GateEvent, VoiceGate, VoiceState, calculate_energy,
};
pub use hardware::CpalDevices;
pub use pipeline::{AudioPipeline, CaptureEvent, PlaybackQueue, RenderComplete};
pub use playback::AudioPlayback;
