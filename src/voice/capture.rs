//! Audio capture from microphone

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, SizedSample, StreamConfig};

use super::convert::samples_to_bytes;
use super::device::{CaptureInput, CaptureStream, FrameCallback, PcmFormat, SampleEncoding};
use crate::{Error, Result};

/// Captures audio from a named (or the default) input device
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    format: PcmFormat,
}

impl AudioCapture {
    /// Resolve the input device and a stream config at `sample_rate`
    ///
    /// Prefers `channels`; falls back to any channel count the device offers at
    /// that rate since the converter downmixes anyway.
    ///
    /// # Errors
    ///
    /// Returns error if no matching device or config exists
    pub fn new(device_name: Option<&str>, sample_rate: u32, channels: u16) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| Error::Audio(e.to_string()))?
                .find(|d| d.name().is_ok_and(|n| n == name))
                .ok_or_else(|| Error::Audio(format!("input device not found: {name}")))?,
            None => host
                .default_input_device()
                .ok_or_else(|| Error::Audio("no input device available".to_string()))?,
        };

        let candidates: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .filter(|c| {
                c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
                    && encoding_for(c.sample_format()).is_some()
            })
            .collect();

        let supported = candidates
            .iter()
            .find(|c| c.channels() == channels)
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| {
                Error::Audio(format!("no input config supports {sample_rate} Hz"))
            })?
            .with_sample_rate(SampleRate(sample_rate));

        let encoding = encoding_for(supported.sample_format())
            .ok_or_else(|| Error::Audio("unsupported capture sample format".to_string()))?;
        let config = supported.config();
        let format = PcmFormat {
            sample_rate,
            channels: config.channels,
            encoding,
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            ?encoding,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            format,
        })
    }

    /// Format of the buffers this capture delivers
    #[must_use]
    pub const fn format(&self) -> PcmFormat {
        self.format
    }

    /// Start a capture stream feeding `on_input`
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started
    pub fn open(&self, on_input: FrameCallback) -> Result<CaptureStream> {
        let shared = Arc::new(Mutex::new(on_input));

        let stream = match self.format.encoding {
            SampleEncoding::I16 => self.build::<i16>(shared, samples_to_bytes)?,
            SampleEncoding::F32 => self.build::<f32>(shared, |data| {
                data.iter().flat_map(|s| s.to_le_bytes()).collect()
            })?,
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        tracing::debug!("audio capture started");

        Ok(CaptureStream::new(stream))
    }

    fn build<T: SizedSample + 'static>(
        &self,
        shared: Arc<Mutex<FrameCallback>>,
        encode: fn(&[T]) -> Vec<u8>,
    ) -> Result<cpal::Stream> {
        let on_error = Arc::clone(&shared);

        self.device
            .build_input_stream(
                &self.config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut cb) = shared.lock() {
                        cb(CaptureInput::Frames(encode(data)));
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    if let Ok(mut cb) = on_error.lock() {
                        cb(CaptureInput::Error(err.to_string()));
                    }
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))
    }
}

const fn encoding_for(format: SampleFormat) -> Option<SampleEncoding> {
    match format {
        SampleFormat::I16 => Some(SampleEncoding::I16),
        SampleFormat::F32 => Some(SampleEncoding::F32),
        _ => None,
    }
}
