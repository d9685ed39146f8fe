//! Capture-format to wire-format sample conversion
//!
//! Downmixes by unweighted channel averaging and changes rate by nearest-sample
//! selection. No band limiting is applied, so content above the target Nyquist
//! frequency aliases.

use super::device::{PcmFormat, SampleEncoding};

/// Why a conversion produced less than the whole input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionFault {
    /// Trailing bytes did not form a whole frame and were dropped
    Truncated { dropped_bytes: usize },
    /// Zero channels or a zero sample rate; nothing could be decoded
    InvalidFormat,
}

/// Output of [`to_wire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    /// Mono 16-bit little-endian PCM at the target rate
    pub data: Vec<u8>,
    /// Set when part of the input had to be discarded
    pub fault: Option<ConversionFault>,
}

impl Conversion {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.fault.is_none()
    }
}

/// Convert an interleaved native buffer to wire format at `target_rate`
///
/// Never fails: malformed input yields the longest valid prefix and a fault flag.
#[must_use]
pub fn to_wire(input: &[u8], format: PcmFormat, target_rate: u32) -> Conversion {
    let frame_bytes = format.frame_bytes();
    if frame_bytes == 0 || format.sample_rate == 0 || target_rate == 0 {
        return Conversion {
            data: Vec::new(),
            fault: Some(ConversionFault::InvalidFormat),
        };
    }

    let whole = input.len() - input.len() % frame_bytes;
    let dropped_bytes = input.len() - whole;
    let fault = (dropped_bytes > 0).then_some(ConversionFault::Truncated { dropped_bytes });
    let input = &input[..whole];

    // Already in wire shape: plain copy
    if format.sample_rate == target_rate
        && format.channels == 1
        && format.encoding == SampleEncoding::I16
    {
        return Conversion {
            data: input.to_vec(),
            fault,
        };
    }

    let mono = downmix(input, format);
    let resampled = resample_nearest(&mono, format.sample_rate, target_rate);

    Conversion {
        data: samples_to_bytes(&resampled),
        fault,
    }
}

/// Average each interleaved frame down to one 16-bit sample
fn downmix(input: &[u8], format: PcmFormat) -> Vec<i16> {
    let channels = usize::from(format.channels);
    let width = format.encoding.bytes();

    input
        .chunks_exact(format.frame_bytes())
        .map(|frame| {
            let sum: i32 = frame
                .chunks_exact(width)
                .map(|raw| i32::from(decode_sample(raw, format.encoding)))
                .sum();
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let avg = (sum / channels as i32) as i16;
            avg
        })
        .collect()
}

fn decode_sample(raw: &[u8], encoding: SampleEncoding) -> i16 {
    match encoding {
        SampleEncoding::I16 => i16::from_le_bytes([raw[0], raw[1]]),
        SampleEncoding::F32 => {
            let value = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            f32_to_i16(value)
        }
    }
}

/// Scale a float sample in [-1.0, 1.0] to 16-bit
#[must_use]
pub fn f32_to_i16(sample: f32) -> i16 {
    #[allow(clippy::cast_possible_truncation)]
    let scaled = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
    scaled
}

/// Change rate by picking the nearest earlier source sample for each output slot
///
/// Output length is `floor(len * to / from)`. Works in both directions; when
/// `to > from` samples are repeated.
#[must_use]
pub fn resample_nearest(samples: &[i16], from: u32, to: u32) -> Vec<i16> {
    if from == to || samples.is_empty() {
        return samples.to_vec();
    }
    if from == 0 || to == 0 {
        return Vec::new();
    }

    let from = u64::from(from);
    let to = u64::from(to);
    #[allow(clippy::cast_possible_truncation)]
    let out_len = (samples.len() as u64 * to / from) as usize;

    (0..out_len)
        .map(|i| {
            #[allow(clippy::cast_possible_truncation)]
            let src = (i as u64 * from / to) as usize;
            samples[src.min(samples.len() - 1)]
        })
        .collect()
}

/// Encode 16-bit samples as little-endian bytes
#[must_use]
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode little-endian 16-bit samples; a trailing odd byte is ignored
#[must_use]
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
