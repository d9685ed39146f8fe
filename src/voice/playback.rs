//! Audio playback to speakers
//!
//! A dedicated worker thread owns the output device (cpal streams are not
//! `Send`) and renders one chunk at a time, reporting completion through the
//! chunk's callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, SampleFormat, SampleRate, StreamConfig, SupportedStreamConfig,
    SupportedStreamConfigRange,
};

use super::convert::{bytes_to_samples, resample_nearest};
use super::device::{AudioChunk, RenderCallback};
use crate::{Error, Result};

/// Poll interval while waiting for the device to drain a chunk
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Grace period beyond the nominal chunk length before giving up on the device
const DRAIN_GRACE: Duration = Duration::from_millis(500);

struct RenderJob {
    chunk: AudioChunk,
    epoch: u64,
    on_done: RenderCallback,
}

/// Plays wire-format chunks on a named (or the default) output device
pub struct AudioPlayback {
    jobs: Sender<RenderJob>,
    epoch: Arc<AtomicU64>,
    _worker: JoinHandle<()>,
}

impl AudioPlayback {
    /// Spawn the playback worker and open the output device
    ///
    /// # Errors
    ///
    /// Returns error if the output device cannot be opened
    pub fn new(device_name: Option<&str>, wire_rate: u32) -> Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let epoch = Arc::new(AtomicU64::new(0));

        let worker_epoch = Arc::clone(&epoch);
        let device_name = device_name.map(ToString::to_string);
        let worker = std::thread::Builder::new()
            .name("voxlink-playback".to_string())
            .spawn(move || run_worker(device_name.as_deref(), wire_rate, &jobs_rx, &worker_epoch, &ready_tx))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback worker exited during startup".to_string()))??;

        Ok(Self {
            jobs: jobs_tx,
            epoch,
            _worker: worker,
        })
    }

    /// Queue `chunk` on the worker; `on_done` fires once the device drains it
    ///
    /// # Errors
    ///
    /// Returns error if the worker has exited
    pub fn submit(&self, chunk: AudioChunk, on_done: RenderCallback) -> Result<()> {
        let job = RenderJob {
            chunk,
            epoch: self.epoch.load(Ordering::Acquire),
            on_done,
        };
        self.jobs
            .send(job)
            .map_err(|_| Error::Audio("playback worker is gone".to_string()))
    }

    /// Abort the chunk in flight; its callback is dropped without being called
    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

fn run_worker(
    device_name: Option<&str>,
    wire_rate: u32,
    jobs: &Receiver<RenderJob>,
    epoch: &AtomicU64,
    ready: &SyncSender<Result<()>>,
) {
    let output = match OutputDevice::open(device_name, wire_rate) {
        Ok(output) => {
            let _ = ready.send(Ok(()));
            output
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Ok(job) = jobs.recv() {
        let cancelled = || epoch.load(Ordering::Acquire) != job.epoch;
        if cancelled() {
            continue;
        }

        let result = output.play_blocking(&job.chunk, cancelled);
        match result {
            Ok(Rendered::Cancelled) => tracing::debug!("playback cancelled"),
            Ok(Rendered::Complete) => (job.on_done)(Ok(())),
            Err(e) => (job.on_done)(Err(e)),
        }
    }

    tracing::debug!("playback worker stopped");
}

enum Rendered {
    Complete,
    Cancelled,
}

/// Pick an f32 output config, preferring mono then stereo at the wire rate
///
/// Otherwise falls back to the device default (if f32) or any f32 range at its
/// highest rate; chunks are resampled on the way out.
fn choose_output_config(
    ranges: &[SupportedStreamConfigRange],
    default: Option<SupportedStreamConfig>,
    wire_rate: u32,
) -> Option<SupportedStreamConfig> {
    let supports_wire_rate = |c: &SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.sample_format() == SampleFormat::F32
            && c.min_sample_rate() <= SampleRate(wire_rate)
            && c.max_sample_rate() >= SampleRate(wire_rate)
    };

    let exact = ranges
        .iter()
        .find(|c| supports_wire_rate(c, 1))
        .or_else(|| ranges.iter().find(|c| supports_wire_rate(c, 2)))
        .map(|c| c.clone().with_sample_rate(SampleRate(wire_rate)));
    if exact.is_some() {
        return exact;
    }

    default
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .or_else(|| {
            ranges
                .iter()
                .find(|c| c.sample_format() == SampleFormat::F32)
                .map(|c| c.clone().with_max_sample_rate())
        })
}

struct OutputDevice {
    device: Device,
    config: StreamConfig,
    wire_rate: u32,
}

impl OutputDevice {
    fn open(device_name: Option<&str>, wire_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| Error::Audio(e.to_string()))?
                .find(|d| d.name().is_ok_and(|n| n == name))
                .ok_or_else(|| Error::Audio(format!("output device not found: {name}")))?,
            None => host
                .default_output_device()
                .ok_or_else(|| Error::Audio("no output device available".to_string()))?,
        };

        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .collect();
        let default = device.default_output_config().ok();
        let config = choose_output_config(&ranges, default, wire_rate)
            .ok_or_else(|| Error::Audio("output device offers no f32 stream config".to_string()))?
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            device,
            config,
            wire_rate,
        })
    }

    /// Render `chunk` and block until the device has consumed it
    fn play_blocking(&self, chunk: &AudioChunk, cancelled: impl Fn() -> bool) -> Result<Rendered> {
        let source_rate = chunk.pcm_format().sample_rate;
        let source_rate = if source_rate == 0 { self.wire_rate } else { source_rate };
        let device_rate = self.config.sample_rate.0;

        let samples: Vec<f32> = resample_nearest(&bytes_to_samples(&chunk.data), source_rate, device_rate)
            .into_iter()
            .map(|s| f32::from(s) / 32768.0)
            .collect();

        if samples.is_empty() {
            return Ok(Rendered::Complete);
        }

        let channels = usize::from(self.config.channels);
        let sample_count = samples.len();
        let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
        let (fault_tx, fault_rx) = mpsc::sync_channel::<String>(1);
        let mut position = 0usize;

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(position).copied().unwrap_or(0.0);
                        frame.fill(sample);
                        if position < samples.len() {
                            position += 1;
                        }
                    }
                    if position >= samples.len() {
                        let _ = done_tx.try_send(());
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    let _ = fault_tx.try_send(err.to_string());
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (sample_count as u64 * 1000) / u64::from(device_rate.max(1));
        let deadline = Instant::now() + Duration::from_millis(duration_ms) + DRAIN_GRACE;

        let outcome = loop {
            if cancelled() {
                break Ok(Rendered::Cancelled);
            }
            if let Ok(message) = fault_rx.try_recv() {
                break Err(Error::Audio(message));
            }
            match done_rx.recv_timeout(POLL_INTERVAL) {
                Ok(()) => break Ok(Rendered::Complete),
                Err(mpsc::RecvTimeoutError::Disconnected) => break Ok(Rendered::Complete),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
            if Instant::now() > deadline {
                tracing::warn!(samples = sample_count, "playback did not drain in time");
                break Ok(Rendered::Complete);
            }
        };

        drop(stream);
        tracing::debug!(samples = sample_count, "playback complete");

        outcome
    }
}
