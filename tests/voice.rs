//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use voxlink::voice::{
    AudioChunk, AudioPipeline, CaptureEvent, GateConfig, GateEvent, PcmFormat, SampleEncoding,
    VoiceGate, VoiceState, convert, to_wire,
};

mod common;

use common::ScriptedDevices;

/// Generate interleaved 16-bit sine samples
fn generate_sine_samples(frequency: f32, sample_rate: u32, duration_ms: u32, amplitude: f32) -> Vec<i16> {
    let num_samples = (sample_rate * duration_ms / 1000) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin() * 32767.0) as i16
        })
        .collect()
}

/// Generate silence
fn generate_silence(sample_rate: u32, duration_ms: u32) -> Vec<i16> {
    vec![0; (sample_rate * duration_ms / 1000) as usize]
}

fn gate_config() -> GateConfig {
    GateConfig {
        speech_confirm: Duration::from_millis(500),
        silence_confirm: Duration::from_millis(3000),
        inactivity: Duration::from_millis(20_000),
        energy_threshold: 500.0,
    }
}

/// Feed `count` chunks of 100ms each starting at `start_ms`, collecting events
fn feed(gate: &mut VoiceGate, t0: Instant, start_ms: u64, count: u64, samples: &[i16]) -> Vec<GateEvent> {
    (0..count)
        .flat_map(|i| gate.process(samples, t0 + Duration::from_millis(start_ms + i * 100)))
        .collect()
}

#[test]
fn test_converter_output_length_and_shape() {
    let encodings = [SampleEncoding::I16, SampleEncoding::F32];
    for rate in [8_000u32, 16_000, 22_050, 44_100, 48_000] {
        for channels in [1u16, 2, 6] {
            for encoding in encodings {
                let format = PcmFormat {
                    sample_rate: rate,
                    channels,
                    encoding,
                };
                let frames = rate as usize / 50;
                let input = vec![0u8; frames * format.frame_bytes()];

                let out = to_wire(&input, format, 16_000);
                assert!(out.is_clean());
                assert_eq!(out.data.len() % 2, 0, "output must be whole 16-bit samples");

                let expected = (frames as u64 * 16_000 / u64::from(rate)) as i64;
                let actual = (out.data.len() / 2) as i64;
                assert!(
                    (actual - expected).abs() <= 1,
                    "{rate} Hz x{channels} {encoding:?}: {actual} samples, expected {expected}"
                );
            }
        }
    }
}

#[test]
fn test_converter_downmixes_stereo_sine() {
    let left = generate_sine_samples(440.0, 48_000, 20, 0.5);
    let interleaved: Vec<i16> = left.iter().flat_map(|&s| [s, s]).collect();
    let format = PcmFormat {
        sample_rate: 48_000,
        channels: 2,
        encoding: SampleEncoding::I16,
    };

    let out = to_wire(&convert::samples_to_bytes(&interleaved), format, 16_000);
    let samples = convert::bytes_to_samples(&out.data);

    assert_eq!(samples.len(), left.len() / 3);
    for (i, sample) in samples.iter().enumerate() {
        assert_eq!(*sample, left[i * 3]);
    }
}

#[test]
fn test_converter_keeps_valid_prefix_of_truncated_input() {
    let format = PcmFormat {
        sample_rate: 16_000,
        channels: 2,
        encoding: SampleEncoding::I16,
    };
    // Two whole frames and a stray byte
    let input = [1u8, 0, 3, 0, 5, 0, 7, 0, 9];

    let out = to_wire(&input, format, 16_000);
    assert!(!out.is_clean());
    assert_eq!(convert::bytes_to_samples(&out.data), vec![2, 6]);
}

#[test]
fn test_gate_short_loud_run_never_starts_speech() {
    let mut gate = VoiceGate::new(gate_config());
    let t0 = Instant::now();
    gate.start_listening(t0);

    let loud = generate_sine_samples(440.0, 16_000, 100, 0.3);
    let quiet = generate_silence(16_000, 100);

    // 400ms loud, then quiet: below the 500ms confirm window
    let mut events = feed(&mut gate, t0, 0, 4, &loud);
    events.extend(feed(&mut gate, t0, 400, 10, &quiet));

    assert!(events.is_empty());
    assert_eq!(gate.state(), VoiceState::Silence);
}

#[test]
fn test_gate_sustained_speech_starts_once() {
    let mut gate = VoiceGate::new(gate_config());
    let t0 = Instant::now();
    gate.start_listening(t0);

    let loud = generate_sine_samples(440.0, 16_000, 100, 0.3);
    let events = feed(&mut gate, t0, 0, 20, &loud);

    assert_eq!(events, vec![GateEvent::SpeechStart]);
    assert_eq!(gate.state(), VoiceState::Speech);
}

#[test]
fn test_gate_pause_shorter_than_silence_window_keeps_speech() {
    let mut gate = VoiceGate::new(gate_config());
    let t0 = Instant::now();
    gate.start_listening(t0);

    let loud = generate_sine_samples(440.0, 16_000, 100, 0.3);
    let quiet = generate_silence(16_000, 100);

    let mut events = feed(&mut gate, t0, 0, 10, &loud);
    // 2.9s pause, then speech resumes
    events.extend(feed(&mut gate, t0, 1000, 29, &quiet));
    events.extend(feed(&mut gate, t0, 3900, 5, &loud));

    assert_eq!(events, vec![GateEvent::SpeechStart]);
    assert_eq!(gate.state(), VoiceState::Speech);
}

#[test]
fn test_gate_full_silence_window_ends_speech_once() {
    let mut gate = VoiceGate::new(gate_config());
    let t0 = Instant::now();
    gate.start_listening(t0);

    let loud = generate_sine_samples(440.0, 16_000, 100, 0.3);
    let quiet = generate_silence(16_000, 100);

    let mut events = feed(&mut gate, t0, 0, 10, &loud);
    events.extend(feed(&mut gate, t0, 1000, 40, &quiet));

    assert_eq!(events, vec![GateEvent::SpeechStart, GateEvent::SpeechEnd]);
    assert_eq!(gate.state(), VoiceState::Silence);
}

#[test]
fn test_gate_inactivity_times_out_once() {
    let mut gate = VoiceGate::new(gate_config());
    let t0 = Instant::now();
    gate.start_listening(t0);

    let quiet = generate_silence(16_000, 100);
    let events = feed(&mut gate, t0, 0, 250, &quiet);

    assert_eq!(events, vec![GateEvent::Timeout]);
    assert!(!gate.is_listening());
}

#[test]
fn test_pipeline_renders_fifo_one_at_a_time() {
    let devices = ScriptedDevices::new(PcmFormat::wire(16_000));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut pipeline = AudioPipeline::new(devices.clone(), 16_000, tx);

    for tag in 1..=4u8 {
        pipeline.enqueue_playback(AudioChunk::wire(vec![tag, 0], 16_000));
    }
    assert_eq!(devices.rendered().len(), 1);
    assert_eq!(pipeline.queued(), 3);

    for _ in 0..4 {
        assert!(devices.complete_render());
        let done = rx.try_recv().unwrap();
        pipeline.on_render_complete(done);
    }

    let order: Vec<u8> = devices.rendered().iter().map(|c| c.data[0]).collect();
    assert_eq!(order, vec![1, 2, 3, 4]);
    assert!(!pipeline.is_playing());
}

#[test]
fn test_pipeline_skips_empty_chunks() {
    let devices = ScriptedDevices::new(PcmFormat::wire(16_000));
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut pipeline = AudioPipeline::new(devices.clone(), 16_000, tx);

    pipeline.enqueue_playback(AudioChunk::wire(Vec::new(), 16_000));
    assert!(devices.rendered().is_empty());
    assert!(!pipeline.is_playing());
}

#[test]
fn test_pipeline_start_capture_is_idempotent() {
    let devices = ScriptedDevices::new(PcmFormat::wire(16_000));
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut pipeline = AudioPipeline::new(devices.clone(), 16_000, tx);

    let (chunks_tx, mut chunks) = mpsc::unbounded_channel();
    let first = chunks_tx.clone();
    pipeline
        .start_capture(move |event| {
            let _ = first.send(event);
        })
        .unwrap();
    pipeline
        .start_capture(move |event| {
            let _ = chunks_tx.send(event);
        })
        .unwrap();

    assert_eq!(devices.capture_opens(), 1);
    assert!(devices.push_frames(vec![1, 0, 2, 0]));

    let Ok(CaptureEvent::Chunk(chunk)) = chunks.try_recv() else {
        panic!("expected a captured chunk");
    };
    assert_eq!(chunk, AudioChunk::wire(vec![1, 0, 2, 0], 16_000));
    assert!(chunks.try_recv().is_err());
}

#[test]
fn test_pipeline_converts_native_capture() {
    let devices = ScriptedDevices::new(PcmFormat {
        sample_rate: 32_000,
        channels: 2,
        encoding: SampleEncoding::I16,
    });
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut pipeline = AudioPipeline::new(devices.clone(), 16_000, tx);

    let (chunks_tx, mut chunks) = mpsc::unbounded_channel();
    pipeline
        .start_capture(move |event| {
            let _ = chunks_tx.send(event);
        })
        .unwrap();

    // Four stereo frames at 32 kHz become two mono samples at 16 kHz
    let frames = convert::samples_to_bytes(&[100, 300, 50, 50, -100, -300, 8, 8]);
    devices.push_frames(frames);

    let Ok(CaptureEvent::Chunk(chunk)) = chunks.try_recv() else {
        panic!("expected a captured chunk");
    };
    assert_eq!(convert::bytes_to_samples(&chunk.data), vec![200, -200]);
}

#[test]
fn test_pipeline_stop_capture_silences_callbacks() {
    let devices = ScriptedDevices::new(PcmFormat::wire(16_000));
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut pipeline = AudioPipeline::new(devices.clone(), 16_000, tx);

    let (chunks_tx, mut chunks) = mpsc::unbounded_channel();
    pipeline
        .start_capture(move |event| {
            let _ = chunks_tx.send(event);
        })
        .unwrap();
    pipeline.stop_capture();
    pipeline.stop_capture();

    assert!(!pipeline.is_capturing());
    assert!(!devices.push_frames(vec![1, 0]));
    assert!(chunks.try_recv().is_err());
}

#[test]
fn test_pipeline_capture_error_surfaces_as_fault() {
    let devices = ScriptedDevices::new(PcmFormat::wire(16_000));
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut pipeline = AudioPipeline::new(devices.clone(), 16_000, tx);

    let (chunks_tx, mut chunks) = mpsc::unbounded_channel();
    pipeline
        .start_capture(move |event| {
            let _ = chunks_tx.send(event);
        })
        .unwrap();

    devices.fail_capture_stream("buffer overrun");
    devices.push_frames(vec![1, 0]);

    assert!(matches!(chunks.try_recv(), Ok(CaptureEvent::Fault(m)) if m == "buffer overrun"));
    assert!(chunks.try_recv().is_err());
}

#[test]
fn test_pipeline_cleanup_is_repeatable() {
    let devices = ScriptedDevices::new(PcmFormat::wire(16_000));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut pipeline = AudioPipeline::new(devices.clone(), 16_000, tx);

    pipeline.start_capture(|_| {}).unwrap();
    pipeline.enqueue_playback(AudioChunk::wire(vec![1, 0], 16_000));
    pipeline.enqueue_playback(AudioChunk::wire(vec![2, 0], 16_000));

    pipeline.cleanup();
    pipeline.cleanup();

    assert!(!pipeline.is_capturing());
    assert!(!pipeline.is_playing());
    assert!(!devices.is_capturing());
    assert_eq!(devices.script.lock().unwrap().cancels, 1);
    assert!(rx.try_recv().is_err());

    // The pipeline is usable again afterwards
    pipeline.enqueue_playback(AudioChunk::wire(vec![3, 0], 16_000));
    assert_eq!(devices.rendered().len(), 2);
}
