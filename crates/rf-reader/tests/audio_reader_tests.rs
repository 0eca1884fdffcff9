//! AudioReader Integration Tests
//!
//! Tests for:
//! - Sample-exact forward reads across task boundaries
//! - Backward reads returning the reversed forward sequence
//! - End of stream handling in both directions
//! - Silence for undecodable packets
//! - Output format conversion

use std::sync::Arc;

use rf_core::{AudioFormat, SampleFormat};
use rf_reader::synthetic::{SyntheticAudioConfig, SyntheticAudioSource, synthetic_sample};
use rf_reader::{AudioReader, ReaderConfig};

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

const RATE: u32 = 48_000;

fn start_reader(config: SyntheticAudioConfig, output: AudioFormat) -> AudioReader {
    let _ = env_logger::builder().is_test(true).try_init();
    let reader = AudioReader::new(ReaderConfig::default()).unwrap();
    reader.open(Arc::new(SyntheticAudioSource::new(config))).unwrap();
    reader.configure(output).unwrap();
    reader.start().unwrap();
    reader
}

fn stereo_f32() -> AudioFormat {
    AudioFormat::new(2, RATE, SampleFormat::F32)
}

/// Read `frames` stereo f32 frames, blocking until available
fn read_frames(reader: &AudioReader, frames: usize) -> (Vec<[f32; 2]>, bool) {
    let mut buf = vec![0u8; frames * 8];
    let outcome = reader.read_audio_samples(&mut buf, true).unwrap();
    let samples = buf[..outcome.bytes]
        .chunks_exact(8)
        .map(|f| {
            [
                SampleFormat::F32.read_f32(&f[0..4]),
                SampleFormat::F32.read_f32(&f[4..8]),
            ]
        })
        .collect();
    (samples, outcome.eof)
}

fn expected(frame: i64) -> [f32; 2] {
    [synthetic_sample(frame, 0), synthetic_sample(frame, 1)]
}

// ═══════════════════════════════════════════════════════════════════════════════
// FORWARD
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_forward_read_is_sample_exact() {
    let reader = start_reader(SyntheticAudioConfig::default(), stereo_f32());
    let (samples, eof) = read_frames(&reader, 4800);
    assert!(!eof);
    assert_eq!(samples.len(), 4800);
    for (i, frame) in samples.iter().enumerate() {
        assert_eq!(*frame, expected(i as i64), "mismatch at frame {}", i);
    }
    assert_eq!(reader.cursor(), 4800);
    assert_eq!(reader.read_pos(), 100);
}

#[test]
fn test_read_across_task_boundary() {
    let reader = start_reader(SyntheticAudioConfig::default(), stereo_f32());
    // one-second tasks; 1024-frame packets straddle the 48000 boundary
    reader.seek_to_sample(47_000).unwrap();
    let (samples, _) = read_frames(&reader, 2_000);
    assert_eq!(samples.len(), 2_000);
    for (i, frame) in samples.iter().enumerate() {
        assert_eq!(*frame, expected(47_000 + i as i64), "mismatch at frame {}", 47_000 + i);
    }
}

#[test]
fn test_long_read_pulls_window_along() {
    let reader = start_reader(SyntheticAudioConfig::default(), stereo_f32());
    // longer than the whole cache window
    let (samples, _) = read_frames(&reader, 3 * RATE as usize);
    assert_eq!(samples.len(), 3 * RATE as usize);
    assert_eq!(samples[140_000], expected(140_000));
}

#[test]
fn test_forward_eof() {
    let reader = start_reader(SyntheticAudioConfig::default(), stereo_f32());
    let total = reader.total_samples().unwrap();
    assert_eq!(total, 240_000);

    reader.seek_to_sample(total - 100).unwrap();
    let (samples, eof) = read_frames(&reader, 1_000);
    assert_eq!(samples.len(), 100);
    assert!(eof);
    assert_eq!(samples[99], expected(total - 1));

    let (samples, eof) = read_frames(&reader, 1_000);
    assert!(samples.is_empty());
    assert!(eof);
}

// ═══════════════════════════════════════════════════════════════════════════════
// BACKWARD
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_backward_read_reverses_forward_span() {
    let reader = start_reader(SyntheticAudioConfig::default(), stereo_f32());
    reader.seek_to(2_000, false).unwrap();
    let (forward, _) = read_frames(&reader, 3_000);
    assert_eq!(reader.cursor(), 99_000);

    reader.set_direction(false);
    let (backward, _) = read_frames(&reader, 3_000);
    assert_eq!(reader.cursor(), 96_000);

    let mut reversed = forward.clone();
    reversed.reverse();
    assert_eq!(backward, reversed);
}

#[test]
fn test_backward_read_across_task_boundary() {
    let reader = start_reader(SyntheticAudioConfig::default(), stereo_f32());
    reader.seek_to_sample(49_000).unwrap();
    reader.set_direction(false);
    let (samples, _) = read_frames(&reader, 2_000);
    assert_eq!(samples.len(), 2_000);
    for (i, frame) in samples.iter().enumerate() {
        assert_eq!(*frame, expected(48_999 - i as i64));
    }
}

#[test]
fn test_backward_stops_at_start() {
    let reader = start_reader(SyntheticAudioConfig::default(), stereo_f32());
    reader.seek_to_sample(300).unwrap();
    reader.set_direction(false);

    let (samples, eof) = read_frames(&reader, 1_000);
    assert_eq!(samples.len(), 300);
    assert!(eof);
    assert_eq!(samples[0], expected(299));
    assert_eq!(samples[299], expected(0));

    let (samples, eof) = read_frames(&reader, 10);
    assert!(samples.is_empty());
    assert!(eof);
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS AND CONVERSION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_corrupt_packet_reads_as_silence() {
    let config = SyntheticAudioConfig {
        corrupt_packets: vec![3],
        ..Default::default()
    };
    let reader = start_reader(config, stereo_f32());
    let (samples, _) = read_frames(&reader, 5_000);
    assert_eq!(samples[3_071], expected(3_071));
    assert!(samples[3_072..4_096].iter().all(|f| *f == [0.0, 0.0]));
    assert_eq!(samples[4_096], expected(4_096));
}

#[test]
fn test_converted_output_format() {
    let output = AudioFormat::new(1, 24_000, SampleFormat::S16);
    let reader = start_reader(SyntheticAudioConfig::default(), output);
    assert_eq!(reader.total_samples(), Some(120_000));

    let mut buf = vec![0u8; 2_400 * 2];
    let outcome = reader.read_audio_samples(&mut buf, true).unwrap();
    assert_eq!(outcome.frames, 2_400);
    assert_eq!(outcome.bytes, 4_800);
    assert_eq!(reader.read_pos(), 100);
}

#[test]
fn test_non_blocking_read_never_overfills() {
    let reader = start_reader(SyntheticAudioConfig::default(), stereo_f32());
    let mut buf = vec![0u8; 1_000 * 8];
    let outcome = reader.read_audio_samples(&mut buf, false).unwrap();
    assert!(outcome.frames <= 1_000);
    assert_eq!(outcome.bytes, outcome.frames * 8);
    assert_eq!(reader.cursor(), outcome.frames as i64);
}

#[test]
fn test_stats_and_window() {
    let reader = start_reader(SyntheticAudioConfig::default(), stereo_f32());
    read_frames(&reader, 480);
    let window = reader.cache_window().unwrap();
    assert!(window.contains(reader.read_pos()));
    assert!(reader.stats().ready_tasks >= 1);
    assert!(reader.last_error().is_none());
}
