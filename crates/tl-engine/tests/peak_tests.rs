//! Peak Cache Integration Tests
//!
//! Builds real .peak files from WAV fixtures on the background worker and
//! checks every stored zoom level against a direct scan of the source.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use approx::assert_relative_eq;
use serial_test::serial;
use tl_core::SampleFormat;
use tl_engine::peak::{
    zoom_step, PeakEvent, PeakPair, HEADER_SIZE, MAX_ZOOM_USING_SOURCEFILE, PEAK_VERSION, ZOOM_LEVELS,
};
use tl_engine::{AudioSource, PeakManager, PeakResult, PeakState, PeakView};
use tl_file::WavFileWriter;

const SAMPLE_RATE: u32 = 44100;
const FRAMES: usize = 150_000;

/// Stereo fixture: a slow sine on the left, a decaying saw on the right
fn write_fixture(path: &Path) -> Vec<f32> {
    let mut samples = Vec::with_capacity(FRAMES * 2);
    for i in 0..FRAMES {
        let t = i as f32 / SAMPLE_RATE as f32;
        let left = 0.8 * (2.0 * std::f32::consts::PI * 3.0 * t).sin();
        let right = (1.0 - i as f32 / FRAMES as f32) * (((i % 500) as f32 / 250.0) - 1.0);
        samples.push(left);
        samples.push(right);
    }
    let mut writer = WavFileWriter::create(path, 2, SAMPLE_RATE, SampleFormat::Float32).unwrap();
    writer.write(&samples, FRAMES).unwrap();
    writer.finalize().unwrap();
    samples
}

fn build_and_wait(manager: &PeakManager, source: &Arc<AudioSource>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        manager.request_build(source);
        if manager
            .peaks_for(source)
            .iter()
            .all(|p| p.state() == PeakState::Available)
        {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for peak build");
        if let Some(PeakEvent::Failed { error, .. }) = manager.wait_event(Duration::from_millis(20)) {
            panic!("peak build failed: {}", error);
        }
    }
}

/// Quantized envelope of `[i*step, (i+1)*step)` computed straight from the
/// interleaved samples
fn direct_pairs(samples: &[f32], channel: usize, step: usize) -> Vec<PeakPair> {
    samples
        .chunks(step * 2)
        .map(|window| {
            let (mut max, mut min) = (0.0f32, 0.0f32);
            for frame in window.chunks_exact(2) {
                max = max.max(frame[channel]);
                min = min.min(frame[channel]);
            }
            PeakPair::from_extremes(max, min)
        })
        .collect()
}

#[test]
#[serial]
fn test_every_stored_level_matches_direct_scan() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("fixture.wav");
    let samples = write_fixture(&wav);

    let manager = PeakManager::new(dir.path().join("peaks")).unwrap();
    let source = Arc::new(AudioSource::from_file(&wav).unwrap());
    build_and_wait(&manager, &source);

    for channel in 0..2 {
        for level in (MAX_ZOOM_USING_SOURCEFILE + 1)..ZOOM_LEVELS {
            let step = zoom_step(level) as usize;
            let expected = direct_pairs(&samples, channel, step);
            let result = manager.calculate_peaks(&source, channel, level, 0, expected.len() + 5);
            let PeakResult::Ready(PeakView::Macro(pairs)) = result else {
                panic!("level {} not ready: {:?}", level, result);
            };
            assert_eq!(pairs, expected, "channel {} level {}", channel, level);
        }
    }
}

#[test]
#[serial]
fn test_same_named_files_keep_separate_peaks() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("a")).unwrap();
    std::fs::create_dir_all(dir.path().join("b")).unwrap();
    let wav_a = dir.path().join("a").join("take.wav");
    let wav_b = dir.path().join("b").join("take.wav");
    let samples_a = write_fixture(&wav_a);
    let samples_b: Vec<f32> = samples_a.iter().map(|s| s * 0.25).collect();
    let mut writer = WavFileWriter::create(&wav_b, 2, SAMPLE_RATE, SampleFormat::Float32).unwrap();
    writer.write(&samples_b, FRAMES).unwrap();
    writer.finalize().unwrap();

    let manager = PeakManager::new(dir.path().join("peaks")).unwrap();
    let source_a = Arc::new(AudioSource::from_file(&wav_a).unwrap());
    let source_b = Arc::new(AudioSource::from_file(&wav_b).unwrap());
    build_and_wait(&manager, &source_a);
    build_and_wait(&manager, &source_b);

    let path_a = manager.get(source_a.id(), 0).unwrap().path().to_path_buf();
    let path_b = manager.get(source_b.id(), 0).unwrap().path().to_path_buf();
    assert_ne!(path_a, path_b);

    let level = MAX_ZOOM_USING_SOURCEFILE + 1;
    let step = zoom_step(level) as usize;
    for (source, samples) in [(&source_a, &samples_a), (&source_b, &samples_b)] {
        let expected = direct_pairs(samples, 0, step);
        let PeakResult::Ready(PeakView::Macro(pairs)) = manager.calculate_peaks(source, 0, level, 0, expected.len())
        else {
            panic!("level {} not ready", level);
        };
        assert_eq!(pairs, expected);
    }
}

#[test]
#[serial]
fn test_micro_view_reads_source() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("micro.wav");
    let samples = write_fixture(&wav);

    let manager = PeakManager::new(dir.path().join("peaks")).unwrap();
    let source = Arc::new(AudioSource::from_file(&wav).unwrap());
    build_and_wait(&manager, &source);

    // level 0: one frame per pixel
    let PeakResult::Ready(PeakView::Micro(values)) = manager.calculate_peaks(&source, 1, 0, 1000, 16) else {
        panic!("micro view not ready");
    };
    assert_eq!(values.len(), 16);
    for (i, value) in values.iter().enumerate() {
        let sample = samples[(1000 + i) * 2 + 1];
        assert_eq!(*value, (sample * 120.0) as i16);
    }
}

#[test]
#[serial]
fn test_max_amplitude_is_stable_and_matches_scan() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("norm.wav");
    let samples = write_fixture(&wav);

    let manager = PeakManager::new(dir.path().join("peaks")).unwrap();
    let source = Arc::new(AudioSource::from_file(&wav).unwrap());
    build_and_wait(&manager, &source);

    let peak_path = manager.get(source.id(), 0).unwrap().path().to_path_buf();
    let modified: SystemTime = std::fs::metadata(&peak_path).unwrap().modified().unwrap();

    let (start, end) = (1_234u64, 75_432u64);
    let expected = samples[start as usize * 2..end as usize * 2]
        .iter()
        .fold(0.0f32, |acc, s| acc.max(s.abs()));

    let first = manager.get_max_amplitude(&source, start, end).unwrap();
    let second = manager.get_max_amplitude(&source, start, end).unwrap();
    assert_eq!(first, second);
    assert_relative_eq!(first, expected);

    assert_eq!(std::fs::metadata(&peak_path).unwrap().modified().unwrap(), modified);
    assert_eq!(manager.get_max_amplitude(&source, 500, 500).unwrap(), 0.0);
}

#[test]
#[serial]
fn test_version_mismatch_forces_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("versioned.wav");
    write_fixture(&wav);
    let peak_dir = dir.path().join("peaks");

    let peak_path = {
        let manager = PeakManager::new(&peak_dir).unwrap();
        let source = Arc::new(AudioSource::from_file(&wav).unwrap());
        build_and_wait(&manager, &source);
        manager.get(source.id(), 0).unwrap().path().to_path_buf()
    };

    let mut bytes = std::fs::read(&peak_path).unwrap();
    assert!(bytes.len() > HEADER_SIZE);
    bytes[7] = PEAK_VERSION[1] + 1;
    std::fs::write(&peak_path, &bytes).unwrap();

    let manager = PeakManager::new(&peak_dir).unwrap();
    let source = Arc::new(AudioSource::from_file(&wav).unwrap());
    build_and_wait(&manager, &source);

    let rebuilt = std::fs::read(&peak_path).unwrap();
    assert_eq!(&rebuilt[6..8], &PEAK_VERSION);
    assert!(matches!(
        manager.calculate_peaks(&source, 0, 10, 0, 4),
        PeakResult::Ready(PeakView::Macro(_))
    ));
}

#[test]
#[serial]
fn test_removed_source_peaks_are_closed() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("closing.wav");
    write_fixture(&wav);

    let manager = PeakManager::new(dir.path().join("peaks")).unwrap();
    let source = Arc::new(AudioSource::from_file(&wav).unwrap());
    manager.request_build(&source);
    let peak = manager.get(source.id(), 1).unwrap();

    manager.remove_source(source.id());
    assert_eq!(peak.state(), PeakState::Closed);
    assert!(manager.get(source.id(), 1).is_none());
}

#[test]
fn test_short_source_fails_permanently() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PeakManager::new(dir.path().join("peaks")).unwrap();
    let source = Arc::new(AudioSource::from_memory("tiny", vec![0.5; 10], 1, SAMPLE_RATE));
    manager.request_build(&source);

    let event = manager.wait_event(Duration::from_secs(10));
    assert!(matches!(event, Some(PeakEvent::Failed { .. })));
    assert_eq!(manager.calculate_peaks(&source, 0, 8, 0, 1), PeakResult::Failed);
}

#[test]
fn test_silence_source_has_no_peaks() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PeakManager::new(dir.path().join("peaks")).unwrap();
    let source = Arc::new(AudioSource::silence(48000, 48000));
    manager.request_build(&source);
    assert!(manager.peaks_for(&source).is_empty());
    assert_eq!(manager.get_max_amplitude(&source, 0, 48000).unwrap(), 0.0);
}
