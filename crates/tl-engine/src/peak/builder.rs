//! Peak file construction
//!
//! Streams one channel of a source in large chunks, collecting a min/max
//! pair per 64-frame window and a max-abs value per normalization chunk.
//! The coarser levels are derived from the finest by max-pooling.

use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tl_core::{TlError, TlResult};
use tl_file::AudioReader;

use super::format::{
    zoom_step, PeakHeader, PeakPair, HEADER_SIZE, NORMALIZE_CHUNK_SIZE, SAVED_LEVELS, SAVING_ZOOM_FACTOR,
};

/// Frames per read while building
pub const BUILD_CHUNK_FRAMES: usize = 65_536;

/// Read size for sources shorter than [`BUILD_CHUNK_FRAMES`]
pub const MIN_BUILD_CHUNK_FRAMES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Finished,
    Interrupted,
}

/// Side file collecting normalization values during the build
pub fn norm_path_for(peak_path: &Path) -> PathBuf {
    peak_path.with_extension("norm")
}

fn temp_path_for(peak_path: &Path) -> PathBuf {
    peak_path.with_extension("peak.tmp")
}

/// Build `path` for `channel` of `reader`. `interrupt` is checked once per
/// chunk; `on_progress` receives the percentage whenever it changes.
pub fn build_peak_file(
    reader: &mut dyn AudioReader,
    channel: usize,
    path: &Path,
    interrupt: &AtomicBool,
    on_progress: impl FnMut(u32),
) -> TlResult<BuildOutcome> {
    let result = build_inner(reader, channel, path, interrupt, on_progress);
    if !matches!(result, Ok(BuildOutcome::Finished)) {
        let _ = fs::remove_file(norm_path_for(path));
        let _ = fs::remove_file(temp_path_for(path));
    }
    result
}

fn build_inner(
    reader: &mut dyn AudioReader,
    channel: usize,
    path: &Path,
    interrupt: &AtomicBool,
    mut on_progress: impl FnMut(u32),
) -> TlResult<BuildOutcome> {
    let total = reader.num_frames();
    if total < MIN_BUILD_CHUNK_FRAMES as u64 {
        return Err(TlError::Source(format!(
            "source too short for peak building ({} frames)",
            total
        )));
    }
    let channels = reader.channels();
    if channel >= channels {
        return Err(TlError::InvalidParam(format!(
            "channel {} out of range ({} channels)",
            channel, channels
        )));
    }
    if !reader.seek(0) {
        return Err(TlError::Source("cannot seek to start of source".to_string()));
    }

    let chunk = if total < BUILD_CHUNK_FRAMES as u64 {
        MIN_BUILD_CHUNK_FRAMES
    } else {
        BUILD_CHUNK_FRAMES
    };
    let window = zoom_step(SAVING_ZOOM_FACTOR) as usize;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let norm_path = norm_path_for(path);
    let mut norm_file = BufWriter::new(File::create(&norm_path)?);

    let mut buffer = vec![0.0f32; chunk * channels];
    let mut level0: Vec<PeakPair> = Vec::with_capacity((total as usize).div_ceil(window));
    let (mut upper, mut lower, mut in_window) = (0.0f32, 0.0f32, 0usize);
    let (mut norm_value, mut norm_frames) = (0.0f32, 0u64);
    let mut processed = 0u64;
    let mut last_percent = None;

    loop {
        if interrupt.load(Ordering::Acquire) {
            log::debug!("[PeakBuilder] interrupted: {}", path.display());
            return Ok(BuildOutcome::Interrupted);
        }

        let got = reader.read(&mut buffer, chunk);
        if got == 0 {
            break;
        }

        for frame in buffer[..got * channels].chunks_exact(channels) {
            let sample = frame[channel];

            upper = upper.max(sample);
            lower = lower.min(sample);
            in_window += 1;
            if in_window == window {
                level0.push(PeakPair::from_extremes(upper, lower));
                upper = 0.0;
                lower = 0.0;
                in_window = 0;
            }

            norm_value = norm_value.max(sample.abs());
            norm_frames += 1;
            if norm_frames == NORMALIZE_CHUNK_SIZE {
                norm_file.write_all(&norm_value.to_le_bytes())?;
                norm_value = 0.0;
                norm_frames = 0;
            }
        }

        processed += got as u64;
        let percent = (processed.min(total) * 100 / total) as u32;
        if last_percent != Some(percent) {
            on_progress(percent);
            last_percent = Some(percent);
        }
    }

    if in_window > 0 {
        level0.push(PeakPair::from_extremes(upper, lower));
    }
    if level0.is_empty() {
        return Err(TlError::Decode("no audio could be read".to_string()));
    }
    norm_file.flush()?;
    drop(norm_file);

    finish(path, level0, &norm_path)?;
    Ok(BuildOutcome::Finished)
}

/// Max-pool adjacent pairs; a trailing odd pair is kept as is
pub fn decimate(pairs: &[PeakPair]) -> Vec<PeakPair> {
    pairs
        .chunks(2)
        .map(|c| c.iter().fold(PeakPair::default(), |acc, p| acc.merge(*p)))
        .collect()
}

fn finish(path: &Path, level0: Vec<PeakPair>, norm_path: &Path) -> TlResult<()> {
    let mut levels = Vec::with_capacity(SAVED_LEVELS);
    levels.push(level0);
    for i in 1..SAVED_LEVELS {
        let next = decimate(&levels[i - 1]);
        levels.push(next);
    }

    let temp_path = temp_path_for(path);
    let mut out = BufWriter::new(File::create(&temp_path)?);
    let mut header = PeakHeader::new();

    // placeholder, rewritten once offsets are known
    out.write_all(&header.to_bytes())?;

    let mut offset = HEADER_SIZE as u64;
    for (i, level) in levels.iter().enumerate() {
        header.level_offsets[i] = offset as u32;
        header.level_sizes[i] = (level.len() * 2) as u32;
        let bytes: Vec<u8> = level.iter().flat_map(|p| [p.upper, p.lower]).collect();
        out.write_all(&bytes)?;
        offset += bytes.len() as u64;
    }

    header.norm_offset = offset;
    let norm = fs::read(norm_path)?;
    out.write_all(&norm)?;
    fs::remove_file(norm_path)?;

    out.seek(SeekFrom::Start(0))?;
    out.write_all(&header.to_bytes())?;
    out.flush()?;
    drop(out);

    fs::rename(&temp_path, path)?;
    log::debug!(
        "[PeakBuilder] wrote {} ({} pairs at level 0, {} norm values)",
        path.display(),
        levels[0].len(),
        norm.len() / 4
    );
    Ok(())
}
