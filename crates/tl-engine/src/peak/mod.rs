//! Peak Cache - Multi-Resolution Waveform Envelopes
//!
//! Provides per-source, per-channel waveform data:
//! - Coarse zoom levels served from a memory-mapped `.peak` file
//! - Fine zoom levels decoded from the source on demand
//! - A normalization table for fast max-amplitude queries
//! - Builds run on a single background worker and can be interrupted
//!
//! Nothing here blocks the caller on a build except [`Peak::close`], which
//! waits at most one read chunk for an in-flight build to notice the
//! interrupt.

mod builder;
mod format;
mod scheduler;

pub use builder::{build_peak_file, decimate, norm_path_for, BuildOutcome, BUILD_CHUNK_FRAMES, MIN_BUILD_CHUNK_FRAMES};
pub use format::{
    zoom_step, PeakFileMmap, PeakHeader, PeakPair, HEADER_SIZE, MAX_DB_VALUE, MAX_ZOOM_USING_SOURCEFILE,
    NORMALIZE_CHUNK_SIZE, PEAK_MAGIC, PEAK_VERSION, SAVED_LEVELS, SAVING_ZOOM_FACTOR, ZOOM_LEVELS,
};
pub use scheduler::{PeakEvent, PeakQueue, PeakScheduler};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, RwLock};
use tl_core::{TlError, TlResult};
use tl_file::AudioReader;

use crate::ids::SourceId;
use crate::source::AudioSource;

/// Frames decoded per read when scanning the source directly
const SCAN_BLOCK_FRAMES: usize = 8192;

// ═══════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeakState {
    Unbuilt = 0,
    ReadingHeader = 1,
    Building = 2,
    Available = 3,
    /// Cannot be built; every request fails cheaply
    PermanentFailure = 4,
    Closed = 5,
}

impl From<u8> for PeakState {
    fn from(v: u8) -> Self {
        match v {
            1 => PeakState::ReadingHeader,
            2 => PeakState::Building,
            3 => PeakState::Available,
            4 => PeakState::PermanentFailure,
            5 => PeakState::Closed,
            _ => PeakState::Unbuilt,
        }
    }
}

/// Waveform data for a pixel range
#[derive(Debug, Clone, PartialEq)]
pub enum PeakView {
    /// One quantized pair per pixel
    Macro(Vec<PeakPair>),
    /// One signed value per pixel, scaled by [`MAX_DB_VALUE`]
    Micro(Vec<i16>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeakResult {
    Ready(PeakView),
    /// No data yet; a build has been queued
    Pending,
    Failed,
}

// ═══════════════════════════════════════════════════════════════════════════
// PEAK
// ═══════════════════════════════════════════════════════════════════════════

/// Envelope cache for one channel of one source
pub struct Peak {
    source: Arc<AudioSource>,
    channel: usize,
    path: PathBuf,
    state: AtomicU8,
    file: RwLock<Option<PeakFileMmap>>,
    /// Decoder for micro views and partial windows
    reader: Mutex<Option<Box<dyn AudioReader>>>,
    interrupt: AtomicBool,
    building: Mutex<bool>,
    build_done: Condvar,
    queue: PeakQueue,
}

impl Peak {
    pub fn new(source: Arc<AudioSource>, channel: usize, peak_dir: &Path, queue: PeakQueue) -> Arc<Self> {
        let path = Self::path_for(peak_dir, &source, channel);
        Arc::new(Self {
            source,
            channel,
            path,
            state: AtomicU8::new(PeakState::Unbuilt as u8),
            file: RwLock::new(None),
            reader: Mutex::new(None),
            interrupt: AtomicBool::new(false),
            building: Mutex::new(false),
            build_done: Condvar::new(),
            queue,
        })
    }

    /// `<name>-<key>-ch<N>.peak` for multichannel sources, `<name>-<key>.peak`
    /// otherwise, where `<key>` is [`AudioSource::cache_key`]
    pub fn path_for(peak_dir: &Path, source: &AudioSource, channel: usize) -> PathBuf {
        let key = source.cache_key();
        if source.channels() > 1 {
            peak_dir.join(format!("{}-{}-ch{}.peak", source.name(), key, channel))
        } else {
            peak_dir.join(format!("{}-{}.peak", source.name(), key))
        }
    }

    pub fn key(&self) -> (SourceId, usize) {
        (self.source.id(), self.channel)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn source(&self) -> &Arc<AudioSource> {
        &self.source
    }

    pub fn state(&self) -> PeakState {
        PeakState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PeakState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Map an existing file. False when it is missing, stale, or invalid.
    fn read_header(&self) -> bool {
        if !self.path.exists() {
            return false;
        }

        let peak_modified = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if let (Some(source_time), Some(peak_time)) = (self.source.modified(), peak_modified) {
            if source_time > peak_time {
                log::info!("[Peak] {} is older than its source, rebuilding", self.path.display());
                return false;
            }
        }

        match PeakFileMmap::open(&self.path) {
            Ok(file) => {
                *self.file.write() = Some(file);
                self.set_state(PeakState::Available);
                true
            }
            Err(e) => {
                log::warn!("[Peak] {} unusable ({}), rebuilding", self.path.display(), e);
                false
            }
        }
    }

    /// Make the on-disk data usable if possible, queueing a build otherwise
    fn ensure_available(self: &Arc<Self>) -> PeakState {
        match self.state() {
            PeakState::Unbuilt => {}
            other => return other,
        }
        // queued: the worker owns the state until the build is done
        if self.queue.is_pending(self.source.id(), self.channel) {
            return PeakState::Unbuilt;
        }

        self.set_state(PeakState::ReadingHeader);
        if self.read_header() {
            return PeakState::Available;
        }
        self.set_state(PeakState::Unbuilt);
        self.queue_build();
        PeakState::Unbuilt
    }

    /// Queue a background build unless one is queued, running, or done
    pub fn queue_build(self: &Arc<Self>) -> bool {
        if self.state() != PeakState::Unbuilt {
            return false;
        }
        self.queue.enqueue(self.clone())
    }

    /// Waveform for `pixelcount` pixels starting at source frame `start_pos`
    /// at `zoom_level`. Never blocks on a build.
    pub fn calculate_peaks(self: &Arc<Self>, zoom_level: usize, start_pos: u64, pixelcount: usize) -> PeakResult {
        match self.ensure_available() {
            PeakState::Available => {}
            PeakState::PermanentFailure | PeakState::Closed => return PeakResult::Failed,
            _ => return PeakResult::Pending,
        }

        let zoom_level = zoom_level.min(ZOOM_LEVELS - 1);
        if zoom_level > MAX_ZOOM_USING_SOURCEFILE {
            let file = self.file.read();
            let Some(file) = file.as_ref() else {
                return PeakResult::Pending;
            };
            let level = zoom_level - SAVING_ZOOM_FACTOR;
            let start = (start_pos / zoom_step(zoom_level)) as usize;
            return PeakResult::Ready(PeakView::Macro(file.read_pairs(level, start, pixelcount)));
        }

        match self.read_micro(zoom_level, start_pos, pixelcount) {
            Ok(values) => PeakResult::Ready(PeakView::Micro(values)),
            Err(e) => {
                log::warn!("[Peak] micro view of {} failed: {}", self.source.name(), e);
                PeakResult::Failed
            }
        }
    }

    fn read_micro(&self, zoom_level: usize, start_pos: u64, pixelcount: usize) -> TlResult<Vec<i16>> {
        let step = zoom_step(zoom_level) as usize;
        let mut values = Vec::with_capacity(pixelcount);
        let mut pixel_max = f32::MIN;
        let mut pixel_min = f32::MAX;
        let mut in_pixel = 0;

        self.scan(start_pos, start_pos + (pixelcount * step) as u64, |sample| {
            pixel_max = pixel_max.max(sample);
            pixel_min = pixel_min.min(sample);
            in_pixel += 1;
            if in_pixel == step {
                values.push(micro_value(pixel_max, pixel_min));
                pixel_max = f32::MIN;
                pixel_min = f32::MAX;
                in_pixel = 0;
            }
        })?;
        if in_pixel > 0 {
            values.push(micro_value(pixel_max, pixel_min));
        }
        Ok(values)
    }

    /// Largest absolute sample value in source frames `[start, end)`
    pub fn get_max_amplitude(self: &Arc<Self>, start: u64, end: u64) -> TlResult<f32> {
        match self.ensure_available() {
            PeakState::Available => {}
            PeakState::PermanentFailure | PeakState::Closed => {
                return Err(TlError::PeakFormat(format!("no peak data for {}", self.source.name())));
            }
            _ => return Err(TlError::PeakUnavailable),
        }
        if start >= end {
            return Ok(0.0);
        }

        let chunk = NORMALIZE_CHUNK_SIZE;
        let first_full = start.div_ceil(chunk);
        let last_full = end / chunk;

        if first_full >= last_full {
            return self.scan_max_abs(start, end);
        }

        let mut max_amp = 0.0f32;
        if start % chunk != 0 {
            max_amp = max_amp.max(self.scan_max_abs(start, first_full * chunk)?);
        }

        let file = self.file.read();
        let file = file.as_ref().ok_or(TlError::PeakUnavailable)?;
        for index in first_full..last_full {
            match file.norm_value(index as usize) {
                Some(value) => max_amp = max_amp.max(value),
                None => {
                    max_amp = max_amp.max(self.scan_max_abs(index * chunk, (index + 1) * chunk)?);
                }
            }
        }
        drop(file);

        if end > last_full * chunk {
            max_amp = max_amp.max(self.scan_max_abs(last_full * chunk, end)?);
        }
        Ok(max_amp)
    }

    fn scan_max_abs(&self, start: u64, end: u64) -> TlResult<f32> {
        let mut max_amp = 0.0f32;
        self.scan(start, end, |s| max_amp = max_amp.max(s.abs()))?;
        Ok(max_amp)
    }

    /// Feed this channel's samples in `[start, end)` to `f`
    fn scan(&self, start: u64, end: u64, mut f: impl FnMut(f32)) -> TlResult<()> {
        let mut guard = self.reader.lock();
        if guard.is_none() {
            *guard = Some(self.source.open_reader()?);
        }
        let Some(reader) = guard.as_mut() else {
            return Ok(());
        };

        let end = end.min(reader.num_frames());
        if start >= end {
            return Ok(());
        }
        if !reader.seek(start) {
            return Err(TlError::Source(format!("cannot seek {} to {}", self.source.name(), start)));
        }

        let channels = reader.channels();
        let mut buffer = vec![0.0f32; SCAN_BLOCK_FRAMES * channels];
        let mut remaining = (end - start) as usize;
        while remaining > 0 {
            let want = remaining.min(SCAN_BLOCK_FRAMES);
            let got = reader.read(&mut buffer, want);
            if got == 0 {
                break;
            }
            for frame in buffer[..got * channels].chunks_exact(channels) {
                f(frame[self.channel]);
            }
            remaining -= got;
        }
        Ok(())
    }

    /// Run the build on the calling (worker) thread. Progress goes to
    /// `events`; the completion event is returned.
    pub(crate) fn build(&self, events: &Sender<PeakEvent>) -> Option<PeakEvent> {
        {
            let mut building = self.building.lock();
            if self.interrupt.load(Ordering::Acquire) || self.state() != PeakState::Unbuilt {
                return None;
            }
            *building = true;
        }
        self.set_state(PeakState::Building);
        *self.file.write() = None;

        let (source, channel) = self.key();
        log::info!("[Peak] building {}", self.path.display());

        let result = self.source.open_reader().and_then(|mut reader| {
            build_peak_file(reader.as_mut(), channel, &self.path, &self.interrupt, |percent| {
                let _ = events.send(PeakEvent::Progress { source, channel, percent });
            })
        });

        let done = match result {
            Ok(BuildOutcome::Finished) => {
                if self.read_header() {
                    Some(PeakEvent::Finished { source, channel })
                } else {
                    self.set_state(PeakState::PermanentFailure);
                    Some(PeakEvent::Failed {
                        source,
                        channel,
                        error: "peak file unreadable after build".to_string(),
                    })
                }
            }
            Ok(BuildOutcome::Interrupted) => {
                self.set_state(PeakState::Unbuilt);
                None
            }
            Err(e) => {
                log::error!("[Peak] build of {} failed: {}", self.path.display(), e);
                self.set_state(PeakState::PermanentFailure);
                Some(PeakEvent::Failed {
                    source,
                    channel,
                    error: e.to_string(),
                })
            }
        };

        let mut building = self.building.lock();
        *building = false;
        self.build_done.notify_all();
        done
    }

    /// Stop using this peak. Interrupts and waits for an in-flight build.
    pub fn close(&self) {
        self.interrupt.store(true, Ordering::Release);
        let mut building = self.building.lock();
        while *building {
            self.build_done.wait(&mut building);
        }
        self.set_state(PeakState::Closed);
        *self.file.write() = None;
        *self.reader.lock() = None;
    }
}

#[inline]
fn micro_value(max: f32, min: f32) -> i16 {
    let value = if max.abs() > min.abs() { max } else { min };
    (value * MAX_DB_VALUE) as i16
}

// ═══════════════════════════════════════════════════════════════════════════
// PEAK MANAGER
// ═══════════════════════════════════════════════════════════════════════════

/// Owns every [`Peak`] and the build worker
pub struct PeakManager {
    dir: PathBuf,
    peaks: RwLock<HashMap<SourceId, Vec<Arc<Peak>>>>,
    scheduler: PeakScheduler,
}

impl PeakManager {
    pub fn new<P: AsRef<Path>>(dir: P) -> TlResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            peaks: RwLock::new(HashMap::new()),
            scheduler: PeakScheduler::new()?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Peaks for every channel of `source`, created on first use
    pub fn peaks_for(&self, source: &Arc<AudioSource>) -> Vec<Arc<Peak>> {
        if let Some(peaks) = self.peaks.read().get(&source.id()) {
            return peaks.clone();
        }
        let mut map = self.peaks.write();
        map.entry(source.id())
            .or_insert_with(|| {
                (0..source.channels())
                    .map(|ch| Peak::new(source.clone(), ch, &self.dir, self.scheduler.queue()))
                    .collect()
            })
            .clone()
    }

    pub fn get(&self, source: SourceId, channel: usize) -> Option<Arc<Peak>> {
        self.peaks.read().get(&source).and_then(|p| p.get(channel).cloned())
    }

    pub fn calculate_peaks(
        &self,
        source: &Arc<AudioSource>,
        channel: usize,
        zoom_level: usize,
        start_pos: u64,
        pixelcount: usize,
    ) -> PeakResult {
        match self.peaks_for(source).get(channel) {
            Some(peak) => peak.calculate_peaks(zoom_level, start_pos, pixelcount),
            None => PeakResult::Failed,
        }
    }

    /// Make sure all channels are built or being built
    pub fn request_build(&self, source: &Arc<AudioSource>) {
        for peak in self.peaks_for(source) {
            peak.ensure_available();
        }
    }

    /// Maximum over all channels
    pub fn get_max_amplitude(&self, source: &Arc<AudioSource>, start: u64, end: u64) -> TlResult<f32> {
        let peaks = self.peaks_for(source);
        if peaks.is_empty() {
            return Ok(0.0);
        }
        let mut max_amp = 0.0f32;
        for peak in peaks {
            max_amp = max_amp.max(peak.get_max_amplitude(start, end)?);
        }
        Ok(max_amp)
    }

    /// Close and forget the peaks of a removed source
    pub fn remove_source(&self, source: SourceId) {
        let removed = self.peaks.write().remove(&source);
        if let Some(peaks) = removed {
            for peak in peaks {
                peak.close();
            }
        }
    }

    pub fn is_pending(&self, source: SourceId, channel: usize) -> bool {
        self.scheduler.queue().is_pending(source, channel)
    }

    pub fn poll_events(&self) -> Vec<PeakEvent> {
        self.scheduler.poll_events()
    }

    pub fn wait_event(&self, timeout: Duration) -> Option<PeakEvent> {
        self.scheduler.wait_event(timeout)
    }
}

impl Drop for PeakManager {
    fn drop(&mut self) {
        for peaks in self.peaks.write().drain().map(|(_, p)| p) {
            for peak in peaks {
                peak.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_file_naming() {
        let dir = Path::new("/tmp/peaks");
        let mono = AudioSource::from_memory("kick", vec![0.0; 10], 1, 48000);
        let stereo = AudioSource::from_memory("pad", vec![0.0; 10], 2, 48000);
        let mono_key = mono.cache_key();
        let stereo_key = stereo.cache_key();
        assert_eq!(mono_key.len(), 16);
        assert_eq!(Peak::path_for(dir, &mono, 0), dir.join(format!("kick-{}.peak", mono_key)));
        assert_eq!(Peak::path_for(dir, &stereo, 1), dir.join(format!("pad-{}-ch1.peak", stereo_key)));
    }

    #[test]
    fn test_same_name_sources_get_distinct_files() {
        let dir = Path::new("/tmp/peaks");
        let quiet = AudioSource::from_memory("take", vec![0.1; 10], 1, 48000);
        let loud = AudioSource::from_memory("take", vec![0.9; 10], 1, 48000);
        let again = AudioSource::from_memory("take", vec![0.1; 10], 1, 48000);
        assert_ne!(Peak::path_for(dir, &quiet, 0), Peak::path_for(dir, &loud, 0));
        assert_eq!(Peak::path_for(dir, &quiet, 0), Peak::path_for(dir, &again, 0));
    }

    #[test]
    fn test_micro_value_picks_larger_magnitude() {
        assert_eq!(micro_value(0.5, -0.25), 60);
        assert_eq!(micro_value(0.25, -0.5), -60);
    }
}
