//! Clips: a window onto an audio source placed on a track
//!
//! A clip maps `[track_start, track_start + length)` on the timeline to
//! `[source_start, source_start + length)` in its source. Each block it
//! computes its overlap with the transport window, pulls that many frames
//! from its read stream (or straight from the file when rendering offline),
//! applies fades and gain, and sums the result into the track bus.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tl_core::{fuzzy_eq, max_clip_gain, Decibels, SampleFormat, TimeRef, TlError, TlResult};
use tl_file::{AudioReader, ResampleReader};

use crate::bus::AudioBus;
use crate::fade::{FadeCurve, FadeDirection, GainEnvelope};
use crate::ids::{reserve_id, ClipId, SourceId, TrackId};
use crate::notify::{EngineEvent, EventQueue};
use crate::peak::PeakManager;
use crate::source::{AudioSource, SourceRegistry};
use crate::streaming::{source_frame_at, DiskIo, ReadStream, WriteStream};

/// Shortest clip an edge trim may leave, in source frames
pub const MIN_CLIP_FRAMES: i64 = 4;

// ═══════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipStatus {
    NotRecording,
    Recording,
    /// Capture stopped, the file is still being written out
    FinishingRecording,
}

/// Outcome of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipProcessResult {
    /// Nothing mixed this block
    NoAudio,
    /// Source not usable; clip skipped
    Invalid,
    /// Frames mixed into the bus
    Produced(usize),
}

/// Per-block processing parameters
pub struct ProcessContext<'a> {
    /// Transport position of the first frame
    pub location: TimeRef,
    pub nframes: usize,
    /// Output sample rate
    pub rate: u32,
    /// Read from ring buffers (true) or decode directly (offline render)
    pub realtime: bool,
    pub events: &'a EventQueue,
}

impl ProcessContext<'_> {
    #[inline]
    pub fn end(&self) -> TimeRef {
        self.location.add_frames(self.nframes as i64, self.rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NormalizeResult {
    NoOp,
    Changed(f32),
}

/// Persisted clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipState {
    pub id: ClipId,
    pub name: String,
    pub source: SourceId,
    pub track_start: TimeRef,
    pub source_start: TimeRef,
    pub length: TimeRef,
    pub gain: f32,
    pub muted: bool,
    pub locked: bool,
    pub take: bool,
    #[serde(default)]
    pub fade_in: Option<FadeCurve>,
    #[serde(default)]
    pub fade_out: Option<FadeCurve>,
    #[serde(default)]
    pub gain_envelope: GainEnvelope,
}

/// Decoder used for offline rendering
struct DirectReader {
    reader: ResampleReader,
    /// Next frame the reader will return, output rate
    position: i64,
    scratch: Vec<f32>,
}

// ═══════════════════════════════════════════════════════════════════════════
// CLIP
// ═══════════════════════════════════════════════════════════════════════════

pub struct Clip {
    id: ClipId,
    name: String,
    track: TrackId,
    /// None while recording
    source: Option<Arc<AudioSource>>,
    track_start: TimeRef,
    source_start: TimeRef,
    length: TimeRef,
    gain: f32,
    muted: bool,
    locked: bool,
    take: bool,
    fade_in: Option<FadeCurve>,
    fade_out: Option<FadeCurve>,
    envelope: GainEnvelope,
    status: ClipStatus,
    read_stream: Option<Arc<ReadStream>>,
    write_stream: Option<Arc<WriteStream>>,
    direct: Mutex<Option<DirectReader>>,
    render_bus: AudioBus,
}

impl Clip {
    /// Clip covering all of `source`, starting at `track_start`
    pub fn new(track: TrackId, source: Arc<AudioSource>, track_start: TimeRef, block_size: usize) -> Self {
        Self {
            id: ClipId::new(),
            name: source.name().to_string(),
            track,
            length: source.length(),
            render_bus: AudioBus::new(source.channels(), block_size),
            source: Some(source),
            track_start,
            source_start: TimeRef::ZERO,
            gain: 1.0,
            muted: false,
            locked: false,
            take: false,
            fade_in: None,
            fade_out: None,
            envelope: GainEnvelope::new(),
            status: ClipStatus::NotRecording,
            read_stream: None,
            write_stream: None,
            direct: Mutex::new(None),
        }
    }

    /// Empty clip that grows while recording
    pub fn new_recording(track: TrackId, track_start: TimeRef, name: impl Into<String>, block_size: usize) -> Self {
        Self {
            id: ClipId::new(),
            name: name.into(),
            track,
            source: None,
            track_start,
            source_start: TimeRef::ZERO,
            length: TimeRef::ZERO,
            gain: 1.0,
            muted: false,
            locked: false,
            take: true,
            fade_in: None,
            fade_out: None,
            envelope: GainEnvelope::new(),
            status: ClipStatus::NotRecording,
            read_stream: None,
            write_stream: None,
            direct: Mutex::new(None),
            render_bus: AudioBus::new(0, block_size),
        }
    }

    /// Rebuild a saved clip around an already restored source
    pub fn from_state(track: TrackId, state: &ClipState, source: Arc<AudioSource>, block_size: usize) -> Self {
        reserve_id(state.id.0);
        let mut clip = Self::new(track, source, state.track_start, block_size);
        clip.id = state.id;
        clip.set_state(state);
        clip
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn id(&self) -> ClipId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn track(&self) -> TrackId {
        self.track
    }

    pub fn source(&self) -> Option<&Arc<AudioSource>> {
        self.source.as_ref()
    }

    pub fn source_id(&self) -> Option<SourceId> {
        self.source.as_ref().map(|s| s.id())
    }

    /// Recording clips report their input channel count
    pub fn channels(&self) -> usize {
        match (&self.source, &self.write_stream) {
            (Some(source), _) => source.channels(),
            (None, Some(stream)) => stream.channels(),
            (None, None) => 0,
        }
    }

    pub fn track_start(&self) -> TimeRef {
        self.track_start
    }

    pub fn track_end(&self) -> TimeRef {
        self.track_start + self.length
    }

    pub fn source_start(&self) -> TimeRef {
        self.source_start
    }

    pub fn source_end(&self) -> TimeRef {
        self.source_start + self.length
    }

    pub fn length(&self) -> TimeRef {
        self.length
    }

    /// Source length, or the recorded length while recording
    pub fn source_length(&self) -> TimeRef {
        match &self.source {
            Some(source) => source.length(),
            None => self.length,
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_take(&self) -> bool {
        self.take
    }

    pub fn status(&self) -> ClipStatus {
        self.status
    }

    pub fn fade_in(&self) -> Option<&FadeCurve> {
        self.fade_in.as_ref()
    }

    pub fn fade_out(&self) -> Option<&FadeCurve> {
        self.fade_out.as_ref()
    }

    pub fn envelope(&self) -> &GainEnvelope {
        &self.envelope
    }

    pub fn envelope_mut(&mut self) -> &mut GainEnvelope {
        &mut self.envelope
    }

    pub fn read_stream(&self) -> Option<&Arc<ReadStream>> {
        self.read_stream.as_ref()
    }

    pub fn write_stream(&self) -> Option<&Arc<WriteStream>> {
        self.write_stream.as_ref()
    }

    /// Whether `[start, end)` overlaps the clip on the timeline
    pub fn overlaps(&self, start: TimeRef, end: TimeRef) -> bool {
        self.track_start < end && self.track_end() > start
    }

    /// Device block size changed. Control thread only.
    pub fn set_block_size(&mut self, block_size: usize) {
        self.render_bus.resize(block_size);
    }

    // ─── Editing ────────────────────────────────────────────────────────────

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, max_clip_gain());
    }

    pub fn toggle_mute(&mut self) {
        self.muted = !self.muted;
    }

    pub fn toggle_lock(&mut self) {
        self.locked = !self.locked;
    }

    fn min_length(&self) -> TimeRef {
        let rate = self.source.as_ref().map_or(48_000, |s| s.sample_rate().max(1));
        TimeRef::from_frames(MIN_CLIP_FRAMES, rate)
    }

    /// Move the clip. Refused when locked.
    pub fn set_track_start(&mut self, track_start: TimeRef) -> bool {
        if self.locked {
            return false;
        }
        self.track_start = track_start.max(TimeRef::ZERO);
        self.sync_geometry();
        true
    }

    /// Move the left edge to `new_start`, shifting the source start by the
    /// same amount. Clamped so the source start stays inside the source and
    /// the clip keeps at least [`MIN_CLIP_FRAMES`].
    pub fn set_left_edge(&mut self, new_start: TimeRef) -> bool {
        if self.locked || self.status != ClipStatus::NotRecording {
            return false;
        }
        let source_end = self.source_end();
        let mut delta = new_start - self.track_start;
        delta = delta.min(source_end - self.min_length() - self.source_start);
        delta = delta.max(-self.source_start).max(-self.track_start);
        if delta == TimeRef::ZERO {
            return false;
        }

        self.track_start += delta;
        self.source_start += delta;
        self.length -= delta;
        debug_assert_eq!(self.source_end(), source_end);
        self.clamp_fades();
        self.sync_geometry();
        true
    }

    /// Move the right edge to `new_end`. The source end never passes the end
    /// of the source, the clip keeps at least [`MIN_CLIP_FRAMES`].
    pub fn set_right_edge(&mut self, new_end: TimeRef) -> bool {
        if self.locked || self.status != ClipStatus::NotRecording {
            return false;
        }
        let available = self.source_length() - self.source_start;
        let length = (new_end - self.track_start).max(self.min_length()).min(available);
        if length == self.length {
            return false;
        }
        self.length = length;
        self.clamp_fades();
        self.sync_geometry();
        true
    }

    pub fn set_fade_in(&mut self, range: TimeRef) {
        let range = range.max(TimeRef::ZERO).min(self.length);
        self.fade_in
            .get_or_insert_with(|| FadeCurve::new(FadeDirection::In, range))
            .range = range;
    }

    pub fn set_fade_out(&mut self, range: TimeRef) {
        let range = range.max(TimeRef::ZERO).min(self.length);
        self.fade_out
            .get_or_insert_with(|| FadeCurve::new(FadeDirection::Out, range))
            .range = range;
    }

    pub fn fade_in_mut(&mut self) -> Option<&mut FadeCurve> {
        self.fade_in.as_mut()
    }

    pub fn fade_out_mut(&mut self) -> Option<&mut FadeCurve> {
        self.fade_out.as_mut()
    }

    pub fn reset_fade_in(&mut self) {
        self.fade_in = None;
    }

    pub fn reset_fade_out(&mut self) {
        self.fade_out = None;
    }

    pub fn reset_fades(&mut self) {
        self.reset_fade_in();
        self.reset_fade_out();
    }

    fn clamp_fades(&mut self) {
        let length = self.length;
        for fade in [self.fade_in.as_mut(), self.fade_out.as_mut()].into_iter().flatten() {
            fade.range = fade.range.min(length);
        }
    }

    fn sync_geometry(&self) {
        if let Some(stream) = &self.read_stream {
            stream.set_geometry(self.track_start, self.source_start, self.source_end());
        }
    }

    /// Source and native frame range a normalization has to measure
    pub fn normalize_range(&self) -> Option<(Arc<AudioSource>, u64, u64)> {
        let source = self.source.clone()?;
        if source.is_silence() {
            return None;
        }
        let rate = source.sample_rate();
        let start = self.source_start.to_frame(rate).max(0) as u64;
        let end = self.source_end().to_frame(rate).max(0) as u64;
        Some((source, start, end))
    }

    /// Gain that brings a measured `max_amplitude` to `target_db`
    pub fn normalize_gain(&self, max_amplitude: f32, target_db: f32) -> NormalizeResult {
        let mut target = Decibels(target_db as f64).to_gain() as f32;
        if target == 1.0 {
            target = 1.0 - f32::EPSILON;
        }
        if max_amplitude <= f32::EPSILON || fuzzy_eq(max_amplitude, target) {
            return NormalizeResult::NoOp;
        }

        let gain = (target / max_amplitude).min(max_clip_gain());
        if fuzzy_eq(gain, self.gain) {
            return NormalizeResult::NoOp;
        }
        NormalizeResult::Changed(gain)
    }

    /// Measure through the peak cache and apply. `TlError::PeakUnavailable`
    /// means try again once the peaks are built.
    pub fn normalize(&mut self, peaks: &PeakManager, target_db: f32) -> TlResult<NormalizeResult> {
        let Some((source, start, end)) = self.normalize_range() else {
            return Ok(NormalizeResult::NoOp);
        };
        let max_amplitude = peaks.get_max_amplitude(&source, start, end)?;
        let result = self.normalize_gain(max_amplitude, target_db);
        if let NormalizeResult::Changed(gain) = result {
            self.gain = gain;
            log::debug!("[Clip] {} normalized, gain {:.4}", self.id, gain);
        }
        Ok(result)
    }

    // ─── State ──────────────────────────────────────────────────────────────

    pub fn get_state(&self) -> ClipState {
        ClipState {
            id: self.id,
            name: self.name.clone(),
            source: self.source_id().unwrap_or(SourceId(0)),
            track_start: self.track_start,
            source_start: self.source_start,
            length: self.length,
            gain: self.gain,
            muted: self.muted,
            locked: self.locked,
            take: self.take,
            fade_in: self.fade_in.clone(),
            fade_out: self.fade_out.clone(),
            gain_envelope: self.envelope.clone(),
        }
    }

    /// Apply saved state. The source is not changed.
    pub fn set_state(&mut self, state: &ClipState) {
        self.name = state.name.clone();
        self.gain = state.gain.clamp(0.0, max_clip_gain());
        self.muted = state.muted;
        self.locked = state.locked;
        self.take = state.take;
        self.fade_in = state.fade_in.clone();
        self.fade_out = state.fade_out.clone();
        self.envelope = state.gain_envelope.clone();

        let source_length = self.source_length();
        self.source_start = state.source_start.max(TimeRef::ZERO).min(source_length);
        self.length = state.length.max(TimeRef::ZERO).min(source_length - self.source_start);
        self.track_start = state.track_start.max(TimeRef::ZERO);
        self.clamp_fades();
        self.sync_geometry();
    }

    /// Same placement and settings, new id, no stream
    pub fn create_copy(&self, block_size: usize) -> Option<Clip> {
        let source = self.source.clone()?;
        let mut copy = Clip::new(self.track, source, self.track_start, block_size);
        copy.set_state(&self.get_state());
        Some(copy)
    }

    // ─── Streams ────────────────────────────────────────────────────────────

    /// Register the playback stream, primed for transport `location`
    pub fn attach_stream(&mut self, disk: &DiskIo, location: TimeRef) -> TlResult<()> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        if source.is_silence() {
            return Ok(());
        }
        let geometry = (self.track_start, self.source_start, self.source_end());
        self.read_stream = Some(disk.register_read_source(self.id, source, geometry, location)?);
        Ok(())
    }

    /// Drop the stream and the source reference. Returns the source when this
    /// clip held its last registration.
    pub fn release(&mut self, disk: &DiskIo, registry: &SourceRegistry) -> Option<Arc<AudioSource>> {
        if self.read_stream.take().is_some() {
            disk.unregister_read_source(self.id);
        }
        if let Some(stream) = self.write_stream.take() {
            stream.set_recording(false);
        }
        *self.direct.get_mut() = None;
        let source = self.source.as_ref()?;
        registry.release(source.id())
    }

    /// Open a decoder for offline rendering at `rate`
    pub fn prepare_direct(&mut self, rate: u32) -> TlResult<()> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        if source.is_silence() {
            return Ok(());
        }
        let reader = ResampleReader::new(source.open_reader()?, rate);
        *self.direct.get_mut() = Some(DirectReader {
            reader,
            position: 0,
            scratch: vec![0.0; self.render_bus.frames() * source.channels()],
        });
        Ok(())
    }

    pub fn release_direct(&mut self) {
        *self.direct.get_mut() = None;
    }

    // ─── Recording ──────────────────────────────────────────────────────────

    /// Start capturing `input` into a new file at `path`
    pub fn init_recording(&mut self, disk: &DiskIo, input: &AudioBus, path: &Path, format: SampleFormat) -> TlResult<()> {
        if input.channel_count() == 0 {
            return Err(TlError::Recording(format!("{}: input has no channels", self.name)));
        }
        let stream = disk.register_write_source(self.id, path, input.channel_count(), format)?;
        self.write_stream = Some(stream);
        self.source = None;
        self.source_start = TimeRef::ZERO;
        self.length = TimeRef::ZERO;
        self.take = true;
        self.status = ClipStatus::Recording;
        log::info!("[Clip] {} recording to {}", self.id, path.display());
        Ok(())
    }

    /// Stop accepting input; the disk worker writes out what is buffered
    pub fn finish_recording(&mut self) {
        if self.status != ClipStatus::Recording {
            return;
        }
        if let Some(stream) = &self.write_stream {
            stream.set_recording(false);
        }
        self.status = ClipStatus::FinishingRecording;
    }

    /// The recorded file is complete: reopen it as this clip's source
    pub fn finish_write_source(
        &mut self,
        disk: &DiskIo,
        registry: &SourceRegistry,
        location: TimeRef,
    ) -> TlResult<Arc<AudioSource>> {
        let path: PathBuf = self
            .write_stream
            .as_ref()
            .map(|s| s.path().to_path_buf())
            .ok_or_else(|| TlError::Recording(format!("{} has no recording", self.id)))?;

        let source = registry.insert(AudioSource::from_file(&path)?);
        registry.acquire(source.id());

        self.write_stream = None;
        self.length = source.length();
        self.source_start = TimeRef::ZERO;
        self.render_bus = AudioBus::new(source.channels(), self.render_bus.frames());
        self.source = Some(source.clone());
        self.status = ClipStatus::NotRecording;
        self.attach_stream(disk, location)?;

        log::info!("[Clip] {} recorded {} ({})", self.id, path.display(), self.length);
        Ok(source)
    }

    // ─── Processing ─────────────────────────────────────────────────────────

    /// Recording path: queue the track input for the file
    pub fn process_capture(&mut self, input: &AudioBus, ctx: &ProcessContext) {
        let Some(stream) = &self.write_stream else {
            return;
        };
        let written = stream.rb_write(input, ctx.nframes);
        self.length = self.length.add_frames(written as i64, ctx.rate);
        if written < ctx.nframes {
            ctx.events.push(EngineEvent::WriteOverrun);
        }
    }

    /// Mix this block into `output`. RT-safe on the realtime path.
    pub fn process(&mut self, ctx: &ProcessContext, input: Option<&AudioBus>, output: &mut AudioBus) -> ClipProcessResult {
        if self.channels() == 0 {
            return ClipProcessResult::NoAudio;
        }

        if self.status == ClipStatus::Recording {
            if let Some(input) = input {
                self.process_capture(input, ctx);
            }
            return ClipProcessResult::NoAudio;
        }

        let source_ok = match (&self.source, ctx.realtime) {
            (None, _) => false,
            (Some(_), true) => self.read_stream.is_some(),
            (Some(_), false) => self.direct.get_mut().is_some(),
        };
        if !source_ok {
            return ClipProcessResult::Invalid;
        }

        if self.muted || self.gain == 0.0 {
            return ClipProcessResult::NoAudio;
        }

        let nframes = ctx.nframes.min(self.render_bus.frames());
        let block_start = ctx.location;
        let block_end = block_start.add_frames(nframes as i64, ctx.rate);
        let track_end = self.track_end();
        if self.track_start >= block_end || track_end <= block_start {
            return ClipProcessResult::NoAudio;
        }

        let rate = ctx.rate;
        let (mut offset, mut source_pos) = if self.track_start > block_start {
            (
                (self.track_start.to_frame(rate) - block_start.to_frame(rate)) as usize,
                self.source_start,
            )
        } else {
            (0, block_start - self.track_start + self.source_start)
        };
        let mut count = nframes.saturating_sub(offset);
        if track_end < block_end {
            let cut = (block_end.to_frame(rate) - track_end.to_frame(rate)) as usize;
            count = count.saturating_sub(cut);
        }
        if count == 0 {
            return ClipProcessResult::NoAudio;
        }

        self.render_bus.silence(nframes);
        let mut source_frame = source_frame_at(block_start, self.track_start, self.source_start, rate);
        let read = if ctx.realtime {
            let Some(stream) = &self.read_stream else {
                return ClipProcessResult::Invalid;
            };
            let result = stream.rb_read(&mut self.render_bus, offset, source_frame, count);
            if result.underrun {
                ctx.events.push(EngineEvent::ReadUnderrun);
            }
            if result.skipped > 0 {
                offset += result.skipped;
                source_frame += result.skipped as i64;
                source_pos = source_pos.add_frames(result.skipped as i64, rate);
            }
            result.frames
        } else {
            self.read_direct(offset, source_frame, count)
        };

        if read == 0 {
            return ClipProcessResult::NoAudio;
        }

        if let Some(fade) = &self.fade_in {
            let len = fade.range.to_frame(rate);
            let pos = source_frame - self.source_start.to_frame(rate);
            fade.apply(&mut self.render_bus, offset, read, pos, len);
        }
        if let Some(fade) = &self.fade_out {
            let len = fade.range.to_frame(rate);
            let pos = source_frame - (self.source_end() - fade.range).to_frame(rate);
            fade.apply(&mut self.render_bus, offset, read, pos, len);
        }
        self.envelope
            .apply(&mut self.render_bus, offset, read, source_pos, rate, self.gain);

        output.mix_from(&self.render_bus, nframes);
        ClipProcessResult::Produced(read)
    }

    fn read_direct(&mut self, offset: usize, position: i64, count: usize) -> usize {
        let Some(direct) = self.direct.get_mut().as_mut() else {
            return 0;
        };
        if position != direct.position {
            if !direct.reader.seek(position.max(0) as u64) {
                return 0;
            }
            direct.position = position;
        }

        let channels = direct.reader.channels();
        if direct.scratch.len() < count * channels {
            direct.scratch.resize(count * channels, 0.0);
        }
        let got = direct.reader.read(&mut direct.scratch[..count * channels], count);
        direct.position += got as i64;

        let out_channels = self.render_bus.channel_count().min(channels);
        for ch in 0..out_channels {
            let dest = &mut self.render_bus.channel_mut(ch)[offset..offset + got];
            for (i, sample) in dest.iter_mut().enumerate() {
                *sample = direct.scratch[i * channels + ch];
            }
        }
        got
    }
}

impl std::fmt::Debug for Clip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clip")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("track_start", &self.track_start)
            .field("source_start", &self.source_start)
            .field("length", &self.length)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const RATE: u32 = 48_000;

    fn frames(n: i64) -> TimeRef {
        TimeRef::from_frames(n, RATE)
    }

    fn memory_clip(len: usize, value: f32) -> Clip {
        let source = Arc::new(AudioSource::from_memory("test", vec![value; len], 1, RATE));
        Clip::new(TrackId::new(), source, TimeRef::ZERO, 256)
    }

    #[test]
    fn test_left_edge_keeps_lengths_consistent() {
        let mut clip = memory_clip(1000, 0.5);
        assert!(clip.set_left_edge(frames(100)));
        assert_eq!(clip.track_start(), frames(100));
        assert_eq!(clip.source_start(), frames(100));
        assert_eq!(clip.length(), frames(900));
        assert_eq!(clip.source_end() - clip.source_start(), clip.length());
        assert_eq!(clip.track_end() - clip.track_start(), clip.length());
    }

    #[test]
    fn test_left_edge_clamped_at_source_start() {
        let mut clip = memory_clip(1000, 0.5);
        clip.set_track_start(frames(500));
        clip.set_left_edge(frames(550));
        // dragging back past the beginning of the source stops at frame 0
        clip.set_left_edge(frames(0));
        assert_eq!(clip.source_start(), TimeRef::ZERO);
        assert_eq!(clip.track_start(), frames(500));
        assert_eq!(clip.length(), frames(1000));
    }

    #[test]
    fn test_edges_keep_minimum_length() {
        let mut clip = memory_clip(1000, 0.5);
        clip.set_left_edge(frames(5000));
        assert_eq!(clip.length(), frames(MIN_CLIP_FRAMES));
        assert_eq!(clip.source_end(), frames(1000));

        let mut clip = memory_clip(1000, 0.5);
        clip.set_right_edge(frames(1));
        assert_eq!(clip.length(), frames(MIN_CLIP_FRAMES));
        clip.set_right_edge(frames(100_000));
        assert_eq!(clip.source_end(), frames(1000));
    }

    #[test]
    fn test_locked_clip_refuses_edits() {
        let mut clip = memory_clip(1000, 0.5);
        clip.toggle_lock();
        assert!(clip.is_locked());
        assert!(!clip.set_left_edge(frames(10)));
        assert!(!clip.set_right_edge(frames(10)));
        assert!(!clip.set_track_start(frames(10)));
    }

    #[test]
    fn test_gain_is_clamped() {
        let mut clip = memory_clip(100, 0.5);
        clip.set_gain(1000.0);
        assert_relative_eq!(clip.gain(), max_clip_gain());
        clip.set_gain(-1.0);
        assert_eq!(clip.gain(), 0.0);
    }

    #[test]
    fn test_fades_follow_length() {
        let mut clip = memory_clip(1000, 0.5);
        clip.set_fade_in(frames(2000));
        assert_eq!(clip.fade_in().map(|f| f.range), Some(frames(1000)));
        clip.set_right_edge(frames(400));
        assert_eq!(clip.fade_in().map(|f| f.range), Some(frames(400)));
        clip.reset_fades();
        assert!(clip.fade_in().is_none());
    }

    #[test]
    fn test_state_round_trip() {
        let mut clip = memory_clip(1000, 0.5);
        clip.set_track_start(frames(300));
        clip.set_left_edge(frames(350));
        clip.set_gain(0.25);
        clip.set_fade_out(frames(20));
        clip.envelope_mut().add_point(frames(100), 0.5);
        clip.toggle_mute();

        let state = clip.get_state();
        let json = serde_json::to_string(&state).unwrap();
        let restored: ClipState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);

        let source = clip.source().cloned().unwrap();
        let copy = Clip::from_state(clip.track(), &restored, source, 256);
        assert_eq!(copy.get_state(), state);
    }

    #[test]
    fn test_offline_block_offset() {
        let mut clip = memory_clip(1000, 0.5);
        clip.set_track_start(frames(500));
        clip.prepare_direct(RATE).unwrap();

        let events = EventQueue::new();
        let ctx = ProcessContext {
            location: frames(400),
            nframes: 200,
            rate: RATE,
            realtime: false,
            events: &events,
        };
        let mut out = AudioBus::new(2, 200);
        assert_eq!(clip.process(&ctx, None, &mut out), ClipProcessResult::Produced(100));
        assert!(out.channel(0)[..100].iter().all(|&s| s == 0.0));
        assert!(out.channel(0)[100..].iter().all(|&s| s == 0.5));
        assert!(out.channel(1)[100..].iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_block_past_clip_end_truncates() {
        let mut clip = memory_clip(1000, 0.25);
        clip.prepare_direct(RATE).unwrap();
        let events = EventQueue::new();
        let ctx = ProcessContext {
            location: frames(900),
            nframes: 200,
            rate: RATE,
            realtime: false,
            events: &events,
        };
        let mut out = AudioBus::new(1, 200);
        assert_eq!(clip.process(&ctx, None, &mut out), ClipProcessResult::Produced(100));
        assert!(out.channel(0)[..100].iter().all(|&s| s == 0.25));
        assert!(out.channel(0)[100..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_muted_and_unprepared_clips() {
        let events = EventQueue::new();
        let ctx = ProcessContext {
            location: TimeRef::ZERO,
            nframes: 64,
            rate: RATE,
            realtime: true,
            events: &events,
        };
        let mut out = AudioBus::new(2, 64);

        let mut clip = memory_clip(1000, 0.5);
        assert_eq!(clip.process(&ctx, None, &mut out), ClipProcessResult::Invalid);

        let silence = Arc::new(AudioSource::silence(1000, RATE));
        let mut clip = Clip::new(TrackId::new(), silence, TimeRef::ZERO, 64);
        assert_eq!(clip.process(&ctx, None, &mut out), ClipProcessResult::NoAudio);
    }

    #[test]
    fn test_fade_in_ramps_from_silence() {
        let mut clip = memory_clip(1000, 1.0);
        clip.set_fade_in(frames(100));
        if let Some(fade) = clip.fade_in_mut() {
            fade.shape = crate::fade::FadeShape::Linear;
        }
        assert!(clip.fade_out_mut().is_none());
        clip.prepare_direct(RATE).unwrap();
        let events = EventQueue::new();
        let ctx = ProcessContext {
            location: TimeRef::ZERO,
            nframes: 200,
            rate: RATE,
            realtime: false,
            events: &events,
        };
        let mut out = AudioBus::new(1, 200);
        clip.process(&ctx, None, &mut out);
        assert_eq!(out.channel(0)[0], 0.0);
        assert_relative_eq!(out.channel(0)[50], 0.5, epsilon = 1e-6);
        assert_eq!(out.channel(0)[150], 1.0);
    }
}
