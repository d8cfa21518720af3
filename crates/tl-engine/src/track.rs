//! Tracks: ordered containers of clips with a stereo process bus
//!
//! Audio tracks own clips and an input bus (the capture source while armed).
//! Bus tracks own no clips; audio tracks routed to them sum into their
//! process bus before it goes on to master.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tl_core::{SampleFormat, TimeRef, TlError, TlResult};

use crate::bus::AudioBus;
use crate::clip::{Clip, ClipProcessResult, ClipState, ClipStatus, ProcessContext};
use crate::ids::{reserve_id, ClipId, TrackId};
use crate::streaming::DiskIo;

/// Channels of every process bus
pub const PROCESS_BUS_CHANNELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Bus,
}

/// Where a track's process bus goes after gain and pan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputRoute {
    #[default]
    Master,
    Bus(TrackId),
}

/// Persisted track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    pub id: TrackId,
    pub name: String,
    pub kind: TrackKind,
    pub sort_index: usize,
    #[serde(default)]
    pub route: OutputRoute,
    pub gain: f32,
    pub pan: f32,
    pub muted: bool,
    pub soloed: bool,
    pub armed: bool,
    #[serde(default)]
    pub clips: Vec<ClipState>,
}

pub struct Track {
    id: TrackId,
    name: String,
    kind: TrackKind,
    sort_index: usize,
    route: OutputRoute,
    clips: Vec<Clip>,
    process_bus: AudioBus,
    input_bus: Option<AudioBus>,
    gain: f32,
    /// -1.0 (left) to +1.0 (right)
    pan: f32,
    muted: bool,
    soloed: bool,
    muted_by_solo: bool,
    armed: bool,
    block_size: usize,
}

impl Track {
    pub fn new(kind: TrackKind, name: impl Into<String>, block_size: usize) -> Self {
        Self {
            id: TrackId::new(),
            name: name.into(),
            kind,
            sort_index: 0,
            route: OutputRoute::Master,
            clips: Vec::new(),
            process_bus: AudioBus::new(PROCESS_BUS_CHANNELS, block_size),
            input_bus: match kind {
                TrackKind::Audio => Some(AudioBus::new(PROCESS_BUS_CHANNELS, block_size)),
                TrackKind::Bus => None,
            },
            gain: 1.0,
            pan: 0.0,
            muted: false,
            soloed: false,
            muted_by_solo: false,
            armed: false,
            block_size,
        }
    }

    /// Track settings only; clips are restored by the session
    pub fn from_state(state: &TrackState, block_size: usize) -> Self {
        reserve_id(state.id.0);
        let mut track = Self::new(state.kind, state.name.clone(), block_size);
        track.id = state.id;
        track.sort_index = state.sort_index;
        track.route = if state.kind == TrackKind::Bus { OutputRoute::Master } else { state.route };
        track.gain = state.gain.max(0.0);
        track.pan = state.pan.clamp(-1.0, 1.0);
        track.muted = state.muted;
        track.soloed = state.soloed;
        track.armed = state.armed && state.kind == TrackKind::Audio;
        track
    }

    pub fn get_state(&self) -> TrackState {
        TrackState {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            sort_index: self.sort_index,
            route: self.route,
            gain: self.gain,
            pan: self.pan,
            muted: self.muted,
            soloed: self.soloed,
            armed: self.armed,
            clips: self
                .clips
                .iter()
                .filter(|c| c.status() == ClipStatus::NotRecording && c.source().is_some())
                .map(Clip::get_state)
                .collect(),
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_bus(&self) -> bool {
        self.kind == TrackKind::Bus
    }

    pub fn sort_index(&self) -> usize {
        self.sort_index
    }

    pub fn set_sort_index(&mut self, index: usize) {
        self.sort_index = index;
    }

    pub fn route(&self) -> OutputRoute {
        self.route
    }

    pub fn set_route(&mut self, route: OutputRoute) {
        self.route = route;
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.max(0.0);
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    pub fn set_pan(&mut self, pan: f32) {
        self.pan = pan.clamp(-1.0, 1.0);
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_soloed(&self) -> bool {
        self.soloed
    }

    pub fn set_soloed(&mut self, soloed: bool) {
        self.soloed = soloed;
    }

    pub fn is_muted_by_solo(&self) -> bool {
        self.muted_by_solo
    }

    pub fn set_muted_by_solo(&mut self, muted: bool) {
        self.muted_by_solo = muted;
    }

    /// Not muted, directly or by someone else's solo
    pub fn is_audible(&self) -> bool {
        !self.muted && !self.muted_by_solo
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Bus tracks cannot record
    pub fn set_armed(&mut self, armed: bool) -> bool {
        if self.kind != TrackKind::Audio {
            return false;
        }
        self.armed = armed;
        true
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn process_bus(&self) -> &AudioBus {
        &self.process_bus
    }

    pub fn process_bus_mut(&mut self) -> &mut AudioBus {
        &mut self.process_bus
    }

    pub fn input_bus(&self) -> Option<&AudioBus> {
        self.input_bus.as_ref()
    }

    pub fn input_bus_mut(&mut self) -> Option<&mut AudioBus> {
        self.input_bus.as_mut()
    }

    /// Capture channel count. Zero disables recording on this track.
    pub fn set_input_channels(&mut self, channels: usize) {
        if self.kind == TrackKind::Audio {
            self.input_bus = Some(AudioBus::new(channels, self.block_size));
        }
    }

    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
        self.process_bus.resize(block_size);
        if let Some(input) = &mut self.input_bus {
            input.resize(block_size);
        }
        for clip in &mut self.clips {
            clip.set_block_size(block_size);
        }
    }

    // ─── Clips ──────────────────────────────────────────────────────────────

    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }

    pub fn clips_mut(&mut self) -> &mut [Clip] {
        &mut self.clips
    }

    pub fn clip(&self, id: ClipId) -> Option<&Clip> {
        self.clips.iter().find(|c| c.id() == id)
    }

    pub fn clip_mut(&mut self, id: ClipId) -> Option<&mut Clip> {
        self.clips.iter_mut().find(|c| c.id() == id)
    }

    pub fn add_clip(&mut self, clip: Clip) -> TlResult<ClipId> {
        if self.kind != TrackKind::Audio {
            return Err(TlError::InvalidParam(format!("{} is a bus track", self.name)));
        }
        let id = clip.id();
        self.clips.push(clip);
        Ok(id)
    }

    pub fn remove_clip(&mut self, id: ClipId) -> Option<Clip> {
        let index = self.clips.iter().position(|c| c.id() == id)?;
        Some(self.clips.remove(index))
    }

    /// Take every clip out of the track
    pub fn take_clips(&mut self) -> Vec<Clip> {
        std::mem::take(&mut self.clips)
    }

    /// End of the last clip, if any
    pub fn last_clip_end(&self) -> Option<TimeRef> {
        self.clips.iter().map(Clip::track_end).max()
    }

    /// Timeline range covered by clips
    pub fn render_range(&self) -> Option<(TimeRef, TimeRef)> {
        let start = self.clips.iter().map(Clip::track_start).min()?;
        let end = self.clips.iter().map(Clip::track_end).max()?;
        Some((start, end))
    }

    // ─── Recording ──────────────────────────────────────────────────────────

    /// Add a recording clip at `location` capturing into `directory`.
    /// Returns None when the track is not armed.
    pub fn init_recording(
        &mut self,
        disk: &DiskIo,
        location: TimeRef,
        directory: &Path,
        format: SampleFormat,
    ) -> TlResult<Option<ClipId>> {
        if !self.armed || self.kind != TrackKind::Audio {
            return Ok(None);
        }
        let input = self
            .input_bus
            .as_ref()
            .ok_or_else(|| TlError::Recording(format!("{} has no input", self.name)))?;

        std::fs::create_dir_all(directory)?;
        let mut clip = Clip::new_recording(self.id, location, self.name.clone(), self.block_size);
        let path = directory.join(format!("{}-{}.wav", self.name, clip.id().0));
        clip.init_recording(disk, input, &path, format)?;

        let id = clip.id();
        self.clips.push(clip);
        Ok(Some(id))
    }

    /// Stop capture on every recording clip. Returns the clips now waiting
    /// for their file to be finished.
    pub fn finish_recording(&mut self) -> Vec<ClipId> {
        let mut finishing = Vec::new();
        for clip in &mut self.clips {
            if clip.status() == ClipStatus::Recording {
                clip.finish_recording();
                finishing.push(clip.id());
            }
        }
        finishing
    }

    // ─── Processing ─────────────────────────────────────────────────────────

    /// Zero the process bus for a new block
    #[inline]
    pub fn begin_block(&mut self, nframes: usize) {
        self.process_bus.silence(nframes);
    }

    /// Mix every clip into the process bus. Returns frames produced by the
    /// busiest clip.
    pub fn process(&mut self, ctx: &ProcessContext) -> usize {
        let mut produced = 0;
        let input = self.input_bus.as_ref();
        for clip in &mut self.clips {
            if let ClipProcessResult::Produced(n) = clip.process(ctx, input, &mut self.process_bus) {
                produced = produced.max(n);
            }
        }
        produced
    }

    /// Gain and balance over the process bus. Inaudible tracks are silenced.
    pub fn apply_gain_pan(&mut self, nframes: usize) {
        if !self.is_audible() {
            self.process_bus.silence(nframes);
            return;
        }
        let left = self.gain * (1.0 - self.pan.max(0.0));
        let right = self.gain * (1.0 + self.pan.min(0.0));
        let n = nframes.min(self.process_bus.frames());
        for (ch, gain) in [(0, left), (1, right)] {
            if ch >= self.process_bus.channel_count() || gain == 1.0 {
                continue;
            }
            for s in &mut self.process_bus.channel_mut(ch)[..n] {
                *s *= gain;
            }
        }
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("clips", &self.clips.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventQueue;
    use crate::source::AudioSource;
    use std::sync::Arc;

    #[test]
    fn test_bus_track_rejects_clips() {
        let mut bus = Track::new(TrackKind::Bus, "FX", 64);
        let source = Arc::new(AudioSource::from_memory("a", vec![0.0; 64], 1, 48000));
        let clip = Clip::new(bus.id(), source, TimeRef::ZERO, 64);
        assert!(bus.add_clip(clip).is_err());
        assert!(!bus.set_armed(true));
        assert!(bus.input_bus().is_none());
    }

    #[test]
    fn test_balance_and_mute() {
        let mut track = Track::new(TrackKind::Audio, "Vox", 4);
        track.process_bus_mut().channel_mut(0).fill(1.0);
        track.process_bus_mut().channel_mut(1).fill(1.0);
        track.set_pan(0.5);
        track.apply_gain_pan(4);
        assert_eq!(track.process_bus().channel(0)[0], 0.5);
        assert_eq!(track.process_bus().channel(1)[0], 1.0);

        track.set_muted_by_solo(true);
        track.apply_gain_pan(4);
        assert!(track.process_bus().channel(0).iter().all(|&s| s == 0.0));
        assert!(track.process_bus().channel(1).iter().all(|&s| s == 0.0));

        track.set_muted_by_solo(false);
        track.set_muted(true);
        assert!(track.is_muted());
        track.process_bus_mut().channel_mut(0).fill(1.0);
        track.apply_gain_pan(4);
        assert!(track.process_bus().channel(0).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_clips_sum_into_process_bus() {
        let mut track = Track::new(TrackKind::Audio, "Drums", 128);
        for value in [0.25, 0.5] {
            let source = Arc::new(AudioSource::from_memory("hit", vec![value; 128], 1, 48000));
            let mut clip = Clip::new(track.id(), source, TimeRef::ZERO, 128);
            clip.prepare_direct(48000).unwrap();
            track.add_clip(clip).unwrap();
        }

        let events = EventQueue::new();
        let ctx = ProcessContext {
            location: TimeRef::ZERO,
            nframes: 128,
            rate: 48000,
            realtime: false,
            events: &events,
        };
        track.begin_block(128);
        assert_eq!(track.process(&ctx), 128);
        assert_eq!(track.process_bus().channel(0)[10], 0.75);
        assert_eq!(track.process_bus().channel(1)[127], 0.75);
        assert_eq!(track.render_range(), Some((TimeRef::ZERO, TimeRef::from_frames(128, 48000))));
    }

    #[test]
    fn test_state_round_trip() {
        let mut track = Track::new(TrackKind::Audio, "Bass", 64);
        track.set_gain(0.5);
        track.set_pan(-0.25);
        track.set_armed(true);
        track.set_sort_index(3);
        let state = track.get_state();

        let json = serde_json::to_string(&state).unwrap();
        let restored = Track::from_state(&serde_json::from_str(&json).unwrap(), 64);
        assert_eq!(restored.get_state(), state);
    }
}
