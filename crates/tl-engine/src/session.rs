//! Session - Timeline Context Object
//!
//! Owns everything a running timeline needs and wires the threads together:
//! - Tracks and their clips (behind a lock the audio thread only try-locks)
//! - The transport state machine and the seek / recording sequences
//! - The disk worker, the peak cache and the source registry
//!
//! The audio callback calls [`Session::process`]. Everything else runs on the
//! control thread, which must call [`Session::poll_events`] regularly to
//! complete seeks, prepare and finish recordings and collect notifications.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tl_core::{EngineConfig, TimeRef, TlError, TlResult};

use crate::bus::AudioBus;
use crate::clip::{Clip, NormalizeResult, ProcessContext};
use crate::export::{self, ExportSpec};
use crate::ids::{ClipId, TrackId};
use crate::notify::{EngineEvent, EventQueue, SessionEvent};
use crate::peak::{PeakEvent, PeakManager};
use crate::source::{AudioSource, SourceRegistry, SourceState};
use crate::streaming::{DiskEvent, DiskIo};
use crate::track::{OutputRoute, Track, TrackKind, TrackState};
use crate::transport::{Transport, TransportRequest, TransportState};

const READ_UNDERRUN_MESSAGE: &str = "Hard disk overload detected!\nFailed to fill read buffer in time";
const WRITE_OVERRUN_MESSAGE: &str = "Hard disk overload detected!\nFailed to empty write buffer in time";

/// How long a control-thread stop waits for the audio callback
const STOP_TIMEOUT: Duration = Duration::from_millis(100);

/// Persisted session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub sample_rate: u32,
    pub position: TimeRef,
    pub master_gain: f32,
    pub sources: Vec<SourceState>,
    pub tracks: Vec<TrackState>,
}

pub struct Session {
    config: EngineConfig,
    transport: Transport,
    /// Sorted by sort index
    tracks: RwLock<Vec<Track>>,
    sources: SourceRegistry,
    events: EventQueue,
    notices: Mutex<Vec<SessionEvent>>,
    /// Recording clips whose files are still being written
    finishing: Mutex<HashSet<ClipId>>,
    master_gain: AtomicU32,
    rate: AtomicU32,
    block_size: AtomicUsize,
    disk: DiskIo,
    peaks: PeakManager,
}

impl Session {
    pub fn new(config: EngineConfig) -> TlResult<Self> {
        config.validate()?;
        let disk = DiskIo::new(&config, config.audio.sample_rate)?;
        let peaks = PeakManager::new(&config.peaks.directory)?;
        log::info!(
            "[Session] created ({} Hz, {} frames per block)",
            config.audio.sample_rate,
            config.audio.buffer_size
        );

        Ok(Self {
            transport: Transport::new(),
            tracks: RwLock::new(Vec::new()),
            sources: SourceRegistry::new(),
            events: EventQueue::new(),
            notices: Mutex::new(Vec::new()),
            finishing: Mutex::new(HashSet::new()),
            master_gain: AtomicU32::new(1.0f32.to_bits()),
            rate: AtomicU32::new(config.audio.sample_rate),
            block_size: AtomicUsize::new(config.audio.buffer_size),
            disk,
            peaks,
            config,
        })
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn peaks(&self) -> &PeakManager {
        &self.peaks
    }

    pub fn disk(&self) -> &DiskIo {
        &self.disk
    }

    pub fn sample_rate(&self) -> u32 {
        self.rate.load(Ordering::Acquire)
    }

    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Acquire)
    }

    pub fn position(&self) -> TimeRef {
        self.transport.position()
    }

    pub fn master_gain(&self) -> f32 {
        f32::from_bits(self.master_gain.load(Ordering::Relaxed))
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.master_gain.store(gain.max(0.0).to_bits(), Ordering::Relaxed);
    }

    fn notify(&self, event: SessionEvent) {
        self.notices.lock().push(event);
    }

    // ─── Tracks ─────────────────────────────────────────────────────────────

    pub fn add_track(&self, kind: TrackKind, name: &str) -> TrackId {
        let mut tracks = self.tracks.write();
        let mut track = Track::new(kind, name, self.block_size());
        track.set_sort_index(tracks.iter().map(|t| t.sort_index() + 1).max().unwrap_or(0));
        track.set_muted_by_solo(tracks.iter().any(Track::is_soloed));
        let id = track.id();
        tracks.push(track);
        log::debug!("[Session] added {:?} track {} ({})", kind, name, id);
        id
    }

    /// Remove a track and release its clips. Tracks routed to it go to master.
    pub fn remove_track(&self, id: TrackId) -> TlResult<()> {
        let mut track = {
            let mut tracks = self.tracks.write();
            let index = tracks
                .iter()
                .position(|t| t.id() == id)
                .ok_or_else(|| TlError::InvalidParam(format!("no track {}", id)))?;
            let track = tracks.remove(index);
            for other in tracks.iter_mut() {
                if other.route() == OutputRoute::Bus(id) {
                    other.set_route(OutputRoute::Master);
                }
            }
            update_solo_state(&mut tracks);
            track
        };
        for mut clip in track.take_clips() {
            self.release_clip(&mut clip);
        }
        Ok(())
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.read().iter().map(Track::id).collect()
    }

    pub fn with_track<R>(&self, id: TrackId, f: impl FnOnce(&Track) -> R) -> Option<R> {
        self.tracks.read().iter().find(|t| t.id() == id).map(f)
    }

    pub fn with_track_mut<R>(&self, id: TrackId, f: impl FnOnce(&mut Track) -> R) -> Option<R> {
        self.tracks.write().iter_mut().find(|t| t.id() == id).map(f)
    }

    /// Change the order tracks are processed and listed in
    pub fn set_sort_index(&self, id: TrackId, index: usize) -> TlResult<()> {
        let mut tracks = self.tracks.write();
        let track = find_track_mut(&mut tracks, id)?;
        track.set_sort_index(index);
        tracks.sort_by_key(Track::sort_index);
        Ok(())
    }

    pub fn set_route(&self, id: TrackId, route: OutputRoute) -> TlResult<()> {
        let mut tracks = self.tracks.write();
        if let OutputRoute::Bus(bus) = route {
            if find_track_mut(&mut tracks, id)?.is_bus() {
                return Err(TlError::InvalidParam(format!("bus track {} always feeds master", id)));
            }
            let valid = bus != id && tracks.iter().any(|t| t.id() == bus && t.is_bus());
            if !valid {
                return Err(TlError::InvalidParam(format!("{} is not a bus track", bus)));
            }
        }
        find_track_mut(&mut tracks, id)?.set_route(route);
        update_solo_state(&mut tracks);
        Ok(())
    }

    pub fn arm_track(&self, id: TrackId, armed: bool) -> TlResult<()> {
        let mut tracks = self.tracks.write();
        if !find_track_mut(&mut tracks, id)?.set_armed(armed) {
            return Err(TlError::InvalidParam(format!("{} cannot record", id)));
        }
        Ok(())
    }

    /// Toggle solo. Soloing a bus solos the audio tracks feeding it.
    /// Returns the new solo state.
    pub fn solo_track(&self, id: TrackId) -> TlResult<bool> {
        let mut tracks = self.tracks.write();
        let track = find_track_mut(&mut tracks, id)?;
        let soloed = !track.is_soloed();
        track.set_soloed(soloed);

        if track.is_bus() {
            for other in tracks.iter_mut() {
                if other.route() == OutputRoute::Bus(id) {
                    other.set_soloed(soloed);
                }
            }
        }
        update_solo_state(&mut tracks);
        Ok(soloed)
    }

    /// End of the last clip on the timeline
    pub fn last_location(&self) -> TimeRef {
        self.tracks
            .read()
            .iter()
            .filter_map(Track::last_clip_end)
            .max()
            .unwrap_or(TimeRef::ZERO)
    }

    // ─── Clips ──────────────────────────────────────────────────────────────

    /// Import a file onto `track`, placed just after the track's last clip
    pub fn import_file<P: AsRef<Path>>(&self, track: TrackId, path: P) -> TlResult<ClipId> {
        let source = AudioSource::from_file(path.as_ref())?;
        log::info!(
            "[Session] importing {} ({} ch, {} Hz, {} frames)",
            path.as_ref().display(),
            source.channels(),
            source.sample_rate(),
            source.num_frames()
        );
        self.import_source(track, source)
    }

    /// Register `source` and place a clip for it after the last clip on `track`
    pub fn import_source(&self, track: TrackId, source: AudioSource) -> TlResult<ClipId> {
        let rate = self.sample_rate();
        let source = self.sources.insert(source);
        self.sources.acquire(source.id());

        let result = {
            let mut tracks = self.tracks.write();
            find_track_mut(&mut tracks, track).and_then(|t| {
                let start = t
                    .last_clip_end()
                    .map_or(TimeRef::ZERO, |end| end.add_frames(1, rate));
                self.place_clip(t, source.clone(), start)
            })
        };
        if result.is_err() {
            self.sources.release(source.id());
            return result;
        }
        self.peaks.request_build(&source);
        result
    }

    /// Add a clip for `source` at `start`
    pub fn add_clip(&self, track: TrackId, source: AudioSource, start: TimeRef) -> TlResult<ClipId> {
        let source = self.sources.insert(source);
        self.sources.acquire(source.id());
        let result = {
            let mut tracks = self.tracks.write();
            find_track_mut(&mut tracks, track).and_then(|t| self.place_clip(t, source.clone(), start))
        };
        if result.is_err() {
            self.sources.release(source.id());
            return result;
        }
        self.peaks.request_build(&source);
        result
    }

    /// Zero-channel clip of `length` at `start`
    pub fn insert_silence(&self, track: TrackId, start: TimeRef, length: TimeRef) -> TlResult<ClipId> {
        let rate = self.sample_rate();
        let frames = length.to_frame(rate);
        if frames <= 0 {
            return Err(TlError::InvalidParam("silence needs a positive length".to_string()));
        }
        self.add_clip(track, AudioSource::silence(frames as u64, rate), start)
    }

    fn place_clip(&self, track: &mut Track, source: Arc<AudioSource>, start: TimeRef) -> TlResult<ClipId> {
        if track.is_bus() {
            return Err(TlError::InvalidParam(format!("{} is a bus track", track.name())));
        }
        let mut clip = Clip::new(track.id(), source, start, self.block_size());
        clip.attach_stream(&self.disk, self.transport.position())?;
        track.add_clip(clip)
    }

    pub fn remove_clip(&self, track: TrackId, clip: ClipId) -> TlResult<()> {
        let mut removed = {
            let mut tracks = self.tracks.write();
            find_track_mut(&mut tracks, track)?
                .remove_clip(clip)
                .ok_or_else(|| TlError::InvalidParam(format!("no clip {} on {}", clip, track)))?
        };
        self.finishing.lock().remove(&clip);
        self.release_clip(&mut removed);
        Ok(())
    }

    /// Duplicate a clip, with all its edits, to `start` on the same track
    pub fn copy_clip(&self, track: TrackId, clip: ClipId, start: TimeRef) -> TlResult<ClipId> {
        let block_size = self.block_size();
        let position = self.transport.position();
        let mut tracks = self.tracks.write();
        let track = find_track_mut(&mut tracks, track)?;
        let mut copy = track
            .clip(clip)
            .ok_or_else(|| TlError::InvalidParam(format!("no clip {} on {}", clip, track.id())))?
            .create_copy(block_size)
            .ok_or_else(|| TlError::InvalidParam(format!("{} has no source", clip)))?;
        if !copy.set_track_start(start) {
            return Err(TlError::InvalidParam(format!("{} is locked", clip)));
        }
        let source = copy.source().cloned();
        copy.attach_stream(&self.disk, position)?;
        if let Some(source) = &source {
            self.sources.acquire(source.id());
        }
        track.add_clip(copy)
    }

    fn release_clip(&self, clip: &mut Clip) {
        if let Some(source) = clip.release(&self.disk, &self.sources) {
            self.peaks.remove_source(source.id());
        }
    }

    pub fn with_clip<R>(&self, track: TrackId, clip: ClipId, f: impl FnOnce(&Clip) -> R) -> Option<R> {
        let tracks = self.tracks.read();
        let track = tracks.iter().find(|t| t.id() == track)?;
        track.clip(clip).map(f)
    }

    /// Run an edit on a clip (trim, move, fades, gain, toggles)
    pub fn edit_clip<R>(&self, track: TrackId, clip: ClipId, f: impl FnOnce(&mut Clip) -> R) -> TlResult<R> {
        let mut tracks = self.tracks.write();
        let clip = find_track_mut(&mut tracks, track)?
            .clip_mut(clip)
            .ok_or_else(|| TlError::InvalidParam(format!("no clip {} on {}", clip, track)))?;
        Ok(f(clip))
    }

    /// Normalize a clip's peak to `target_db`. The measurement runs without
    /// holding the track lock.
    pub fn normalize_clip(&self, track: TrackId, clip: ClipId, target_db: f32) -> TlResult<NormalizeResult> {
        let range = self
            .with_clip(track, clip, Clip::normalize_range)
            .ok_or_else(|| TlError::InvalidParam(format!("no clip {} on {}", clip, track)))?;
        let Some((source, start, end)) = range else {
            return Ok(NormalizeResult::NoOp);
        };
        let max_amplitude = self.peaks.get_max_amplitude(&source, start, end)?;

        self.edit_clip(track, clip, |c| {
            let result = c.normalize_gain(max_amplitude, target_db);
            if let NormalizeResult::Changed(gain) = result {
                c.set_gain(gain);
            }
            result
        })
    }

    // ─── Transport (control thread) ─────────────────────────────────────────

    /// Start rolling at the current (or pending seek) position
    pub fn start_transport(&self) {
        let location = if self.transport.is_seeking() {
            self.transport.seek_target()
        } else {
            self.transport.position()
        };
        self.transport.post_request(TransportState::Starting, location);
    }

    pub fn stop_transport(&self) {
        let location = if self.transport.is_seeking() {
            self.transport.seek_target()
        } else {
            self.transport.position()
        };
        self.transport.post_request(TransportState::Stopped, location);
    }

    /// Stop from the control thread and wait for the audio thread to take
    /// the request. With no callback running the transition completes here.
    fn stop_and_wait(&self) {
        let transport = &self.transport;
        if transport.state() == TransportState::Stopped
            && transport.pending_request().is_none()
            && !transport.is_seeking()
        {
            return;
        }
        self.stop_transport();

        let deadline = Instant::now() + STOP_TIMEOUT;
        while transport.pending_request().is_some() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        if let Some(request) = transport.pending_request() {
            log::debug!("[Transport] no audio callback, stopping from the control thread");
            let request = TransportRequest {
                realtime: false,
                is_slave: false,
                ..request
            };
            if self.transport_control(request) {
                transport.clear_request(request.state);
            }
        }
    }

    /// Relocate. While a seek is in flight only the target moves.
    pub fn set_transport_pos(&self, location: TimeRef) {
        let location = location.max(TimeRef::ZERO);
        if !self.transport.initiate_seek_start(location) {
            log::debug!("[Transport] seek in flight, retargeted to {}", location);
        }
    }

    /// Toggle record mode. Refused while rolling and when nothing is armed.
    pub fn set_recordable(&self, recordable: bool) -> bool {
        if self.transport.is_rolling() {
            self.notify(SessionEvent::warning("Cannot change record mode while the transport is rolling"));
            return false;
        }
        if recordable && !self.tracks.read().iter().any(Track::is_armed) {
            self.notify(SessionEvent::critical("No track is armed for recording"));
            return false;
        }
        if !recordable && self.transport.is_ready_to_record() {
            self.finish_recordings();
        }
        self.transport.set_recordable(recordable);
        if !recordable {
            self.transport.reset_recording();
        }
        self.notify(SessionEvent::RecordingStateChanged(recordable));
        true
    }

    pub fn set_recordable_and_start_transport(&self) -> bool {
        if !self.set_recordable(true) {
            return false;
        }
        self.start_transport();
        true
    }

    /// Create recording clips on every armed track at the current position.
    /// Control thread only.
    pub fn prepare_recording(&self) -> TlResult<usize> {
        let location = self.transport.position();
        let directory = self.config.recording.directory.clone();
        let format = self.config.recording.format;

        let mut created = 0;
        {
            let mut tracks = self.tracks.write();
            for track in tracks.iter_mut() {
                match track.init_recording(&self.disk, location, &directory, format) {
                    Ok(Some(_)) => created += 1,
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("[Session] {} cannot record: {}", track.name(), e);
                        self.notify(SessionEvent::critical(format!("{}: {}", track.name(), e)));
                    }
                }
            }
        }

        if created == 0 {
            self.transport.set_recordable(false);
            self.transport.reset_recording();
            return Err(TlError::Recording("no armed track could start recording".to_string()));
        }
        log::info!("[Session] prepared {} recording clip(s) at {}", created, location);
        self.transport.set_ready_to_record(true);
        Ok(created)
    }

    fn finish_recordings(&self) {
        let mut finishing = Vec::new();
        for track in self.tracks.write().iter_mut() {
            finishing.extend(track.finish_recording());
        }
        self.finishing.lock().extend(finishing);
    }

    // ─── Transport state machine ────────────────────────────────────────────

    /// Drive one transport transition. Returns true once the transition is
    /// complete; callers repeat the same request until then. Only the
    /// non-slave `Rolling` request may touch non-RT-safe code.
    pub fn transport_control(&self, request: TransportRequest) -> bool {
        let transport = &self.transport;
        match request.state {
            TransportState::Stopped => {
                let was_running = transport.state() != TransportState::Stopped;
                transport.cancel_resume();
                if was_running {
                    transport.set_state(TransportState::Stopped);
                    self.events.push(EngineEvent::TransportStopped(transport.position()));
                }
                if transport.is_recording() || transport.is_ready_to_record() {
                    transport.reset_recording();
                    self.events.push(EngineEvent::RecordingStopped);
                }
                if request.location != transport.position() && !transport.is_seeking() {
                    transport.initiate_seek_start(request.location);
                }
                true
            }
            TransportState::Starting => {
                if transport.is_seeking() {
                    return false;
                }
                if request.location != transport.position() {
                    transport.initiate_seek_start(request.location);
                    return false;
                }
                if transport.is_recordable() && !transport.is_ready_to_record() {
                    if transport.request_prepare() {
                        self.events.push(EngineEvent::PrepareRecording);
                    }
                    return false;
                }
                transport.set_state(TransportState::Starting);
                true
            }
            TransportState::Rolling => {
                if transport.is_seeking() {
                    return false;
                }
                if transport.is_rolling() {
                    return true;
                }
                if !request.is_slave && transport.is_recordable() && !transport.is_ready_to_record() {
                    if let Err(e) = self.prepare_recording() {
                        self.notify(SessionEvent::critical(e.to_string()));
                    }
                }
                if transport.is_recordable() && transport.is_ready_to_record() {
                    transport.set_recording(true);
                }
                transport.set_state(TransportState::Rolling);
                self.events.push(EngineEvent::TransportStarted(transport.position()));
                true
            }
        }
    }

    fn start_seek(&self) {
        self.transport.begin_seek();
        self.disk.prepare_for_seek();
        self.events.push(EngineEvent::SeekStart);
    }

    // ─── Audio thread ───────────────────────────────────────────────────────

    /// Render one block into `output`. RT-safe: never blocks, never
    /// allocates. `input` is the device capture buffer, if any.
    pub fn process(&self, input: Option<&AudioBus>, output: &mut AudioBus, nframes: usize) {
        output.silence(nframes);
        let rate = self.sample_rate();

        if self.transport.take_start_seek() {
            self.start_seek();
        }

        if let Some(request) = self.transport.pending_request() {
            if self.transport_control(request) {
                if request.state == TransportState::Starting {
                    self.transport.advance_request(TransportState::Rolling);
                    if let Some(next) = self.transport.pending_request() {
                        if self.transport_control(next) {
                            self.transport.clear_request(next.state);
                        }
                    }
                } else {
                    self.transport.clear_request(request.state);
                }
            }
        }

        if !self.transport.is_rolling() {
            return;
        }

        let location = self.transport.position();
        if let Some(mut tracks) = self.tracks.try_write() {
            let nframes = nframes.min(self.block_size());
            if let Some(input) = input {
                if self.transport.is_recording() {
                    copy_input(&mut tracks, input, nframes);
                }
            }
            let ctx = ProcessContext {
                location,
                nframes,
                rate,
                realtime: true,
                events: &self.events,
            };
            mix_tracks(&mut tracks, &ctx, output);
            output.apply_gain(nframes, self.master_gain());
        }
        self.transport.advance(nframes, rate);
    }

    // ─── Control thread event handling ──────────────────────────────────────

    /// Handle everything the audio thread and the workers reported. Returns
    /// the notifications for observers.
    pub fn poll_events(&self) -> Vec<SessionEvent> {
        let mut underrun = false;
        let mut overrun = false;
        for event in self.events.drain() {
            match event {
                EngineEvent::SeekStart => self.disk.seek(self.transport.seek_target()),
                EngineEvent::PrepareRecording => {
                    if let Err(e) = self.prepare_recording() {
                        log::warn!("[Session] prepare recording failed: {}", e);
                        self.notify(SessionEvent::critical(e.to_string()));
                    }
                }
                EngineEvent::TransportStarted(location) => {
                    log::info!("[Transport] started at {}", location);
                    self.notify(SessionEvent::TransportStarted(location));
                }
                EngineEvent::TransportStopped(location) => {
                    log::info!("[Transport] stopped at {}", location);
                    self.notify(SessionEvent::TransportStopped(location));
                }
                EngineEvent::RecordingStopped => {
                    self.finish_recordings();
                    self.notify(SessionEvent::RecordingStateChanged(false));
                }
                EngineEvent::ReadUnderrun => underrun = true,
                EngineEvent::WriteOverrun => overrun = true,
            }
        }

        if self.transport.is_rolling() {
            if underrun {
                self.notify(SessionEvent::critical(READ_UNDERRUN_MESSAGE));
            }
            if overrun {
                self.notify(SessionEvent::critical(WRITE_OVERRUN_MESSAGE));
            }
        }

        for event in self.disk.poll_events() {
            self.handle_disk_event(event);
        }
        for event in self.peaks.poll_events() {
            self.notify(peak_notice(event));
        }

        std::mem::take(&mut *self.notices.lock())
    }

    /// Block up to `timeout` for a worker event, then poll
    pub fn wait_events(&self, timeout: Duration) -> Vec<SessionEvent> {
        if self.events_pending() {
            return self.poll_events();
        }
        if let Some(event) = self.disk.wait_event(timeout) {
            self.handle_disk_event(event);
        }
        self.poll_events()
    }

    fn events_pending(&self) -> bool {
        !self.notices.lock().is_empty()
    }

    fn handle_disk_event(&self, event: DiskEvent) {
        match event {
            DiskEvent::SeekFinished(location) => {
                let target = self.transport.seek_target();
                if location != target {
                    log::debug!("[Transport] seek to {} superseded by {}", location, target);
                    self.disk.seek(target);
                    return;
                }
                let resumed = self.transport.finish_seek(location);
                log::debug!("[Transport] seek finished at {} (resumed: {})", location, resumed);
                self.notify(SessionEvent::TransportPosSet(location));
            }
            DiskEvent::WriteFinished(clip) => self.recording_finished(clip),
            DiskEvent::Error(text) => {
                log::error!("[Session] disk error: {}", text);
                self.notify(SessionEvent::critical(text));
            }
        }
    }

    fn recording_finished(&self, clip_id: ClipId) {
        if !self.finishing.lock().remove(&clip_id) {
            log::debug!("[Session] ignoring finished write for unknown {}", clip_id);
            return;
        }

        let location = self.transport.position();
        let finished = {
            let mut tracks = self.tracks.write();
            tracks.iter_mut().find_map(|track| {
                let track_id = track.id();
                let clip = track.clip_mut(clip_id)?;
                Some((track_id, clip.finish_write_source(&self.disk, &self.sources, location)))
            })
        };

        match finished {
            Some((track, Ok(source))) => {
                self.peaks.request_build(&source);
                self.notify(SessionEvent::RecordingFinished { track, clip: clip_id });
            }
            Some((_, Err(e))) => {
                log::error!("[Session] finishing {} failed: {}", clip_id, e);
                self.notify(SessionEvent::critical(format!("Recording could not be finished: {}", e)));
            }
            None => {}
        }

        if self.finishing.lock().is_empty() {
            if let Some(path) = self.config.recording.autosave_path.clone() {
                match self.save_state(&path) {
                    Ok(()) => log::info!("[Session] autosaved to {}", path.display()),
                    Err(e) => self.notify(SessionEvent::warning(format!("Autosave failed: {}", e))),
                }
            }
        }
    }

    // ─── Device ─────────────────────────────────────────────────────────────

    /// The audio device changed rate or block size
    pub fn audiodevice_params_changed(&self, sample_rate: u32, block_size: usize) -> TlResult<()> {
        if sample_rate == 0 {
            return Err(TlError::InvalidSampleRate(sample_rate));
        }
        if block_size == 0 {
            return Err(TlError::InvalidParam("block size must be positive".to_string()));
        }

        if block_size != self.block_size() {
            let mut tracks = self.tracks.write();
            for track in tracks.iter_mut() {
                track.set_block_size(block_size);
            }
            self.block_size.store(block_size, Ordering::Release);
            log::info!("[Session] block size now {}", block_size);
        }

        if sample_rate != self.sample_rate() {
            self.rate.store(sample_rate, Ordering::Release);
            self.disk.output_rate_changed(sample_rate);
            // stale resampled data has to go: relocate one frame ahead
            let base = if self.transport.is_seeking() {
                self.transport.seek_target()
            } else {
                self.transport.position()
            };
            let location = base.add_frames(1, sample_rate);
            self.transport.initiate_seek_start(location);
            log::info!("[Session] sample rate now {}", sample_rate);
        }
        Ok(())
    }

    // ─── Export ─────────────────────────────────────────────────────────────

    /// Timeline range to export: soloed tracks if any, otherwise everything
    pub fn render_range(&self) -> Option<(TimeRef, TimeRef)> {
        let tracks = self.tracks.read();
        let any_solo = tracks.iter().any(|t| !t.is_bus() && t.is_soloed());
        tracks
            .iter()
            .filter(|t| !t.is_bus() && (!any_solo || t.is_soloed()))
            .filter_map(Track::render_range)
            .reduce(|(s1, e1), (s2, e2)| (s1.min(s2), e1.max(e2)))
    }

    /// Render to a file through the offline path. Stops a rolling transport.
    pub fn export(&self, spec: &mut ExportSpec) -> TlResult<()> {
        if spec.start.is_none() || spec.end.is_none() {
            let (start, end) = self.render_range().unwrap_or((TimeRef::ZERO, TimeRef::ZERO));
            spec.start.get_or_insert(start);
            spec.end.get_or_insert(end);
        }
        if let Err(e) = export::validate(spec) {
            self.notify(SessionEvent::warning(e.to_string()));
            return Err(e);
        }

        self.stop_and_wait();

        log::info!("[Export] rendering to {}", spec.path.display());
        let rate = spec.sample_rate;
        let block_size = self.block_size();
        let master_gain = self.master_gain();
        let events = EventQueue::new();

        let mut tracks = self.tracks.write();
        let mut prepared = Ok(());
        for track in tracks.iter_mut() {
            track.set_block_size(spec.block_size);
            for clip in track.clips_mut() {
                if let Err(e) = clip.prepare_direct(rate) {
                    prepared = Err(e);
                }
            }
        }

        let result = prepared.and_then(|_| {
            export::render(
                spec,
                |location, nframes, master| {
                    let ctx = ProcessContext {
                        location,
                        nframes,
                        rate,
                        realtime: false,
                        events: &events,
                    };
                    mix_tracks(&mut tracks, &ctx, master);
                    master.apply_gain(nframes, master_gain);
                },
                |percent| self.notify(SessionEvent::ExportProgress(percent)),
            )
        });

        for track in tracks.iter_mut() {
            for clip in track.clips_mut() {
                clip.release_direct();
            }
            track.set_block_size(block_size);
        }
        if let Err(e) = &result {
            log::error!("[Export] failed: {}", e);
        }
        result
    }

    // ─── State ──────────────────────────────────────────────────────────────

    pub fn get_state(&self) -> SessionState {
        let tracks = self.tracks.read();
        SessionState {
            sample_rate: self.sample_rate(),
            position: self.transport.position(),
            master_gain: self.master_gain(),
            sources: self.sources.states(),
            tracks: tracks.iter().map(Track::get_state).collect(),
        }
    }

    /// Replace every track with the saved ones. Sources that cannot be
    /// reopened are reported and their clips skipped.
    pub fn set_state(&self, state: &SessionState) -> TlResult<()> {
        self.stop_and_wait();

        let old = std::mem::take(&mut *self.tracks.write());
        for mut track in old {
            for mut clip in track.take_clips() {
                self.release_clip(&mut clip);
            }
        }

        let mut restored = std::collections::HashMap::new();
        for source_state in &state.sources {
            match self.sources.restore(source_state) {
                Ok(source) => {
                    restored.insert(source_state.id, source);
                }
                Err(e) => {
                    log::warn!("[Session] cannot restore source {}: {}", source_state.name, e);
                    self.notify(SessionEvent::warning(format!("Missing source {}: {}", source_state.name, e)));
                }
            }
        }

        let position = state.position.max(TimeRef::ZERO);
        self.transport.set_position(position);
        self.set_master_gain(state.master_gain);

        let block_size = self.block_size();
        let mut tracks = Vec::with_capacity(state.tracks.len());
        for track_state in &state.tracks {
            let mut track = Track::from_state(track_state, block_size);
            for clip_state in &track_state.clips {
                let Some(source) = restored.get(&clip_state.source).cloned() else {
                    continue;
                };
                self.sources.acquire(source.id());
                let mut clip = Clip::from_state(track.id(), clip_state, source.clone(), block_size);
                if let Err(e) = clip.attach_stream(&self.disk, position) {
                    log::warn!("[Session] clip {} has no stream: {}", clip.id(), e);
                }
                track.add_clip(clip)?;
                self.peaks.request_build(&source);
            }
            tracks.push(track);
        }
        tracks.sort_by_key(Track::sort_index);
        update_solo_state(&mut tracks);
        *self.tracks.write() = tracks;

        log::info!("[Session] restored {} track(s)", state.tracks.len());
        Ok(())
    }

    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> TlResult<()> {
        let json = serde_json::to_string_pretty(&self.get_state())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_state<P: AsRef<Path>>(&self, path: P) -> TlResult<()> {
        let json = std::fs::read_to_string(path)?;
        let state: SessionState = serde_json::from_str(&json)?;
        self.set_state(&state)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let tracks = std::mem::take(&mut *self.tracks.write());
        for mut track in tracks {
            for mut clip in track.take_clips() {
                clip.release(&self.disk, &self.sources);
            }
        }
        log::debug!("[Session] closed");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MIXING
// ═══════════════════════════════════════════════════════════════════════════

/// Audio tracks into their bus or master, then bus tracks into master
fn mix_tracks(tracks: &mut [Track], ctx: &ProcessContext, output: &mut AudioBus) {
    let nframes = ctx.nframes;
    for track in tracks.iter_mut() {
        track.begin_block(nframes);
    }

    for i in 0..tracks.len() {
        if tracks[i].is_bus() {
            continue;
        }
        tracks[i].process(ctx);
        tracks[i].apply_gain_pan(nframes);

        let dest = match tracks[i].route() {
            OutputRoute::Master => None,
            OutputRoute::Bus(id) => tracks.iter().position(|t| t.id() == id && t.is_bus()),
        };
        match dest {
            Some(j) => mix_track_into(tracks, i, j, nframes),
            None => output.mix_from(tracks[i].process_bus(), nframes),
        }
    }

    for track in tracks.iter_mut().filter(|t| t.is_bus()) {
        track.apply_gain_pan(nframes);
        output.mix_from(track.process_bus(), nframes);
    }
}

fn mix_track_into(tracks: &mut [Track], src: usize, dst: usize, nframes: usize) {
    if src < dst {
        let (head, tail) = tracks.split_at_mut(dst);
        tail[0].process_bus_mut().mix_from(head[src].process_bus(), nframes);
    } else {
        let (head, tail) = tracks.split_at_mut(src);
        head[dst].process_bus_mut().mix_from(tail[0].process_bus(), nframes);
    }
}

/// Device input into the input bus of every armed track
fn copy_input(tracks: &mut [Track], input: &AudioBus, nframes: usize) {
    if input.channel_count() == 0 {
        return;
    }
    let n = nframes.min(input.frames());
    for track in tracks.iter_mut().filter(|t| t.is_armed()) {
        let Some(bus) = track.input_bus_mut() else {
            continue;
        };
        let n = n.min(bus.frames());
        for ch in 0..bus.channel_count() {
            let src = input.channel(ch.min(input.channel_count() - 1));
            bus.channel_mut(ch)[..n].copy_from_slice(&src[..n]);
        }
    }
}

/// Recompute solo muting. Bus tracks fed by a soloed track stay audible.
fn update_solo_state(tracks: &mut [Track]) {
    let any_solo = tracks.iter().any(Track::is_soloed);
    let feeding: Vec<TrackId> = tracks
        .iter()
        .filter(|t| t.is_soloed())
        .filter_map(|t| match t.route() {
            OutputRoute::Bus(id) => Some(id),
            OutputRoute::Master => None,
        })
        .collect();
    for track in tracks.iter_mut() {
        let muted = any_solo && !track.is_soloed() && !feeding.contains(&track.id());
        track.set_muted_by_solo(muted);
    }
}

fn find_track_mut(tracks: &mut [Track], id: TrackId) -> TlResult<&mut Track> {
    tracks
        .iter_mut()
        .find(|t| t.id() == id)
        .ok_or_else(|| TlError::InvalidParam(format!("no track {}", id)))
}

fn peak_notice(event: PeakEvent) -> SessionEvent {
    match event {
        PeakEvent::Progress { source, channel, percent } => SessionEvent::PeakProgress { source, channel, percent },
        PeakEvent::Finished { source, channel } => SessionEvent::PeakFinished { source, channel },
        PeakEvent::Failed { source, channel, error } => SessionEvent::PeakFailed { source, channel, error },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.peaks.directory = dir.join("peaks");
        config.recording.directory = dir.join("recordings");
        config.audio.buffer_size = 256;
        config
    }

    #[test]
    fn test_solo_propagates_through_bus() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(test_config(dir.path())).unwrap();
        let bus = session.add_track(TrackKind::Bus, "Drum Bus");
        let kick = session.add_track(TrackKind::Audio, "Kick");
        let vox = session.add_track(TrackKind::Audio, "Vox");
        session.set_route(kick, OutputRoute::Bus(bus)).unwrap();

        assert!(session.solo_track(bus).unwrap());
        assert_eq!(session.with_track(kick, Track::is_soloed), Some(true));
        assert_eq!(session.with_track(vox, Track::is_muted_by_solo), Some(true));
        assert_eq!(session.with_track(kick, Track::is_muted_by_solo), Some(false));

        // tracks added while something is soloed start muted
        let late = session.add_track(TrackKind::Audio, "Late");
        assert_eq!(session.with_track(late, Track::is_muted_by_solo), Some(true));

        assert!(!session.solo_track(bus).unwrap());
        assert_eq!(session.with_track(vox, Track::is_muted_by_solo), Some(false));
        assert_eq!(session.with_track(late, Track::is_muted_by_solo), Some(false));
    }

    #[test]
    fn test_soloed_track_keeps_its_bus_audible() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(test_config(dir.path())).unwrap();
        let bus = session.add_track(TrackKind::Bus, "FX");
        let gtr = session.add_track(TrackKind::Audio, "Gtr");
        session.set_route(gtr, OutputRoute::Bus(bus)).unwrap();
        session.solo_track(gtr).unwrap();
        assert_eq!(session.with_track(bus, Track::is_muted_by_solo), Some(false));
    }

    #[test]
    fn test_recordable_needs_armed_track() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(test_config(dir.path())).unwrap();
        let track = session.add_track(TrackKind::Audio, "Mic");
        assert!(!session.set_recordable(true));
        let events = session.poll_events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Message { severity: crate::notify::Severity::Critical, .. }
        )));

        session.arm_track(track, true).unwrap();
        assert!(session.set_recordable(true));
        assert!(session.transport().is_recordable());
    }

    #[test]
    fn test_route_to_audio_track_refused() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(test_config(dir.path())).unwrap();
        let a = session.add_track(TrackKind::Audio, "A");
        let b = session.add_track(TrackKind::Audio, "B");
        assert!(session.set_route(a, OutputRoute::Bus(b)).is_err());
    }

    #[test]
    fn test_bus_cannot_feed_another_bus() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(test_config(dir.path())).unwrap();
        let drums = session.add_track(TrackKind::Bus, "Drums");
        let group = session.add_track(TrackKind::Bus, "Group");
        assert!(session.set_route(drums, OutputRoute::Bus(group)).is_err());
        assert_eq!(session.with_track(drums, Track::route), Some(OutputRoute::Master));
        assert!(session.set_route(drums, OutputRoute::Master).is_ok());
    }

    #[test]
    fn test_restored_bus_routes_to_master() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(test_config(dir.path())).unwrap();
        let a = session.add_track(TrackKind::Bus, "A");
        let b = session.add_track(TrackKind::Bus, "B");
        let mut state = session.get_state();
        let saved = state.tracks.iter_mut().find(|t| t.id == a).unwrap();
        saved.route = OutputRoute::Bus(b);

        session.set_state(&state).unwrap();
        assert_eq!(session.with_track(a, Track::route), Some(OutputRoute::Master));
    }

    #[test]
    fn test_removing_bus_reroutes_feeders() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(test_config(dir.path())).unwrap();
        let bus = session.add_track(TrackKind::Bus, "FX");
        let gtr = session.add_track(TrackKind::Audio, "Gtr");
        session.set_route(gtr, OutputRoute::Bus(bus)).unwrap();
        session.solo_track(bus).unwrap();

        session.remove_track(bus).unwrap();
        assert_eq!(session.track_ids(), vec![gtr]);
        assert_eq!(session.with_track(gtr, Track::route), Some(OutputRoute::Master));
        assert!(session.remove_track(bus).is_err());
    }

    #[test]
    fn test_stop_without_callback_completes_on_control_thread() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(test_config(dir.path())).unwrap();
        session.add_track(TrackKind::Audio, "Idle");
        let mut output = AudioBus::new(2, 256);
        session.start_transport();
        session.process(None, &mut output, 256);
        assert!(session.transport().is_rolling());

        // nothing calls process from here on
        session.stop_and_wait();
        assert_eq!(session.transport().state(), TransportState::Stopped);
        assert!(session.transport().pending_request().is_none());
        let events = session.poll_events();
        assert!(events.iter().any(|e| matches!(e, SessionEvent::TransportStopped(_))));
    }
}
