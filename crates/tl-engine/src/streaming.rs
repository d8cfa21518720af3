//! Disk Streaming
//!
//! Decouples file I/O from the audio thread:
//! - Each playing clip owns a [`ReadStream`]: a ring buffer the disk worker
//!   keeps filled ahead of the play position
//! - Each recording clip owns a [`WriteStream`]: a ring buffer the audio
//!   thread fills and the disk worker drains into a WAV file
//! - One `disk-io` worker thread does every blocking read, write and seek
//!
//! The audio thread only touches atomics and ring buffers. When data is not
//! there it gets fewer frames and the shortfall is reported, never waited on.

use std::cell::UnsafeCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tl_core::{EngineConfig, SampleFormat, TimeRef, TlError, TlResult};
use tl_file::{AudioReader, ResampleReader, WavFileWriter};

use crate::bus::AudioBus;
use crate::ids::ClipId;
use crate::source::AudioSource;

// ═══════════════════════════════════════════════════════════════════════════
// RING BUFFER
// ═══════════════════════════════════════════════════════════════════════════

/// Lock-free SPSC ring buffer for interleaved audio
pub struct AudioRingBuffer {
    data: Box<[UnsafeCell<f32>]>,
    capacity_frames: usize,
    channels: usize,
    /// Producer cursor, frames
    write_pos: AtomicUsize,
    /// Consumer cursor, frames
    read_pos: AtomicUsize,
}

// SAFETY: single producer and single consumer. Each side writes only the
// region between its own cursor and the other side's cursor.
unsafe impl Send for AudioRingBuffer {}
unsafe impl Sync for AudioRingBuffer {}

impl AudioRingBuffer {
    pub fn new(capacity_frames: usize, channels: usize) -> Self {
        let capacity_frames = capacity_frames.max(2);
        let channels = channels.max(1);
        let data = (0..capacity_frames * channels)
            .map(|_| UnsafeCell::new(0.0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            data,
            capacity_frames,
            channels,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity_frames
    }

    #[inline]
    pub fn available_read(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        (w + self.capacity_frames - r) % self.capacity_frames
    }

    /// Leaves a 1 frame gap to distinguish full from empty
    #[inline]
    pub fn available_write(&self) -> usize {
        self.capacity_frames - 1 - self.available_read()
    }

    #[inline]
    fn load(&self, idx: usize) -> f32 {
        // SAFETY: idx is inside the readable region owned by the caller
        unsafe { *self.data[idx].get() }
    }

    #[inline]
    fn store(&self, idx: usize, value: f32) {
        // SAFETY: idx is inside the writable region owned by the caller
        unsafe { *self.data[idx].get() = value }
    }

    /// Consumer: read into `dest` channels starting at `offset`.
    /// Returns frames read.
    pub fn read_planar(&self, dest: &mut AudioBus, offset: usize, frames: usize) -> usize {
        let frames = frames.min(dest.frames().saturating_sub(offset));
        let to_read = frames.min(self.available_read());
        if to_read == 0 {
            return 0;
        }

        let r = self.read_pos.load(Ordering::Relaxed);
        let ch = self.channels;
        let out_channels = dest.channel_count().min(ch);
        for c in 0..out_channels {
            let out = &mut dest.channel_mut(c)[offset..offset + to_read];
            for (i, sample) in out.iter_mut().enumerate() {
                let idx = (r + i) % self.capacity_frames;
                *sample = self.load(idx * ch + c);
            }
        }

        self.read_pos.store((r + to_read) % self.capacity_frames, Ordering::Release);
        to_read
    }

    /// Consumer: read interleaved
    pub fn read(&self, output: &mut [f32], frames: usize) -> usize {
        let ch = self.channels;
        let to_read = frames.min(output.len() / ch).min(self.available_read());
        if to_read == 0 {
            return 0;
        }

        let r = self.read_pos.load(Ordering::Relaxed);
        for i in 0..to_read {
            let idx = (r + i) % self.capacity_frames;
            for c in 0..ch {
                output[i * ch + c] = self.load(idx * ch + c);
            }
        }

        self.read_pos.store((r + to_read) % self.capacity_frames, Ordering::Release);
        to_read
    }

    /// Producer: write interleaved
    pub fn write(&self, input: &[f32], frames: usize) -> usize {
        let ch = self.channels;
        let to_write = frames.min(input.len() / ch).min(self.available_write());
        if to_write == 0 {
            return 0;
        }

        let w = self.write_pos.load(Ordering::Relaxed);
        for i in 0..to_write {
            let idx = (w + i) % self.capacity_frames;
            for c in 0..ch {
                self.store(idx * ch + c, input[i * ch + c]);
            }
        }

        self.write_pos.store((w + to_write) % self.capacity_frames, Ordering::Release);
        to_write
    }

    /// Producer: write from planar channels. Missing source channels are
    /// filled from channel 0.
    pub fn write_planar(&self, src: &AudioBus, frames: usize) -> usize {
        if src.channel_count() == 0 {
            return 0;
        }
        let to_write = frames.min(src.frames()).min(self.available_write());
        if to_write == 0 {
            return 0;
        }

        let w = self.write_pos.load(Ordering::Relaxed);
        let ch = self.channels;
        for c in 0..ch {
            let input = src.channel(if c < src.channel_count() { c } else { 0 });
            for (i, &sample) in input[..to_write].iter().enumerate() {
                let idx = (w + i) % self.capacity_frames;
                self.store(idx * ch + c, sample);
            }
        }

        self.write_pos.store((w + to_write) % self.capacity_frames, Ordering::Release);
        to_write
    }

    /// Empty the buffer. Only valid while the other side is known idle.
    pub fn reset(&self) {
        self.write_pos.store(0, Ordering::Release);
        self.read_pos.store(0, Ordering::Release);
    }
}

/// Source frame (at `rate`) a clip plays when the transport is at `location`.
///
/// Works on whole frames so consecutive blocks map to consecutive source
/// frames whatever the sub-frame placement of the clip.
#[inline]
pub fn source_frame_at(location: TimeRef, track_start: TimeRef, source_start: TimeRef, rate: u32) -> i64 {
    let start = source_start.to_frame(rate);
    start + (location.to_frame(rate) - track_start.to_frame(rate)).max(0)
}

// ═══════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════

struct DiskShared {
    /// Set by `prepare_for_seek`, cleared once the worker completed the seek
    seek_pending: AtomicBool,
    output_rate: AtomicU32,
}

// ═══════════════════════════════════════════════════════════════════════════
// READ STREAM
// ═══════════════════════════════════════════════════════════════════════════

/// Result of one [`ReadStream::rb_read`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamRead {
    /// Frames placed in the destination
    pub frames: usize,
    /// Frames left silent before them while the play position catches up
    /// with a refill made ahead of it
    pub skipped: usize,
    /// The ring ran dry while in sync
    pub underrun: bool,
}

/// Playback side of one clip
pub struct ReadStream {
    clip: ClipId,
    ring: AudioRingBuffer,
    shared: Arc<DiskShared>,
    /// Source-space frame (output rate) of the next frame in the ring
    rb_read_pos: AtomicI64,
    need_sync: AtomicBool,
    sync_pos: AtomicI64,
    track_start: AtomicI64,
    source_start: AtomicI64,
    source_end: AtomicI64,
    /// How far ahead of the play position a resync while rolling refills
    resync_lead: i64,
    underruns: AtomicU64,
}

impl ReadStream {
    fn new(clip: ClipId, channels: usize, capacity: usize, shared: Arc<DiskShared>) -> Self {
        Self {
            resync_lead: (capacity / 8) as i64,
            clip,
            ring: AudioRingBuffer::new(capacity, channels),
            shared,
            rb_read_pos: AtomicI64::new(0),
            need_sync: AtomicBool::new(true),
            sync_pos: AtomicI64::new(0),
            track_start: AtomicI64::new(0),
            source_start: AtomicI64::new(0),
            source_end: AtomicI64::new(0),
            underruns: AtomicU64::new(0),
        }
    }

    pub fn clip(&self) -> ClipId {
        self.clip
    }

    pub fn channels(&self) -> usize {
        self.ring.channels()
    }

    /// RT: copy `count` frames for source frame `position` (output rate) into
    /// `dest` at `offset`.
    ///
    /// When the buffer is behind `position` (or implausibly far ahead) the
    /// worker is asked to refill from a point ahead of it, and playback
    /// resumes once the transport reaches that point. The audio thread never
    /// touches the ring while a refill is pending.
    pub fn rb_read(&self, dest: &mut AudioBus, offset: usize, position: i64, count: usize) -> StreamRead {
        if self.shared.seek_pending.load(Ordering::Acquire) || self.need_sync.load(Ordering::Acquire) {
            return StreamRead::default();
        }

        let expected = self.rb_read_pos.load(Ordering::Acquire);
        let lead = expected - position;
        if lead < 0 || lead > self.resync_lead {
            self.request_sync(position + self.resync_lead);
            return StreamRead::default();
        }

        let skipped = lead as usize;
        if skipped >= count {
            return StreamRead { frames: 0, skipped: count, underrun: false };
        }
        let want = count - skipped;
        let got = self.ring.read_planar(dest, offset + skipped, want);
        self.rb_read_pos.store(expected + got as i64, Ordering::Release);
        let underrun = got < want;
        if underrun {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        StreamRead { frames: got, skipped, underrun }
    }

    /// Ask the worker to refill from `position` (source-space frame at the
    /// output rate). The audio thread stays off the ring until it is done.
    pub fn request_sync(&self, position: i64) {
        self.sync_pos.store(position, Ordering::Release);
        self.need_sync.store(true, Ordering::Release);
    }

    pub fn is_synced(&self) -> bool {
        !self.need_sync.load(Ordering::Acquire)
    }

    pub fn buffered_frames(&self) -> usize {
        self.ring.available_read()
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Clip placement, used to map a transport location to a source frame
    pub fn set_geometry(&self, track_start: TimeRef, source_start: TimeRef, source_end: TimeRef) {
        self.track_start.store(track_start.universal_frame(), Ordering::Release);
        self.source_start.store(source_start.universal_frame(), Ordering::Release);
        self.source_end.store(source_end.universal_frame(), Ordering::Release);
    }

    /// Source frame the clip needs when the transport is at `location`
    pub fn frame_for_location(&self, location: TimeRef, rate: u32) -> i64 {
        let track_start = TimeRef::from_universal(self.track_start.load(Ordering::Acquire));
        let source_start = TimeRef::from_universal(self.source_start.load(Ordering::Acquire));
        source_frame_at(location, track_start, source_start, rate)
    }

    fn source_end_frame(&self, rate: u32) -> i64 {
        TimeRef::from_universal(self.source_end.load(Ordering::Acquire)).to_frame(rate)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITE STREAM
// ═══════════════════════════════════════════════════════════════════════════

/// Capture side of one recording clip
pub struct WriteStream {
    clip: ClipId,
    ring: AudioRingBuffer,
    path: PathBuf,
    accepting: AtomicBool,
    overruns: AtomicU64,
}

impl WriteStream {
    pub fn clip(&self) -> ClipId {
        self.clip
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channels(&self) -> usize {
        self.ring.channels()
    }

    /// RT: queue `frames` frames of `bus` for the file. Returns frames queued.
    pub fn rb_write(&self, bus: &AudioBus, frames: usize) -> usize {
        if !self.accepting.load(Ordering::Acquire) {
            return 0;
        }
        let written = self.ring.write_planar(bus, frames);
        if written < frames {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
        written
    }

    /// No more input; the worker finalizes once the buffer is drained
    pub fn set_recording(&self, recording: bool) {
        self.accepting.store(recording, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DISK WORKER
// ═══════════════════════════════════════════════════════════════════════════

/// Notifications from the disk worker
#[derive(Debug, Clone, PartialEq)]
pub enum DiskEvent {
    /// All read streams are filled at this location
    SeekFinished(TimeRef),
    /// The file of this recording clip is complete on disk
    WriteFinished(ClipId),
    Error(String),
}

enum DiskCommand {
    RegisterRead(Arc<ReadStream>, Box<dyn AudioReader>),
    UnregisterRead(ClipId),
    RegisterWrite(Arc<WriteStream>, WavFileWriter),
    Seek(TimeRef),
    OutputRateChanged(u32),
    Shutdown,
}

struct ReadEntry {
    stream: Arc<ReadStream>,
    reader: ResampleReader,
    fill_pos: i64,
}

impl ReadEntry {
    /// Reset the ring and refill from `target`. Callers guarantee the audio
    /// thread is off the ring: either `need_sync` or the shared
    /// `seek_pending` is set.
    fn sync(&mut self, target: i64, rate: u32, chunk: usize, scratch: &mut Vec<f32>) {
        let target = target.max(0);
        if !self.reader.seek(target as u64) {
            log::debug!("[DiskIo] {} sync past end of source ({})", self.stream.clip, target);
        }
        self.stream.ring.reset();
        self.fill_pos = target;
        self.stream.rb_read_pos.store(target, Ordering::Release);
        self.fill(rate, chunk, usize::MAX, scratch);
        self.stream.need_sync.store(false, Ordering::Release);
    }

    fn fill(&mut self, rate: u32, chunk: usize, max_frames: usize, scratch: &mut Vec<f32>) -> usize {
        let ch = self.stream.ring.channels();
        let end = self.stream.source_end_frame(rate).min(self.reader.num_frames() as i64);
        let mut moved = 0;

        while moved < max_frames {
            let free = self.stream.ring.available_write();
            let remaining = (end - self.fill_pos).max(0) as usize;
            let want = free.min(chunk).min(remaining).min(max_frames - moved);
            if want == 0 {
                break;
            }
            if scratch.len() < want * ch {
                scratch.resize(want * ch, 0.0);
            }
            let got = self.reader.read(&mut scratch[..want * ch], want);
            if got == 0 {
                break;
            }
            self.stream.ring.write(&scratch[..got * ch], got);
            self.fill_pos += got as i64;
            moved += got;
        }
        moved
    }
}

struct WriteEntry {
    stream: Arc<WriteStream>,
    writer: WavFileWriter,
}

impl WriteEntry {
    /// Returns true when the entry is done and can be dropped
    fn drain(&mut self, chunk: usize, scratch: &mut Vec<f32>, events: &Sender<DiskEvent>) -> bool {
        let ch = self.stream.ring.channels();
        if scratch.len() < chunk * ch {
            scratch.resize(chunk * ch, 0.0);
        }

        // Sample `accepting` before draining so frames pushed just before
        // the stop are still written.
        let stopping = !self.stream.is_recording();
        loop {
            let got = self.stream.ring.read(&mut scratch[..chunk * ch], chunk);
            if got == 0 {
                break;
            }
            if let Err(e) = self.writer.write(&scratch[..got * ch], got) {
                log::error!("[DiskIo] write to {} failed: {}", self.writer.path().display(), e);
                let _ = events.send(DiskEvent::Error(format!("Write to {} failed: {}", self.writer.path().display(), e)));
                self.stream.set_recording(false);
                break;
            }
        }

        if stopping && self.stream.ring.available_read() == 0 {
            if let Err(e) = self.writer.finalize() {
                let _ = events.send(DiskEvent::Error(format!("Finalizing {} failed: {}", self.writer.path().display(), e)));
            }
            log::info!(
                "[DiskIo] {} finished recording {} ({} frames)",
                self.stream.clip,
                self.writer.path().display(),
                self.writer.frames_written()
            );
            let _ = events.send(DiskEvent::WriteFinished(self.stream.clip));
            return true;
        }
        false
    }
}

struct DiskWorker {
    shared: Arc<DiskShared>,
    commands: Receiver<DiskCommand>,
    events: Sender<DiskEvent>,
    reads: Vec<ReadEntry>,
    writes: Vec<WriteEntry>,
    chunk: usize,
    poll: Duration,
    scratch: Vec<f32>,
}

impl DiskWorker {
    fn run(mut self) {
        log::debug!("[DiskIo] worker started");
        loop {
            match self.commands.recv_timeout(self.poll) {
                Ok(DiskCommand::Shutdown) => break,
                Ok(cmd) => {
                    self.handle(cmd);
                    // Handle everything already queued before servicing
                    while let Ok(cmd) = self.commands.try_recv() {
                        if matches!(cmd, DiskCommand::Shutdown) {
                            self.finish_writes();
                            return;
                        }
                        self.handle(cmd);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.service();
        }
        self.finish_writes();
        log::debug!("[DiskIo] worker stopped");
    }

    fn rate(&self) -> u32 {
        self.shared.output_rate.load(Ordering::Acquire)
    }

    fn handle(&mut self, cmd: DiskCommand) {
        let rate = self.rate();
        match cmd {
            DiskCommand::RegisterRead(stream, reader) => {
                let mut entry = ReadEntry {
                    stream,
                    reader: ResampleReader::new(reader, rate),
                    fill_pos: 0,
                };
                let target = entry.stream.sync_pos.load(Ordering::Acquire);
                entry.sync(target, rate, self.chunk, &mut self.scratch);
                self.reads.push(entry);
            }
            DiskCommand::UnregisterRead(clip) => {
                self.reads.retain(|e| e.stream.clip != clip);
            }
            DiskCommand::RegisterWrite(stream, writer) => {
                self.writes.push(WriteEntry { stream, writer });
            }
            DiskCommand::Seek(location) => {
                for entry in &mut self.reads {
                    let target = entry.stream.frame_for_location(location, rate);
                    entry.sync(target, rate, self.chunk, &mut self.scratch);
                }
                self.shared.seek_pending.store(false, Ordering::Release);
                log::debug!("[DiskIo] seek finished at {}", location);
                let _ = self.events.send(DiskEvent::SeekFinished(location));
            }
            DiskCommand::OutputRateChanged(new_rate) => {
                // buffered data stays stale until the seek that follows a
                // rate change refills every stream
                self.shared.output_rate.store(new_rate, Ordering::Release);
                for entry in &mut self.reads {
                    entry.reader.set_output_rate(new_rate);
                }
            }
            DiskCommand::Shutdown => {}
        }
    }

    fn service(&mut self) {
        let rate = self.rate();
        for entry in &mut self.reads {
            if entry.stream.need_sync.load(Ordering::Acquire) {
                let target = entry.stream.sync_pos.load(Ordering::Acquire);
                entry.sync(target, rate, self.chunk, &mut self.scratch);
            } else {
                entry.fill(rate, self.chunk, self.chunk * 4, &mut self.scratch);
            }
        }

        let chunk = self.chunk;
        let scratch = &mut self.scratch;
        let events = &self.events;
        self.writes.retain_mut(|entry| !entry.drain(chunk, scratch, events));
    }

    fn finish_writes(&mut self) {
        for entry in &mut self.writes {
            entry.stream.set_recording(false);
        }
        let chunk = self.chunk;
        let scratch = &mut self.scratch;
        let events = &self.events;
        self.writes.retain_mut(|entry| !entry.drain(chunk, scratch, events));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DISK IO
// ═══════════════════════════════════════════════════════════════════════════

/// Owner of the disk worker and the streams it services
pub struct DiskIo {
    shared: Arc<DiskShared>,
    commands: Sender<DiskCommand>,
    events: Receiver<DiskEvent>,
    worker: Option<JoinHandle<()>>,
    config: EngineConfig,
}

impl DiskIo {
    pub fn new(config: &EngineConfig, output_rate: u32) -> TlResult<Self> {
        let shared = Arc::new(DiskShared {
            seek_pending: AtomicBool::new(false),
            output_rate: AtomicU32::new(output_rate),
        });
        let (cmd_tx, cmd_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let worker = DiskWorker {
            shared: shared.clone(),
            commands: cmd_rx,
            events: event_tx,
            reads: Vec::new(),
            writes: Vec::new(),
            chunk: config.disk.chunk_frames,
            poll: Duration::from_millis(config.disk.poll_interval_ms.max(1)),
            scratch: Vec::new(),
        };

        let handle = std::thread::Builder::new()
            .name("disk-io".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                log::error!("[DiskIo] Failed to spawn worker thread: {}", e);
                TlError::Io(e)
            })?;

        Ok(Self {
            shared,
            commands: cmd_tx,
            events: event_rx,
            worker: Some(handle),
            config: config.clone(),
        })
    }

    pub fn output_rate(&self) -> u32 {
        self.shared.output_rate.load(Ordering::Acquire)
    }

    /// Create the playback stream for a clip. The stream is primed for
    /// transport `location` before the worker starts serving it.
    pub fn register_read_source(
        &self,
        clip: ClipId,
        source: &AudioSource,
        geometry: (TimeRef, TimeRef, TimeRef),
        location: TimeRef,
    ) -> TlResult<Arc<ReadStream>> {
        let reader = source.open_reader()?;
        let rate = self.output_rate();
        let capacity = self.config.read_buffer_frames(rate);
        let stream = Arc::new(ReadStream::new(clip, source.channels(), capacity, self.shared.clone()));
        stream.set_geometry(geometry.0, geometry.1, geometry.2);
        stream.request_sync(stream.frame_for_location(location, rate));

        self.send(DiskCommand::RegisterRead(stream.clone(), reader))?;
        Ok(stream)
    }

    pub fn unregister_read_source(&self, clip: ClipId) {
        let _ = self.send(DiskCommand::UnregisterRead(clip));
    }

    /// Create the capture stream and output file for a recording clip
    pub fn register_write_source(
        &self,
        clip: ClipId,
        path: &Path,
        channels: usize,
        format: SampleFormat,
    ) -> TlResult<Arc<WriteStream>> {
        let rate = self.output_rate();
        let writer = WavFileWriter::create(path, channels, rate, format)?;
        let stream = Arc::new(WriteStream {
            clip,
            ring: AudioRingBuffer::new(self.config.write_buffer_frames(rate), channels),
            path: path.to_path_buf(),
            accepting: AtomicBool::new(true),
            overruns: AtomicU64::new(0),
        });

        self.send(DiskCommand::RegisterWrite(stream.clone(), writer))?;
        Ok(stream)
    }

    /// RT-safe: streams stop delivering until the next seek completes
    pub fn prepare_for_seek(&self) {
        self.shared.seek_pending.store(true, Ordering::Release);
    }

    pub fn is_seeking(&self) -> bool {
        self.shared.seek_pending.load(Ordering::Acquire)
    }

    /// Refill every read stream for `location`; completion arrives as
    /// [`DiskEvent::SeekFinished`]
    pub fn seek(&self, location: TimeRef) {
        self.shared.seek_pending.store(true, Ordering::Release);
        if self.send(DiskCommand::Seek(location)).is_err() {
            self.shared.seek_pending.store(false, Ordering::Release);
        }
    }

    /// New device rate. Buffers are refilled by the next [`DiskIo::seek`].
    pub fn output_rate_changed(&self, rate: u32) {
        let _ = self.send(DiskCommand::OutputRateChanged(rate));
    }

    /// Drain pending events without blocking
    pub fn poll_events(&self) -> Vec<DiskEvent> {
        self.events.try_iter().collect()
    }

    /// Block up to `timeout` for the next event
    pub fn wait_event(&self, timeout: Duration) -> Option<DiskEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    fn send(&self, cmd: DiskCommand) -> TlResult<()> {
        self.commands
            .send(cmd)
            .map_err(|_| TlError::State("disk worker is gone".into()))
    }
}

impl Drop for DiskIo {
    fn drop(&mut self) {
        let _ = self.commands.send(DiskCommand::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("[DiskIo] worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_wraps() {
        let ring = AudioRingBuffer::new(8, 2);
        assert_eq!(ring.available_write(), 7);

        let input: Vec<f32> = (0..10).map(|i| i as f32).collect();
        assert_eq!(ring.write(&input, 5), 5);
        let mut out = [0.0f32; 6];
        assert_eq!(ring.read(&mut out, 3), 3);
        assert_eq!(out, [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        // crosses the end of storage
        assert_eq!(ring.write(&input, 5), 5);
        assert_eq!(ring.available_read(), 7);
        assert_eq!(ring.available_write(), 0);
    }

    #[test]
    fn test_planar_round_trip_through_ring() {
        let ring = AudioRingBuffer::new(16, 2);
        let mut src = AudioBus::new(2, 4);
        src.channel_mut(0).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        src.channel_mut(1).copy_from_slice(&[-1.0, -2.0, -3.0, -4.0]);
        assert_eq!(ring.write_planar(&src, 4), 4);

        let mut dest = AudioBus::new(2, 8);
        assert_eq!(ring.read_planar(&mut dest, 2, 8), 4);
        assert_eq!(&dest.channel(0)[..6], &[0.0, 0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(&dest.channel(1)[2..6], &[-1.0, -2.0, -3.0, -4.0]);
    }

    #[test]
    fn test_underflow_reads_nothing() {
        let ring = AudioRingBuffer::new(16, 1);
        let mut dest = AudioBus::new(1, 4);
        assert_eq!(ring.read_planar(&mut dest, 0, 4), 0);
    }

    fn mono_stream(capacity: usize) -> ReadStream {
        let shared = Arc::new(DiskShared {
            seek_pending: AtomicBool::new(false),
            output_rate: AtomicU32::new(48000),
        });
        ReadStream::new(ClipId::new(), 1, capacity, shared)
    }

    /// What the worker does on a sync: ring holds frame numbers from `start`
    fn refill(stream: &ReadStream, start: i64, frames: usize) {
        stream.ring.reset();
        let data: Vec<f32> = (0..frames).map(|i| (start + i as i64) as f32).collect();
        stream.ring.write(&data, frames);
        stream.rb_read_pos.store(start, Ordering::Release);
        stream.need_sync.store(false, Ordering::Release);
    }

    #[test]
    fn test_resync_lands_ahead_and_catches_up() {
        let stream = mono_stream(800);
        let mut dest = AudioBus::new(1, 64);
        assert_eq!(stream.rb_read(&mut dest, 0, 0, 64), StreamRead::default());

        refill(&stream, 0, 700);
        assert_eq!(stream.rb_read(&mut dest, 0, 0, 64).frames, 64);

        // the play position jumped past the buffer
        assert_eq!(stream.rb_read(&mut dest, 0, 1000, 64), StreamRead::default());
        assert!(!stream.is_synced());
        assert_eq!(stream.sync_pos.load(Ordering::Acquire), 1000 + stream.resync_lead);

        refill(&stream, 1100, 500);
        let early = stream.rb_read(&mut dest, 0, 1000, 64);
        assert_eq!(early, StreamRead { frames: 0, skipped: 64, underrun: false });

        dest.silence(64);
        let partial = stream.rb_read(&mut dest, 0, 1064, 64);
        assert_eq!(partial, StreamRead { frames: 28, skipped: 36, underrun: false });
        assert!(dest.channel(0)[..36].iter().all(|&s| s == 0.0));
        assert_eq!(dest.channel(0)[36], 1100.0);
        assert_eq!(dest.channel(0)[63], 1127.0);

        let aligned = stream.rb_read(&mut dest, 0, 1128, 64);
        assert_eq!(aligned, StreamRead { frames: 64, skipped: 0, underrun: false });
        assert_eq!(dest.channel(0)[0], 1128.0);
        assert!(stream.is_synced());
        assert_eq!(stream.underruns(), 0);
    }

    #[test]
    fn test_short_buffer_in_sync_is_an_underrun() {
        let stream = mono_stream(800);
        let mut dest = AudioBus::new(1, 64);
        refill(&stream, 0, 40);
        let read = stream.rb_read(&mut dest, 0, 0, 64);
        assert_eq!(read, StreamRead { frames: 40, skipped: 0, underrun: true });
        assert_eq!(stream.underruns(), 1);
        assert!(stream.is_synced());
    }

    #[test]
    fn test_pending_seek_keeps_reader_off_the_ring() {
        let stream = mono_stream(800);
        refill(&stream, 0, 700);
        stream.shared.seek_pending.store(true, Ordering::Release);
        let mut dest = AudioBus::new(1, 64);
        assert_eq!(stream.rb_read(&mut dest, 0, 0, 64), StreamRead::default());
        assert_eq!(stream.buffered_frames(), 700);
    }

    #[test]
    fn test_offgrid_clip_maps_consecutive_blocks_contiguously() {
        let rate = 48000;
        // starts between two output frames
        let track_start = TimeRef::from_frames(1, 44100);
        let first = source_frame_at(TimeRef::ZERO, track_start, TimeRef::ZERO, rate);
        let offset = track_start.to_frame(rate);
        assert_eq!(first, 0);

        let mut expected = first + (256 - offset);
        for block in 1..50 {
            let location = TimeRef::from_frames(block * 256, rate);
            assert_eq!(source_frame_at(location, track_start, TimeRef::ZERO, rate), expected);
            expected += 256;
        }
    }
}
