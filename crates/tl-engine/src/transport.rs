//! Transport state shared between the control thread and the audio thread
//!
//! Everything here is an atomic. The control thread posts requests and seek
//! targets; the audio thread picks them up at the start of a block. Nothing
//! blocks on either side.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

use tl_core::TimeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Stopped = 0,
    Starting = 1,
    Rolling = 2,
}

impl TransportState {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Stopped),
            1 => Some(Self::Starting),
            2 => Some(Self::Rolling),
            _ => None,
        }
    }
}

/// A requested transport transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportRequest {
    pub state: TransportState,
    pub location: TimeRef,
    /// Caller is the audio callback
    pub realtime: bool,
    /// Issued by the start/seek sequence itself rather than by a user
    pub is_slave: bool,
}

impl TransportRequest {
    pub fn new(state: TransportState, location: TimeRef) -> Self {
        Self {
            state,
            location,
            realtime: true,
            is_slave: true,
        }
    }
}

const NO_REQUEST: u8 = u8::MAX;

pub struct Transport {
    state: AtomicU8,
    position: AtomicI64,

    // seek state machine
    start_seek: AtomicBool,
    seeking: AtomicBool,
    seek_target: AtomicI64,
    resume_after_seek: AtomicBool,

    // recording state machine
    recordable: AtomicBool,
    recording: AtomicBool,
    prepare_requested: AtomicBool,
    ready_to_record: AtomicBool,

    // pending control request
    request_state: AtomicU8,
    request_location: AtomicI64,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TransportState::Stopped as u8),
            position: AtomicI64::new(0),
            start_seek: AtomicBool::new(false),
            seeking: AtomicBool::new(false),
            seek_target: AtomicI64::new(0),
            resume_after_seek: AtomicBool::new(false),
            recordable: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            prepare_requested: AtomicBool::new(false),
            ready_to_record: AtomicBool::new(false),
            request_state: AtomicU8::new(NO_REQUEST),
            request_location: AtomicI64::new(0),
        }
    }

    // ─── State / position ───────────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(TransportState::Stopped)
    }

    #[inline]
    pub fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_rolling(&self) -> bool {
        self.state() == TransportState::Rolling
    }

    #[inline]
    pub fn position(&self) -> TimeRef {
        TimeRef::from_universal(self.position.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_position(&self, location: TimeRef) {
        self.position.store(location.universal_frame(), Ordering::Release);
    }

    #[inline]
    pub fn advance(&self, frames: usize, rate: u32) {
        let next = self.position().add_frames(frames as i64, rate);
        self.set_position(next);
    }

    // ─── Seeking ────────────────────────────────────────────────────────────

    /// Record `location` as the seek target. Returns false when a seek is
    /// already under way; that seek will land on this target instead.
    pub fn initiate_seek_start(&self, location: TimeRef) -> bool {
        self.seek_target.store(location.universal_frame(), Ordering::Release);
        if self.seeking.load(Ordering::Acquire) || self.start_seek.load(Ordering::Acquire) {
            return false;
        }
        self.start_seek.store(true, Ordering::Release);
        true
    }

    /// Audio thread: consume the start-seek flag
    #[inline]
    pub fn take_start_seek(&self) -> bool {
        self.start_seek.swap(false, Ordering::AcqRel)
    }

    /// Audio thread: pause for the seek, remembering whether to resume
    pub fn begin_seek(&self) {
        let rolling = self.is_rolling();
        self.resume_after_seek.store(rolling, Ordering::Release);
        if rolling {
            self.set_state(TransportState::Stopped);
        }
        self.seeking.store(true, Ordering::Release);
    }

    pub fn seek_target(&self) -> TimeRef {
        TimeRef::from_universal(self.seek_target.load(Ordering::Acquire))
    }

    pub fn is_seeking(&self) -> bool {
        self.seeking.load(Ordering::Acquire) || self.start_seek.load(Ordering::Acquire)
    }

    /// Control thread: the seek landed at `location`. Returns true when the
    /// transport resumed rolling.
    pub fn finish_seek(&self, location: TimeRef) -> bool {
        self.set_position(location);
        self.seeking.store(false, Ordering::Release);
        if self.resume_after_seek.swap(false, Ordering::AcqRel) {
            self.set_state(TransportState::Rolling);
            return true;
        }
        false
    }

    /// A stop during a seek keeps the transport stopped once it lands
    pub fn cancel_resume(&self) {
        self.resume_after_seek.store(false, Ordering::Release);
    }

    // ─── Recording ──────────────────────────────────────────────────────────

    pub fn is_recordable(&self) -> bool {
        self.recordable.load(Ordering::Acquire)
    }

    pub fn set_recordable(&self, recordable: bool) {
        self.recordable.store(recordable, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    pub fn is_ready_to_record(&self) -> bool {
        self.ready_to_record.load(Ordering::Acquire)
    }

    pub fn set_ready_to_record(&self, ready: bool) {
        self.ready_to_record.store(ready, Ordering::Release);
        if ready {
            self.prepare_requested.store(false, Ordering::Release);
        }
    }

    /// True the first time after a reset; used to post the prepare request
    /// only once
    pub fn request_prepare(&self) -> bool {
        !self.prepare_requested.swap(true, Ordering::AcqRel)
    }

    pub fn reset_recording(&self) {
        self.recording.store(false, Ordering::Release);
        self.ready_to_record.store(false, Ordering::Release);
        self.prepare_requested.store(false, Ordering::Release);
    }

    // ─── Requests ───────────────────────────────────────────────────────────

    /// Control thread: queue a transition for the next block. A newer
    /// request replaces an unconsumed one.
    pub fn post_request(&self, state: TransportState, location: TimeRef) {
        self.request_location.store(location.universal_frame(), Ordering::Release);
        self.request_state.store(state as u8, Ordering::Release);
    }

    /// Audio thread: the pending request, if any
    pub fn pending_request(&self) -> Option<TransportRequest> {
        let state = TransportState::from_u8(self.request_state.load(Ordering::Acquire))?;
        let location = TimeRef::from_universal(self.request_location.load(Ordering::Acquire));
        Some(TransportRequest::new(state, location))
    }

    /// Audio thread: drop the pending request if it is still `state`
    pub fn clear_request(&self, state: TransportState) {
        let _ = self
            .request_state
            .compare_exchange(state as u8, NO_REQUEST, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Replace a consumed Starting request with the Rolling step
    pub fn advance_request(&self, to: TransportState) {
        let _ = self.request_state.compare_exchange(
            TransportState::Starting as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}
