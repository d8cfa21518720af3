//! Notifications between the audio thread and the control thread
//!
//! The audio thread never calls into control code. It pushes small
//! [`EngineEvent`] values into a lock-free queue; the control thread drains
//! the queue from `Session::poll_events` and turns them into work or into
//! [`SessionEvent`]s for the user.
//!
//! Events the transport depends on (seek start, prepare / stop recording)
//! and the disk shortfall reports are not queued: they are coalesced into
//! atomic flags so a full queue can never lose them.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use tl_core::TimeRef;

use crate::ids::{ClipId, SourceId, TrackId};

/// Queue depth for transport notifications
const EVENT_QUEUE_SIZE: usize = 256;

const FLAG_SEEK_START: u8 = 1 << 0;
const FLAG_PREPARE_RECORDING: u8 = 1 << 1;
const FLAG_RECORDING_STOPPED: u8 = 1 << 2;
const FLAG_READ_UNDERRUN: u8 = 1 << 3;
const FLAG_WRITE_OVERRUN: u8 = 1 << 4;

/// Flagged events in the order they are handed to the control thread
const FLAGGED: [(u8, EngineEvent); 5] = [
    (FLAG_SEEK_START, EngineEvent::SeekStart),
    (FLAG_PREPARE_RECORDING, EngineEvent::PrepareRecording),
    (FLAG_RECORDING_STOPPED, EngineEvent::RecordingStopped),
    (FLAG_READ_UNDERRUN, EngineEvent::ReadUnderrun),
    (FLAG_WRITE_OVERRUN, EngineEvent::WriteOverrun),
];

/// Audio thread → control thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// `start_seek` ran; the control thread must start the disk seek
    SeekStart,
    /// Transport asked to start with record enabled
    PrepareRecording,
    TransportStarted(TimeRef),
    TransportStopped(TimeRef),
    /// Recording clips must be finalized
    RecordingStopped,
    /// A read stream delivered less than a block while in sync
    ReadUnderrun,
    /// A capture stream could not take a whole block
    WriteOverrun,
}

impl EngineEvent {
    fn flag(self) -> Option<u8> {
        match self {
            Self::SeekStart => Some(FLAG_SEEK_START),
            Self::PrepareRecording => Some(FLAG_PREPARE_RECORDING),
            Self::RecordingStopped => Some(FLAG_RECORDING_STOPPED),
            Self::ReadUnderrun => Some(FLAG_READ_UNDERRUN),
            Self::WriteOverrun => Some(FLAG_WRITE_OVERRUN),
            Self::TransportStarted(_) | Self::TransportStopped(_) => None,
        }
    }
}

/// Severity of a user-facing message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Control thread → observers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message { severity: Severity, text: String },
    TransportStarted(TimeRef),
    TransportStopped(TimeRef),
    /// Seek completed, position is authoritative
    TransportPosSet(TimeRef),
    RecordingStateChanged(bool),
    RecordingFinished { track: TrackId, clip: ClipId },
    PeakProgress { source: SourceId, channel: usize, percent: u32 },
    PeakFinished { source: SourceId, channel: usize },
    PeakFailed { source: SourceId, channel: usize, error: String },
    ExportProgress(u32),
}

impl SessionEvent {
    pub fn info(text: impl Into<String>) -> Self {
        Self::Message { severity: Severity::Info, text: text.into() }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::Message { severity: Severity::Warning, text: text.into() }
    }

    pub fn critical(text: impl Into<String>) -> Self {
        Self::Message { severity: Severity::Critical, text: text.into() }
    }
}

/// Audio thread → control thread channel; `push` is RT-safe
pub struct EventQueue {
    tx: Mutex<Producer<EngineEvent>>,
    rx: Mutex<Consumer<EngineEvent>>,
    flags: AtomicU8,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = RingBuffer::<EngineEvent>::new(EVENT_QUEUE_SIZE);
        Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            flags: AtomicU8::new(0),
        }
    }

    /// Never blocks. Flagged events always succeed and coalesce until the
    /// next drain. Returns false when a notification was dropped.
    #[inline]
    pub fn push(&self, event: EngineEvent) -> bool {
        if let Some(flag) = event.flag() {
            self.flags.fetch_or(flag, Ordering::AcqRel);
            return true;
        }
        match self.tx.try_lock() {
            Some(mut tx) => tx.push(event).is_ok(),
            None => false,
        }
    }

    /// Control thread only. Queued notifications first, then each raised
    /// flag once.
    pub fn drain(&self) -> Vec<EngineEvent> {
        let mut rx = self.rx.lock();
        let mut events = Vec::with_capacity(rx.slots() + FLAGGED.len());
        while let Ok(event) = rx.pop() {
            events.push(event);
        }
        let flags = self.flags.swap(0, Ordering::AcqRel);
        events.extend(
            FLAGGED
                .iter()
                .filter(|(flag, _)| flags & flag != 0)
                .map(|&(_, event)| event),
        );
        events
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain_in_order() {
        let queue = EventQueue::new();
        assert!(queue.push(EngineEvent::SeekStart));
        assert!(queue.push(EngineEvent::TransportStarted(TimeRef::ZERO)));

        let events = queue.drain();
        assert_eq!(events, vec![EngineEvent::SeekStart, EngineEvent::TransportStarted(TimeRef::ZERO)]);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_full_queue_drops_notifications_only() {
        let queue = EventQueue::new();
        for _ in 0..EVENT_QUEUE_SIZE {
            assert!(queue.push(EngineEvent::TransportStopped(TimeRef::ZERO)));
        }
        assert!(!queue.push(EngineEvent::TransportStopped(TimeRef::ZERO)));

        // the transport still gets its seek and recording events
        assert!(queue.push(EngineEvent::SeekStart));
        assert!(queue.push(EngineEvent::RecordingStopped));
        let events = queue.drain();
        assert_eq!(events.len(), EVENT_QUEUE_SIZE + 2);
        assert_eq!(&events[EVENT_QUEUE_SIZE..], &[EngineEvent::SeekStart, EngineEvent::RecordingStopped]);
    }

    #[test]
    fn test_underruns_coalesce() {
        let queue = EventQueue::new();
        for _ in 0..10_000 {
            queue.push(EngineEvent::ReadUnderrun);
        }
        assert!(queue.push(EngineEvent::SeekStart));
        assert_eq!(queue.drain(), vec![EngineEvent::SeekStart, EngineEvent::ReadUnderrun]);
        assert!(queue.drain().is_empty());
    }
}
