//! tl-engine: Multi-track Timeline Engine
//!
//! Real-time playback, recording and offline rendering of audio clips
//! arranged on tracks:
//! - Sample-accurate timeline positions independent of the device rate
//! - Disk streaming through lock-free ring buffers (one worker thread)
//! - Seek coalescing and a record-arm / prepare / roll sequence
//! - Multi-resolution peak cache with a persistent file format
//! - Offline export with optional two-pass normalization
//!
//! [`Session`] is the entry point. The audio callback calls
//! [`Session::process`]; the control thread calls [`Session::poll_events`].

// Audio loops index channels and frames explicitly
#![allow(clippy::needless_range_loop)]

mod bus;
mod clip;
mod export;
mod fade;
mod ids;
mod notify;
mod session;
mod source;
mod streaming;
mod track;
mod transport;

pub mod peak;

pub use bus::*;
pub use clip::{Clip, ClipProcessResult, ClipState, ClipStatus, NormalizeResult, ProcessContext, MIN_CLIP_FRAMES};
pub use export::{render, validate, ExportFormat, ExportSpec, RenderPass};
pub use fade::*;
pub use ids::{ClipId, SourceId, TrackId};
pub use notify::*;
pub use peak::{PeakManager, PeakResult, PeakState, PeakView};
pub use session::{Session, SessionState};
pub use source::*;
pub use streaming::{source_frame_at, AudioRingBuffer, DiskEvent, DiskIo, ReadStream, StreamRead, WriteStream};
pub use track::{OutputRoute, Track, TrackKind, TrackState, PROCESS_BUS_CHANNELS};
pub use transport::{Transport, TransportRequest, TransportState};

pub use tl_core::{EngineConfig, TimeRef, TlError, TlResult};
