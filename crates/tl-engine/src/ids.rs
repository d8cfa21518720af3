//! Identifier newtypes

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique track identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

/// Unique clip identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClipId(pub u64);

/// Unique audio source identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(pub u64);

// Global ID counter shared by every id kind
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Keep freshly generated ids above one restored from saved state
pub(crate) fn reserve_id(id: u64) {
    NEXT_ID.fetch_max(id + 1, Ordering::Relaxed);
}

impl TrackId {
    pub fn new() -> Self {
        Self(next_id())
    }
}

impl ClipId {
    pub fn new() -> Self {
        Self(next_id())
    }
}

impl SourceId {
    pub fn new() -> Self {
        Self(next_id())
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ClipId {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "clip#{}", self.0)
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source#{}", self.0)
    }
}
