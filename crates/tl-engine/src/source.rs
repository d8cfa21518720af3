//! Audio sources and the shared source registry

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tl_core::{TimeRef, TlError, TlResult};
use tl_file::{open_reader, AudioReader, MemoryReader};

use crate::ids::{reserve_id, SourceId};

/// Where the audio of a source lives
#[derive(Debug, Clone)]
pub enum SourceData {
    File(PathBuf),
    Memory(Arc<Vec<f32>>),
    /// No audio at all; clips on it produce nothing
    Silence,
}

/// Immutable description of one audio file (or buffer)
#[derive(Debug)]
pub struct AudioSource {
    id: SourceId,
    name: String,
    data: SourceData,
    channels: usize,
    sample_rate: u32,
    num_frames: u64,
    bit_depth: u16,
}

impl AudioSource {
    /// Probe a file and describe it
    pub fn from_file<P: AsRef<Path>>(path: P) -> TlResult<Self> {
        Self::from_file_with_id(path, SourceId::new())
    }

    fn from_file_with_id<P: AsRef<Path>>(path: P, id: SourceId) -> TlResult<Self> {
        let path = path.as_ref();
        let reader = open_reader(path)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("source")
            .to_string();

        Ok(Self {
            id,
            name,
            data: SourceData::File(path.to_path_buf()),
            channels: reader.channels(),
            sample_rate: reader.sample_rate(),
            num_frames: reader.num_frames(),
            bit_depth: reader.bit_depth(),
        })
    }

    /// Interleaved samples held in memory
    pub fn from_memory(name: impl Into<String>, samples: Vec<f32>, channels: usize, sample_rate: u32) -> Self {
        let channels = channels.max(1);
        Self {
            id: SourceId::new(),
            name: name.into(),
            num_frames: (samples.len() / channels) as u64,
            data: SourceData::Memory(Arc::new(samples)),
            channels,
            sample_rate,
            bit_depth: 32,
        }
    }

    /// Zero-channel placeholder of the given length
    pub fn silence(num_frames: u64, sample_rate: u32) -> Self {
        Self {
            id: SourceId::new(),
            name: "silence".to_string(),
            data: SourceData::Silence,
            channels: 0,
            sample_rate,
            num_frames,
            bit_depth: 0,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_frames(&self) -> u64 {
        self.num_frames
    }

    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    pub fn is_silence(&self) -> bool {
        self.channels == 0
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.data {
            SourceData::File(p) => Some(p),
            _ => None,
        }
    }

    /// Short digest naming this source's cache files. Files are keyed by
    /// their full path, in-memory buffers by their content.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        match &self.data {
            SourceData::File(path) => hasher.update(path.to_string_lossy().as_bytes()),
            SourceData::Memory(samples) => {
                hasher.update(self.sample_rate.to_le_bytes());
                hasher.update((self.channels as u32).to_le_bytes());
                for s in samples.iter() {
                    hasher.update(s.to_le_bytes());
                }
            }
            SourceData::Silence => hasher.update(self.id.0.to_le_bytes()),
        }
        hex::encode(&hasher.finalize()[..8])
    }

    /// Source length on the timeline
    pub fn length(&self) -> TimeRef {
        TimeRef::from_frames(self.num_frames as i64, self.sample_rate.max(1))
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.path()
            .and_then(|p| std::fs::metadata(p).ok())
            .and_then(|m| m.modified().ok())
    }

    /// Fresh reader positioned at frame 0, at the source's native rate
    pub fn open_reader(&self) -> TlResult<Box<dyn AudioReader>> {
        match &self.data {
            SourceData::File(path) => Ok(open_reader(path)?),
            SourceData::Memory(samples) => Ok(Box::new(MemoryReader::shared(
                samples.clone(),
                self.channels,
                self.sample_rate,
            ))),
            SourceData::Silence => Err(TlError::Source(format!("{} has no audio", self.name))),
        }
    }

    pub fn get_state(&self) -> SourceState {
        SourceState {
            id: self.id,
            name: self.name.clone(),
            path: self.path().map(Path::to_path_buf),
            channels: self.channels,
            sample_rate: self.sample_rate,
            num_frames: self.num_frames,
        }
    }
}

/// Persisted description of a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub id: SourceId,
    pub name: String,
    pub path: Option<PathBuf>,
    pub channels: usize,
    pub sample_rate: u32,
    pub num_frames: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

struct RegistryEntry {
    source: Arc<AudioSource>,
    refs: usize,
}

/// Shared ownership of sources by id. Clips acquire and release; when the
/// last clip lets go the entry disappears.
#[derive(Default)]
pub struct SourceRegistry {
    entries: RwLock<HashMap<SourceId, RegistryEntry>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source without taking a reference
    pub fn insert(&self, source: AudioSource) -> Arc<AudioSource> {
        let source = Arc::new(source);
        self.entries.write().insert(
            source.id(),
            RegistryEntry {
                source: source.clone(),
                refs: 0,
            },
        );
        source
    }

    pub fn get(&self, id: SourceId) -> Option<Arc<AudioSource>> {
        self.entries.read().get(&id).map(|e| e.source.clone())
    }

    pub fn acquire(&self, id: SourceId) -> Option<Arc<AudioSource>> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id)?;
        entry.refs += 1;
        Some(entry.source.clone())
    }

    /// Drop one reference. Returns the source when this was the last one.
    pub fn release(&self, id: SourceId) -> Option<Arc<AudioSource>> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            return entries.remove(&id).map(|e| e.source);
        }
        None
    }

    pub fn ref_count(&self, id: SourceId) -> usize {
        self.entries.read().get(&id).map_or(0, |e| e.refs)
    }

    /// Find an existing entry or reopen from saved state
    pub fn restore(&self, state: &SourceState) -> TlResult<Arc<AudioSource>> {
        if let Some(source) = self.get(state.id) {
            return Ok(source);
        }
        if state.channels == 0 {
            reserve_id(state.id.0);
            let mut source = AudioSource::silence(state.num_frames, state.sample_rate);
            source.id = state.id;
            return Ok(self.insert(source));
        }
        let path = state
            .path
            .as_ref()
            .ok_or_else(|| TlError::Source(format!("{} has no file to reopen", state.name)))?;
        reserve_id(state.id.0);
        let source = AudioSource::from_file_with_id(path, state.id)?;
        Ok(self.insert(source))
    }

    pub fn states(&self) -> Vec<SourceState> {
        let entries = self.entries.read();
        let mut states: Vec<SourceState> = entries.values().map(|e| e.source.get_state()).collect();
        states.sort_by_key(|s| s.id);
        states
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
