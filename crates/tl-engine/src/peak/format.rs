//! .peak File Format
//!
//! File structure (little-endian):
//! ```text
//! +----------------------------------------+
//! | Header (120 bytes)                     |
//! |   magic "TLPEAK", version [major,minor]|
//! |   level offsets  [u32; 12]             |
//! |   level sizes    [u32; 12] (bytes)     |
//! |   norm offset    u64                   |
//! |   peak offset    u64                   |
//! +----------------------------------------+
//! | Level 0 (64 frames per pair)           |
//! | Level 1 (128 frames per pair)          |
//! | ...                                    |
//! | Level 11 (131072 frames per pair)      |
//! +----------------------------------------+
//! | Normalization table: f32 per 10000     |
//! | frames                                 |
//! +----------------------------------------+
//! ```
//!
//! A pair is two bytes: the highest positive excursion and the magnitude of
//! the lowest negative excursion in the window, each scaled to 0..=120.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tl_core::{TlError, TlResult};

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

pub const PEAK_MAGIC: [u8; 6] = *b"TLPEAK";

/// `[major, minor]`. Any mismatch forces a rebuild.
pub const PEAK_VERSION: [u8; 2] = [1, 0];

/// Total zoom ladder; level `n` shows `2^n` frames per pixel
pub const ZOOM_LEVELS: usize = 18;

/// Levels below this are computed from the source on demand
pub const SAVING_ZOOM_FACTOR: usize = 6;

pub const MAX_ZOOM_USING_SOURCEFILE: usize = SAVING_ZOOM_FACTOR - 1;

/// Levels stored in the file
pub const SAVED_LEVELS: usize = ZOOM_LEVELS - SAVING_ZOOM_FACTOR;

/// Frames per normalization table entry
pub const NORMALIZE_CHUNK_SIZE: u64 = 10_000;

/// Full-scale pair value
pub const MAX_DB_VALUE: f32 = 120.0;

pub const HEADER_SIZE: usize = 6 + 2 + SAVED_LEVELS * 4 * 2 + 8 + 8;

/// Frames per pixel at `zoom_level`
#[inline]
pub const fn zoom_step(zoom_level: usize) -> u64 {
    1 << zoom_level
}

// ═══════════════════════════════════════════════════════════════════════════
// PAIR
// ═══════════════════════════════════════════════════════════════════════════

/// Quantized envelope of one window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeakPair {
    pub upper: u8,
    pub lower: u8,
}

impl PeakPair {
    /// From the window's max and min sample
    #[inline]
    pub fn from_extremes(max: f32, min: f32) -> Self {
        Self {
            upper: quantize(max),
            lower: quantize(-min),
        }
    }

    #[inline]
    pub fn merge(self, other: PeakPair) -> PeakPair {
        PeakPair {
            upper: self.upper.max(other.upper),
            lower: self.lower.max(other.lower),
        }
    }
}

#[inline]
fn quantize(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * MAX_DB_VALUE) as u8
}

// ═══════════════════════════════════════════════════════════════════════════
// HEADER
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakHeader {
    pub label: [u8; 6],
    pub version: [u8; 2],
    /// Absolute byte offset of each saved level
    pub level_offsets: [u32; SAVED_LEVELS],
    /// Byte size of each saved level
    pub level_sizes: [u32; SAVED_LEVELS],
    pub norm_offset: u64,
    pub peak_data_offset: u64,
}

impl PeakHeader {
    pub fn new() -> Self {
        Self {
            label: PEAK_MAGIC,
            version: PEAK_VERSION,
            level_offsets: [0; SAVED_LEVELS],
            level_sizes: [0; SAVED_LEVELS],
            norm_offset: 0,
            peak_data_offset: HEADER_SIZE as u64,
        }
    }

    pub fn validate(&self) -> TlResult<()> {
        if self.label != PEAK_MAGIC {
            return Err(TlError::PeakFormat("invalid magic".to_string()));
        }
        if self.version != PEAK_VERSION {
            return Err(TlError::PeakFormat(format!(
                "unsupported version {}.{}",
                self.version[0], self.version[1]
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        bytes.extend_from_slice(&self.label);
        bytes.extend_from_slice(&self.version);
        for offset in &self.level_offsets {
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
        for size in &self.level_sizes {
            bytes.extend_from_slice(&size.to_le_bytes());
        }
        bytes.extend_from_slice(&self.norm_offset.to_le_bytes());
        bytes.extend_from_slice(&self.peak_data_offset.to_le_bytes());
        bytes
    }

    /// Parse and validate
    pub fn from_bytes(bytes: &[u8]) -> TlResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(TlError::PeakFormat("header too short".to_string()));
        }

        let mut label = [0u8; 6];
        label.copy_from_slice(&bytes[0..6]);
        let version = [bytes[6], bytes[7]];

        let mut pos = 8;
        let read_u32 = |pos: &mut usize| {
            let v = u32::from_le_bytes([bytes[*pos], bytes[*pos + 1], bytes[*pos + 2], bytes[*pos + 3]]);
            *pos += 4;
            v
        };
        let mut level_offsets = [0u32; SAVED_LEVELS];
        for offset in level_offsets.iter_mut() {
            *offset = read_u32(&mut pos);
        }
        let mut level_sizes = [0u32; SAVED_LEVELS];
        for size in level_sizes.iter_mut() {
            *size = read_u32(&mut pos);
        }

        let mut u64_bytes = [0u8; 8];
        u64_bytes.copy_from_slice(&bytes[pos..pos + 8]);
        let norm_offset = u64::from_le_bytes(u64_bytes);
        u64_bytes.copy_from_slice(&bytes[pos + 8..pos + 16]);
        let peak_data_offset = u64::from_le_bytes(u64_bytes);

        let header = Self {
            label,
            version,
            level_offsets,
            level_sizes,
            norm_offset,
            peak_data_offset,
        };
        header.validate()?;
        Ok(header)
    }
}

impl Default for PeakHeader {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MAPPED FILE
// ═══════════════════════════════════════════════════════════════════════════

/// Read-only view of a finished .peak file
pub struct PeakFileMmap {
    pub header: PeakHeader,
    mmap: Mmap,
}

impl PeakFileMmap {
    pub fn open(path: &Path) -> TlResult<Self> {
        let file = File::open(path)?;

        // SAFETY: peak files are only written by the builder, which never
        // touches a file that is currently mapped
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE {
            return Err(TlError::PeakFormat("file too small for header".to_string()));
        }
        let header = PeakHeader::from_bytes(&mmap[..HEADER_SIZE])?;

        let norm_end = header.norm_offset as usize;
        for level in 0..SAVED_LEVELS {
            let end = header.level_offsets[level] as usize + header.level_sizes[level] as usize;
            if end > mmap.len() || end > norm_end {
                return Err(TlError::PeakFormat(format!("level {} out of bounds", level)));
            }
        }
        if norm_end > mmap.len() {
            return Err(TlError::PeakFormat("normalization table out of bounds".to_string()));
        }

        Ok(Self { header, mmap })
    }

    /// Pairs stored at saved level `level`
    pub fn pair_count(&self, level: usize) -> usize {
        self.header.level_sizes[level] as usize / 2
    }

    /// Up to `count` pairs of saved level `level` starting at pair `start`.
    /// Truncated at the end of the level.
    pub fn read_pairs(&self, level: usize, start: usize, count: usize) -> Vec<PeakPair> {
        let available = self.pair_count(level);
        if start >= available {
            return Vec::new();
        }
        let count = count.min(available - start);
        let base = self.header.level_offsets[level] as usize + start * 2;
        self.mmap[base..base + count * 2]
            .chunks_exact(2)
            .map(|b| PeakPair { upper: b[0], lower: b[1] })
            .collect()
    }

    pub fn norm_count(&self) -> usize {
        (self.mmap.len() - self.header.norm_offset as usize) / 4
    }

    pub fn norm_value(&self, index: usize) -> Option<f32> {
        if index >= self.norm_count() {
            return None;
        }
        let pos = self.header.norm_offset as usize + index * 4;
        let bytes: [u8; 4] = self.mmap[pos..pos + 4].try_into().ok()?;
        Some(f32::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_and_round_trip() {
        assert_eq!(HEADER_SIZE, 120);

        let mut header = PeakHeader::new();
        header.level_offsets[3] = 4096;
        header.level_sizes[11] = 2;
        header.norm_offset = 9000;

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(PeakHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_bad_magic_and_version_rejected() {
        let mut bytes = PeakHeader::new().to_bytes();
        bytes[0] = b'X';
        assert!(PeakHeader::from_bytes(&bytes).is_err());

        let mut bytes = PeakHeader::new().to_bytes();
        bytes[7] = PEAK_VERSION[1] + 1;
        assert!(matches!(PeakHeader::from_bytes(&bytes), Err(TlError::PeakFormat(_))));
    }

    #[test]
    fn test_quantization() {
        let pair = PeakPair::from_extremes(1.5, -0.5);
        assert_eq!(pair.upper, 120);
        assert_eq!(pair.lower, 60);

        let silent = PeakPair::from_extremes(0.0, 0.0);
        assert_eq!(silent, PeakPair::default());
        assert_eq!(pair.merge(PeakPair { upper: 0, lower: 100 }), PeakPair { upper: 120, lower: 100 });
    }

    #[test]
    fn test_zoom_ladder() {
        assert_eq!(SAVED_LEVELS, 12);
        assert_eq!(zoom_step(SAVING_ZOOM_FACTOR), 64);
        assert_eq!(zoom_step(ZOOM_LEVELS - 1), 131_072);
    }
}
