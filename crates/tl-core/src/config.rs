//! Engine configuration
//!
//! Populated once at startup (defaults, optionally overlaid from a JSON file)
//! and handed to the session by reference.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{TlError, TlResult};

/// Output sample format for recorded and exported files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    Int16,
    Int24,
    Float32,
}

impl SampleFormat {
    pub fn bits_per_sample(self) -> u16 {
        match self {
            SampleFormat::Int16 => 16,
            SampleFormat::Int24 => 24,
            SampleFormat::Float32 => 32,
        }
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::Float32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub buffer_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            buffer_size: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Read-ahead per stream, seconds
    pub read_buffer_seconds: f32,
    /// Capture buffer per recording clip, seconds
    pub write_buffer_seconds: f32,
    /// Worker wake-up interval
    pub poll_interval_ms: u64,
    /// Frames moved per worker iteration per stream
    pub chunk_frames: usize,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            read_buffer_seconds: 3.0,
            write_buffer_seconds: 5.0,
            poll_interval_ms: 10,
            chunk_frames: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakConfig {
    /// Directory holding `.peak` files
    pub directory: PathBuf,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("timeline-peaks"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub directory: PathBuf,
    pub format: SampleFormat,
    /// Save the session once every recording clip has been finalized
    pub autosave_path: Option<PathBuf>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("timeline-recordings"),
            format: SampleFormat::Float32,
            autosave_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportDefaults {
    pub block_size: usize,
    pub format: SampleFormat,
    /// Normalization target, dBFS
    pub normalize_target_db: f32,
}

impl Default for ExportDefaults {
    fn default() -> Self {
        Self {
            block_size: 1024,
            format: SampleFormat::Int24,
            normalize_target_db: 0.0,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub disk: DiskConfig,
    pub peaks: PeakConfig,
    pub recording: RecordingConfig,
    pub export: ExportDefaults,
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> TlResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> TlResult<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> TlResult<()> {
        if self.audio.sample_rate == 0 {
            return Err(TlError::InvalidSampleRate(0));
        }
        if self.audio.buffer_size == 0 {
            return Err(TlError::InvalidParam("buffer_size must be > 0".into()));
        }
        if self.disk.chunk_frames == 0 {
            return Err(TlError::InvalidParam("disk.chunk_frames must be > 0".into()));
        }
        if self.export.block_size == 0 {
            return Err(TlError::InvalidParam("export.block_size must be > 0".into()));
        }
        Ok(())
    }

    /// Ring buffer capacity for read streams at `rate`
    pub fn read_buffer_frames(&self, rate: u32) -> usize {
        ((self.disk.read_buffer_seconds.max(0.1) * rate as f32) as usize).max(self.disk.chunk_frames * 2)
    }

    pub fn write_buffer_frames(&self, rate: u32) -> usize {
        ((self.disk.write_buffer_seconds.max(0.1) * rate as f32) as usize).max(self.disk.chunk_frames * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{ "audio": { "sample_rate": 44100 } }"#).unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.audio.buffer_size, 512);
        assert_eq!(config.disk.poll_interval_ms, 10);
        assert_eq!(config.recording.format, SampleFormat::Float32);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.json");

        let mut config = EngineConfig::default();
        config.export.format = SampleFormat::Int16;
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.export.format, SampleFormat::Int16);
    }

    #[test]
    fn test_rejects_zero_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{ "audio": { "sample_rate": 0 } }"#).unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(TlError::InvalidSampleRate(0))));
    }
}
