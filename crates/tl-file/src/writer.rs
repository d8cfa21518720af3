//! WAV output for recordings and exports

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tl_core::SampleFormat;

use crate::{FileError, FileResult};

/// Incremental WAV writer fed with interleaved `f32` frames
pub struct WavFileWriter {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    path: PathBuf,
    channels: usize,
    sample_rate: u32,
    format: SampleFormat,
    frames_written: u64,
}

impl WavFileWriter {
    pub fn create<P: AsRef<Path>>(
        path: P,
        channels: usize,
        sample_rate: u32,
        format: SampleFormat,
    ) -> FileResult<Self> {
        let path = path.as_ref();
        if channels == 0 {
            return Err(FileError::WriteError("cannot write a zero-channel file".into()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let spec = hound::WavSpec {
            channels: channels as u16,
            sample_rate,
            bits_per_sample: format.bits_per_sample(),
            sample_format: match format {
                SampleFormat::Float32 => hound::SampleFormat::Float,
                SampleFormat::Int16 | SampleFormat::Int24 => hound::SampleFormat::Int,
            },
        };
        let writer = hound::WavWriter::create(path, spec)?;

        log::debug!(
            "[WavFileWriter] created {} ({} ch, {} Hz, {:?})",
            path.display(),
            channels,
            sample_rate,
            format
        );

        Ok(Self {
            writer: Some(writer),
            path: path.to_path_buf(),
            channels,
            sample_rate,
            format,
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Append `frames` interleaved frames from `data`
    pub fn write(&mut self, data: &[f32], frames: usize) -> FileResult<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| FileError::WriteError("writer already finalized".into()))?;
        let frames = frames.min(data.len() / self.channels);
        let samples = &data[..frames * self.channels];

        match self.format {
            SampleFormat::Float32 => {
                for &s in samples {
                    writer.write_sample(s)?;
                }
            }
            SampleFormat::Int16 => {
                for &s in samples {
                    writer.write_sample((s.clamp(-1.0, 1.0) * 32767.0) as i16)?;
                }
            }
            SampleFormat::Int24 => {
                for &s in samples {
                    writer.write_sample((s.clamp(-1.0, 1.0) * 8_388_607.0) as i32)?;
                }
            }
        }

        self.frames_written += frames as u64;
        Ok(frames)
    }

    /// Flush and patch the header. Further writes fail.
    pub fn finalize(&mut self) -> FileResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            log::debug!(
                "[WavFileWriter] finalized {} ({} frames)",
                self.path.display(),
                self.frames_written
            );
        }
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.writer.is_none()
    }
}

impl Drop for WavFileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            log::error!("[WavFileWriter] finalize on drop failed for {}: {}", self.path.display(), e);
        }
    }
}
