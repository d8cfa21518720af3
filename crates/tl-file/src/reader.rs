//! Audio source readers
//!
//! Every reader delivers interleaved `f32` frames and can be repositioned.
//! WAV goes through hound (streamed from disk); everything else symphonia
//! can probe is decoded up front and served from memory.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::{FileError, FileResult};

// ═══════════════════════════════════════════════════════════════════════════════
// READER CONTRACT
// ═══════════════════════════════════════════════════════════════════════════════

/// Seekable source of interleaved audio
pub trait AudioReader: Send {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    fn bit_depth(&self) -> u16;

    /// Length in frames
    fn num_frames(&self) -> u64;

    /// Reposition to `frame`. Returns false when the position is out of range
    /// or the underlying file refused.
    fn seek(&mut self, frame: u64) -> bool;

    /// Read up to `frames` frames into `dest` (interleaved, `frames * channels`
    /// samples). Returns frames actually read; 0 at end of source.
    fn read(&mut self, dest: &mut [f32], frames: usize) -> usize;

    /// Current read position in frames
    fn position(&self) -> u64;
}

/// Open the best reader for `path`
pub fn open_reader<P: AsRef<Path>>(path: P) -> FileResult<Box<dyn AudioReader>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(FileError::NotFound(path.display().to_string()));
    }

    if WavFileReader::can_decode(path) {
        return Ok(Box::new(WavFileReader::open(path)?));
    }
    if SymphoniaReader::can_decode(path) {
        return Ok(Box::new(SymphoniaReader::open(path)?));
    }

    Err(FileError::UnsupportedFormat(path.display().to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMORY
// ═══════════════════════════════════════════════════════════════════════════════

/// Reader over an interleaved buffer already in memory
#[derive(Debug, Clone)]
pub struct MemoryReader {
    samples: Arc<Vec<f32>>,
    channels: usize,
    sample_rate: u32,
    bit_depth: u16,
    position: u64,
}

impl MemoryReader {
    pub fn new(samples: Vec<f32>, channels: usize, sample_rate: u32) -> Self {
        Self::shared(Arc::new(samples), channels, sample_rate)
    }

    /// Share a buffer between several readers
    pub fn shared(samples: Arc<Vec<f32>>, channels: usize, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sample_rate,
            bit_depth: 32,
            position: 0,
        }
    }

    /// Build from per-channel buffers
    pub fn from_channels(channels: &[Vec<f32>], sample_rate: u32) -> Self {
        let num_channels = channels.len().max(1);
        let num_frames = channels.iter().map(Vec::len).max().unwrap_or(0);
        let mut interleaved = vec![0.0; num_frames * num_channels];
        for (ch, data) in channels.iter().enumerate() {
            for (i, &s) in data.iter().enumerate() {
                interleaved[i * num_channels + ch] = s;
            }
        }
        Self::new(interleaved, num_channels, sample_rate)
    }

    fn with_bit_depth(mut self, bits: u16) -> Self {
        self.bit_depth = bits;
        self
    }
}

impl AudioReader for MemoryReader {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    fn num_frames(&self) -> u64 {
        (self.samples.len() / self.channels) as u64
    }

    fn seek(&mut self, frame: u64) -> bool {
        if frame > self.num_frames() {
            return false;
        }
        self.position = frame;
        true
    }

    fn read(&mut self, dest: &mut [f32], frames: usize) -> usize {
        let remaining = self.num_frames().saturating_sub(self.position) as usize;
        let count = frames.min(remaining).min(dest.len() / self.channels);
        if count == 0 {
            return 0;
        }

        let start = self.position as usize * self.channels;
        let len = count * self.channels;
        dest[..len].copy_from_slice(&self.samples[start..start + len]);
        self.position += count as u64;
        count
    }

    fn position(&self) -> u64 {
        self.position
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WAV (hound)
// ═══════════════════════════════════════════════════════════════════════════════

/// Streaming WAV reader
pub struct WavFileReader {
    reader: hound::WavReader<BufReader<File>>,
    spec: hound::WavSpec,
    num_frames: u64,
    position: u64,
}

impl WavFileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        let reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(FileError::InvalidFile(format!(
                "{}: zero channels",
                path.as_ref().display()
            )));
        }
        let num_frames = reader.duration() as u64;

        Ok(Self {
            reader,
            spec,
            num_frames,
            position: 0,
        })
    }

    /// RIFF/WAVE header sniffing
    pub fn can_decode<P: AsRef<Path>>(path: P) -> bool {
        let Ok(mut file) = File::open(path) else {
            return false;
        };
        let mut header = [0u8; 12];
        if file.read_exact(&mut header).is_err() {
            return false;
        }
        &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE"
    }
}

impl AudioReader for WavFileReader {
    fn channels(&self) -> usize {
        self.spec.channels as usize
    }

    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn bit_depth(&self) -> u16 {
        self.spec.bits_per_sample
    }

    fn num_frames(&self) -> u64 {
        self.num_frames
    }

    fn seek(&mut self, frame: u64) -> bool {
        if frame > self.num_frames {
            return false;
        }
        match self.reader.seek(frame as u32) {
            Ok(()) => {
                self.position = frame;
                true
            }
            Err(e) => {
                log::warn!("[WavFileReader] seek to {} failed: {}", frame, e);
                false
            }
        }
    }

    fn read(&mut self, dest: &mut [f32], frames: usize) -> usize {
        let channels = self.spec.channels as usize;
        let frames = frames.min(dest.len() / channels);
        let wanted = frames * channels;
        let mut written = 0;

        match self.spec.sample_format {
            hound::SampleFormat::Float => {
                for sample in self.reader.samples::<f32>().take(wanted) {
                    match sample {
                        Ok(s) => dest[written] = s,
                        Err(_) => break,
                    }
                    written += 1;
                }
            }
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (self.spec.bits_per_sample - 1)) as f32;
                for sample in self.reader.samples::<i32>().take(wanted) {
                    match sample {
                        Ok(s) => dest[written] = s as f32 * scale,
                        Err(_) => break,
                    }
                    written += 1;
                }
            }
        }

        let frames_read = written / channels;
        self.position += frames_read as u64;
        frames_read
    }

    fn position(&self) -> u64 {
        self.position
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SYMPHONIA (FLAC, MP3, OGG, AAC, AIFF)
// ═══════════════════════════════════════════════════════════════════════════════

/// Reader for compressed formats. The file is decoded once on open.
pub struct SymphoniaReader {
    inner: MemoryReader,
}

impl SymphoniaReader {
    pub fn open<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|_| FileError::NotFound(path.display().to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| FileError::DecodeError(e.to_string()))?;
        let mut format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| FileError::InvalidFile("No audio track found".to_string()))?;

        let track_id = track.id;
        let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);
        let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
        let bit_depth = track.codec_params.bits_per_sample.unwrap_or(16) as u16;

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| FileError::DecodeError(e.to_string()))?;

        let mut samples: Vec<f32> = Vec::new();
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(FileError::DecodeError(e.to_string())),
            };
            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    if channels == 0 {
                        channels = decoded.spec().channels.count();
                    }
                    let buf = sample_buf.get_or_insert_with(|| {
                        SampleBuffer::new(decoded.capacity() as u64, *decoded.spec())
                    });
                    if buf.capacity() < decoded.capacity() * decoded.spec().channels.count() {
                        *buf = SampleBuffer::new(decoded.capacity() as u64, *decoded.spec());
                    }
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
                // Corrupt packet; keep going
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(FileError::DecodeError(e.to_string())),
            }
        }

        if channels == 0 {
            return Err(FileError::InvalidFile(format!("{}: zero channels", path.display())));
        }

        log::debug!(
            "[SymphoniaReader] decoded {}: {} ch, {} Hz, {} frames",
            path.display(),
            channels,
            sample_rate,
            samples.len() / channels
        );

        Ok(Self {
            inner: MemoryReader::new(samples, channels, sample_rate).with_bit_depth(bit_depth),
        })
    }

    /// True when symphonia recognises the container
    pub fn can_decode<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        let Ok(file) = File::open(path) else {
            return false;
        };
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .is_ok()
    }
}

impl AudioReader for SymphoniaReader {
    fn channels(&self) -> usize {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn bit_depth(&self) -> u16 {
        self.inner.bit_depth()
    }

    fn num_frames(&self) -> u64 {
        self.inner.num_frames()
    }

    fn seek(&mut self, frame: u64) -> bool {
        self.inner.seek(frame)
    }

    fn read(&mut self, dest: &mut [f32], frames: usize) -> usize {
        self.inner.read(dest, frames)
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_reader_read_and_seek() {
        let mut reader = MemoryReader::from_channels(&[vec![0.0, 1.0, 2.0, 3.0], vec![0.0, -1.0, -2.0, -3.0]], 48000);
        assert_eq!(reader.channels(), 2);
        assert_eq!(reader.num_frames(), 4);

        let mut buf = [0.0f32; 4];
        assert!(reader.seek(2));
        assert_eq!(reader.read(&mut buf, 2), 2);
        assert_eq!(buf, [2.0, -2.0, 3.0, -3.0]);
        assert_eq!(reader.read(&mut buf, 2), 0);
        assert!(!reader.seek(5));
    }

    #[test]
    fn test_memory_reader_respects_dest_len() {
        let mut reader = MemoryReader::new(vec![0.5; 100], 1, 44100);
        let mut buf = [0.0f32; 10];
        assert_eq!(reader.read(&mut buf, 50), 10);
        assert_eq!(reader.position(), 10);
    }
}
