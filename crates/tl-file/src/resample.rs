//! Streaming sample-rate conversion
//!
//! Linear interpolation between neighbouring source frames. Output positions
//! are derived from the absolute output frame index, so long reads and seeks
//! never drift against the source.

use crate::AudioReader;

/// Wraps a reader and presents it at `output_rate`
pub struct ResampleReader {
    inner: Box<dyn AudioReader>,
    output_rate: u32,
    /// Source frames per output frame
    ratio: f64,
    /// Decoded source frames starting at `window_start`
    window: Vec<f32>,
    window_start: u64,
    window_frames: usize,
    position: u64,
}

impl ResampleReader {
    pub fn new(inner: Box<dyn AudioReader>, output_rate: u32) -> Self {
        let ratio = inner.sample_rate() as f64 / output_rate.max(1) as f64;
        Self {
            inner,
            output_rate,
            ratio,
            window: Vec::new(),
            window_start: 0,
            window_frames: 0,
            position: 0,
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.sample_rate() == self.output_rate
    }

    /// Change the output rate, keeping the current position in time
    pub fn set_output_rate(&mut self, output_rate: u32) {
        let seconds = self.position as f64 / self.output_rate.max(1) as f64;
        self.output_rate = output_rate;
        self.ratio = self.inner.sample_rate() as f64 / output_rate.max(1) as f64;
        self.window.clear();
        self.window_frames = 0;
        let target = (seconds * output_rate as f64).floor() as u64;
        self.seek(target);
    }

    /// Make the window cover source frames `[first, end)` as far as the
    /// source allows
    fn fill_window(&mut self, first: u64, end: u64) {
        let ch = self.inner.channels();
        let window_end = self.window_start + self.window_frames as u64;

        if self.window_frames == 0 || first < self.window_start || first > window_end {
            self.window.clear();
            self.window_frames = 0;
            self.window_start = first;
            if !self.inner.seek(first) {
                return;
            }
        } else if first > self.window_start {
            let drop = (first - self.window_start) as usize;
            self.window.drain(..drop * ch);
            self.window_frames -= drop;
            self.window_start = first;
        }

        let have_end = self.window_start + self.window_frames as u64;
        if end <= have_end {
            return;
        }
        let need = (end - have_end) as usize;
        let old_len = self.window.len();
        self.window.resize(old_len + need * ch, 0.0);
        let got = self.inner.read(&mut self.window[old_len..], need);
        self.window.truncate(old_len + got * ch);
        self.window_frames += got;
    }
}

impl AudioReader for ResampleReader {
    fn channels(&self) -> usize {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.output_rate
    }

    fn bit_depth(&self) -> u16 {
        self.inner.bit_depth()
    }

    fn num_frames(&self) -> u64 {
        if self.is_passthrough() {
            return self.inner.num_frames();
        }
        let in_rate = self.inner.sample_rate().max(1) as u128;
        (self.inner.num_frames() as u128 * self.output_rate as u128 / in_rate) as u64
    }

    fn seek(&mut self, frame: u64) -> bool {
        if frame > self.num_frames() {
            return false;
        }
        self.position = frame;
        if self.is_passthrough() {
            return self.inner.seek(frame);
        }
        true
    }

    fn read(&mut self, dest: &mut [f32], frames: usize) -> usize {
        let ch = self.inner.channels();
        let frames = frames.min(dest.len() / ch);
        if frames == 0 {
            return 0;
        }

        if self.is_passthrough() {
            let got = self.inner.read(dest, frames);
            self.position += got as u64;
            return got;
        }

        let first = (self.position as f64 * self.ratio).floor() as u64;
        let last = ((self.position + frames as u64 - 1) as f64 * self.ratio).floor() as u64;
        self.fill_window(first, last + 2);

        let window_end = self.window_start + self.window_frames as u64;
        let mut produced = 0;
        for i in 0..frames {
            let pos = (self.position + i as u64) as f64 * self.ratio;
            let i0 = pos.floor() as u64;
            if i0 < self.window_start || i0 >= window_end {
                break;
            }
            let frac = (pos - i0 as f64) as f32;
            let a = (i0 - self.window_start) as usize * ch;
            let b = if i0 + 1 < window_end { a + ch } else { a };
            for c in 0..ch {
                let s0 = self.window[a + c];
                let s1 = self.window[b + c];
                dest[i * ch + c] = s0 + (s1 - s0) * frac;
            }
            produced += 1;
        }

        self.position += produced as u64;
        produced
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryReader;
    use approx::assert_relative_eq;

    #[test]
    fn test_passthrough_at_same_rate() {
        let source = MemoryReader::new((0..100).map(|i| i as f32).collect(), 1, 48000);
        let mut reader = ResampleReader::new(Box::new(source), 48000);
        assert!(reader.is_passthrough());
        assert_eq!(reader.num_frames(), 100);

        let mut buf = [0.0f32; 10];
        assert!(reader.seek(50));
        assert_eq!(reader.read(&mut buf, 10), 10);
        assert_eq!(buf[0], 50.0);
    }

    #[test]
    fn test_upsample_doubles_length_and_interpolates() {
        let source = MemoryReader::new((0..100).map(|i| i as f32).collect(), 1, 24000);
        let mut reader = ResampleReader::new(Box::new(source), 48000);
        assert_eq!(reader.num_frames(), 200);

        let mut buf = [0.0f32; 6];
        assert_eq!(reader.read(&mut buf, 6), 6);
        assert_relative_eq!(buf[0], 0.0);
        assert_relative_eq!(buf[1], 0.5);
        assert_relative_eq!(buf[2], 1.0);
        assert_relative_eq!(buf[5], 2.5);
    }

    #[test]
    fn test_chunked_reads_match_single_read() {
        let data: Vec<f32> = (0..4410).map(|i| (i as f32 * 0.01).sin()).collect();

        let mut whole = ResampleReader::new(Box::new(MemoryReader::new(data.clone(), 1, 44100)), 48000);
        let mut expected = vec![0.0f32; 4800];
        let n = whole.read(&mut expected, 4800);

        let mut chunked = ResampleReader::new(Box::new(MemoryReader::new(data, 1, 44100)), 48000);
        let mut actual = vec![0.0f32; 4800];
        let mut done = 0;
        while done < n {
            let got = chunked.read(&mut actual[done..], 333);
            if got == 0 {
                break;
            }
            done += got;
        }
        assert_eq!(done, n);
        for i in 0..n {
            assert_relative_eq!(actual[i], expected[i]);
        }
    }

    #[test]
    fn test_seek_then_read() {
        let source = MemoryReader::new((0..1000).map(|i| i as f32).collect(), 1, 24000);
        let mut reader = ResampleReader::new(Box::new(source), 48000);
        assert!(reader.seek(400));
        let mut buf = [0.0f32; 2];
        assert_eq!(reader.read(&mut buf, 2), 2);
        assert_relative_eq!(buf[0], 200.0);
        assert_relative_eq!(buf[1], 200.5);
    }
}
