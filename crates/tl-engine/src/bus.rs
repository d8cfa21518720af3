//! Multi-channel sample buffers used between mixing stages

/// Planar `f32` buffer with a fixed channel count and a block-sized length.
/// Allocation only happens in [`AudioBus::new`] and [`AudioBus::resize`].
#[derive(Debug, Clone)]
pub struct AudioBus {
    channels: Vec<Vec<f32>>,
    frames: usize,
}

impl AudioBus {
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels: vec![vec![0.0; frames]; channels],
            frames,
        }
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.channels[ch]
    }

    #[inline]
    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        &mut self.channels[ch]
    }

    /// Change the block length. Control thread only.
    pub fn resize(&mut self, frames: usize) {
        for ch in &mut self.channels {
            ch.resize(frames, 0.0);
        }
        self.frames = frames;
    }

    /// Zero the first `frames` frames of every channel
    #[inline]
    pub fn silence(&mut self, frames: usize) {
        let n = frames.min(self.frames);
        for ch in &mut self.channels {
            ch[..n].fill(0.0);
        }
    }

    /// Sum `src` into this bus over `frames`. A mono source feeds every
    /// destination channel; otherwise channels are paired by index.
    pub fn mix_from(&mut self, src: &AudioBus, frames: usize) {
        let n = frames.min(self.frames).min(src.frames);
        if src.channel_count() == 0 {
            return;
        }
        for (ch, dst) in self.channels.iter_mut().enumerate() {
            let src_ch = if src.channel_count() == 1 {
                0
            } else if ch < src.channel_count() {
                ch
            } else {
                continue;
            };
            mix_buffers_no_gain(&mut dst[..n], &src.channels[src_ch][..n]);
        }
    }

    #[inline]
    pub fn apply_gain(&mut self, frames: usize, gain: f32) {
        if gain == 1.0 {
            return;
        }
        let n = frames.min(self.frames);
        for ch in &mut self.channels {
            for s in &mut ch[..n] {
                *s *= gain;
            }
        }
    }
}

#[inline]
pub fn mix_buffers_no_gain(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_feeds_both_channels() {
        let mut mono = AudioBus::new(1, 4);
        mono.channel_mut(0).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

        let mut stereo = AudioBus::new(2, 4);
        stereo.mix_from(&mono, 4);
        stereo.mix_from(&mono, 4);
        assert_eq!(stereo.channel(0), &[2.0, 4.0, 6.0, 8.0]);
        assert_eq!(stereo.channel(1), &[2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_silence_clears_every_channel() {
        let mut bus = AudioBus::new(2, 8);
        bus.channel_mut(1)[3] = -0.75;
        bus.silence(8);
        assert!(bus.channel(0).iter().chain(bus.channel(1)).all(|&s| s == 0.0));
    }

    #[test]
    fn test_resize_keeps_channels() {
        let mut bus = AudioBus::new(2, 8);
        bus.resize(16);
        assert_eq!(bus.frames(), 16);
        assert_eq!(bus.channel(1).len(), 16);
    }
}
