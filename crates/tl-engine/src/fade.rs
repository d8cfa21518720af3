//! Clip fades and gain envelopes

use serde::{Deserialize, Serialize};
use tl_core::TimeRef;

use crate::bus::AudioBus;

// ═══════════════════════════════════════════════════════════════════════════
// FADES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FadeDirection {
    In,
    Out,
}

/// Fade curve shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FadeShape {
    Linear,
    /// Rises quickly, settles late
    #[default]
    Fast,
    /// Starts slowly
    Slow,
    /// Smooth sigmoid
    SCurve,
}

/// Fade attached to one end of a clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FadeCurve {
    pub direction: FadeDirection,
    /// Length of the fade on the timeline
    pub range: TimeRef,
    pub shape: FadeShape,
    /// Exponent modifier for `Fast`/`Slow` (0 = linear)
    pub bend: f32,
    /// Blend between a linear ramp (0.0) and the full shape (1.0)
    pub strength: f32,
    pub bypassed: bool,
}

impl FadeCurve {
    pub fn new(direction: FadeDirection, range: TimeRef) -> Self {
        Self {
            direction,
            range,
            shape: FadeShape::default(),
            bend: 1.0,
            strength: 1.0,
            bypassed: false,
        }
    }

    /// Gain at normalized progress `t` through the fade (0 = start of the fade
    /// region on the timeline, 1 = end)
    pub fn gain_at(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        let x = match self.direction {
            FadeDirection::In => t,
            FadeDirection::Out => 1.0 - t,
        };
        let exponent = 1.0 + self.bend.max(0.0);
        let shaped = match self.shape {
            FadeShape::Linear => x,
            FadeShape::Fast => 1.0 - (1.0 - x).powf(exponent),
            FadeShape::Slow => x.powf(exponent),
            FadeShape::SCurve => 0.5 - 0.5 * (std::f32::consts::PI * x).cos(),
        };
        x + (shaped - x) * self.strength.clamp(0.0, 1.0)
    }

    /// Apply to `frames` frames of `bus` starting at `offset`. `fade_pos` is the
    /// position of the first frame relative to the fade start, `fade_len` the
    /// fade length, both in output-rate frames.
    pub fn apply(&self, bus: &mut AudioBus, offset: usize, frames: usize, fade_pos: i64, fade_len: i64) {
        if self.bypassed || fade_len <= 0 {
            return;
        }
        let first = (-fade_pos).max(0) as usize;
        let last = ((fade_len - fade_pos).max(0) as usize).min(frames);
        if first >= last {
            return;
        }
        for i in first..last {
            let gain = self.gain_at((fade_pos + i as i64) as f32 / fade_len as f32);
            for ch in 0..bus.channel_count() {
                bus.channel_mut(ch)[offset + i] *= gain;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// GAIN ENVELOPE
// ═══════════════════════════════════════════════════════════════════════════

/// Envelope breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvelopePoint {
    /// Position in source space
    pub time: TimeRef,
    /// Linear gain
    pub value: f32,
}

/// Piecewise-linear per-frame gain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GainEnvelope {
    points: Vec<EnvelopePoint>,
}

impl GainEnvelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[EnvelopePoint] {
        &self.points
    }

    /// Insert keeping points sorted. A point at an existing time replaces it.
    pub fn add_point(&mut self, time: TimeRef, value: f32) {
        let value = value.max(0.0);
        match self.points.binary_search_by(|p| p.time.cmp(&time)) {
            Ok(i) => self.points[i].value = value,
            Err(i) => self.points.insert(i, EnvelopePoint { time, value }),
        }
    }

    pub fn remove_point(&mut self, time: TimeRef) -> bool {
        match self.points.binary_search_by(|p| p.time.cmp(&time)) {
            Ok(i) => {
                self.points.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn value_at(&self, time: TimeRef) -> f32 {
        let Some(first) = self.points.first() else {
            return 1.0;
        };
        if time <= first.time {
            return first.value;
        }
        let idx = self.points.partition_point(|p| p.time <= time);
        if idx >= self.points.len() {
            return self.points[self.points.len() - 1].value;
        }
        interpolate(&self.points[idx - 1], &self.points[idx], time)
    }

    /// Multiply `frames` frames of `bus` from `offset` by `gain * envelope(t)`
    /// where `t` starts at `start` and advances one frame at `rate` per frame
    pub fn apply(&self, bus: &mut AudioBus, offset: usize, frames: usize, start: TimeRef, rate: u32, gain: f32) {
        if self.points.is_empty() {
            bus_apply_range(bus, offset, frames, gain);
            return;
        }

        let mut idx = self.points.partition_point(|p| p.time <= start);
        for i in 0..frames {
            let t = start.add_frames(i as i64, rate);
            while idx < self.points.len() && self.points[idx].time <= t {
                idx += 1;
            }
            let value = if idx == 0 {
                self.points[0].value
            } else if idx >= self.points.len() {
                self.points[self.points.len() - 1].value
            } else {
                interpolate(&self.points[idx - 1], &self.points[idx], t)
            };
            let g = gain * value;
            for ch in 0..bus.channel_count() {
                bus.channel_mut(ch)[offset + i] *= g;
            }
        }
    }
}

fn interpolate(a: &EnvelopePoint, b: &EnvelopePoint, time: TimeRef) -> f32 {
    let span = (b.time - a.time).universal_frame();
    if span <= 0 {
        return b.value;
    }
    let frac = (time - a.time).universal_frame() as f64 / span as f64;
    a.value + (b.value - a.value) * frac as f32
}

fn bus_apply_range(bus: &mut AudioBus, offset: usize, frames: usize, gain: f32) {
    if gain == 1.0 {
        return;
    }
    for ch in 0..bus.channel_count() {
        for s in &mut bus.channel_mut(ch)[offset..offset + frames] {
            *s *= gain;
        }
    }
}
