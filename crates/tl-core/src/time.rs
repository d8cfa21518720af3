//! Timeline positions
//!
//! Positions are stored as a fixed-point count of ticks at [`UNIVERSAL_SAMPLE_RATE`].
//! The rate is a common multiple of every sample rate a device or file is likely
//! to use, so `from_frames` is exact for those rates and a position can be moved
//! between rates without accumulating error.

use serde::{Deserialize, Serialize};

/// Ticks per second
pub const UNIVERSAL_SAMPLE_RATE: i64 = 28_224_000;

/// Position (or length) on the timeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeRef(i64);

impl TimeRef {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(i64::MAX);

    #[inline]
    pub const fn from_universal(ticks: i64) -> Self {
        Self(ticks)
    }

    #[inline]
    pub const fn universal_frame(self) -> i64 {
        self.0
    }

    /// Position of `frames` at `rate`
    #[inline]
    pub fn from_frames(frames: i64, rate: u32) -> Self {
        debug_assert!(rate > 0);
        let ticks = (frames as i128 * UNIVERSAL_SAMPLE_RATE as i128).div_euclid(rate.max(1) as i128);
        Self(ticks as i64)
    }

    /// Frame index at `rate`, rounded toward negative infinity
    #[inline]
    pub fn to_frame(self, rate: u32) -> i64 {
        debug_assert!(rate > 0);
        (self.0 as i128 * rate as i128).div_euclid(UNIVERSAL_SAMPLE_RATE as i128) as i64
    }

    #[inline]
    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds * UNIVERSAL_SAMPLE_RATE as f64).floor() as i64)
    }

    #[inline]
    pub fn to_seconds(self) -> f64 {
        self.0 as f64 / UNIVERSAL_SAMPLE_RATE as f64
    }

    /// Move by a frame count expressed at `rate`
    #[inline]
    pub fn add_frames(self, frames: i64, rate: u32) -> Self {
        self + Self::from_frames(frames, rate)
    }
}

impl std::ops::Add for TimeRef {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for TimeRef {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::AddAssign for TimeRef {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::SubAssign for TimeRef {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl std::ops::Neg for TimeRef {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl std::fmt::Display for TimeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.to_seconds();
        let minutes = (secs / 60.0).floor();
        write!(f, "{:02}:{:06.3}", minutes as i64, secs - minutes * 60.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_rates_are_exact() {
        for rate in [8000, 22050, 32000, 44100, 48000, 88200, 96000, 176400, 192000] {
            let t = TimeRef::from_frames(12345, rate);
            assert_eq!(t.to_frame(rate), 12345, "rate {rate}");
        }
    }

    #[test]
    fn test_rounds_toward_negative_infinity() {
        // one tick short of frame 1 at 48k
        let t = TimeRef::from_universal(UNIVERSAL_SAMPLE_RATE / 48000 - 1);
        assert_eq!(t.to_frame(48000), 0);
        assert_eq!((-t).to_frame(48000), -1);
    }

    #[test]
    fn test_no_drift_over_add_sub_cycles() {
        let start = TimeRef::from_frames(1000, 44100);
        let mut t = start;
        for _ in 0..10_000 {
            t = t.add_frames(37, 48000);
            t = t.add_frames(-37, 48000);
        }
        assert_eq!(t, start);
    }

    #[test]
    fn test_cross_rate_conversion() {
        let one_second = TimeRef::from_frames(48000, 48000);
        assert_eq!(one_second.to_frame(44100), 44100);
        assert_eq!(one_second, TimeRef::from_seconds(1.0));
    }
}
