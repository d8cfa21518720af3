//! tl-core: Shared types for the timeline engine
//!
//! Time positions, gain conversions, errors and engine configuration used by
//! every other crate in the workspace.

mod config;
mod error;
mod time;

pub use config::*;
pub use error::*;
pub use time::*;

/// Maximum clip amplification, dB
pub const MAX_CLIP_GAIN_DB: f64 = 24.0;

/// Gain in decibels
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Decibels(pub f64);

impl Decibels {
    pub const ZERO: Self = Self(0.0);
    pub const NEG_INF: Self = Self(f64::NEG_INFINITY);

    #[inline]
    pub fn from_gain(gain: f64) -> Self {
        if gain <= 0.0 {
            Self::NEG_INF
        } else {
            Self(20.0 * gain.log10())
        }
    }

    #[inline]
    pub fn to_gain(self) -> f64 {
        if self.0 <= -144.0 {
            0.0
        } else {
            10.0_f64.powf(self.0 / 20.0)
        }
    }
}

impl Default for Decibels {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Largest linear gain a clip may carry
#[inline]
pub fn max_clip_gain() -> f32 {
    Decibels(MAX_CLIP_GAIN_DB).to_gain() as f32
}

/// Relative float equality with a 1e-5 tolerance
#[inline]
pub fn fuzzy_eq(a: f32, b: f32) -> bool {
    (a - b).abs() * 100_000.0 <= a.abs().min(b.abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_decibels() {
        assert_relative_eq!(Decibels(0.0).to_gain(), 1.0);
        assert_relative_eq!(Decibels(-6.0206).to_gain(), 0.5, epsilon = 1e-4);
        assert_eq!(Decibels(-200.0).to_gain(), 0.0);
        assert_eq!(Decibels::from_gain(0.0), Decibels::NEG_INF);
    }

    #[test]
    fn test_max_clip_gain() {
        assert_relative_eq!(max_clip_gain(), 15.848932, epsilon = 1e-4);
    }

    #[test]
    fn test_fuzzy_eq() {
        assert!(fuzzy_eq(1.0, 1.0));
        assert!(fuzzy_eq(1.0, 1.0 - f32::EPSILON));
        assert!(!fuzzy_eq(1.0, 0.99));
        assert!(!fuzzy_eq(0.0, 0.5));
    }
}
