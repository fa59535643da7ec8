//! Encoder configuration and validation.

use serde::{Deserialize, Serialize};

use crate::error::{EncodeError, Result};
use crate::types::Profile;

/// Hardware alignment unit for encode surfaces.
pub const SURFACE_ALIGNMENT: u32 = 16;

/// Round `v` up to the surface alignment unit.
pub fn align16(v: u32) -> u32 {
    (v + (SURFACE_ALIGNMENT - 1)) & !(SURFACE_ALIGNMENT - 1)
}

/// Exact rational frame rate handed to the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    /// Convert a floating-point frame rate to an exact rational, recognizing
    /// integer rates and NTSC 1.001-denominator rates (29.97, 59.94, ...).
    pub fn from_fps(fps: f64) -> Self {
        let rounded = (fps + 0.5) as u32;
        if (rounded as f64 - fps).abs() < 0.0001 {
            return Self { num: rounded, den: 1 };
        }

        let ntsc = (fps * 1.001 + 0.5) as u32;
        if (ntsc as f64 * 1000.0 - fps * 1001.0).abs() < 10.0 {
            return Self {
                num: ntsc * 1000,
                den: 1001,
            };
        }

        Self {
            num: (fps * 10000.0 + 0.5) as u32,
            den: 10000,
        }
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

/// Static configuration for one encode session.
///
/// `width`/`height` are the caller's crop dimensions; the engine works on
/// 16-aligned dimensions derived from them. The profile variant carries the
/// codec identity (see [`Profile`]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub profile: Profile,
    pub width: u32,
    pub height: u32,
    /// Steady-state target in bits per second.
    pub target_bitrate_bps: u32,
    /// Hard ceiling in bits per second. Must be >= the target.
    pub max_bitrate_bps: u32,
    pub framerate: f64,
    /// Requested temporal layer count. Clamped to 1..=3 by [`normalized`].
    ///
    /// [`normalized`]: EncoderConfig::normalized
    pub temporal_layers: u8,
}

impl EncoderConfig {
    pub fn codec(&self) -> crate::types::VideoCodec {
        self.profile.codec()
    }

    /// Aligned dimensions the engine session is created with.
    pub fn aligned_size(&self) -> (u32, u32) {
        (align16(self.width), align16(self.height))
    }

    /// Copy of the config with out-of-range fields pulled into range:
    /// temporal layers clamped to 1..=3 (a zero request means "one layer").
    pub fn normalized(&self) -> Self {
        let mut cfg = self.clone();
        cfg.temporal_layers = cfg.temporal_layers.clamp(1, 3);
        cfg
    }

    /// Enforce the construction invariants. Called at session init; a
    /// failure here is fatal to `init` and leaves no session behind.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(EncodeError::Configuration(format!(
                "zero frame dimension {}x{}",
                self.width, self.height
            )));
        }
        if self.target_bitrate_bps == 0 {
            return Err(EncodeError::Configuration("zero target bitrate".into()));
        }
        if self.target_bitrate_bps > self.max_bitrate_bps {
            return Err(EncodeError::Configuration(format!(
                "target bitrate {} exceeds max {}",
                self.target_bitrate_bps, self.max_bitrate_bps
            )));
        }
        if self.framerate < 1.0 {
            return Err(EncodeError::Configuration(format!(
                "frame rate {} below 1.0",
                self.framerate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Profile;

    fn base() -> EncoderConfig {
        EncoderConfig {
            profile: Profile::H264ConstrainedBaseline,
            width: 1280,
            height: 720,
            target_bitrate_bps: 2_000_000,
            max_bitrate_bps: 2_500_000,
            framerate: 30.0,
            temporal_layers: 1,
        }
    }

    #[test]
    fn align16_rounds_up() {
        assert_eq!(align16(1280), 1280);
        assert_eq!(align16(720), 720);
        assert_eq!(align16(1080), 1088);
        assert_eq!(align16(1), 16);
        assert_eq!(align16(0), 0);
    }

    #[test]
    fn integer_fps_is_exact() {
        assert_eq!(Rational::from_fps(30.0), Rational { num: 30, den: 1 });
        assert_eq!(Rational::from_fps(60.0), Rational { num: 60, den: 1 });
    }

    #[test]
    fn ntsc_fps_gets_1001_denominator() {
        assert_eq!(
            Rational::from_fps(29.97),
            Rational { num: 30000, den: 1001 }
        );
        assert_eq!(
            Rational::from_fps(59.94),
            Rational { num: 60000, den: 1001 }
        );
    }

    #[test]
    fn odd_fps_falls_back_to_fixed_denominator() {
        let r = Rational::from_fps(12.5);
        assert_eq!(r, Rational { num: 125000, den: 10000 });
        assert!((r.as_f64() - 12.5).abs() < 1e-9);
    }

    #[test]
    fn valid_config_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn zero_dimension_rejected() {
        let mut cfg = base();
        cfg.height = 0;
        assert!(matches!(
            cfg.validate(),
            Err(crate::error::EncodeError::Configuration(_))
        ));
    }

    #[test]
    fn target_above_max_rejected() {
        let mut cfg = base();
        cfg.max_bitrate_bps = 1_000_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn temporal_layers_clamped() {
        let mut cfg = base();
        cfg.temporal_layers = 0;
        assert_eq!(cfg.normalized().temporal_layers, 1);
        cfg.temporal_layers = 7;
        assert_eq!(cfg.normalized().temporal_layers, 3);
        cfg.temporal_layers = 2;
        assert_eq!(cfg.normalized().temporal_layers, 2);
    }

    #[test]
    fn aligned_size_is_16_aligned() {
        let mut cfg = base();
        cfg.width = 1080;
        cfg.height = 607;
        assert_eq!(cfg.aligned_size(), (1088, 608));
    }
}
