//! Rate-control state assembly and the reference software rate model.
//!
//! Most codec families delegate bitrate control to the engine (VBR with the
//! configured target/max). The VP9 family runs the engine in CQP mode and
//! consults a [`RateModel`] for one quantizer per frame; this module builds
//! the model's configuration from the encoder configuration and ships a
//! deterministic leaky-bucket model as the in-tree collaborator.

use tracing::debug;
use vega_core::config::EncoderConfig;
use vega_core::engine::{LayerRate, RateControlConfig, RateModel};
use vega_core::types::{FrameType, VideoCodec};

use crate::qp_table::{
    index_to_quantizer, MAX_QINDEX_AV1, MAX_QINDEX_VP9, MIN_QINDEX_AV1, MIN_QINDEX_VP9,
};

/// Bitrate split across temporal layers, indexed by `layer_count - 2`.
/// Layer 0 is the base layer.
pub const TEMPORAL_LAYER_BITRATE_FRACTIONS: [[f64; 3]; 2] = [
    [0.50, 0.50, 0.00], // two temporal layers
    [0.25, 0.25, 0.50], // three temporal layers
];

/// Buffer model sizing in abstract milliseconds of payload.
pub const BUF_INITIAL_MS: u32 = 500;
pub const BUF_OPTIMAL_MS: u32 = 600;
pub const BUF_MAX_MS: u32 = 1000;

/// Keyframe size ceiling relative to a steady-state frame, in percent, with
/// a 300% floor.
pub fn max_intra_size_pct(optimal_buffer_ms: u32, framerate: f64) -> u32 {
    let target_size_byte_per_frame = optimal_buffer_ms as f64 * 0.5;
    let target_size_kbyte = (target_size_byte_per_frame * framerate / 1000.0) as u32;
    (target_size_kbyte * 100).max(300)
}

/// Native quantizer bounds for a codec family, via the quantizer table.
fn quantizer_bounds(codec: VideoCodec) -> (u16, u16) {
    let (min_idx, max_idx) = match codec {
        VideoCodec::Av1 => (MIN_QINDEX_AV1, MAX_QINDEX_AV1),
        _ => (MIN_QINDEX_VP9, MAX_QINDEX_VP9),
    };
    (index_to_quantizer(min_idx), index_to_quantizer(max_idx))
}

/// Build the rate-control state for one encoder configuration. Called at
/// init and again whenever bitrate, frame rate or resolution change.
pub fn build_rate_control(cfg: &EncoderConfig) -> RateControlConfig {
    let (min_quantizer, max_quantizer) = quantizer_bounds(cfg.codec());
    let layer_count = cfg.temporal_layers.clamp(1, 3) as usize;

    let layers = (0..layer_count)
        .map(|i| {
            let fraction = if layer_count == 1 {
                1.0
            } else {
                TEMPORAL_LAYER_BITRATE_FRACTIONS[layer_count - 2][i]
            };
            LayerRate {
                target_bitrate_bps: (cfg.target_bitrate_bps as f64 * fraction) as u32,
                decimator: 1 << (layer_count - 1 - i),
                min_quantizer,
                max_quantizer,
            }
        })
        .collect();

    RateControlConfig {
        width: cfg.width,
        height: cfg.height,
        min_quantizer,
        max_quantizer,
        target_bitrate_bps: cfg.target_bitrate_bps,
        framerate: cfg.framerate,
        buf_initial_ms: BUF_INITIAL_MS,
        buf_optimal_ms: BUF_OPTIMAL_MS,
        buf_max_ms: BUF_MAX_MS,
        undershoot_pct: 50,
        overshoot_pct: 50,
        max_intra_bitrate_pct: max_intra_size_pct(BUF_OPTIMAL_MS, cfg.framerate),
        layers,
    }
}

/// Deterministic leaky-bucket [`RateModel`].
///
/// The quantizer mixes two terms: a rate term from the configured bits per
/// pixel (so target changes take effect on the very next frame) and an
/// occupancy term from the bucket's distance to the optimal level (so
/// sustained over/undershoot is corrected). The same value is used for
/// intra and inter frames.
pub struct LeakyBucketModel {
    config: RateControlConfig,
    /// Current bucket fullness in bits.
    bucket_bits: f64,
    last_qp: u16,
}

/// Bits-per-pixel level at which the rate term sits at its midpoint.
const REFERENCE_BPP: f64 = 0.1;

impl LeakyBucketModel {
    pub fn new() -> Self {
        Self {
            config: RateControlConfig {
                width: 0,
                height: 0,
                min_quantizer: 0,
                max_quantizer: 0,
                target_bitrate_bps: 0,
                framerate: 0.0,
                buf_initial_ms: BUF_INITIAL_MS,
                buf_optimal_ms: BUF_OPTIMAL_MS,
                buf_max_ms: BUF_MAX_MS,
                undershoot_pct: 50,
                overshoot_pct: 50,
                max_intra_bitrate_pct: 300,
                layers: Vec::new(),
            },
            bucket_bits: 0.0,
            last_qp: 0,
        }
    }

    pub fn last_qp(&self) -> u16 {
        self.last_qp
    }

    fn ms_to_bits(&self, ms: u32) -> f64 {
        ms as f64 / 1000.0 * self.config.target_bitrate_bps as f64
    }

    fn bits_per_frame(&self) -> f64 {
        self.config.target_bitrate_bps as f64 / self.config.framerate.max(1.0)
    }
}

impl Default for LeakyBucketModel {
    fn default() -> Self {
        Self::new()
    }
}

impl RateModel for LeakyBucketModel {
    fn configure(&mut self, config: &RateControlConfig) {
        self.config = config.clone();
        self.bucket_bits = self.ms_to_bits(config.buf_initial_ms);
        self.last_qp = (config.min_quantizer + config.max_quantizer) / 2;
    }

    fn compute_qp(&mut self, frame_type: FrameType) -> u16 {
        let c = &self.config;
        let span = c.max_quantizer.saturating_sub(c.min_quantizer) as f64;
        let pixels = (c.width as u64 * c.height as u64).max(1) as f64;
        let bpp = self.bits_per_frame() / pixels;

        let rate_term = (REFERENCE_BPP / bpp * 0.5).clamp(0.0, 1.0);

        let optimal = self.ms_to_bits(c.buf_optimal_ms);
        let max = self.ms_to_bits(c.buf_max_ms).max(1.0);
        let pressure = ((self.bucket_bits - optimal) / max).clamp(-1.0, 1.0);
        let occupancy = 0.5 + 0.5 * pressure;

        let mix = (0.7 * rate_term + 0.3 * occupancy).clamp(0.0, 1.0);
        let qp = c.min_quantizer + (span * mix).round() as u16;
        let qp = qp.min(c.max_quantizer);

        debug!(?frame_type, qp, bucket_bits = self.bucket_bits, "computed quantizer");
        self.last_qp = qp;
        qp
    }

    fn update_bitrate(&mut self, config: &RateControlConfig) {
        // Carry the relative bucket fullness across the target change so
        // quantizer history survives a rate update.
        let old_max = self.ms_to_bits(self.config.buf_max_ms).max(1.0);
        let ratio = (self.bucket_bits / old_max).clamp(0.0, 1.0);
        self.config = config.clone();
        self.bucket_bits = ratio * self.ms_to_bits(config.buf_max_ms);
    }

    fn post_encode(&mut self, encoded_bytes: usize) {
        let drained = self.bits_per_frame();
        let max = self.ms_to_bits(self.config.buf_max_ms);
        self.bucket_bits =
            (self.bucket_bits + encoded_bytes as f64 * 8.0 - drained).clamp(0.0, max);
    }
}
