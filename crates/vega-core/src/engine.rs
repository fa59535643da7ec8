//! Cross-crate traits and parameter types at the engine boundary.
//!
//! This is the neutral home for the three collaborator interfaces the
//! pipeline talks to: the hardware codec engine, the software rate-model
//! used for one codec family, and the consumer callback that receives
//! encoded access units. Hardware backends depend on this crate alone.
//!
//! An [`EncodeEngine`] is one explicitly owned session handle, constructed
//! by the caller and moved into the encode session. There is no process-wide
//! engine factory; teardown order is the owner's to decide.

use std::time::Duration;

use crate::bitstream::Bitstream;
use crate::config::{EncoderConfig, Rational};
use crate::error::{EncodeError, Result};
use crate::types::{FrameType, PixelFormat, Profile, Surface, VideoCodec};

/// Status codes reported by the engine. Statuses are not errors by
/// themselves — the session decides which are transient, which drop the
/// frame, and which invalidate the session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Success,
    /// Transient: the device cannot accept work right now. Retried with a
    /// bounded budget.
    DeviceBusy,
    /// Transient: the output buffer is too small. Triggers grow-and-retry.
    NotEnoughBuffer,
    /// Warning-grade: the engine adjusted incompatible parameters itself.
    /// Treated as success.
    IncompatibleParams,
    /// The engine is unusable; the session must be rebuilt.
    DeviceLost,
    /// Any other hard failure, with the engine's native code.
    Failed(i32),
}

impl EngineStatus {
    /// Success for the purposes of a submit/init call (the engine may have
    /// silently adjusted parameters).
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::IncompatibleParams)
    }
}

/// Per-frame bitrate control handed to the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RateControlMode {
    /// Engine-internal variable bitrate control.
    Vbr { target_kbps: u32, max_kbps: u32 },
    /// Constant quantizer; the session updates the QPs per frame when a
    /// software rate model drives this codec family.
    Cqp { qp_intra: u16, qp_inter: u16 },
}

/// Codec-specific extension parameters, assembled once at init from the
/// encoder configuration and validated before use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtParam {
    /// AVC/HEVC byte-stream toggles. The transport wants bare slice data:
    /// no AU delimiters, no picture-timing SEI, no HRD timing in the VUI,
    /// and no PPS repetition.
    CodingOptions {
        au_delimiter: bool,
        pic_timing_sei: bool,
        vui_nal_hrd: bool,
        repeat_pps: bool,
    },
    /// Adaptive long-term reference control.
    AdaptiveLtr { enabled: bool },
    /// Explicit luma sample dimensions for HEVC when the crop is 8- but not
    /// 16-aligned.
    HevcPictureSize { luma_width: u32, luma_height: u32 },
    /// VP9 container-header toggle. The transport does not tolerate IVF
    /// headers in the elementary stream.
    Vp9Params { write_ivf_headers: bool },
    /// AVC/HEVC temporal layer structure: per-layer frame-rate scale,
    /// lowest layer first.
    TemporalLayers { base_layer_pid: u8, scales: Vec<u8> },
    /// VP9 temporal layer structure, frame-rate scale per layer.
    Vp9TemporalLayers { scales: Vec<u8> },
}

/// Full parameter block for one engine session.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineParams {
    pub codec: VideoCodec,
    pub profile: Profile,
    /// Aligned dimensions the engine encodes at.
    pub width: u32,
    pub height: u32,
    /// Visible crop inside the aligned frame.
    pub crop_width: u32,
    pub crop_height: u32,
    pub framerate: Rational,
    pub pixel_format: PixelFormat,
    pub rate_control: RateControlMode,
    /// Submit pipelining depth. One for the real-time path.
    pub async_depth: u16,
    pub num_ref_frames: u16,
    pub low_power: bool,
    pub extensions: Vec<ExtParam>,
    /// Engine-suggested output buffer size in KB, filled by the engine
    /// after init and read back for the grow-and-retry path.
    pub buffer_size_kb: u32,
}

/// Default CQP quantizer until the rate model produces its first value.
pub const DEFAULT_CQP_QUANTIZER: u16 = 31;

impl EngineParams {
    /// Assemble the per-codec parameter set from a validated configuration.
    pub fn from_config(cfg: &EncoderConfig) -> Result<Self> {
        let codec = cfg.codec();
        let (width, height) = cfg.aligned_size();
        let layers = cfg.temporal_layers;
        if !(1..=3).contains(&layers) {
            return Err(EncodeError::Configuration(format!(
                "temporal layer count {layers} outside 1..=3"
            )));
        }

        let rate_control = if codec.uses_software_rate_control() {
            // The engine reports incompatible params if a bitrate ceiling is
            // combined with CQP, so the mode carries no VBR fields at all.
            RateControlMode::Cqp {
                qp_intra: DEFAULT_CQP_QUANTIZER,
                qp_inter: DEFAULT_CQP_QUANTIZER,
            }
        } else {
            RateControlMode::Vbr {
                target_kbps: cfg.target_bitrate_bps / 1000,
                max_kbps: cfg.max_bitrate_bps / 1000,
            }
        };

        let layer_scales: Vec<u8> = (0..layers).map(|l| 1u8 << l).collect();
        let mut extensions = Vec::new();
        match codec {
            VideoCodec::H264 | VideoCodec::H265 => {
                extensions.push(ExtParam::CodingOptions {
                    au_delimiter: false,
                    pic_timing_sei: false,
                    vui_nal_hrd: false,
                    repeat_pps: false,
                });
                extensions.push(ExtParam::AdaptiveLtr { enabled: true });
                if codec == VideoCodec::H265
                    && (cfg.width % 16 == 8 || cfg.height % 16 == 8)
                {
                    extensions.push(ExtParam::HevcPictureSize {
                        luma_width: cfg.width,
                        luma_height: cfg.height,
                    });
                }
                if layers > 1 {
                    extensions.push(ExtParam::TemporalLayers {
                        base_layer_pid: 1,
                        scales: layer_scales,
                    });
                }
            }
            VideoCodec::Vp9 => {
                extensions.push(ExtParam::Vp9Params {
                    write_ivf_headers: false,
                });
                if layers > 1 {
                    extensions.push(ExtParam::Vp9TemporalLayers {
                        scales: layer_scales,
                    });
                }
            }
            VideoCodec::Av1 => {
                extensions.push(ExtParam::AdaptiveLtr { enabled: true });
            }
        }

        Ok(Self {
            codec,
            profile: cfg.profile,
            width,
            height,
            crop_width: cfg.width,
            crop_height: cfg.height,
            framerate: Rational::from_fps(cfg.framerate),
            pixel_format: cfg.profile.surface_format(),
            rate_control,
            async_depth: 1,
            num_ref_frames: 2,
            low_power: true,
            extensions,
            buffer_size_kb: 0,
        })
    }

    /// Engine-suggested output buffer size in bytes.
    pub fn suggested_buffer_bytes(&self) -> usize {
        self.buffer_size_kb as usize * 1000
    }
}

/// Per-submit control block.
#[derive(Copy, Clone, Debug, Default)]
pub struct EncodeControl {
    /// Force an IDR/keyframe for this submission.
    pub force_idr: bool,
    pub frame_order: u32,
}

/// Opaque completion token returned by a successful submit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncToken(pub u64);

/// Capability set required from the hardware codec engine.
///
/// One value of this trait is one engine session. All calls happen on the
/// session's worker thread; implementations need `Send` but never `Sync`.
/// Surfaces are allocated CPU-visible, so no lock/unlock bracketing is
/// needed around plane writes.
pub trait EncodeEngine: Send {
    /// Initialize (or re-initialize) the session with the given parameters.
    fn init(&mut self, params: &EngineParams) -> EngineStatus;

    /// How many input surfaces the engine wants for these parameters.
    /// The pool must never hand the engine more than this.
    fn query_surface_count(&mut self, params: &EngineParams) -> (EngineStatus, u16);

    /// Allocate the input surface set. The default allocation is plain
    /// host-visible memory matching the session's pixel layout.
    fn alloc_surfaces(&mut self, params: &EngineParams, count: u16) -> Vec<Surface> {
        (0..count)
            .map(|_| Surface::new(params.pixel_format, params.width, params.height))
            .collect()
    }

    /// Current session parameters, including engine-filled fields.
    fn get_params(&self) -> EngineParams;

    /// Reconfigure the live session without tearing it down. Used per frame
    /// by the software rate-control path to apply the next quantizer.
    fn reset(&mut self, params: &EngineParams) -> EngineStatus;

    /// Submit one surface for encoding. Output is appended to `out`; the
    /// engine must not grow the buffer — an undersized buffer yields
    /// `NotEnoughBuffer` with any partial bytes left in place.
    fn submit(
        &mut self,
        ctrl: &EncodeControl,
        surface: &Surface,
        out: &mut Bitstream,
    ) -> (EngineStatus, Option<SyncToken>);

    /// Block until the submitted frame completes, up to `timeout`.
    /// `DeviceBusy` past the timeout means the frame is still in flight.
    fn sync(&mut self, token: SyncToken, timeout: Duration) -> EngineStatus;

    /// Tear the session down. Idempotent.
    fn close(&mut self);
}

/// Consumer verdict for one delivered access unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SinkVerdict {
    Accepted,
    Rejected,
}

/// Registered consumer of encoded access units.
///
/// Invoked synchronously on the session worker — a slow callback delays the
/// next frame's submission.
pub trait FrameSink: Send {
    fn on_encoded(&mut self, au: &crate::types::AccessUnit<'_>) -> SinkVerdict;
}

/// Rate-control state for one configuration of the software-controlled
/// codec family. Rebuilt whenever bitrate, frame rate or resolution change.
#[derive(Clone, Debug, PartialEq)]
pub struct RateControlConfig {
    pub width: u32,
    pub height: u32,
    /// Native quantizer bounds, already mapped through the quantizer table.
    pub min_quantizer: u16,
    pub max_quantizer: u16,
    pub target_bitrate_bps: u32,
    pub framerate: f64,
    /// Buffer model sizing in abstract milliseconds of payload.
    pub buf_initial_ms: u32,
    pub buf_optimal_ms: u32,
    pub buf_max_ms: u32,
    pub undershoot_pct: u32,
    pub overshoot_pct: u32,
    /// Keyframe size ceiling as a percentage of a steady-state frame.
    pub max_intra_bitrate_pct: u32,
    pub layers: Vec<LayerRate>,
}

/// Per-temporal-layer rate allocation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LayerRate {
    pub target_bitrate_bps: u32,
    /// Frame-rate decimator: the layer runs at `full_rate / decimator`.
    pub decimator: u32,
    pub min_quantizer: u16,
    pub max_quantizer: u16,
}

/// Capability set required from the software rate-control collaborator.
pub trait RateModel: Send {
    /// Install a freshly built state. Resets any history.
    fn configure(&mut self, config: &RateControlConfig);

    /// One quantizer for the upcoming frame. The session applies the same
    /// value to the intra and inter quantizer fields.
    fn compute_qp(&mut self, frame_type: FrameType) -> u16;

    /// Adopt new bitrate/frame-rate targets without resetting quantizer
    /// history.
    fn update_bitrate(&mut self, config: &RateControlConfig);

    /// Feedback after a delivered frame so the model can track buffer
    /// fullness.
    fn post_encode(&mut self, encoded_bytes: usize);
}
