//! The encode session: configuration owner, engine orchestration, and the
//! per-frame submit pipeline.
//!
//! One frame moves through: keyframe classification → per-frame quantizer
//! (software-rate-controlled family only, applied via a live engine reset
//! strictly before submit) → surface acquisition → format conversion →
//! submit with bounded busy-retry and grow-on-undersize → completion sync →
//! metadata extraction → synchronous delivery.
//!
//! Per-frame failures drop that frame and leave the session usable. Only an
//! engine-unusable status drops the session back to `Initialized`, after
//! which a fresh `init` is required.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use vega_core::bitstream::Bitstream;
use vega_core::config::EncoderConfig;
use vega_core::engine::{
    EncodeControl, EncodeEngine, EngineParams, EngineStatus, RateControlMode, RateModel,
};
use vega_core::error::{EncodeError, Result};
use vega_core::types::{AccessUnit, EncodeRequest, FrameType, VideoCodec};

use crate::convert::i420_to_surface;
use crate::nal;
use crate::rate::{build_rate_control, LeakyBucketModel};
use crate::sink::OutputSink;
use crate::surface_pool::{SurfacePool, ACQUIRE_POLL_INTERVAL, ACQUIRE_WAIT_WINDOW};

/// A keyframe is produced every this many delivered frames, on top of any
/// caller demand.
pub const KEYFRAME_INTERVAL: u64 = 30;

/// Elapsed-time budget for `DeviceBusy` submit retries.
pub const BUSY_RETRY_BUDGET: Duration = Duration::from_millis(100);
/// Sleep between busy retries.
pub const BUSY_RETRY_STEP: Duration = Duration::from_millis(1);
/// Completion-sync wait bound.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(600);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Running,
    Released,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Released => "released",
        }
    }
}

/// Timing bounds for one session. The defaults are the production values;
/// tests shrink them to keep failure paths fast.
#[derive(Clone, Debug)]
pub struct SessionLimits {
    pub acquire_poll: Duration,
    pub acquire_wait: Duration,
    pub busy_retry_budget: Duration,
    pub busy_retry_step: Duration,
    pub sync_timeout: Duration,
    /// Initial output buffer capacity. `None` means the conservative
    /// estimate of four bytes per pixel of the aligned frame.
    pub initial_bitstream: Option<usize>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            acquire_poll: ACQUIRE_POLL_INTERVAL,
            acquire_wait: ACQUIRE_WAIT_WINDOW,
            busy_retry_budget: BUSY_RETRY_BUDGET,
            busy_retry_step: BUSY_RETRY_STEP,
            sync_timeout: SYNC_TIMEOUT,
            initial_bitstream: None,
        }
    }
}

pub struct EncodeSession {
    engine: Box<dyn EncodeEngine>,
    sink: OutputSink,
    limits: SessionLimits,
    state: SessionState,
    config: Option<EncoderConfig>,
    pool: Option<SurfacePool>,
    bitstream: Bitstream,
    model: Box<dyn RateModel>,
    software_brc: bool,
    /// Advanced only on a sink-accepted delivery; drives keyframe cadence
    /// and surface frame-order tags.
    frames_delivered: u64,
}

impl EncodeSession {
    pub fn new(engine: Box<dyn EncodeEngine>, sink: OutputSink) -> Self {
        Self::with_limits(engine, sink, SessionLimits::default())
    }

    pub fn with_limits(
        engine: Box<dyn EncodeEngine>,
        sink: OutputSink,
        limits: SessionLimits,
    ) -> Self {
        Self {
            engine,
            sink,
            limits,
            state: SessionState::Uninitialized,
            config: None,
            pool: None,
            bitstream: Bitstream::new(),
            model: Box::new(LeakyBucketModel::new()),
            software_brc: false,
            frames_delivered: 0,
        }
    }

    /// Replace the software rate-model collaborator. Only consulted for the
    /// software-rate-controlled codec family.
    pub fn with_rate_model(mut self, model: Box<dyn RateModel>) -> Self {
        self.model = model;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    /// Configure (or fully reconfigure) the session. A session that is
    /// already initialized is closed and rebuilt rather than mutated in
    /// place.
    pub fn init(&mut self, config: &EncoderConfig) -> Result<()> {
        config.validate()?;
        let config = config.normalized();

        if matches!(self.state, SessionState::Initialized | SessionState::Running) {
            self.engine.close();
            self.pool = None;
        }

        let params = EngineParams::from_config(&config)?;
        let status = self.engine.init(&params);
        if status == EngineStatus::IncompatibleParams {
            warn!("engine adjusted incompatible parameters at init");
        } else if !status.is_ok() {
            return Err(EncodeError::Engine { status });
        }

        let (status, count) = self.engine.query_surface_count(&params);
        if !status.is_ok() {
            return Err(EncodeError::Engine { status });
        }
        let surfaces = self.engine.alloc_surfaces(&params, count);
        debug_assert!(surfaces.len() <= count as usize);
        self.pool = Some(SurfacePool::with_wait(
            surfaces,
            self.limits.acquire_poll,
            self.limits.acquire_wait,
        ));

        self.software_brc = config.codec().uses_software_rate_control();
        if self.software_brc {
            self.model.configure(&build_rate_control(&config));
        }

        info!(
            codec = config.codec().display_name(),
            width = config.width,
            height = config.height,
            target_kbps = config.target_bitrate_bps / 1000,
            framerate = config.framerate,
            temporal_layers = config.temporal_layers,
            surfaces = count,
            software_brc = self.software_brc,
            "encode session initialized"
        );

        self.config = Some(config);
        self.frames_delivered = 0;
        self.state = SessionState::Initialized;
        Ok(())
    }

    /// Encode one frame. Returns the delivered frame's classification.
    pub fn submit(&mut self, request: &EncodeRequest) -> Result<FrameType> {
        if !matches!(self.state, SessionState::Initialized | SessionState::Running) {
            return Err(EncodeError::InvalidState {
                op: "submit",
                state: self.state.name(),
            });
        }
        let Some(config) = self.config.clone() else {
            return Err(EncodeError::InvalidState {
                op: "submit",
                state: self.state.name(),
            });
        };

        let is_keyframe =
            request.force_keyframe || self.frames_delivered % KEYFRAME_INTERVAL == 0;
        let frame_type = if is_keyframe {
            FrameType::Key
        } else {
            FrameType::Delta
        };

        // Rate control happens strictly before submit: the live session is
        // reconfigured with the frame's quantizer, shared by both frame
        // type fields.
        if self.software_brc {
            let qp = self.model.compute_qp(frame_type);
            let mut params = self.engine.get_params();
            params.rate_control = RateControlMode::Cqp {
                qp_intra: qp,
                qp_inter: qp,
            };
            match self.engine.reset(&params) {
                s if s.is_ok() => {}
                EngineStatus::DeviceLost => {
                    self.state = SessionState::Initialized;
                    return Err(EncodeError::EngineLost);
                }
                status => return Err(EncodeError::Engine { status }),
            }
        }

        let frame_order = self.frames_delivered as u32;
        let Some(pool) = self.pool.as_mut() else {
            return Err(EncodeError::InvalidState {
                op: "submit",
                state: self.state.name(),
            });
        };
        let idx = pool.acquire()?;
        {
            let surface = pool.surface_mut(idx);
            surface.frame_order = frame_order;
            i420_to_surface(&request.frame, surface);
        }

        let (aligned_w, aligned_h) = config.aligned_size();
        let initial = self
            .limits
            .initial_bitstream
            .unwrap_or(aligned_w as usize * aligned_h as usize * 4);
        self.bitstream.clear();
        self.bitstream.ensure_capacity(initial);

        let ctrl = EncodeControl {
            force_idr: is_keyframe,
            frame_order,
        };
        let started = Instant::now();
        let mut grew = false;
        let token = loop {
            match self
                .engine
                .submit(&ctrl, pool.surface(idx), &mut self.bitstream)
            {
                (status, token) if status.is_ok() => match token {
                    Some(token) => break token,
                    // Acceptance without a completion token is an engine
                    // contract violation.
                    None => return Err(EncodeError::Engine { status }),
                },
                (EngineStatus::DeviceBusy, _) => {
                    if started.elapsed() >= self.limits.busy_retry_budget {
                        let budget_ms = self.limits.busy_retry_budget.as_millis() as u64;
                        warn!(budget_ms, "engine stayed busy, dropping frame");
                        return Err(EncodeError::RetriesExhausted { budget_ms });
                    }
                    thread::sleep(self.limits.busy_retry_step);
                }
                (EngineStatus::NotEnoughBuffer, _) => {
                    if grew {
                        return Err(EncodeError::Engine {
                            status: EngineStatus::NotEnoughBuffer,
                        });
                    }
                    let required = self.engine.get_params().suggested_buffer_bytes();
                    debug!(
                        have = self.bitstream.capacity(),
                        required, "output buffer undersized, growing"
                    );
                    self.bitstream.grow_preserving(required);
                    grew = true;
                }
                (EngineStatus::DeviceLost, _) => {
                    self.state = SessionState::Initialized;
                    return Err(EncodeError::EngineLost);
                }
                (status, _) => return Err(EncodeError::Engine { status }),
            }
        };

        match self.engine.sync(token, self.limits.sync_timeout) {
            s if s.is_ok() => {}
            EngineStatus::DeviceBusy => {
                let timeout_ms = self.limits.sync_timeout.as_millis() as u64;
                warn!(timeout_ms, "completion sync timed out, dropping frame");
                return Err(EncodeError::SyncTimeout { timeout_ms });
            }
            EngineStatus::DeviceLost => {
                self.state = SessionState::Initialized;
                return Err(EncodeError::EngineLost);
            }
            status => return Err(EncodeError::Engine { status }),
        }
        self.state = SessionState::Running;

        let payload = self.bitstream.payload();
        let h264 = (config.codec() == VideoCodec::H264)
            .then(|| nal::h264_temporal_info(payload))
            .flatten();
        let au = AccessUnit {
            data: payload,
            codec: config.codec(),
            width: config.width,
            height: config.height,
            frame_type,
            timestamp_rtp: request.frame.timestamp_rtp,
            capture_time_ms: request.frame.capture_time_ms,
            h264,
        };
        let encoded_bytes = payload.len();
        self.sink.deliver(&au)?;

        if self.software_brc {
            self.model.post_encode(encoded_bytes);
        }
        self.frames_delivered += 1;
        self.bitstream.clear();
        Ok(frame_type)
    }

    /// Adopt new live targets. Ignored with a warning before init or for a
    /// frame rate below 1.0.
    pub fn set_rates(&mut self, bitrate_bps: u32, framerate: f64) -> Result<()> {
        if !matches!(self.state, SessionState::Initialized | SessionState::Running) {
            warn!(state = self.state.name(), "set_rates ignored before init");
            return Ok(());
        }
        if framerate < 1.0 {
            warn!(framerate, "set_rates ignored, frame rate must be >= 1.0");
            return Ok(());
        }
        if bitrate_bps == 0 {
            warn!("set_rates ignored, zero bitrate");
            return Ok(());
        }
        let Some(config) = self.config.as_mut() else {
            return Ok(());
        };
        config.target_bitrate_bps = bitrate_bps;
        config.max_bitrate_bps = config.max_bitrate_bps.max(bitrate_bps);
        config.framerate = framerate;

        if self.software_brc {
            let rc = build_rate_control(config);
            self.model.update_bitrate(&rc);
        }
        info!(
            target_kbps = bitrate_bps / 1000,
            framerate, "encoder rates updated"
        );
        Ok(())
    }

    /// Tear down the engine session and the surface pool. Idempotent; safe
    /// from any state.
    pub fn release(&mut self) -> Result<()> {
        if self.state == SessionState::Released {
            return Ok(());
        }
        self.engine.close();
        self.pool = None;
        self.sink.finalize();
        info!(frames = self.frames_delivered, "encode session released");
        self.state = SessionState::Released;
        Ok(())
    }
}
