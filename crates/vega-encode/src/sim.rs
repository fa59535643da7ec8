//! Deterministic software rendition of the engine capability set.
//!
//! Stands in for the hardware runtime on build hosts without it and drives
//! the integration suites. The output is stable for identical inputs:
//! Annex-B access units for the NAL codecs, raw framed payloads for
//! VP9/AV1, sized by the active quantizer and seeded from the surface
//! content, so the format-conversion path matters to the bytes produced.
//!
//! Fault injection covers every transient the session must survive:
//! scripted `DeviceBusy` runs, device loss, sync timeouts and hard submit
//! failures. Undersized output buffers are not scripted — they fall out of
//! the real capacity check, with partial bytes left in place exactly like
//! an engine that filled the buffer mid-frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;
use vega_core::bitstream::Bitstream;
use vega_core::config::EncoderConfig;
use vega_core::engine::{
    EncodeControl, EncodeEngine, EngineParams, EngineStatus, RateControlMode, SyncToken,
};
use vega_core::types::{Profile, Surface, SurfaceLock, VideoCodec};

/// Scripted engine behavior, consumed in injection order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The next `n` submits report `DeviceBusy`.
    BusySubmits(u32),
    /// The next submit reports the device unusable.
    LoseDevice,
    /// The next sync never completes in time.
    SyncTimeout,
    /// The next submit fails hard with this native code.
    FailSubmit(i32),
}

struct PendingJob {
    lock: SurfaceLock,
}

struct SimState {
    params: EngineParams,
    initialized: bool,
    surface_count: u16,
    busy_submits: u32,
    lose_device: bool,
    timeout_syncs: u32,
    fail_submit: Option<i32>,
    pending: HashMap<u64, PendingJob>,
    /// Partially written access units awaiting a grown buffer, keyed by
    /// frame order.
    partial: HashMap<u32, Vec<u8>>,
    next_token: u64,
    frames_submitted: u64,
    submitted_qps: Vec<u16>,
}

/// Shared-handle simulation engine. Clones observe and script the same
/// session, so a test can keep one handle while the session owns another.
#[derive(Clone)]
pub struct SimEngine(Arc<Mutex<SimState>>);

impl SimEngine {
    pub fn new() -> Self {
        Self::with_surface_count(4)
    }

    pub fn with_surface_count(surface_count: u16) -> Self {
        let placeholder = EncoderConfig {
            profile: Profile::H264ConstrainedBaseline,
            width: 16,
            height: 16,
            target_bitrate_bps: 100_000,
            max_bitrate_bps: 100_000,
            framerate: 30.0,
            temporal_layers: 1,
        };
        let params = EngineParams::from_config(&placeholder)
            .unwrap_or_else(|_| unreachable!("placeholder config is valid"));
        Self(Arc::new(Mutex::new(SimState {
            params,
            initialized: false,
            surface_count,
            busy_submits: 0,
            lose_device: false,
            timeout_syncs: 0,
            fail_submit: None,
            pending: HashMap::new(),
            partial: HashMap::new(),
            next_token: 1,
            frames_submitted: 0,
            submitted_qps: Vec::new(),
        })))
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().expect("sim engine state poisoned")
    }

    /// Script the next engine behavior.
    pub fn inject(&self, fault: Fault) {
        let mut s = self.state();
        match fault {
            Fault::BusySubmits(n) => s.busy_submits += n,
            Fault::LoseDevice => s.lose_device = true,
            Fault::SyncTimeout => s.timeout_syncs += 1,
            Fault::FailSubmit(code) => s.fail_submit = Some(code),
        }
    }

    /// Frames accepted by submit so far.
    pub fn frames_submitted(&self) -> u64 {
        self.state().frames_submitted
    }

    /// Inter quantizer in effect at each accepted submit, in order.
    pub fn submitted_qps(&self) -> Vec<u16> {
        self.state().submitted_qps.clone()
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeEngine for SimEngine {
    fn init(&mut self, params: &EngineParams) -> EngineStatus {
        let mut s = self.state();
        s.params = params.clone();
        // Suggest a generous output buffer, refined on undersize reports.
        s.params.buffer_size_kb = (params.width * params.height * 4).div_ceil(1000);
        s.initialized = true;
        s.pending.clear();
        s.partial.clear();
        s.frames_submitted = 0;
        s.submitted_qps.clear();
        debug!(codec = ?params.codec, width = params.width, height = params.height, "sim engine initialized");
        EngineStatus::Success
    }

    fn query_surface_count(&mut self, _params: &EngineParams) -> (EngineStatus, u16) {
        let s = self.state();
        if !s.initialized {
            return (EngineStatus::Failed(-1), 0);
        }
        (EngineStatus::Success, s.surface_count)
    }

    fn get_params(&self) -> EngineParams {
        self.state().params.clone()
    }

    fn reset(&mut self, params: &EngineParams) -> EngineStatus {
        let mut s = self.state();
        if !s.initialized {
            return EngineStatus::Failed(-1);
        }
        let buffer_size_kb = s.params.buffer_size_kb;
        s.params = params.clone();
        s.params.buffer_size_kb = buffer_size_kb;
        EngineStatus::Success
    }

    fn submit(
        &mut self,
        ctrl: &EncodeControl,
        surface: &Surface,
        out: &mut Bitstream,
    ) -> (EngineStatus, Option<SyncToken>) {
        let mut s = self.state();
        if !s.initialized {
            return (EngineStatus::Failed(-1), None);
        }
        if s.busy_submits > 0 {
            s.busy_submits -= 1;
            return (EngineStatus::DeviceBusy, None);
        }
        if s.lose_device {
            s.lose_device = false;
            s.initialized = false;
            return (EngineStatus::DeviceLost, None);
        }
        if let Some(code) = s.fail_submit.take() {
            return (EngineStatus::Failed(code), None);
        }

        // A retried submit after a grow continues the partially written
        // access unit; a fresh submit generates the whole unit.
        let remaining = match s.partial.remove(&ctrl.frame_order) {
            Some(rest) => rest,
            None => s.generate_access_unit(ctrl, surface),
        };

        if !out.try_append(&remaining) {
            let spare = out.spare();
            let (fits, rest) = remaining.split_at(spare);
            let appended = out.try_append(fits);
            debug_assert!(appended, "prefix sized to the spare region");
            let total = out.len() + rest.len();
            s.params.buffer_size_kb = (total as u32).div_ceil(1000) + 1;
            s.partial.insert(ctrl.frame_order, rest.to_vec());
            return (EngineStatus::NotEnoughBuffer, None);
        }

        let qp = match s.params.rate_control {
            RateControlMode::Cqp { qp_inter, .. } => qp_inter,
            RateControlMode::Vbr { .. } => 0,
        };
        s.submitted_qps.push(qp);
        s.frames_submitted += 1;

        let token = SyncToken(s.next_token);
        s.next_token += 1;
        let lock = surface.in_use_flag();
        lock.set(true);
        s.pending.insert(token.0, PendingJob { lock });
        (EngineStatus::Success, Some(token))
    }

    fn sync(&mut self, token: SyncToken, _timeout: Duration) -> EngineStatus {
        let mut s = self.state();
        let Some(job) = s.pending.remove(&token.0) else {
            return EngineStatus::Failed(-2);
        };
        // The frame completes either way; on a scripted timeout it merely
        // completes too late for the caller, so the surface is still freed.
        job.lock.set(false);
        if s.timeout_syncs > 0 {
            s.timeout_syncs -= 1;
            return EngineStatus::DeviceBusy;
        }
        EngineStatus::Success
    }

    fn close(&mut self) {
        let mut s = self.state();
        for (_, job) in s.pending.drain() {
            job.lock.set(false);
        }
        s.partial.clear();
        s.initialized = false;
    }
}

impl SimState {
    fn generate_access_unit(&mut self, ctrl: &EncodeControl, surface: &Surface) -> Vec<u8> {
        let qp = match self.params.rate_control {
            RateControlMode::Cqp { qp_intra, qp_inter } => {
                if ctrl.force_idr {
                    qp_intra
                } else {
                    qp_inter
                }
            }
            // A stand-in steady-state quantizer for engine-controlled VBR.
            RateControlMode::Vbr { .. } => 26,
        };

        let pixels = self.params.width as usize * self.params.height as usize;
        let mut len = (pixels / 64) / qp.max(1) as usize;
        if ctrl.force_idr {
            len *= 3;
        }
        let len = len.max(24);
        let payload = self.payload_bytes(ctrl, surface, qp, len);

        match self.params.codec {
            VideoCodec::H264 => self.h264_access_unit(ctrl, &payload),
            VideoCodec::H265 => self.h265_access_unit(ctrl, &payload),
            VideoCodec::Vp9 | VideoCodec::Av1 => {
                let mut au = Vec::with_capacity(payload.len() + 1);
                au.push(if ctrl.force_idr { 0x82 } else { 0x86 });
                au.extend_from_slice(&payload);
                au
            }
        }
    }

    /// Pseudo-random payload seeded by frame order, quantizer and surface
    /// content.
    fn payload_bytes(
        &self,
        ctrl: &EncodeControl,
        surface: &Surface,
        qp: u16,
        len: usize,
    ) -> Vec<u8> {
        let mid = surface.y.len() / 2;
        let mut state = 0x9E37_79B9u32
            ^ (ctrl.frame_order.wrapping_mul(2654435761))
            ^ ((qp as u32) << 16)
            ^ ((surface.y[0] as u32) << 8)
            ^ surface.y[mid] as u32;
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            let byte = (state >> 24) as u8;
            // Avoid accidental start codes inside the payload.
            bytes.push(if byte == 0 { 1 } else { byte });
        }
        bytes
    }

    fn temporal_id(&self) -> u8 {
        let layers = self
            .params
            .extensions
            .iter()
            .find_map(|e| match e {
                vega_core::engine::ExtParam::TemporalLayers { scales, .. } => {
                    Some(scales.len() as u8)
                }
                _ => None,
            })
            .unwrap_or(1);
        match layers {
            2 => [0, 1][(self.frames_submitted % 2) as usize],
            3 => [0, 2, 1, 2][(self.frames_submitted % 4) as usize],
            _ => 0,
        }
    }

    fn h264_access_unit(&self, ctrl: &EncodeControl, payload: &[u8]) -> Vec<u8> {
        const SC: [u8; 4] = [0, 0, 0, 1];
        let mut au = Vec::with_capacity(payload.len() + 64);
        let tid = if ctrl.force_idr { 0 } else { self.temporal_id() };
        let layered = self
            .params
            .extensions
            .iter()
            .any(|e| matches!(e, vega_core::engine::ExtParam::TemporalLayers { .. }));

        if ctrl.force_idr {
            // SPS carrying the coded dimensions, then PPS.
            au.extend_from_slice(&SC);
            au.push(0x67);
            au.extend_from_slice(&(self.params.crop_width as u16).to_be_bytes());
            au.extend_from_slice(&(self.params.crop_height as u16).to_be_bytes());
            au.extend_from_slice(&SC);
            au.push(0x68);
            au.push(0x01);
        }
        if layered {
            // Prefix NAL with the SVC extension header.
            au.extend_from_slice(&SC);
            au.push(0x6E);
            au.push(0x80 | if ctrl.force_idr { 0x40 } else { 0 } | (tid & 0x3F));
            au.push(0x00);
            au.push(tid << 5);
        }
        au.extend_from_slice(&SC);
        au.push(if ctrl.force_idr { 0x65 } else { 0x41 });
        au.extend_from_slice(payload);
        au
    }

    fn h265_access_unit(&self, ctrl: &EncodeControl, payload: &[u8]) -> Vec<u8> {
        const SC: [u8; 4] = [0, 0, 0, 1];
        let mut au = Vec::with_capacity(payload.len() + 64);
        if ctrl.force_idr {
            for header in [0x40u8, 0x42, 0x44] {
                // VPS/SPS/PPS, two-byte NAL headers.
                au.extend_from_slice(&SC);
                au.push(header);
                au.push(0x01);
            }
        }
        au.extend_from_slice(&SC);
        au.push(if ctrl.force_idr { 0x26 } else { 0x02 });
        au.push(0x01);
        au.extend_from_slice(payload);
        au
    }
}
