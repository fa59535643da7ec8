//! End-to-end session behavior against the simulation engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use vega_core::config::EncoderConfig;
use vega_core::engine::{FrameSink, SinkVerdict};
use vega_core::error::EncodeError;
use vega_core::types::{
    AccessUnit, EncodeRequest, FrameType, H264Metadata, Profile, RawFrame,
};
use vega_encode::session::{EncodeSession, SessionLimits, SessionState};
use vega_encode::sim::{Fault, SimEngine};
use vega_encode::sink::OutputSink;

#[derive(Clone, Debug)]
struct Delivered {
    frame_type: FrameType,
    data: Vec<u8>,
    h264: Option<H264Metadata>,
}

#[derive(Clone)]
struct RecordingSink {
    delivered: Arc<Mutex<Vec<Delivered>>>,
    reject_first: Arc<Mutex<bool>>,
}

impl RecordingSink {
    fn new() -> Self {
        Self {
            delivered: Arc::new(Mutex::new(Vec::new())),
            reject_first: Arc::new(Mutex::new(false)),
        }
    }

    fn rejecting_first() -> Self {
        let sink = Self::new();
        *sink.reject_first.lock().unwrap() = true;
        sink
    }

    fn frames(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }

    fn keyframe_indices(&self) -> Vec<usize> {
        self.frames()
            .iter()
            .enumerate()
            .filter(|(_, d)| d.frame_type == FrameType::Key)
            .map(|(i, _)| i)
            .collect()
    }
}

impl FrameSink for RecordingSink {
    fn on_encoded(&mut self, au: &AccessUnit<'_>) -> SinkVerdict {
        let mut reject = self.reject_first.lock().unwrap();
        if *reject {
            *reject = false;
            return SinkVerdict::Rejected;
        }
        self.delivered.lock().unwrap().push(Delivered {
            frame_type: au.frame_type,
            data: au.data.to_vec(),
            h264: au.h264,
        });
        SinkVerdict::Accepted
    }
}

fn config(profile: Profile, layers: u8) -> EncoderConfig {
    EncoderConfig {
        profile,
        width: 1280,
        height: 720,
        target_bitrate_bps: 2_000_000,
        max_bitrate_bps: 2_500_000,
        framerate: 30.0,
        temporal_layers: layers,
    }
}

fn request(luma: u8) -> EncodeRequest {
    EncodeRequest {
        frame: RawFrame::solid(1280, 720, luma),
        force_keyframe: false,
    }
}

fn session_with(engine: SimEngine, sink: RecordingSink) -> EncodeSession {
    EncodeSession::new(Box::new(engine), OutputSink::new(Box::new(sink)))
}

#[test]
fn sixty_frames_yield_two_keyframes_and_sixty_deliveries() {
    let sink = RecordingSink::new();
    let mut session = session_with(SimEngine::new(), sink.clone());
    session.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();

    for i in 0..60u32 {
        let mut req = request((i % 251) as u8);
        req.frame.timestamp_rtp = i * 3000;
        session.submit(&req).unwrap();
    }

    assert_eq!(sink.frames().len(), 60, "sixty accepted deliveries");
    assert_eq!(
        sink.keyframe_indices(),
        vec![0, 30],
        "keyframes at frame 0 and frame 30 only"
    );
}

#[test]
fn explicit_keyframe_request_overrides_cadence() {
    let sink = RecordingSink::new();
    let mut session = session_with(SimEngine::new(), sink.clone());
    session.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();

    for _ in 0..5 {
        session.submit(&request(10)).unwrap();
    }
    let mut forced = request(10);
    forced.force_keyframe = true;
    let ft = session.submit(&forced).unwrap();
    assert_eq!(ft, FrameType::Key, "forced keyframe produced immediately");

    assert_eq!(sink.keyframe_indices(), vec![0, 5]);
}

#[test]
fn undersized_first_buffer_yields_identical_bytes() {
    // Run A: deliberately undersized initial buffer forces grow-and-retry.
    let sink_a = RecordingSink::new();
    let mut limits = SessionLimits::default();
    limits.initial_bitstream = Some(16);
    let mut session_a = EncodeSession::with_limits(
        Box::new(SimEngine::new()),
        OutputSink::new(Box::new(sink_a.clone())),
        limits,
    );
    session_a.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();
    session_a.submit(&request(77)).unwrap();

    // Run B: a comfortably large buffer from the start.
    let sink_b = RecordingSink::new();
    let mut session_b = session_with(SimEngine::new(), sink_b.clone());
    session_b.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();
    session_b.submit(&request(77)).unwrap();

    let a = sink_a.frames();
    let b = sink_b.frames();
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0].data, b[0].data, "growth must be transparent");
    assert!(a[0].data.len() > 16, "frame was larger than the first buffer");
}

#[test]
fn device_busy_is_retried_within_budget() {
    let engine = SimEngine::new();
    engine.inject(Fault::BusySubmits(3));

    let sink = RecordingSink::new();
    let mut session = session_with(engine.clone(), sink.clone());
    session.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();

    session.submit(&request(1)).unwrap();
    assert_eq!(sink.frames().len(), 1);
    assert_eq!(engine.frames_submitted(), 1);
}

#[test]
fn busy_past_budget_drops_the_frame() {
    let engine = SimEngine::new();
    engine.inject(Fault::BusySubmits(100_000));

    let sink = RecordingSink::new();
    let mut limits = SessionLimits::default();
    limits.busy_retry_budget = Duration::from_millis(5);
    limits.busy_retry_step = Duration::from_millis(1);
    let mut session = EncodeSession::with_limits(
        Box::new(engine),
        OutputSink::new(Box::new(sink.clone())),
        limits,
    );
    session.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();

    assert!(matches!(
        session.submit(&request(1)),
        Err(EncodeError::RetriesExhausted { .. })
    ));
    assert!(sink.frames().is_empty());
}

#[test]
fn sync_timeout_drops_frame_but_session_survives() {
    let engine = SimEngine::new();
    engine.inject(Fault::SyncTimeout);

    let sink = RecordingSink::new();
    let mut session = session_with(engine, sink.clone());
    session.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();

    assert!(matches!(
        session.submit(&request(1)),
        Err(EncodeError::SyncTimeout { .. })
    ));
    assert_eq!(session.frames_delivered(), 0);

    // The dropped frame never counted: the next submit still encodes the
    // stream's first frame, a keyframe.
    let ft = session.submit(&request(1)).unwrap();
    assert_eq!(ft, FrameType::Key);
    assert_eq!(sink.frames().len(), 1);
}

#[test]
fn device_loss_forces_reinit() {
    let engine = SimEngine::new();
    engine.inject(Fault::LoseDevice);

    let sink = RecordingSink::new();
    let mut session = session_with(engine, sink.clone());
    let cfg = config(Profile::H264ConstrainedBaseline, 1);
    session.init(&cfg).unwrap();

    assert!(matches!(
        session.submit(&request(1)),
        Err(EncodeError::EngineLost)
    ));
    assert_eq!(session.state(), SessionState::Initialized);

    // Dead engine until a fresh init rebuilds the session.
    assert!(session.submit(&request(1)).is_err());
    session.init(&cfg).unwrap();
    session.submit(&request(1)).unwrap();
    assert_eq!(sink.frames().len(), 1);
}

#[test]
fn hard_submit_failure_keeps_session_usable() {
    let engine = SimEngine::new();
    engine.inject(Fault::FailSubmit(-17));

    let sink = RecordingSink::new();
    let mut session = session_with(engine, sink.clone());
    session.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();

    assert!(matches!(
        session.submit(&request(1)),
        Err(EncodeError::Engine { .. })
    ));
    session.submit(&request(1)).unwrap();
    assert_eq!(sink.frames().len(), 1);
}

#[test]
fn rejected_callback_freezes_the_frame_counter() {
    let sink = RecordingSink::rejecting_first();
    let mut session = session_with(SimEngine::new(), sink.clone());
    session.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();

    assert!(matches!(
        session.submit(&request(1)),
        Err(EncodeError::CallbackRejected)
    ));
    assert_eq!(session.frames_delivered(), 0);

    let ft = session.submit(&request(1)).unwrap();
    assert_eq!(ft, FrameType::Key, "frame zero slot is retried");
    assert_eq!(session.frames_delivered(), 1);
}

#[test]
fn empty_surface_pool_exhausts_acquire() {
    let engine = SimEngine::with_surface_count(0);
    let sink = RecordingSink::new();
    let mut limits = SessionLimits::default();
    limits.acquire_poll = Duration::from_millis(1);
    limits.acquire_wait = Duration::from_millis(10);
    let mut session = EncodeSession::with_limits(
        Box::new(engine),
        OutputSink::new(Box::new(sink)),
        limits,
    );
    session.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();

    assert!(matches!(
        session.submit(&request(1)),
        Err(EncodeError::ResourceExhausted { .. })
    ));
}

#[test]
fn temporal_layers_mark_h264_frames() {
    let sink = RecordingSink::new();
    let mut session = session_with(SimEngine::new(), sink.clone());
    session.init(&config(Profile::H264ConstrainedBaseline, 2)).unwrap();

    for _ in 0..4 {
        session.submit(&request(9)).unwrap();
    }

    let frames = sink.frames();
    let key = frames[0].h264.expect("layered stream carries frame marking");
    assert!(key.idr_frame);
    assert_eq!(key.temporal_id, 0);
    assert!(!key.base_layer_sync);

    let delta = frames[1].h264.expect("frame marking on delta frames too");
    assert!(!delta.idr_frame);
    assert_eq!(delta.temporal_id, 1);
    assert!(delta.base_layer_sync);
}

#[test]
fn single_layer_h264_has_no_frame_marking() {
    let sink = RecordingSink::new();
    let mut session = session_with(SimEngine::new(), sink.clone());
    session.init(&config(Profile::H264ConstrainedBaseline, 1)).unwrap();
    session.submit(&request(9)).unwrap();
    assert!(sink.frames()[0].h264.is_none());
}

#[test]
fn vp9_set_rates_lowers_qp_within_one_frame() {
    // Two identical VP9 sessions; one adopts a doubled target mid-stream.
    let updated_engine = SimEngine::new();
    let steady_engine = SimEngine::new();

    let mut updated = session_with(updated_engine.clone(), RecordingSink::new());
    let mut steady = session_with(steady_engine.clone(), RecordingSink::new());
    updated.init(&config(Profile::Vp9Profile0, 1)).unwrap();
    steady.init(&config(Profile::Vp9Profile0, 1)).unwrap();

    for i in 0..2u8 {
        updated.submit(&request(i)).unwrap();
        steady.submit(&request(i)).unwrap();
    }

    updated.set_rates(4_000_000, 30.0).unwrap();
    updated.submit(&request(2)).unwrap();
    steady.submit(&request(2)).unwrap();

    let updated_qps = updated_engine.submitted_qps();
    let steady_qps = steady_engine.submitted_qps();
    assert_eq!(updated_qps[..2], steady_qps[..2], "identical until the update");
    assert!(
        updated_qps[2] < steady_qps[2],
        "doubled target must lower the very next quantizer: {} !< {}",
        updated_qps[2],
        steady_qps[2]
    );
}

#[test]
fn vp9_quantizer_applied_before_submit() {
    let engine = SimEngine::new();
    let mut session = session_with(engine.clone(), RecordingSink::new());
    session.init(&config(Profile::Vp9Profile0, 1)).unwrap();
    session.submit(&request(0)).unwrap();

    let qps = engine.submitted_qps();
    assert_eq!(qps.len(), 1);
    let rc = vega_encode::rate::build_rate_control(&config(Profile::Vp9Profile0, 1));
    assert!(
        qps[0] >= rc.min_quantizer && qps[0] <= rc.max_quantizer,
        "quantizer {} outside [{}, {}]",
        qps[0],
        rc.min_quantizer,
        rc.max_quantizer
    );
}

#[test]
fn h265_keyframes_carry_parameter_sets() {
    let sink = RecordingSink::new();
    let mut session = session_with(SimEngine::new(), sink.clone());
    session.init(&config(Profile::H265Main, 1)).unwrap();
    session.submit(&request(3)).unwrap();

    let frames = sink.frames();
    assert_eq!(frames[0].frame_type, FrameType::Key);
    assert_eq!(&frames[0].data[..4], &[0, 0, 0, 1]);
    assert!(frames[0].h264.is_none(), "no AVC frame marking on HEVC");
}

#[test]
fn av1_frames_are_raw_payloads() {
    let sink = RecordingSink::new();
    let mut session = session_with(SimEngine::new(), sink.clone());
    session.init(&config(Profile::Av1Main, 1)).unwrap();
    session.submit(&request(3)).unwrap();
    session.submit(&request(4)).unwrap();

    let frames = sink.frames();
    assert_ne!(&frames[0].data[..4], &[0, 0, 0, 1], "no start codes");
    assert_ne!(frames[0].data, frames[1].data);
}

#[test]
fn reinit_mid_stream_restarts_the_stream() {
    let sink = RecordingSink::new();
    let mut session = session_with(SimEngine::new(), sink.clone());
    let cfg = config(Profile::H264ConstrainedBaseline, 1);
    session.init(&cfg).unwrap();

    for _ in 0..3 {
        session.submit(&request(5)).unwrap();
    }

    // Full reconfiguration: close and rebuild.
    let mut smaller = cfg.clone();
    smaller.width = 640;
    smaller.height = 360;
    session.init(&smaller).unwrap();
    assert_eq!(session.state(), SessionState::Initialized);

    let mut req = EncodeRequest {
        frame: RawFrame::solid(640, 360, 5),
        force_keyframe: false,
    };
    req.frame.timestamp_rtp = 9000;
    let ft = session.submit(&req).unwrap();
    assert_eq!(ft, FrameType::Key, "rebuilt session starts a new stream");
    assert_eq!(sink.frames().len(), 4);
}
