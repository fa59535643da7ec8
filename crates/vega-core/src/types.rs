//! Codec identity, raw frames, engine surfaces and encoded access units.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Video codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
}

impl VideoCodec {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::H264 => "H.264/AVC",
            Self::H265 => "H.265/HEVC",
            Self::Vp9 => "VP9",
            Self::Av1 => "AV1",
        }
    }

    /// Whether the codec emits an Annex-B start-code-delimited byte stream.
    pub fn is_nal_based(self) -> bool {
        matches!(self, Self::H264 | Self::H265)
    }

    /// Whether per-frame quantizer decisions are made in software for this
    /// codec family instead of being delegated to the engine's own
    /// rate controller.
    pub fn uses_software_rate_control(self) -> bool {
        matches!(self, Self::Vp9)
    }
}

/// Per-codec profile. The variant carries the codec identity, so an
/// `EncoderConfig` cannot pair a profile with the wrong codec.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Profile {
    H264ConstrainedBaseline,
    H265Main,
    H265Main10,
    Vp9Profile0,
    Vp9Profile2,
    Av1Main,
    Av1High,
}

impl Profile {
    pub fn codec(self) -> VideoCodec {
        match self {
            Self::H264ConstrainedBaseline => VideoCodec::H264,
            Self::H265Main | Self::H265Main10 => VideoCodec::H265,
            Self::Vp9Profile0 | Self::Vp9Profile2 => VideoCodec::Vp9,
            Self::Av1Main | Self::Av1High => VideoCodec::Av1,
        }
    }

    /// Luma bit depth implied by the profile.
    pub fn bit_depth(self) -> u32 {
        match self {
            Self::H265Main10 | Self::Vp9Profile2 | Self::Av1High => 10,
            _ => 8,
        }
    }

    /// Surface pixel layout the engine expects for this profile.
    pub fn surface_format(self) -> PixelFormat {
        if self.bit_depth() == 10 {
            PixelFormat::P010
        } else {
            PixelFormat::Nv12
        }
    }
}

/// Engine surface pixel layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit semi-planar 4:2:0 (Y plane + interleaved UV plane).
    Nv12,
    /// 10-bit semi-planar 4:2:0, 16 bits per sample, little-endian.
    P010,
}

impl PixelFormat {
    /// Bytes per luma sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Nv12 => 1,
            Self::P010 => 2,
        }
    }
}

/// Encoded frame classification.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    Key,
    Delta,
}

/// One raw I420 input frame destined for the encoder.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub stride_y: usize,
    pub stride_u: usize,
    pub stride_v: usize,
    /// RTP timestamp, 90 kHz clock.
    pub timestamp_rtp: u32,
    /// Capture wall-clock time in milliseconds.
    pub capture_time_ms: i64,
}

impl RawFrame {
    /// Allocate a frame with tightly packed planes filled with `luma` /
    /// mid-grey chroma.
    pub fn solid(width: u32, height: u32, luma: u8) -> Self {
        let (w, h) = (width as usize, height as usize);
        Self {
            width,
            height,
            y: vec![luma; w * h],
            u: vec![128; (w / 2) * (h / 2)],
            v: vec![128; (w / 2) * (h / 2)],
            stride_y: w,
            stride_u: w / 2,
            stride_v: w / 2,
            timestamp_rtp: 0,
            capture_time_ms: 0,
        }
    }
}

/// One encode request: an input frame plus the caller's keyframe demand.
/// The cadence policy may still force a keyframe when the flag is unset.
#[derive(Clone, Debug)]
pub struct EncodeRequest {
    pub frame: RawFrame,
    pub force_keyframe: bool,
}

/// One engine-owned frame buffer used as encode input.
///
/// The pool owns every surface for the session's lifetime. A surface is
/// borrowed for one submit; the in-use flag is mutated only by the engine,
/// which clears it once the surface contents have been consumed. Surfaces
/// are never copied or individually reallocated — the whole pool is rebuilt
/// on reconfigure or release.
#[derive(Debug)]
pub struct Surface {
    pub format: PixelFormat,
    /// Aligned luma width in pixels.
    pub width: u32,
    /// Aligned luma height in pixels.
    pub height: u32,
    /// Row pitch of the Y plane in bytes.
    pub pitch: usize,
    /// Y plane, `pitch * height` bytes.
    pub y: Vec<u8>,
    /// Interleaved UV plane, `pitch * height / 2` bytes.
    pub uv: Vec<u8>,
    /// Submission-order tag, stamped by the session on each borrow.
    pub frame_order: u32,
    in_use: Arc<AtomicBool>,
}

impl Surface {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let pitch = width as usize * format.bytes_per_sample();
        let h = height as usize;
        Self {
            format,
            width,
            height,
            pitch,
            y: vec![0; pitch * h],
            uv: vec![0; pitch * h / 2],
            frame_order: 0,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Shared handle to the in-use flag. Handed to the engine at submit;
    /// only the engine mutates it.
    pub fn in_use_flag(&self) -> SurfaceLock {
        SurfaceLock(Arc::clone(&self.in_use))
    }
}

/// Engine-side handle to a surface's in-use flag.
#[derive(Clone, Debug)]
pub struct SurfaceLock(Arc<AtomicBool>);

impl SurfaceLock {
    pub fn set(&self, in_use: bool) {
        self.0.store(in_use, Ordering::Release);
    }
}

/// Codec-specific metadata extracted from an H.264 access unit carrying
/// temporal scalability markers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct H264Metadata {
    pub temporal_id: u8,
    pub priority_id: u8,
    pub idr_frame: bool,
    /// Upper layers may resync off the base layer on non-IDR frames.
    pub base_layer_sync: bool,
}

/// One complete compressed frame plus derived metadata, delivered to the
/// registered consumer. `data` borrows the session's bitstream buffer and is
/// only valid for the duration of the callback.
#[derive(Debug)]
pub struct AccessUnit<'a> {
    pub data: &'a [u8],
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_type: FrameType,
    pub timestamp_rtp: u32,
    pub capture_time_ms: i64,
    pub h264: Option<H264Metadata>,
}
