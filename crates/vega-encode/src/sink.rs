//! Delivery of finished access units to the registered consumer, plus the
//! optional IVF debug dump.
//!
//! Delivery is synchronous on the session worker: the consumer's verdict is
//! propagated straight back to the submit caller. The dump is strictly a
//! side channel — any dump failure is logged and disables further dumping,
//! but never fails a delivery.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use vega_core::engine::{FrameSink, SinkVerdict};
use vega_core::error::{EncodeError, Result};
use vega_core::types::{AccessUnit, VideoCodec};

/// External configuration value naming the dump directory. Unset means no
/// dump.
pub const DUMP_DIR_ENV: &str = "VEGA_ENCODER_DUMP_DIR";

/// Hard ceiling on dump file size.
pub const DUMP_BYTE_LIMIT: u64 = 100_000_000;

/// IVF timebase for RTP-clocked frames (90 kHz).
const IVF_TIMEBASE_DEN: u32 = 90_000;

pub struct OutputSink {
    consumer: Box<dyn FrameSink>,
    dump_dir: Option<PathBuf>,
    dump: Option<IvfWriter>,
    dump_disabled: bool,
    delivered: u64,
}

impl OutputSink {
    /// Sink with no debug dump.
    pub fn new(consumer: Box<dyn FrameSink>) -> Self {
        Self {
            consumer,
            dump_dir: None,
            dump: None,
            dump_disabled: false,
            delivered: 0,
        }
    }

    /// Sink with the dump directory taken from [`DUMP_DIR_ENV`].
    pub fn from_env(consumer: Box<dyn FrameSink>) -> Self {
        let dir = std::env::var_os(DUMP_DIR_ENV).map(PathBuf::from);
        match dir {
            Some(dir) => Self::with_dump_dir(consumer, dir),
            None => Self::new(consumer),
        }
    }

    pub fn with_dump_dir(consumer: Box<dyn FrameSink>, dir: PathBuf) -> Self {
        let mut sink = Self::new(consumer);
        sink.dump_dir = Some(dir);
        sink
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Hand one access unit to the consumer and, on acceptance, append it to
    /// the dump.
    pub fn deliver(&mut self, au: &AccessUnit<'_>) -> Result<()> {
        if self.consumer.on_encoded(au) == SinkVerdict::Rejected {
            return Err(EncodeError::CallbackRejected);
        }
        self.delivered += 1;
        self.append_dump(au);
        Ok(())
    }

    fn append_dump(&mut self, au: &AccessUnit<'_>) {
        if self.dump_disabled {
            return;
        }
        let Some(dir) = &self.dump_dir else {
            return;
        };

        if self.dump.is_none() {
            let micros = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros())
                .unwrap_or(0);
            let path = dir.join(format!("vega_send_stream_{micros}.ivf"));
            match IvfWriter::create(&path, au.codec, au.width, au.height, DUMP_BYTE_LIMIT) {
                Ok(writer) => {
                    info!(path = %path.display(), "bitstream dump opened");
                    self.dump = Some(writer);
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "bitstream dump disabled");
                    self.dump_disabled = true;
                    return;
                }
            }
        }

        if let Some(writer) = &mut self.dump {
            if let Err(e) = writer.write_frame(au.data, au.timestamp_rtp as u64) {
                warn!(error = %e, "bitstream dump write failed, disabling dump");
                self.dump = None;
                self.dump_disabled = true;
            }
        }
    }

    /// Finish the dump file, patching the frame count into its header.
    /// Called at session release.
    pub fn finalize(&mut self) {
        if let Some(mut writer) = self.dump.take() {
            if let Err(e) = writer.finalize() {
                warn!(error = %e, "bitstream dump finalize failed");
            }
        }
    }
}

/// Minimal IVF container writer: 32-byte file header, then per frame a
/// 12-byte header (payload size + pts) and the raw payload.
pub struct IvfWriter {
    file: File,
    frames_written: u32,
    bytes_written: u64,
    byte_limit: u64,
    limit_reached: bool,
}

impl IvfWriter {
    pub fn create(
        path: &Path,
        codec: VideoCodec,
        width: u32,
        height: u32,
        byte_limit: u64,
    ) -> std::io::Result<Self> {
        let mut file = File::create(path)?;

        let fourcc: &[u8; 4] = match codec {
            VideoCodec::H264 => b"H264",
            VideoCodec::H265 => b"H265",
            VideoCodec::Vp9 => b"VP90",
            VideoCodec::Av1 => b"AV01",
        };

        file.write_all(b"DKIF")?;
        file.write_all(&0u16.to_le_bytes())?; // version
        file.write_all(&32u16.to_le_bytes())?; // header size
        file.write_all(fourcc)?;
        file.write_all(&(width as u16).to_le_bytes())?;
        file.write_all(&(height as u16).to_le_bytes())?;
        file.write_all(&IVF_TIMEBASE_DEN.to_le_bytes())?;
        file.write_all(&1u32.to_le_bytes())?; // timebase numerator
        file.write_all(&0u32.to_le_bytes())?; // frame count, patched at finalize
        file.write_all(&0u32.to_le_bytes())?; // unused

        Ok(Self {
            file,
            frames_written: 0,
            bytes_written: 32,
            byte_limit,
            limit_reached: false,
        })
    }

    pub fn write_frame(&mut self, payload: &[u8], pts: u64) -> std::io::Result<()> {
        let frame_bytes = 12 + payload.len() as u64;
        if self.bytes_written + frame_bytes > self.byte_limit {
            if !self.limit_reached {
                debug!(
                    limit = self.byte_limit,
                    "dump byte limit reached, dropping further frames"
                );
                self.limit_reached = true;
            }
            return Ok(());
        }

        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&pts.to_le_bytes())?;
        self.file.write_all(payload)?;
        self.frames_written += 1;
        self.bytes_written += frame_bytes;
        Ok(())
    }

    /// Patch the frame count into the header and flush.
    pub fn finalize(&mut self) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(24))?;
        self.file.write_all(&self.frames_written.to_le_bytes())?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.flush()
    }
}

impl Drop for IvfWriter {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}
