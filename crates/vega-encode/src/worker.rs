//! Dedicated worker thread owning one encode session.
//!
//! Every lifecycle operation — init, submit, set-rates, release — executes
//! on the worker; the caller sends a request and blocks on its private
//! reply channel until the worker has finished. Because only the worker
//! touches the session, the surface pool and engine handle need no locking.
//!
//! There is no cancellation of an in-flight submit: a release request
//! simply queues behind it and tears the session down once it completes.
//! Dropping the handle closes the request channel, which releases the
//! session and joins the thread.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};
use vega_core::config::EncoderConfig;
use vega_core::error::{EncodeError, Result};
use vega_core::types::{EncodeRequest, FrameType};

use crate::session::EncodeSession;

enum Command {
    Init {
        config: EncoderConfig,
        reply: mpsc::Sender<Result<()>>,
    },
    Submit {
        request: Box<EncodeRequest>,
        reply: mpsc::Sender<Result<FrameType>>,
    },
    SetRates {
        bitrate_bps: u32,
        framerate: f64,
        reply: mpsc::Sender<Result<()>>,
    },
    Release {
        reply: mpsc::Sender<Result<()>>,
    },
}

/// Blocking handle to an encode session running on its own worker thread.
pub struct EncoderHandle {
    tx: Option<mpsc::Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl EncoderHandle {
    /// Move `session` onto a fresh worker thread.
    pub fn spawn(mut session: EncodeSession) -> Self {
        let (tx, rx) = mpsc::channel::<Command>();
        let worker = thread::Builder::new()
            .name("vega-encoder".into())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        Command::Init { config, reply } => {
                            let _ = reply.send(session.init(&config));
                        }
                        Command::Submit { request, reply } => {
                            let result = session.submit(&request);
                            if let Err(e) = &result {
                                if e.is_session_fatal() {
                                    warn!(error = %e, "session-fatal submit failure");
                                }
                            }
                            let _ = reply.send(result);
                        }
                        Command::SetRates {
                            bitrate_bps,
                            framerate,
                            reply,
                        } => {
                            let _ = reply.send(session.set_rates(bitrate_bps, framerate));
                        }
                        Command::Release { reply } => {
                            let _ = reply.send(session.release());
                        }
                    }
                }
                // Handle dropped: tear the session down on the way out.
                let _ = session.release();
                debug!("encoder worker exited");
            })
            .expect("failed to start encoder worker thread");

        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    fn call<T>(&self, build: impl FnOnce(mpsc::Sender<Result<T>>) -> Command) -> Result<T> {
        let tx = self.tx.as_ref().ok_or(EncodeError::WorkerGone)?;
        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(build(reply_tx))
            .map_err(|_| EncodeError::WorkerGone)?;
        reply_rx.recv().map_err(|_| EncodeError::WorkerGone)?
    }

    /// Configure the session. Blocks until the worker has finished.
    pub fn init(&self, config: EncoderConfig) -> Result<()> {
        self.call(|reply| Command::Init { config, reply })
    }

    /// Encode one frame. Blocks through conversion, submit, sync and
    /// delivery; the consumer callback has already returned when this does.
    pub fn submit(&self, request: EncodeRequest) -> Result<FrameType> {
        self.call(|reply| Command::Submit {
            request: Box::new(request),
            reply,
        })
    }

    /// Adopt new live targets.
    pub fn set_rates(&self, bitrate_bps: u32, framerate: f64) -> Result<()> {
        self.call(|reply| Command::SetRates {
            bitrate_bps,
            framerate,
            reply,
        })
    }

    /// Tear the session down. Queues behind any in-flight submit.
    pub fn release(&self) -> Result<()> {
        self.call(|reply| Command::Release { reply })
    }
}

impl Drop for EncoderHandle {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
