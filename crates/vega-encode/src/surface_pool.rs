//! Fixed-size pool of engine-owned encode surfaces.
//!
//! The pool is built once per session configuration, sized by the engine's
//! own surface sizing query, and rebuilt whole on reconfigure or release.
//! Only the session worker touches the pool, so no locking is needed; the
//! per-surface in-use flags are the engine's to clear, which is why
//! [`SurfacePool::acquire`] polls rather than waits on a notification.

use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;
use vega_core::error::{EncodeError, Result};
use vega_core::types::Surface;

/// Poll step while waiting for the engine to free a surface.
pub const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bounded total wait before an acquire fails the frame.
pub const ACQUIRE_WAIT_WINDOW: Duration = Duration::from_millis(600);

pub struct SurfacePool {
    surfaces: Vec<Surface>,
    poll_interval: Duration,
    wait_window: Duration,
}

impl SurfacePool {
    /// Wrap the engine-allocated surface set with default wait bounds.
    pub fn new(surfaces: Vec<Surface>) -> Self {
        Self::with_wait(surfaces, ACQUIRE_POLL_INTERVAL, ACQUIRE_WAIT_WINDOW)
    }

    pub fn with_wait(
        surfaces: Vec<Surface>,
        poll_interval: Duration,
        wait_window: Duration,
    ) -> Self {
        Self {
            surfaces,
            poll_interval,
            wait_window,
        }
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    /// Index of the first surface whose in-use flag is clear.
    fn free_index(&self) -> Option<usize> {
        self.surfaces.iter().position(|s| !s.is_in_use())
    }

    /// Borrow a free surface, waiting up to the bounded window for the
    /// engine to release one. Never returns a surface whose in-use flag is
    /// set.
    pub fn acquire(&mut self) -> Result<usize> {
        let started = Instant::now();
        loop {
            if let Some(idx) = self.free_index() {
                return Ok(idx);
            }
            if started.elapsed() >= self.wait_window {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(
                    waited_ms,
                    pool_size = self.surfaces.len(),
                    "no free encode surface within the wait window"
                );
                return Err(EncodeError::ResourceExhausted { waited_ms });
            }
            thread::sleep(self.poll_interval);
        }
    }

    pub fn surface(&self, idx: usize) -> &Surface {
        &self.surfaces[idx]
    }

    pub fn surface_mut(&mut self, idx: usize) -> &mut Surface {
        &mut self.surfaces[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vega_core::types::PixelFormat;

    fn pool_of(n: usize, window_ms: u64) -> SurfacePool {
        let surfaces = (0..n)
            .map(|_| Surface::new(PixelFormat::Nv12, 64, 64))
            .collect();
        SurfacePool::with_wait(
            surfaces,
            Duration::from_millis(1),
            Duration::from_millis(window_ms),
        )
    }

    #[test]
    fn acquire_returns_free_surface() {
        let mut pool = pool_of(2, 50);
        let idx = pool.acquire().unwrap();
        assert!(!pool.surface(idx).is_in_use());
    }

    #[test]
    fn acquire_skips_in_use_surfaces() {
        let mut pool = pool_of(3, 50);
        pool.surface(0).in_use_flag().set(true);
        pool.surface(1).in_use_flag().set(true);

        let idx = pool.acquire().unwrap();
        assert_eq!(idx, 2);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let mut pool = pool_of(2, 20);
        for i in 0..2 {
            pool.surface(i).in_use_flag().set(true);
        }

        match pool.acquire() {
            Err(EncodeError::ResourceExhausted { waited_ms }) => {
                assert!(waited_ms >= 20, "gave up before the window: {waited_ms} ms");
            }
            other => panic!("expected ResourceExhausted, got {other:?}"),
        }
    }

    #[test]
    fn surface_freed_by_engine_becomes_acquirable() {
        let mut pool = pool_of(1, 200);
        let lock = pool.surface(0).in_use_flag();
        lock.set(true);

        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            lock.set(false);
        });

        let idx = pool.acquire().expect("surface freed within the window");
        assert_eq!(idx, 0);
        release.join().unwrap();
    }
}
