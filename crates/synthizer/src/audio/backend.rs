//! Backend interface and the manual backend
//!
//! A backend signals "ready for one block" through the callback the
//! scheduler hands to `start`; the scheduler answers each signal with
//! exactly one `submit` of `BLOCK_SIZE` interleaved frames. The callback
//! may fire from any thread.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{Sample, BLOCK_SIZE};

/// Invoked by a backend whenever it can accept one more block.
pub type BlockReadyFn = Arc<dyn Fn() + Send + Sync>;

/// A backend before it is running. Consumed by `start` on the audio
/// thread.
pub trait AudioBackend: Send {
    /// Begin producing audio. Returns the started half, which stays on
    /// the calling (audio) thread for its whole life.
    fn start(
        self: Box<Self>,
        sample_rate: u32,
        channels: usize,
        on_block_ready: BlockReadyFn,
    ) -> Result<Box<dyn StartedBackend>>;
}

/// A running backend. Not `Send`: it lives and dies on the audio thread.
pub trait StartedBackend {
    /// Deliver one block of interleaved frames.
    fn submit(&mut self, frames: &[Sample]);

    /// Stop output. Called by the audio thread right before it exits.
    fn stop(&mut self);
}

// --- Manual backend ---

struct ManualShared {
    ready: Mutex<Option<BlockReadyFn>>,
}

/// A backend driven by hand: the host (or a test) asks for blocks and
/// receives exactly what the engine submitted. No device, no clock.
pub struct ManualBackend {
    shared: Arc<ManualShared>,
    frames_tx: flume::Sender<Vec<Sample>>,
}

/// Host-side control for a [`ManualBackend`].
pub struct ManualControl {
    shared: Arc<ManualShared>,
    frames_rx: flume::Receiver<Vec<Sample>>,
    channels: usize,
}

/// Create a manual backend and its control half.
pub fn manual_pair() -> (ManualBackend, ManualControl) {
    let shared = Arc::new(ManualShared {
        ready: Mutex::new(None),
    });
    let (frames_tx, frames_rx) = flume::unbounded();
    (
        ManualBackend {
            shared: shared.clone(),
            frames_tx,
        },
        ManualControl {
            shared,
            frames_rx,
            channels: 2,
        },
    )
}

impl AudioBackend for ManualBackend {
    fn start(
        self: Box<Self>,
        _sample_rate: u32,
        channels: usize,
        on_block_ready: BlockReadyFn,
    ) -> Result<Box<dyn StartedBackend>> {
        *self.shared.ready.lock().unwrap() = Some(on_block_ready);
        let _ = channels;
        Ok(Box::new(StartedManual {
            frames_tx: self.frames_tx,
        }))
    }
}

struct StartedManual {
    frames_tx: flume::Sender<Vec<Sample>>,
}

impl StartedBackend for StartedManual {
    fn submit(&mut self, frames: &[Sample]) {
        let _ = self.frames_tx.send(frames.to_vec());
    }

    fn stop(&mut self) {}
}

impl ManualControl {
    /// Request and collect `blocks` blocks of interleaved output.
    ///
    /// Blocks until the engine has produced them (a second per block of
    /// grace before giving up).
    pub fn render(&self, blocks: usize) -> Result<Vec<Sample>> {
        let mut out = Vec::with_capacity(blocks * BLOCK_SIZE * self.channels);
        for _ in 0..blocks {
            self.trigger()?;
            let frames = self
                .frames_rx
                .recv_timeout(Duration::from_secs(1))
                .map_err(|_| Error::Backend("engine did not produce a block".to_string()))?;
            out.extend_from_slice(&frames);
        }
        Ok(out)
    }

    /// Request blocks without collecting them (advance engine time).
    pub fn advance(&self, blocks: usize) -> Result<()> {
        self.render(blocks).map(|_| ())
    }

    fn trigger(&self) -> Result<()> {
        // The engine installs the callback when its audio thread starts;
        // wait for that on first use.
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        loop {
            if let Some(ready) = self.shared.ready.lock().unwrap().as_ref() {
                ready();
                return Ok(());
            }
            if std::time::Instant::now() > deadline {
                return Err(Error::Backend("backend never started".to_string()));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_backend_roundtrip() {
        let (backend, control) = manual_pair();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_in_cb = fired.clone();
        let ready: BlockReadyFn = Arc::new(move || {
            fired_in_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let mut started = Box::new(backend).start(44_100, 2, ready).unwrap();

        // Triggers invoke the installed callback.
        control.trigger().unwrap();
        control.trigger().unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 2);

        // Submitted blocks come back out in order.
        started.submit(&vec![1.0; BLOCK_SIZE * 2]);
        started.submit(&vec![2.0; BLOCK_SIZE * 2]);
        let first = control.frames_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = control.frames_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(first.iter().all(|&s| s == 1.0));
        assert!(second.iter().all(|&s| s == 2.0));
    }
}
