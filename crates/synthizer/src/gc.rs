//! Deferred deletion off the audio thread
//!
//! Destructors never run on the audio thread. Every node the audio thread
//! owns is a [`basedrop::Owned`] and every immutable shared blob (decoded
//! PCM, object cores) is a [`basedrop::Shared`]; dropping either on the
//! audio thread enqueues a pointer for a background deletion thread
//! instead of freeing inline. Enqueue is wait-free; the deletion thread is
//! free to run destructors that allocate, lock, or touch the OS.
//!
//! The collector is process-wide and initialized on first use, mirroring
//! the fact that deletion order across contexts is a single FIFO.

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

pub use basedrop::{Owned, Shared};

/// Global handle for creating `Shared<T>` / `Owned<T>` allocations.
static DELETION_HANDLE: OnceLock<Handle> = OnceLock::new();

/// How often the deletion thread sweeps its queue.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

fn spawn_deletion_thread() -> Handle {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("synthizer-deletion".to_string())
        .spawn(move || {
            // Collector is !Sync; it lives on this thread and only hands
            // out cloneable Handles.
            let mut collector = Collector::new();
            tx.send(collector.handle())
                .expect("deletion thread failed to hand back its handle");

            log::info!("deferred-deletion thread started");
            loop {
                collector.collect();
                thread::sleep(SWEEP_INTERVAL);
            }
        })
        .expect("failed to spawn deletion thread");

    rx.recv().expect("deletion thread died during startup")
}

/// Get a handle for wrapping values in [`Shared`] or [`Owned`].
///
/// Cheap to clone; call at construction time, not on the audio thread.
pub fn deletion_handle() -> Handle {
    DELETION_HANDLE.get_or_init(spawn_deletion_thread).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct DropProbe {
        dropped: Arc<AtomicBool>,
        dropped_on: Arc<std::sync::Mutex<Option<String>>>,
    }

    impl Drop for DropProbe {
        fn drop(&mut self) {
            let name = thread::current().name().unwrap_or("").to_string();
            *self.dropped_on.lock().unwrap() = Some(name);
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_runs_on_deletion_thread() {
        let dropped = Arc::new(AtomicBool::new(false));
        let dropped_on = Arc::new(std::sync::Mutex::new(None));

        let probe = Owned::new(
            &deletion_handle(),
            DropProbe {
                dropped: dropped.clone(),
                dropped_on: dropped_on.clone(),
            },
        );
        drop(probe);

        // The sweep runs every 50ms; give it a generous window.
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !dropped.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert!(dropped.load(Ordering::SeqCst), "destructor never ran");
        assert_eq!(
            dropped_on.lock().unwrap().as_deref(),
            Some("synthizer-deletion")
        );
    }

    #[test]
    fn test_shared_clones_defer_last_drop() {
        let dropped = Arc::new(AtomicBool::new(false));
        let dropped_on = Arc::new(std::sync::Mutex::new(None));

        let shared = Shared::new(
            &deletion_handle(),
            DropProbe {
                dropped: dropped.clone(),
                dropped_on,
            },
        );
        let clone = shared.clone();
        drop(shared);
        assert!(!dropped.load(Ordering::SeqCst));
        drop(clone);

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !dropped.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(dropped.load(Ordering::SeqCst));
    }
}
