//! Audio output backends
//!
//! The engine produces fixed-size blocks; a backend turns them into sound
//! (or hands them to a test harness). Backends are two-phase: an
//! [`AudioBackend`](backend::AudioBackend) is `Send` and moves onto the
//! audio thread, where `start` converts it into a started backend that
//! never crosses threads again — which is what lets the cpal
//! implementation own its (non-`Send`) stream.

pub mod backend;
pub mod cpal_backend;

pub use backend::{manual_pair, AudioBackend, BlockReadyFn, ManualBackend, ManualControl, StartedBackend};
pub use cpal_backend::CpalBackend;
