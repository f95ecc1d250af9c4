//! Engine command queue
//!
//! External threads never touch the graph directly: anything that must
//! mutate audio-thread state travels as an [`EngineCommand`] through a
//! bounded lock-free MPSC queue, drained at the start of each tick. Large
//! payloads are allocated by the caller and owned by the command; because
//! node payloads are [`Owned`], a command that gets dropped against a dead
//! handle (or during shutdown) defers its destructor off the audio thread
//! automatically.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::buffer::BufferData;
use crate::effects::{EchoTapConfig, EffectEntry};
use crate::error::{Error, Result};
use crate::gc::{Owned, Shared};
use crate::generators::GeneratorEntry;
use crate::sources::SourceNode;
use crate::types::ObjectId;

/// Commands executed on the audio thread between property drain and
/// source ticking.
pub enum EngineCommand {
    AddSource(Owned<SourceNode>),
    RemoveSource(ObjectId),
    AddEffect(Owned<EffectEntry>),
    RemoveEffect(ObjectId),
    /// Park a freshly created generator in the detached pool.
    RegisterGenerator(Owned<GeneratorEntry>),
    /// Drop a generator wherever it currently lives.
    UnregisterGenerator(ObjectId),
    AttachGenerator {
        source: ObjectId,
        generator: ObjectId,
    },
    DetachGenerator {
        source: ObjectId,
        generator: ObjectId,
    },
    SetGeneratorBuffer {
        generator: ObjectId,
        buffer: Shared<BufferData>,
    },
    SetEchoTaps {
        effect: ObjectId,
        taps: Owned<Vec<EchoTapConfig>>,
    },
    ConfigRoute {
        source: ObjectId,
        effect: ObjectId,
        gain: f64,
        fade_time: f64,
    },
    RemoveRoute {
        source: ObjectId,
        effect: ObjectId,
        fade_time: f64,
    },
    /// Arm a host automation marker; a `UserAutomation` event fires once
    /// the block containing `time_samples` has been emitted.
    ScheduleAutomationEvent {
        object: ObjectId,
        time_samples: u64,
        param: u64,
    },
    Shutdown,
}

/// Capacity of the command queue. Object churn is bursty (mass releases);
/// this gives plenty of headroom at ~64 bytes a slot.
pub const COMMAND_QUEUE_CAPACITY: usize = 4096;

/// Cloneable sending half, usable from any thread.
#[derive(Clone)]
pub struct CommandSender {
    queue: Arc<ArrayQueue<EngineCommand>>,
}

impl CommandSender {
    /// Enqueue a command; never blocks.
    pub fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.queue
            .push(cmd)
            .map_err(|_| Error::ResourceExhausted("command queue full"))
    }
}

/// Audio-thread receiving half.
pub struct CommandReceiver {
    queue: Arc<ArrayQueue<EngineCommand>>,
}

impl CommandReceiver {
    /// Pop the next pending command, if any.
    pub fn pop(&self) -> Option<EngineCommand> {
        self.queue.pop()
    }
}

/// Create the command channel for one context.
pub fn command_channel() -> (CommandSender, CommandReceiver) {
    let queue = Arc::new(ArrayQueue::new(COMMAND_QUEUE_CAPACITY));
    (
        CommandSender {
            queue: queue.clone(),
        },
        CommandReceiver { queue },
    )
}
