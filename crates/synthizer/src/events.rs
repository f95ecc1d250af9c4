//! Engine → host event delivery
//!
//! The audio thread never invokes user callbacks. Things worth telling the
//! host about (a generator finishing, a loop wrapping, an automation
//! marker) are pushed onto a bounded queue with a wait-free `try_send`;
//! the host drains it from whatever thread it likes via
//! [`crate::context::Context::next_event`]. A full queue drops the event
//! rather than stalling audio.

use crate::types::ObjectId;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A generator reached the end of its data and is not looping.
    Finished,
    /// A looping generator wrapped around.
    Looped,
    /// A streaming generator's ring ran dry; the engine emitted silence
    /// for the block and will recover when decode catches up.
    StreamUnderflow,
    /// A host-scheduled automation marker was crossed (see
    /// [`crate::context::Context::schedule_user_automation`]). Delivery is
    /// block-accurate: the event fires once the block containing the
    /// marker's time has been emitted.
    UserAutomation { param: u64 },
}

/// An event plus the object it originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub object: ObjectId,
    pub kind: EventKind,
}

/// Capacity of the event queue. Events are tiny; this is hundreds of
/// blocks of headroom for a host that polls once a frame.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Sending half, owned by the audio thread (and decode threads).
#[derive(Clone)]
pub struct EventSender {
    tx: flume::Sender<Event>,
}

impl EventSender {
    /// Post an event; silently drops if the host stopped draining.
    pub fn send(&self, object: ObjectId, kind: EventKind) {
        let _ = self.tx.try_send(Event { object, kind });
    }
}

/// Receiving half, owned by the context handle.
pub struct EventReceiver {
    rx: flume::Receiver<Event>,
}

impl EventReceiver {
    /// Non-blocking pop.
    pub fn try_next(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Block until an event arrives or every sender is gone.
    pub fn next_blocking(&self) -> Option<Event> {
        self.rx.recv().ok()
    }
}

/// Create the event channel for one context.
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = flume::bounded(EVENT_QUEUE_CAPACITY);
    (EventSender { tx }, EventReceiver { rx })
}
