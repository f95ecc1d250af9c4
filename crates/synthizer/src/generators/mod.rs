//! Generators
//!
//! A generator is a pull node that fills `channels × BLOCK_SIZE`
//! interleaved frames when ticked by the source that owns it. The
//! audio-thread state of every generator lives in a [`GeneratorEntry`]:
//! shared core (identity + properties), the drained property snapshot,
//! the per-generator gain ramp, and the DSP node itself.

mod buffer;
mod noise;
mod sine_bank;
mod streaming;

pub use buffer::{BufferGenerator, BufferGeneratorNode};
pub use noise::{NoiseGenerator, NoiseGeneratorNode, NoiseType};
pub use sine_bank::{FastSineBank, SineBankConfig, SineBankNode, SineWaveConfig};
pub use streaming::{StreamingGenerator, StreamingGeneratorNode};

use crate::events::EventSender;
use crate::gc::Shared;
use crate::properties::{ObjectCore, Property, PropertySnapshot};
use crate::types::{ObjectId, GainRamp, Sample, BLOCK_SIZE};

/// Anything a source can consume. Implemented by every generator handle
/// type so `source.add_generator(&gen)` works uniformly.
pub trait AsGenerator {
    fn generator_id(&self) -> ObjectId;
}

impl AsGenerator for BufferGenerator {
    fn generator_id(&self) -> ObjectId {
        self.id()
    }
}

impl AsGenerator for StreamingGenerator {
    fn generator_id(&self) -> ObjectId {
        self.id()
    }
}

impl AsGenerator for NoiseGenerator {
    fn generator_id(&self) -> ObjectId {
        self.id()
    }
}

impl AsGenerator for FastSineBank {
    fn generator_id(&self) -> ObjectId {
        self.id()
    }
}

/// Audio-thread context handed to a generator while it fills a block.
pub struct GeneratorContext<'a> {
    pub core: &'a ObjectCore,
    pub props: &'a mut PropertySnapshot,
    pub events: &'a EventSender,
}

/// The DSP half of a generator, owned by the audio thread.
pub trait Generator: Send {
    /// Channel count of the blocks this generator produces. May change
    /// across ticks (a buffer generator adopts its buffer's layout).
    fn channels(&self) -> usize;

    /// Add one block into `out` (`channels() × BLOCK_SIZE`, interleaved,
    /// zeroed by the caller).
    fn generate(&mut self, cx: &mut GeneratorContext<'_>, out: &mut [Sample]);

    /// Install a decoded buffer. Meaningful only for buffer-backed
    /// generators; everything else ignores it.
    fn set_buffer(&mut self, _buffer: crate::gc::Shared<crate::buffer::BufferData>) {}
}

/// A generator as the audio thread owns it.
pub struct GeneratorEntry {
    core: Shared<ObjectCore>,
    snapshot: PropertySnapshot,
    gain: GainRamp,
    node: Box<dyn Generator>,
}

impl GeneratorEntry {
    pub fn new(core: Shared<ObjectCore>, node: Box<dyn Generator>) -> Self {
        let snapshot = PropertySnapshot::new(core.props());
        let gain = GainRamp::new(snapshot.f64(core.props(), Property::Gain) as f32);
        Self {
            core,
            snapshot,
            gain,
            node,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    pub fn channels(&self) -> usize {
        self.node.channels()
    }

    pub fn node_mut(&mut self) -> &mut dyn Generator {
        &mut *self.node
    }

    /// Drain properties and produce one block into `out`.
    pub fn tick(&mut self, events: &EventSender, out: &mut [Sample]) {
        debug_assert_eq!(out.len(), self.node.channels() * BLOCK_SIZE);

        self.snapshot.drain(self.core.props());
        if self.snapshot.changed(self.core.props(), Property::Gain) {
            self.gain
                .set(self.snapshot.f64(self.core.props(), Property::Gain) as f32);
        }

        let mut cx = GeneratorContext {
            core: &*self.core,
            props: &mut self.snapshot,
            events,
        };
        self.node.generate(&mut cx, out);

        let channels = self.node.channels();
        self.gain.apply(out, channels);
        self.gain.settle();
    }
}
