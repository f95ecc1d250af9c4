//! Global effects
//!
//! A global effect owns an input bus the router accumulates into, an
//! input biquad, and a wet gain. Each tick the entry runs the input
//! filter, lets the effect DSP add its wet output into the master bus,
//! then zeroes the input bus for the next tick — effects own that part of
//! the contract because the router cannot know which effects were routed
//! to.

mod echo;
mod reverb;

pub use echo::{EchoTapConfig, GlobalEcho, MAX_ECHO_TAPS};
pub use reverb::GlobalFdnReverb;

use crate::filters::BiquadFilter;
use crate::gc::Shared;
use crate::properties::{ObjectCore, Property, PropertySnapshot};
use crate::types::{GainRamp, ObjectId, Sample, BLOCK_SIZE};

/// Commands targeted at a specific effect node, shipped through the
/// engine command queue (vector-valued reconfiguration does not fit the
/// fixed-size property union).
pub enum EffectNodeCommand {
    SetEchoTaps(crate::gc::Owned<Vec<EchoTapConfig>>),
}

/// Audio-thread context for an effect's run.
pub struct EffectContext<'a> {
    pub core: &'a ObjectCore,
    pub props: &'a PropertySnapshot,
    /// Wet gain for the block, already ramped.
    pub gain: &'a GainRamp,
}

/// The DSP half of a global effect.
pub trait EffectNode: Send {
    /// Consume one filtered input block and add the wet result into the
    /// stereo master bus, scaled by `cx.gain`.
    fn run(
        &mut self,
        cx: &mut EffectContext<'_>,
        input: &[Sample],
        input_channels: usize,
        master: &mut [Sample],
    );

    /// Handle an effect-specific command. Default: ignore.
    fn command(&mut self, _cmd: EffectNodeCommand) {}
}

/// A global effect as the audio thread owns it.
pub struct EffectEntry {
    core: Shared<ObjectCore>,
    snapshot: PropertySnapshot,
    channels: usize,
    input_bus: Box<[Sample]>,
    filter: BiquadFilter,
    gain: GainRamp,
    node: Box<dyn EffectNode>,
}

impl EffectEntry {
    pub fn new(core: Shared<ObjectCore>, channels: usize, node: Box<dyn EffectNode>) -> Self {
        let snapshot = PropertySnapshot::new(core.props());
        let gain = GainRamp::new(snapshot.f64(core.props(), Property::Gain) as f32);
        Self {
            snapshot,
            channels,
            input_bus: vec![0.0; channels * BLOCK_SIZE].into_boxed_slice(),
            filter: BiquadFilter::new(channels),
            gain,
            node,
            core,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    /// Input bus channel count, used by the router's mix matrices.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// The bus routes accumulate into.
    pub fn input_bus_mut(&mut self) -> &mut [Sample] {
        &mut self.input_bus
    }

    pub fn command(&mut self, cmd: EffectNodeCommand) {
        self.node.command(cmd);
    }

    /// Run one tick: filter the input bus, run the DSP into the master,
    /// zero the input bus.
    pub fn tick(&mut self, master: &mut [Sample]) {
        self.snapshot.drain(self.core.props());
        if self.snapshot.changed(self.core.props(), Property::Gain) {
            self.gain
                .set(self.snapshot.f64(self.core.props(), Property::Gain) as f32);
        }
        if self.snapshot.changed(self.core.props(), Property::FilterInput) {
            self.filter
                .configure(self.snapshot.biquad(self.core.props(), Property::FilterInput));
        }

        self.filter.process_block(&mut self.input_bus);

        let mut cx = EffectContext {
            core: &*self.core,
            props: &self.snapshot,
            gain: &self.gain,
        };
        self.node
            .run(&mut cx, &self.input_bus, self.channels, master);

        self.input_bus.fill(0.0);
        self.gain.settle();
    }
}
