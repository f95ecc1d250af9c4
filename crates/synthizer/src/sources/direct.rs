//! Direct source: generators straight into the master bus

use crate::command::{CommandSender, EngineCommand};
use crate::error::Result;
use crate::filters::BiquadConfig;
use crate::gc::{deletion_handle, Owned, Shared};
use crate::generators::AsGenerator;
use crate::properties::{schema, ObjectCore, Property};
use crate::types::ObjectId;

use super::{SourceKind, SourceNode};

/// A source that sums its generators into the master bus verbatim — no
/// panning, no spatialization. The cheapest way to play something.
pub struct DirectSource {
    core: Shared<ObjectCore>,
    commands: CommandSender,
}

impl DirectSource {
    pub(crate) fn create(commands: CommandSender) -> Result<Self> {
        let core = Shared::new(&deletion_handle(), ObjectCore::new(schema::DIRECT_SOURCE));
        let node = SourceNode::new(core.clone(), SourceKind::Direct);
        commands.send(EngineCommand::AddSource(Owned::new(&deletion_handle(), node)))?;
        Ok(Self { core, commands })
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    /// Attach a generator; it starts playing on the next tick.
    pub fn add_generator(&self, generator: &dyn AsGenerator) -> Result<()> {
        self.commands.send(EngineCommand::AttachGenerator {
            source: self.core.id(),
            generator: generator.generator_id(),
        })
    }

    /// Detach a generator; it keeps its state and can be re-attached.
    pub fn remove_generator(&self, generator: &dyn AsGenerator) -> Result<()> {
        self.commands.send(EngineCommand::DetachGenerator {
            source: self.core.id(),
            generator: generator.generator_id(),
        })
    }

    pub fn gain(&self) -> Result<f64> {
        self.core.props().get_f64(Property::Gain)
    }

    pub fn set_gain(&self, gain: f64) -> Result<()> {
        self.core.props().set_f64(Property::Gain, gain)
    }

    pub fn set_filter(&self, config: BiquadConfig) -> Result<()> {
        self.core.props().set_biquad(Property::Filter, config)
    }

    pub(crate) fn core(&self) -> &Shared<ObjectCore> {
        &self.core
    }
}

impl Drop for DirectSource {
    fn drop(&mut self) {
        let _ = self.commands.send(EngineCommand::RemoveSource(self.core.id()));
    }
}
