//! Panned sources: stereo voices driven by a pan scalar or an angle

use crate::command::{CommandSender, EngineCommand};
use crate::error::Result;
use crate::filters::BiquadConfig;
use crate::gc::{deletion_handle, Owned, Shared};
use crate::generators::AsGenerator;
use crate::properties::{schema, ObjectCore, Property};
use crate::types::ObjectId;

use super::{SourceKind, SourceNode};

/// A source panned by a scalar in `[-1, 1]` (-1 hard left, 1 hard right)
/// through an equal-power stereo voice.
pub struct ScalarPannedSource {
    core: Shared<ObjectCore>,
    commands: CommandSender,
}

impl ScalarPannedSource {
    pub(crate) fn create(commands: CommandSender) -> Result<Self> {
        let core = Shared::new(
            &deletion_handle(),
            ObjectCore::new(schema::SCALAR_PANNED_SOURCE),
        );
        let node = SourceNode::new(core.clone(), SourceKind::ScalarPanned);
        commands.send(EngineCommand::AddSource(Owned::new(&deletion_handle(), node)))?;
        Ok(Self { core, commands })
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    pub fn add_generator(&self, generator: &dyn AsGenerator) -> Result<()> {
        self.commands.send(EngineCommand::AttachGenerator {
            source: self.core.id(),
            generator: generator.generator_id(),
        })
    }

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

    pub fn panning_scalar(&self) -> Result<f64> {
        self.core.props().get_f64(Property::PanningScalar)
    }

    pub fn set_panning_scalar(&self, pan: f64) -> Result<()> {
        self.core.props().set_f64(Property::PanningScalar, pan)
    }

    pub fn set_filter(&self, config: BiquadConfig) -> Result<()> {
        self.core.props().set_biquad(Property::Filter, config)
    }

    pub(crate) fn core(&self) -> &Shared<ObjectCore> {
        &self.core
    }
}

impl Drop for ScalarPannedSource {
    fn drop(&mut self) {
        let _ = self.commands.send(EngineCommand::RemoveSource(self.core.id()));
    }
}

/// A source panned by azimuth/elevation through a stereo voice. The
/// elevation is accepted for API symmetry with HRTF sources; a stereo
/// voice can only render the lateral component.
pub struct AngularPannedSource {
    core: Shared<ObjectCore>,
    commands: CommandSender,
}

impl AngularPannedSource {
    pub(crate) fn create(commands: CommandSender) -> Result<Self> {
        let core = Shared::new(
            &deletion_handle(),
            ObjectCore::new(schema::ANGULAR_PANNED_SOURCE),
        );
        let node = SourceNode::new(core.clone(), SourceKind::AngularPanned);
        commands.send(EngineCommand::AddSource(Owned::new(&deletion_handle(), node)))?;
        Ok(Self { core, commands })
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    pub fn add_generator(&self, generator: &dyn AsGenerator) -> Result<()> {
        self.commands.send(EngineCommand::AttachGenerator {
            source: self.core.id(),
            generator: generator.generator_id(),
        })
    }

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

    pub fn azimuth(&self) -> Result<f64> {
        self.core.props().get_f64(Property::Azimuth)
    }

    /// Azimuth in degrees: 0 front, 90 right, wraps modulo 360.
    pub fn set_azimuth(&self, degrees: f64) -> Result<()> {
        self.core.props().set_f64(Property::Azimuth, degrees)
    }

    pub fn elevation(&self) -> Result<f64> {
        self.core.props().get_f64(Property::Elevation)
    }

    pub fn set_elevation(&self, degrees: f64) -> Result<()> {
        self.core.props().set_f64(Property::Elevation, degrees)
    }

    pub fn set_filter(&self, config: BiquadConfig) -> Result<()> {
        self.core.props().set_biquad(Property::Filter, config)
    }

    pub(crate) fn core(&self) -> &Shared<ObjectCore> {
        &self.core
    }
}

impl Drop for AngularPannedSource {
    fn drop(&mut self) {
        let _ = self.commands.send(EngineCommand::RemoveSource(self.core.id()));
    }
}
