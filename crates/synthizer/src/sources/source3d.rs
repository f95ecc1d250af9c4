//! 3D source: HRTF spatialization in the listener frame

use crate::command::{CommandSender, EngineCommand};
use crate::error::Result;
use crate::filters::BiquadConfig;
use crate::gc::{deletion_handle, Owned, Shared};
use crate::generators::AsGenerator;
use crate::properties::{schema, ObjectCore, Property};
use crate::types::ObjectId;

use super::{SourceKind, SourceNode};

/// Distance attenuation models, in `distance_model` property order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceModel {
    Inverse = 0,
    Linear = 1,
    Exponential = 2,
}

impl DistanceModel {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => DistanceModel::Linear,
            2 => DistanceModel::Exponential,
            _ => DistanceModel::Inverse,
        }
    }
}

/// A source positioned in world space. Each tick it derives its
/// listener-relative azimuth/elevation and distance, attenuates by the
/// configured distance model, and renders binaurally through an HRTF
/// voice (falling back to direct mixing if the voice pool is dry).
pub struct Source3D {
    core: Shared<ObjectCore>,
    commands: CommandSender,
}

impl Source3D {
    pub(crate) fn create(commands: CommandSender) -> Result<Self> {
        let core = Shared::new(&deletion_handle(), ObjectCore::new(schema::SOURCE_3D));
        let node = SourceNode::new(core.clone(), SourceKind::ThreeD);
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

    pub fn position(&self) -> Result<[f64; 3]> {
        self.core.props().get_double3(Property::Position)
    }

    pub fn set_position(&self, position: [f64; 3]) -> Result<()> {
        self.core.props().set_double3(Property::Position, position)
    }

    pub fn orientation(&self) -> Result<[f64; 6]> {
        self.core.props().get_double6(Property::Orientation)
    }

    /// Packed `(at, up)` orientation vectors.
    pub fn set_orientation(&self, orientation: [f64; 6]) -> Result<()> {
        self.core.props().set_double6(Property::Orientation, orientation)
    }

    pub fn distance_model(&self) -> Result<DistanceModel> {
        Ok(DistanceModel::from_i64(
            self.core.props().get_i64(Property::DistanceModel)?,
        ))
    }

    pub fn set_distance_model(&self, model: DistanceModel) -> Result<()> {
        self.core.props().set_i64(Property::DistanceModel, model as i64)
    }

    pub fn distance_ref(&self) -> Result<f64> {
        self.core.props().get_f64(Property::DistanceRef)
    }

    pub fn set_distance_ref(&self, reference: f64) -> Result<()> {
        self.core.props().set_f64(Property::DistanceRef, reference)
    }

    pub fn distance_max(&self) -> Result<f64> {
        self.core.props().get_f64(Property::DistanceMax)
    }

    pub fn set_distance_max(&self, max: f64) -> Result<()> {
        self.core.props().set_f64(Property::DistanceMax, max)
    }

    pub fn rolloff(&self) -> Result<f64> {
        self.core.props().get_f64(Property::Rolloff)
    }

    pub fn set_rolloff(&self, rolloff: f64) -> Result<()> {
        self.core.props().set_f64(Property::Rolloff, rolloff)
    }

    pub fn set_filter(&self, config: BiquadConfig) -> Result<()> {
        self.core.props().set_biquad(Property::Filter, config)
    }

    pub(crate) fn core(&self) -> &Shared<ObjectCore> {
        &self.core
    }
}

impl Drop for Source3D {
    fn drop(&mut self) {
        let _ = self.commands.send(EngineCommand::RemoveSource(self.core.id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_model_mapping() {
        assert_eq!(DistanceModel::from_i64(0), DistanceModel::Inverse);
        assert_eq!(DistanceModel::from_i64(1), DistanceModel::Linear);
        assert_eq!(DistanceModel::from_i64(2), DistanceModel::Exponential);
        assert_eq!(DistanceModel::from_i64(99), DistanceModel::Inverse);
    }
}
