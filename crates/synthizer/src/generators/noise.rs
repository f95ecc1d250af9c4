//! Noise generator
//!
//! Three flavors selected by the `noise_type` property: uniform white
//! noise, `1/f` noise made by filtering white noise, and Voss–McCartney
//! pink noise. All state is small and local to the node.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::command::{CommandSender, EngineCommand};
use crate::error::Result;
use crate::gc::{deletion_handle, Owned, Shared};
use crate::properties::{schema, ObjectCore, Property};
use crate::types::{ObjectId, Sample, BLOCK_SIZE};

use super::{Generator, GeneratorContext, GeneratorEntry};

/// Noise flavors, in `noise_type` property order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseType {
    Uniform = 0,
    /// White noise through a one-over-f shaping filter.
    Filtered = 1,
    VossMcCartney = 2,
}

impl NoiseType {
    fn from_i64(v: i64) -> Self {
        match v {
            1 => NoiseType::Filtered,
            2 => NoiseType::VossMcCartney,
            _ => NoiseType::Uniform,
        }
    }
}

/// Number of octave rows in the Voss–McCartney lattice.
const VM_ROWS: usize = 16;

/// Audio-thread state.
pub struct NoiseGeneratorNode {
    rng: StdRng,
    /// One-pole cascade state for the filtered variant (Paul Kellet's
    /// economy pink approximation).
    filtered_state: [f32; 3],
    /// Voss–McCartney rows plus running sum.
    vm_rows: [f32; VM_ROWS],
    vm_sum: f32,
    vm_counter: u32,
}

impl NoiseGeneratorNode {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            filtered_state: [0.0; 3],
            vm_rows: [0.0; VM_ROWS],
            vm_sum: 0.0,
            vm_counter: 0,
        }
    }

    #[inline]
    fn white(&mut self) -> f32 {
        self.rng.gen_range(-1.0f32..1.0f32)
    }

    #[inline]
    fn filtered(&mut self) -> f32 {
        let white = self.white();
        let [b0, b1, b2] = &mut self.filtered_state;
        *b0 = 0.99765 * *b0 + white * 0.0990460;
        *b1 = 0.96300 * *b1 + white * 0.2965164;
        *b2 = 0.57000 * *b2 + white * 1.0526913;
        (*b0 + *b1 + *b2 + white * 0.1848) * 0.2
    }

    #[inline]
    fn voss_mccartney(&mut self) -> f32 {
        // Each sample, exactly one row re-rolls: the row picked by the
        // number of trailing zeros of the counter. Rows therefore update
        // at halving rates, which stacks up the 1/f spectrum.
        self.vm_counter = self.vm_counter.wrapping_add(1);
        let row = (self.vm_counter.trailing_zeros() as usize).min(VM_ROWS - 1);
        let fresh = self.white();
        self.vm_sum += fresh - self.vm_rows[row];
        self.vm_rows[row] = fresh;
        (self.vm_sum + self.white()) / (VM_ROWS as f32 + 1.0)
    }
}

impl Default for NoiseGeneratorNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Generator for NoiseGeneratorNode {
    fn channels(&self) -> usize {
        1
    }

    fn generate(&mut self, cx: &mut GeneratorContext<'_>, out: &mut [Sample]) {
        let kind = NoiseType::from_i64(cx.props.i64(cx.core.props(), Property::NoiseType));
        for sample in out[..BLOCK_SIZE].iter_mut() {
            *sample += match kind {
                NoiseType::Uniform => self.white(),
                NoiseType::Filtered => self.filtered(),
                NoiseType::VossMcCartney => self.voss_mccartney(),
            };
        }
    }
}

/// Handle to a noise generator.
pub struct NoiseGenerator {
    core: Shared<ObjectCore>,
    commands: CommandSender,
}

impl NoiseGenerator {
    pub(crate) fn create(commands: CommandSender) -> Result<Self> {
        let core = Shared::new(&deletion_handle(), ObjectCore::new(schema::NOISE_GENERATOR));
        let entry = GeneratorEntry::new(core.clone(), Box::new(NoiseGeneratorNode::new()));
        commands.send(EngineCommand::RegisterGenerator(Owned::new(
            &deletion_handle(),
            entry,
        )))?;
        Ok(Self { core, commands })
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    pub fn gain(&self) -> Result<f64> {
        self.core.props().get_f64(Property::Gain)
    }

    pub fn set_gain(&self, gain: f64) -> Result<()> {
        self.core.props().set_f64(Property::Gain, gain)
    }

    pub fn noise_type(&self) -> Result<NoiseType> {
        Ok(NoiseType::from_i64(
            self.core.props().get_i64(Property::NoiseType)?,
        ))
    }

    pub fn set_noise_type(&self, kind: NoiseType) -> Result<()> {
        self.core.props().set_i64(Property::NoiseType, kind as i64)
    }

    pub(crate) fn core(&self) -> &Shared<ObjectCore> {
        &self.core
    }
}

impl Drop for NoiseGenerator {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(EngineCommand::UnregisterGenerator(self.core.id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;

    fn render(kind: NoiseType, blocks: usize) -> Vec<Sample> {
        let core = Shared::new(&deletion_handle(), ObjectCore::new(schema::NOISE_GENERATOR));
        core.props()
            .set_i64(Property::NoiseType, kind as i64)
            .unwrap();
        let mut entry = GeneratorEntry::new(core, Box::new(NoiseGeneratorNode::new()));
        let (tx, _rx) = event_channel();

        let mut all = Vec::new();
        for _ in 0..blocks {
            let mut out = vec![0.0; BLOCK_SIZE];
            entry.tick(&tx, &mut out);
            all.extend_from_slice(&out);
        }
        all
    }

    #[test]
    fn test_white_noise_is_bounded_and_nonzero() {
        let samples = render(NoiseType::Uniform, 16);
        assert!(samples.iter().all(|s| s.abs() <= 1.0));
        let energy: f32 = samples.iter().map(|s| s * s).sum();
        assert!(energy > 0.0);
    }

    #[test]
    fn test_white_noise_is_roughly_zero_mean() {
        let samples = render(NoiseType::Uniform, 64);
        let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
    }

    #[test]
    fn test_pink_variants_have_less_hf_energy_than_white() {
        // First difference is a crude highpass; pink noise should carry
        // less energy there than white noise of similar total power.
        let hf_ratio = |samples: &[Sample]| {
            let total: f32 = samples.iter().map(|s| s * s).sum();
            let diff: f32 = samples.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
            diff / total.max(1e-9)
        };
        let white = hf_ratio(&render(NoiseType::Uniform, 64));
        let filtered = hf_ratio(&render(NoiseType::Filtered, 64));
        let vm = hf_ratio(&render(NoiseType::VossMcCartney, 64));
        assert!(filtered < white * 0.5, "filtered {filtered} vs white {white}");
        assert!(vm < white * 0.5, "vm {vm} vs white {white}");
    }
}
