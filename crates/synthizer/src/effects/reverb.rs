//! FDN reverb
//!
//! A four-line feedback delay network: prime delay lengths spread around
//! the mean-free-path target, a Householder feedback matrix (energy
//! preserving, fully mixing), per-line one-pole damping, and `t60`-derived
//! feedback gains. Line memory is allocated once at the maximum supported
//! mean free path; parameter changes only move effective lengths, so
//! retuning never allocates on the audio thread.

use std::sync::OnceLock;

use crate::command::{CommandSender, EngineCommand};
use crate::error::Result;
use crate::gc::{deletion_handle, Owned, Shared};
use crate::properties::{schema, ObjectCore, Property};
use crate::types::{ObjectId, Sample, BLOCK_SIZE, SAMPLE_RATE};

use super::{EffectContext, EffectEntry, EffectNode};

/// Number of delay lines in the network.
const LINES: usize = 4;

/// Mean free path bounds, seconds.
const MIN_MEAN_FREE_PATH: f64 = 0.002;
const MAX_MEAN_FREE_PATH: f64 = 0.5;

/// Spread multipliers decorrelating the four lines around the target.
const LINE_SPREAD: [f64; LINES] = [0.93, 1.07, 1.19, 1.31];

/// Largest line length we will ever need, in samples.
fn max_line_len() -> usize {
    (MAX_MEAN_FREE_PATH * LINE_SPREAD[LINES - 1] * SAMPLE_RATE as f64) as usize + 2
}

/// Primes up to the maximum line length, sieved once per process.
fn primes() -> &'static [u32] {
    static PRIMES: OnceLock<Vec<u32>> = OnceLock::new();
    PRIMES.get_or_init(|| {
        let limit = max_line_len();
        let mut composite = vec![false; limit + 1];
        let mut out = Vec::new();
        for n in 2..=limit {
            if !composite[n] {
                out.push(n as u32);
                let mut multiple = n * n;
                while multiple <= limit {
                    composite[multiple] = true;
                    multiple += n;
                }
            }
        }
        out
    })
}

/// Nearest prime to `target` (binary search over the sieve).
fn nearest_prime(target: usize) -> usize {
    let primes = primes();
    let target = target.max(2) as u32;
    let idx = primes.partition_point(|&p| p < target);
    let above = primes.get(idx).copied().unwrap_or(*primes.last().unwrap());
    let below = primes.get(idx.wrapping_sub(1)).copied().unwrap_or(above);
    if above - target <= target - below {
        above as usize
    } else {
        below as usize
    }
}

struct DelayLine {
    buffer: Box<[Sample]>,
    write_pos: usize,
    length: usize,
    /// Feedback gain for the current t60.
    feedback: f32,
    /// One-pole damping state and coefficient.
    damp_state: f32,
    damp_coeff: f32,
}

impl DelayLine {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0.0; capacity].into_boxed_slice(),
            write_pos: 0,
            length: 2,
            feedback: 0.5,
            damp_state: 0.0,
            damp_coeff: 0.3,
        }
    }

    #[inline]
    fn read(&self) -> f32 {
        let read = (self.write_pos + self.buffer.len() - self.length) % self.buffer.len();
        self.buffer[read]
    }

    #[inline]
    fn write(&mut self, value: f32) {
        // Damp, then scale by the t60 feedback before storing.
        self.damp_state += self.damp_coeff * (value - self.damp_state);
        self.buffer[self.write_pos] = self.damp_state * self.feedback;
        self.write_pos = (self.write_pos + 1) % self.buffer.len();
    }

}

/// Audio-thread state.
pub struct FdnReverbNode {
    lines: [DelayLine; LINES],
    /// One-pole highpass trimming low frequencies out of the wet tail.
    lf_state: [f32; 2],
    lf_coeff: f32,
    tuned: bool,
}

impl FdnReverbNode {
    pub fn new() -> Self {
        let capacity = max_line_len();
        Self {
            lines: std::array::from_fn(|_| DelayLine::new(capacity)),
            lf_state: [0.0; 2],
            lf_coeff: 0.0,
            tuned: false,
        }
    }

    /// Recompute line lengths and gains from the current properties.
    fn retune(&mut self, t60: f64, mean_free_path: f64, lf_rolloff: f64) {
        let mfp = mean_free_path.clamp(MIN_MEAN_FREE_PATH, MAX_MEAN_FREE_PATH);
        for (line, spread) in self.lines.iter_mut().zip(LINE_SPREAD) {
            let target = (mfp * spread * SAMPLE_RATE as f64) as usize;
            line.length = nearest_prime(target).min(line.buffer.len() - 1);
            // RT60: -60 dB after t60 seconds of recirculation.
            line.feedback =
                10f64.powf(-3.0 * line.length as f64 / (t60.max(0.01) * SAMPLE_RATE as f64))
                    as f32;
            // Damping follows decay time: long tails get darker faster.
            let cutoff = (8000.0 / (1.0 + t60)).clamp(1000.0, 8000.0);
            line.damp_coeff =
                1.0 - (-2.0 * std::f64::consts::PI * cutoff / SAMPLE_RATE as f64).exp() as f32;
        }
        self.lf_coeff = if lf_rolloff > 0.0 {
            1.0 - (-2.0 * std::f64::consts::PI * lf_rolloff.min(2000.0) / SAMPLE_RATE as f64)
                .exp() as f32
        } else {
            0.0
        };
        self.tuned = true;
    }
}

impl Default for FdnReverbNode {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectNode for FdnReverbNode {
    fn run(
        &mut self,
        cx: &mut EffectContext<'_>,
        input: &[Sample],
        input_channels: usize,
        master: &mut [Sample],
    ) {
        debug_assert_eq!(input_channels, 1);
        let props = cx.core.props();
        if !self.tuned
            || cx.props.changed(props, Property::T60)
            || cx.props.changed(props, Property::MeanFreePath)
            || cx.props.changed(props, Property::LateReflectionsLfRolloff)
        {
            self.retune(
                cx.props.f64(props, Property::T60),
                cx.props.f64(props, Property::MeanFreePath),
                cx.props.f64(props, Property::LateReflectionsLfRolloff),
            );
        }

        for frame in 0..BLOCK_SIZE {
            let dry = input[frame] * 0.5;

            let outputs: [f32; LINES] = std::array::from_fn(|i| self.lines[i].read());

            // Householder feedback: H = I - (2/N)·ones. Every line feeds
            // every other with equal weight and total energy is preserved.
            let sum: f32 = outputs.iter().sum();
            let mixed: [f32; LINES] =
                std::array::from_fn(|i| outputs[i] - 2.0 * sum / LINES as f32);

            for (line, &feed) in self.lines.iter_mut().zip(mixed.iter()) {
                line.write(dry + feed);
            }

            // Odd/even lines to left/right for a decorrelated stereo tail.
            let mut left = outputs[0] + outputs[2];
            let mut right = outputs[1] + outputs[3];

            if self.lf_coeff > 0.0 {
                self.lf_state[0] += self.lf_coeff * (left - self.lf_state[0]);
                self.lf_state[1] += self.lf_coeff * (right - self.lf_state[1]);
                left -= self.lf_state[0];
                right -= self.lf_state[1];
            }

            let gain = cx.gain.at(frame);
            master[frame * 2] += left * gain;
            master[frame * 2 + 1] += right * gain;
        }
    }
}

/// Handle to a global FDN reverb.
pub struct GlobalFdnReverb {
    core: Shared<ObjectCore>,
    commands: CommandSender,
}

impl GlobalFdnReverb {
    pub(crate) fn create(commands: CommandSender) -> Result<Self> {
        let core = Shared::new(&deletion_handle(), ObjectCore::new(schema::REVERB_EFFECT));
        let entry = EffectEntry::new(core.clone(), 1, Box::new(FdnReverbNode::new()));
        commands.send(EngineCommand::AddEffect(Owned::new(&deletion_handle(), entry)))?;
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

    pub fn t60(&self) -> Result<f64> {
        self.core.props().get_f64(Property::T60)
    }

    pub fn set_t60(&self, seconds: f64) -> Result<()> {
        self.core.props().set_f64(Property::T60, seconds)
    }

    pub fn mean_free_path(&self) -> Result<f64> {
        self.core.props().get_f64(Property::MeanFreePath)
    }

    pub fn set_mean_free_path(&self, seconds: f64) -> Result<()> {
        self.core.props().set_f64(Property::MeanFreePath, seconds)
    }

    pub fn set_late_reflections_lf_rolloff(&self, hz: f64) -> Result<()> {
        self.core
            .props()
            .set_f64(Property::LateReflectionsLfRolloff, hz)
    }

    pub fn set_filter_input(&self, config: crate::filters::BiquadConfig) -> Result<()> {
        self.core.props().set_biquad(Property::FilterInput, config)
    }

    pub(crate) fn core(&self) -> &Shared<ObjectCore> {
        &self.core
    }
}

impl Drop for GlobalFdnReverb {
    fn drop(&mut self) {
        let _ = self.commands.send(EngineCommand::RemoveEffect(self.core.id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::PropertySnapshot;
    use crate::types::GainRamp;

    fn run_blocks(node: &mut FdnReverbNode, impulse: bool, blocks: usize) -> Vec<f32> {
        let core = ObjectCore::new(schema::REVERB_EFFECT);
        let mut props = PropertySnapshot::new(core.props());
        props.drain(core.props());
        let gain = GainRamp::new(1.0);

        let mut tail = Vec::new();
        for block in 0..blocks {
            let mut input = vec![0.0; BLOCK_SIZE];
            if impulse && block == 0 {
                input[0] = 1.0;
            }
            let mut master = vec![0.0; BLOCK_SIZE * 2];
            let mut cx = EffectContext {
                core: &core,
                props: &props,
                gain: &gain,
            };
            node.run(&mut cx, &input, 1, &mut master);
            tail.extend_from_slice(&master);
        }
        tail
    }

    #[test]
    fn test_prime_lengths() {
        let mut node = FdnReverbNode::new();
        node.retune(1.0, 0.02, 0.0);
        for line in &node.lines {
            let n = line.length;
            assert!(n >= 2);
            assert!((2..n).all(|d| n % d != 0), "{n} is not prime");
        }
        // All four lengths distinct.
        let lengths: Vec<_> = node.lines.iter().map(|l| l.length).collect();
        for i in 0..LINES {
            for j in i + 1..LINES {
                assert_ne!(lengths[i], lengths[j]);
            }
        }
    }

    #[test]
    fn test_impulse_produces_decaying_tail() {
        // The shortest line is ~0.09s at the default mean free path, so
        // render well past it and compare the first half against the last
        // quarter.
        let mut node = FdnReverbNode::new();
        let tail = run_blocks(&mut node, true, 128);

        let early: f32 = tail[..tail.len() / 2].iter().map(|s| s * s).sum();
        let late: f32 = tail[3 * tail.len() / 4..].iter().map(|s| s * s).sum();
        assert!(early > 0.0, "no reverb tail at all");
        assert!(late < early, "tail is not decaying: {early} -> {late}");
    }

    #[test]
    fn test_tail_is_stable() {
        // A long render must not blow up.
        let mut node = FdnReverbNode::new();
        let tail = run_blocks(&mut node, true, 512);
        assert!(tail.iter().all(|s| s.abs() < 10.0));
    }

    #[test]
    fn test_silence_in_silence_out() {
        let mut node = FdnReverbNode::new();
        let tail = run_blocks(&mut node, false, 8);
        assert!(tail.iter().all(|&s| s == 0.0));
    }
}
