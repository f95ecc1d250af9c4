//! Echo effect
//!
//! A bank of fixed taps over one shared delay ring. Each tap reads at its
//! own delay with independent left/right gains, which covers slapback,
//! multi-tap rhythmic echoes, and simple early-reflection patterns. The
//! tap list is reconfigured atomically at a block boundary via the
//! command queue.

use crate::command::{CommandSender, EngineCommand};
use crate::error::{Error, Result};
use crate::gc::{deletion_handle, Owned, Shared};
use crate::properties::{schema, ObjectCore, Property};
use crate::types::{seconds_to_samples, ObjectId, Sample, BLOCK_SIZE};

use super::{EffectContext, EffectNode, EffectNodeCommand, EffectEntry};

/// Upper bound on configured tap delays, in seconds. Sizes the ring once
/// at construction so reconfiguration never allocates on the audio
/// thread.
pub const MAX_ECHO_SECONDS: f64 = 2.0;

/// Maximum taps per echo.
pub const MAX_ECHO_TAPS: usize = 32;

/// One tap as the host configures it.
#[derive(Debug, Clone, Copy)]
pub struct EchoTapConfig {
    pub delay_seconds: f64,
    pub gain_l: f32,
    pub gain_r: f32,
}

/// A tap converted to frames.
#[derive(Debug, Clone, Copy, Default)]
struct EchoTap {
    delay_frames: usize,
    gain_l: f32,
    gain_r: f32,
}

/// Audio-thread state.
pub struct EchoNode {
    /// Mono delay memory sized to `MAX_ECHO_SECONDS` plus one block.
    ring: Box<[Sample]>,
    write_pos: usize,
    taps: [EchoTap; MAX_ECHO_TAPS],
    tap_count: usize,
    /// The live tap config, kept so replacing it defers the old Vec's
    /// destructor off the audio thread.
    config: Option<Owned<Vec<EchoTapConfig>>>,
}

impl EchoNode {
    pub fn new() -> Self {
        let ring_len = seconds_to_samples(MAX_ECHO_SECONDS) + BLOCK_SIZE;
        Self {
            ring: vec![0.0; ring_len].into_boxed_slice(),
            write_pos: 0,
            taps: [EchoTap::default(); MAX_ECHO_TAPS],
            tap_count: 0,
            config: None,
        }
    }

    fn apply_taps(&mut self, config: Owned<Vec<EchoTapConfig>>) {
        self.tap_count = config.len().min(MAX_ECHO_TAPS);
        for (tap, cfg) in self.taps.iter_mut().zip(config.iter()) {
            *tap = EchoTap {
                delay_frames: seconds_to_samples(cfg.delay_seconds.min(MAX_ECHO_SECONDS)),
                gain_l: cfg.gain_l,
                gain_r: cfg.gain_r,
            };
        }
        // Old config (if any) drops here; Owned defers the free.
        self.config = Some(config);
    }
}

impl Default for EchoNode {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectNode for EchoNode {
    fn run(
        &mut self,
        cx: &mut EffectContext<'_>,
        input: &[Sample],
        input_channels: usize,
        master: &mut [Sample],
    ) {
        debug_assert_eq!(input_channels, 1);
        let len = self.ring.len();

        for frame in 0..BLOCK_SIZE {
            self.ring[self.write_pos] = input[frame];

            let mut left = 0.0;
            let mut right = 0.0;
            for tap in &self.taps[..self.tap_count] {
                let read = (self.write_pos + len - tap.delay_frames) % len;
                let sample = self.ring[read];
                left += sample * tap.gain_l;
                right += sample * tap.gain_r;
            }

            let gain = cx.gain.at(frame);
            master[frame * 2] += left * gain;
            master[frame * 2 + 1] += right * gain;

            self.write_pos = (self.write_pos + 1) % len;
        }
    }

    fn command(&mut self, cmd: EffectNodeCommand) {
        match cmd {
            EffectNodeCommand::SetEchoTaps(taps) => self.apply_taps(taps),
        }
    }
}

/// Handle to a global echo.
///
/// Dropping the handle releases the effect; its routes are torn down and
/// the node is destroyed off the audio thread.
pub struct GlobalEcho {
    core: Shared<ObjectCore>,
    commands: CommandSender,
}

impl GlobalEcho {
    pub(crate) fn create(commands: CommandSender) -> Result<Self> {
        let core = Shared::new(&deletion_handle(), ObjectCore::new(schema::ECHO_EFFECT));
        let entry = EffectEntry::new(core.clone(), 1, Box::new(EchoNode::new()));
        commands.send(EngineCommand::AddEffect(Owned::new(&deletion_handle(), entry)))?;
        Ok(Self { core, commands })
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    /// Replace the tap list. Takes effect at the next block boundary.
    pub fn set_taps(&self, taps: &[EchoTapConfig]) -> Result<()> {
        if taps.len() > MAX_ECHO_TAPS {
            return Err(Error::NotSupported("too many echo taps"));
        }
        for tap in taps {
            if !(0.0..=MAX_ECHO_SECONDS).contains(&tap.delay_seconds) {
                return Err(Error::InvalidPropertyValue { tag: "taps" });
            }
        }
        self.commands.send(EngineCommand::SetEchoTaps {
            effect: self.core.id(),
            taps: Owned::new(&deletion_handle(), taps.to_vec()),
        })
    }

    pub fn gain(&self) -> Result<f64> {
        self.core.props().get_f64(Property::Gain)
    }

    pub fn set_gain(&self, gain: f64) -> Result<()> {
        self.core.props().set_f64(Property::Gain, gain)
    }

    pub fn set_filter_input(&self, config: crate::filters::BiquadConfig) -> Result<()> {
        self.core.props().set_biquad(Property::FilterInput, config)
    }

    pub(crate) fn core(&self) -> &Shared<ObjectCore> {
        &self.core
    }
}

impl Drop for GlobalEcho {
    fn drop(&mut self) {
        let _ = self.commands.send(EngineCommand::RemoveEffect(self.core.id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GainRamp, SAMPLE_RATE};

    fn run_block(node: &mut EchoNode, input: &[Sample], master: &mut [Sample]) {
        let core = ObjectCore::new(schema::ECHO_EFFECT);
        let props = crate::properties::PropertySnapshot::new(core.props());
        let gain = GainRamp::new(1.0);
        let mut cx = EffectContext {
            core: &core,
            props: &props,
            gain: &gain,
        };
        node.run(&mut cx, input, 1, master);
    }

    fn taps(configs: &[EchoTapConfig]) -> Owned<Vec<EchoTapConfig>> {
        Owned::new(&deletion_handle(), configs.to_vec())
    }

    #[test]
    fn test_zero_delay_tap_passes_through() {
        let mut node = EchoNode::new();
        node.apply_taps(taps(&[EchoTapConfig {
            delay_seconds: 0.0,
            gain_l: 1.0,
            gain_r: 1.0,
        }]));

        let input = vec![0.5; BLOCK_SIZE];
        let mut master = vec![0.0; BLOCK_SIZE * 2];
        run_block(&mut node, &input, &mut master);
        assert!(master.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_delayed_tap_arrives_late() {
        let mut node = EchoNode::new();
        let delay_frames = 100;
        node.apply_taps(taps(&[EchoTapConfig {
            delay_seconds: delay_frames as f64 / SAMPLE_RATE as f64,
            gain_l: 1.0,
            gain_r: 0.0,
        }]));

        // An impulse at frame 0.
        let mut input = vec![0.0; BLOCK_SIZE];
        input[0] = 1.0;
        let mut master = vec![0.0; BLOCK_SIZE * 2];
        run_block(&mut node, &input, &mut master);

        for frame in 0..BLOCK_SIZE {
            let expected = if frame == delay_frames { 1.0 } else { 0.0 };
            assert_eq!(master[frame * 2], expected, "frame {frame}");
            assert_eq!(master[frame * 2 + 1], 0.0);
        }
    }

    #[test]
    fn test_multiple_taps_sum() {
        let mut node = EchoNode::new();
        node.apply_taps(taps(&[
            EchoTapConfig {
                delay_seconds: 0.0,
                gain_l: 0.5,
                gain_r: 0.5,
            },
            EchoTapConfig {
                delay_seconds: 0.0,
                gain_l: 0.25,
                gain_r: 0.25,
            },
        ]));

        let input = vec![1.0; BLOCK_SIZE];
        let mut master = vec![0.0; BLOCK_SIZE * 2];
        run_block(&mut node, &input, &mut master);
        assert!(master.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_reconfigure_swaps_tap_list() {
        let mut node = EchoNode::new();
        node.apply_taps(taps(&[EchoTapConfig {
            delay_seconds: 0.0,
            gain_l: 1.0,
            gain_r: 1.0,
        }]));
        node.apply_taps(taps(&[EchoTapConfig {
            delay_seconds: 0.0,
            gain_l: 0.1,
            gain_r: 0.1,
        }]));
        assert_eq!(node.tap_count, 1);

        let input = vec![1.0; BLOCK_SIZE];
        let mut master = vec![0.0; BLOCK_SIZE * 2];
        run_block(&mut node, &input, &mut master);
        assert!(master.iter().all(|&s| (s - 0.1).abs() < 1e-6));
    }
}
