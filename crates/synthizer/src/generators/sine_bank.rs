//! Fast sine bank
//!
//! Sums a set of sinusoids synthesized by the two-term recurrence
//! `y[n] = 2·cos(ω)·y[n-1] - y[n-2]`. The recurrence is reseeded from an
//! analytic phase accumulator at every block boundary, which keeps the
//! worst-case error around 1e-4 over arbitrary run lengths while staying
//! one multiply-add per wave per sample inside the block.
//!
//! Besides a plain sine, constructors build classic band-limited
//! approximations (square, triangle, sawtooth) from partial stacks, with
//! the Lanczos sigma factor applied to tame the Gibbs overshoot and the
//! series normalized to unit peak gain.

use crate::command::{CommandSender, EngineCommand};
use crate::error::Result;
use crate::gc::{deletion_handle, Owned, Shared};
use crate::properties::{schema, ObjectCore, Property};
use crate::types::{ObjectId, Sample, BLOCK_SIZE, SAMPLE_RATE};

use super::{Generator, GeneratorContext, GeneratorEntry};

/// One partial: frequency multiplier on the bank's fundamental, initial
/// phase in radians, and linear gain.
#[derive(Debug, Clone, Copy)]
pub struct SineWaveConfig {
    pub freq_mul: f64,
    pub phase: f64,
    pub gain: f64,
}

/// A set of partials for a bank.
#[derive(Debug, Clone)]
pub struct SineBankConfig {
    pub waves: Vec<SineWaveConfig>,
}

impl SineBankConfig {
    /// A single sine at the fundamental.
    pub fn sine() -> Self {
        Self {
            waves: vec![SineWaveConfig {
                freq_mul: 1.0,
                phase: 0.0,
                gain: 1.0,
            }],
        }
    }

    /// Square approximation from `partials` odd harmonics.
    pub fn square(partials: usize) -> Self {
        let waves = (0..partials.max(1))
            .map(|i| {
                let n = (2 * i + 1) as f64;
                SineWaveConfig {
                    freq_mul: n,
                    phase: 0.0,
                    gain: 1.0 / n,
                }
            })
            .collect();
        Self { waves }.shaped()
    }

    /// Triangle approximation from `partials` odd harmonics.
    pub fn triangle(partials: usize) -> Self {
        let waves = (0..partials.max(1))
            .map(|i| {
                let n = (2 * i + 1) as f64;
                // Alternating sign folded into the phase.
                let phase = if i % 2 == 1 { std::f64::consts::PI } else { 0.0 };
                SineWaveConfig {
                    freq_mul: n,
                    phase,
                    gain: 1.0 / (n * n),
                }
            })
            .collect();
        Self { waves }.shaped()
    }

    /// Sawtooth approximation from `partials` harmonics.
    pub fn sawtooth(partials: usize) -> Self {
        let waves = (1..=partials.max(1))
            .map(|n| SineWaveConfig {
                freq_mul: n as f64,
                phase: 0.0,
                gain: 1.0 / n as f64,
            })
            .collect();
        Self { waves }.shaped()
    }

    fn shaped(mut self) -> Self {
        sigma_approximate(&mut self.waves);
        normalize_series(&mut self.waves);
        self
    }
}

/// Apply the Lanczos sigma factor to a harmonic stack (assumed ordered,
/// fundamental first). Reduces the Gibbs overshoot of truncated Fourier
/// series.
fn sigma_approximate(waves: &mut [SineWaveConfig]) {
    let Some(last) = waves.last() else {
        return;
    };
    let m = last.freq_mul + 1.0;
    for wave in waves.iter_mut() {
        let sigma = (std::f64::consts::PI * wave.freq_mul / (2.0 * m)).sin()
            / (std::f64::consts::PI * wave.freq_mul / (2.0 * m));
        wave.gain *= sigma;
    }
}

/// Scale the stack so its gains sum to one.
fn normalize_series(waves: &mut [SineWaveConfig]) {
    let sum: f64 = waves.iter().map(|w| w.gain.abs()).sum();
    if sum > 0.0 {
        let factor = 1.0 / sum;
        for wave in waves.iter_mut() {
            wave.gain *= factor;
        }
    }
}

struct WaveState {
    config: SineWaveConfig,
    /// Analytic phase at the start of the next block.
    phase: f64,
}

/// Audio-thread state.
pub struct SineBankNode {
    waves: Vec<WaveState>,
}

impl SineBankNode {
    pub fn new(config: SineBankConfig) -> Self {
        Self {
            waves: config
                .waves
                .into_iter()
                .map(|config| WaveState {
                    phase: config.phase,
                    config,
                })
                .collect(),
        }
    }
}

impl Generator for SineBankNode {
    fn channels(&self) -> usize {
        1
    }

    fn generate(&mut self, cx: &mut GeneratorContext<'_>, out: &mut [Sample]) {
        let frequency = cx.props.f64(cx.core.props(), Property::Frequency);

        for wave in &mut self.waves {
            let omega =
                2.0 * std::f64::consts::PI * frequency * wave.config.freq_mul / SAMPLE_RATE as f64;
            // Partials above Nyquist would alias; skip them.
            if omega >= std::f64::consts::PI {
                continue;
            }

            // Seed the recurrence from the analytic phase.
            let c = 2.0 * omega.cos();
            let mut y1 = (wave.phase - omega).sin();
            let mut y2 = (wave.phase - 2.0 * omega).sin();
            let gain = wave.config.gain as Sample;

            for sample in out[..BLOCK_SIZE].iter_mut() {
                let y = c * y1 - y2;
                y2 = y1;
                y1 = y;
                *sample += gain * y as Sample;
            }

            wave.phase = (wave.phase + BLOCK_SIZE as f64 * omega)
                % (2.0 * std::f64::consts::PI);
        }
    }
}

/// Handle to a sine bank generator.
pub struct FastSineBank {
    core: Shared<ObjectCore>,
    commands: CommandSender,
}

impl FastSineBank {
    pub(crate) fn create(
        commands: CommandSender,
        config: SineBankConfig,
        frequency: f64,
    ) -> Result<Self> {
        let core = Shared::new(
            &deletion_handle(),
            ObjectCore::new(schema::SINE_BANK_GENERATOR),
        );
        core.props().set_f64(Property::Frequency, frequency)?;
        let entry = GeneratorEntry::new(core.clone(), Box::new(SineBankNode::new(config)));
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

    pub fn frequency(&self) -> Result<f64> {
        self.core.props().get_f64(Property::Frequency)
    }

    pub fn set_frequency(&self, frequency: f64) -> Result<()> {
        self.core.props().set_f64(Property::Frequency, frequency)
    }

    pub(crate) fn core(&self) -> &Shared<ObjectCore> {
        &self.core
    }
}

impl Drop for FastSineBank {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(EngineCommand::UnregisterGenerator(self.core.id()));
    }
}
