//! HRTF spatialization
//!
//! A voice convolves its mono input against a pair of head-related
//! impulse responses selected by source azimuth/elevation. The dataset is
//! a process-wide immutable grid of impulses indexed by
//! `(azimuth bin, elevation bin)`; per block, the four neighboring cells
//! are bilinearly interpolated into a target impulse and ITD pair.
//!
//! Two artifacts need active suppression:
//!
//! - zipper noise on large angular jumps: the block is convolved against
//!   both the previous and the target impulse, crossfaded linearly across
//!   the block;
//! - ITD discontinuities: the per-ear inter-aural delay is a fractional
//!   delay line whose delay value is interpolated across the block.
//!
//! The grid itself is synthesized once from a spherical-head model
//! (Woodworth-style path delay plus first-order head shadow); lookups are
//! deterministic, so equal inputs produce bit-identical coefficients.

use std::sync::OnceLock;

use crate::types::{Sample, BLOCK_SIZE, SAMPLE_RATE};

/// Impulse length per ear, in samples.
pub const IR_LENGTH: usize = 32;

/// Azimuth grid resolution: 24 bins of 15°.
const AZ_BINS: usize = 24;
const AZ_STEP_DEGREES: f64 = 360.0 / AZ_BINS as f64;

/// Elevation grid: -60° to +60° in 30° steps.
const ELEV_MIN_DEGREES: f64 = -60.0;
const ELEV_MAX_DEGREES: f64 = 60.0;
const ELEV_BINS: usize = 5;
const ELEV_STEP_DEGREES: f64 = (ELEV_MAX_DEGREES - ELEV_MIN_DEGREES) / (ELEV_BINS - 1) as f64;

/// Head radius and speed of sound for the ITD model.
const HEAD_RADIUS_M: f64 = 0.0875;
const SPEED_OF_SOUND_M_S: f64 = 343.0;

/// Upper bound on the ITD in samples; sizes the voice delay lines.
const MAX_ITD_SAMPLES: usize = 48;
const ITD_LINE_LEN: usize = 64;

/// One grid cell: per-ear impulse plus per-ear delay in samples.
#[derive(Clone)]
struct HrtfCell {
    /// `[left, right]` impulses.
    impulses: [[f32; IR_LENGTH]; 2],
    /// `[left, right]` delays in samples.
    itd: [f32; 2],
}

/// The process-wide impulse table.
pub struct HrtfDataset {
    cells: Vec<HrtfCell>,
}

static DATASET: OnceLock<HrtfDataset> = OnceLock::new();

/// Get the shared dataset, building it on first use.
pub fn dataset() -> &'static HrtfDataset {
    DATASET.get_or_init(HrtfDataset::build)
}

impl HrtfDataset {
    fn build() -> Self {
        let mut cells = Vec::with_capacity(AZ_BINS * ELEV_BINS);
        for e in 0..ELEV_BINS {
            let elevation = ELEV_MIN_DEGREES + e as f64 * ELEV_STEP_DEGREES;
            for a in 0..AZ_BINS {
                let azimuth = a as f64 * AZ_STEP_DEGREES;
                cells.push(synthesize_cell(azimuth, elevation));
            }
        }
        log::info!(
            "HRTF dataset built: {} cells, {} taps/ear",
            cells.len(),
            IR_LENGTH
        );
        Self { cells }
    }

    #[inline]
    fn cell(&self, az_bin: usize, elev_bin: usize) -> &HrtfCell {
        &self.cells[elev_bin * AZ_BINS + az_bin]
    }

    /// Bilinearly interpolate impulses and ITDs for an exact direction.
    ///
    /// `azimuth` in degrees (0 = front, 90 = right, wraps), `elevation`
    /// in degrees (clamped to the grid range).
    pub fn lookup(&self, azimuth: f64, elevation: f64) -> ([[f32; IR_LENGTH]; 2], [f32; 2]) {
        let az = azimuth.rem_euclid(360.0);
        let az_pos = az / AZ_STEP_DEGREES;
        let a0 = az_pos as usize % AZ_BINS;
        let a1 = (a0 + 1) % AZ_BINS;
        let af = (az_pos - az_pos.floor()) as f32;

        let elev = elevation.clamp(ELEV_MIN_DEGREES, ELEV_MAX_DEGREES);
        let elev_pos = (elev - ELEV_MIN_DEGREES) / ELEV_STEP_DEGREES;
        let e0 = (elev_pos as usize).min(ELEV_BINS - 1);
        let e1 = (e0 + 1).min(ELEV_BINS - 1);
        let ef = (elev_pos - e0 as f64) as f32;

        let corners = [
            (self.cell(a0, e0), (1.0 - af) * (1.0 - ef)),
            (self.cell(a1, e0), af * (1.0 - ef)),
            (self.cell(a0, e1), (1.0 - af) * ef),
            (self.cell(a1, e1), af * ef),
        ];

        let mut impulses = [[0.0f32; IR_LENGTH]; 2];
        let mut itd = [0.0f32; 2];
        for (cell, weight) in corners {
            if weight == 0.0 {
                continue;
            }
            for ear in 0..2 {
                itd[ear] += cell.itd[ear] * weight;
                for (dst, src) in impulses[ear].iter_mut().zip(cell.impulses[ear].iter()) {
                    *dst += src * weight;
                }
            }
        }
        (impulses, itd)
    }
}

/// Build one cell from the spherical-head model.
fn synthesize_cell(azimuth: f64, elevation: f64) -> HrtfCell {
    let elev_rad = elevation.to_radians();
    let mut impulses = [[0.0f32; IR_LENGTH]; 2];
    let mut itd = [0.0f32; 2];

    // Ear positions on the azimuth circle: left at 270°, right at 90°.
    for (ear, ear_azimuth) in [(0usize, 270.0f64), (1usize, 90.0f64)] {
        // Angular separation between source and ear, folded to [0, π].
        let mut delta = (azimuth - ear_azimuth).rem_euclid(360.0);
        if delta > 180.0 {
            delta = 360.0 - delta;
        }
        let delta_rad = delta.to_radians();

        // Head shadow: full brightness at the ear, dark opposite.
        let shadow = (1.0 + delta_rad.cos()) / 2.0;
        let gain = 0.4 + 0.6 * shadow;

        // Shadow as a first-order lowpass; elevation tilts the cutoff a
        // little to keep adjacent elevation cells distinguishable.
        let cutoff = (800.0 + 15_200.0 * shadow * shadow) * (0.7 + 0.3 * elev_rad.cos());
        let pole = (-2.0 * std::f64::consts::PI * cutoff / SAMPLE_RATE as f64).exp();

        let mut coeff = gain * (1.0 - pole);
        for tap in impulses[ear].iter_mut() {
            *tap = coeff as f32;
            coeff *= pole;
        }

        // Path delay around the sphere; lateral component shrinks with
        // elevation.
        let delay_seconds =
            (HEAD_RADIUS_M / SPEED_OF_SOUND_M_S) * (1.0 - delta_rad.cos()) * elev_rad.cos();
        itd[ear] = (delay_seconds * SAMPLE_RATE as f64) as f32;
        debug_assert!(itd[ear] < MAX_ITD_SAMPLES as f32);
    }

    HrtfCell { impulses, itd }
}

/// Fractional delay line for one ear's ITD.
#[derive(Clone)]
struct ItdLine {
    buffer: [f32; ITD_LINE_LEN],
    write_pos: usize,
}

impl ItdLine {
    fn new() -> Self {
        Self {
            buffer: [0.0; ITD_LINE_LEN],
            write_pos: 0,
        }
    }

    /// Write one sample and read back `delay` samples earlier with linear
    /// interpolation between integer taps.
    #[inline]
    fn process(&mut self, input: f32, delay: f32) -> f32 {
        self.buffer[self.write_pos] = input;
        let delay = delay.clamp(0.0, (MAX_ITD_SAMPLES - 1) as f32);
        let whole = delay as usize;
        let frac = delay - whole as f32;

        let i0 = (self.write_pos + ITD_LINE_LEN - whole) % ITD_LINE_LEN;
        let i1 = (self.write_pos + ITD_LINE_LEN - whole - 1) % ITD_LINE_LEN;
        let out = self.buffer[i0] * (1.0 - frac) + self.buffer[i1] * frac;

        self.write_pos = (self.write_pos + 1) % ITD_LINE_LEN;
        out
    }

    fn reset(&mut self) {
        self.buffer = [0.0; ITD_LINE_LEN];
    }
}

/// One binaural voice: convolution state plus ITD lines.
pub struct HrtfPanner {
    prev_impulses: [[f32; IR_LENGTH]; 2],
    prev_itd: [f32; 2],
    /// Input history: the last `IR_LENGTH - 1` samples of the previous
    /// block, so convolution can look backwards across block edges.
    history: [f32; IR_LENGTH - 1 + BLOCK_SIZE],
    itd_lines: [ItdLine; 2],
    primed: bool,
}

impl HrtfPanner {
    pub fn new() -> Self {
        Self {
            prev_impulses: [[0.0; IR_LENGTH]; 2],
            prev_itd: [0.0; 2],
            history: [0.0; IR_LENGTH - 1 + BLOCK_SIZE],
            itd_lines: [ItdLine::new(), ItdLine::new()],
            primed: false,
        }
    }

    /// Forget all state; the next block starts from its target impulse
    /// with no crossfade.
    pub fn reset(&mut self) {
        self.history = [0.0; IR_LENGTH - 1 + BLOCK_SIZE];
        self.itd_lines[0].reset();
        self.itd_lines[1].reset();
        self.primed = false;
    }

    /// Spatialize one mono block at `(azimuth, elevation)` degrees,
    /// adding the binaural result into interleaved stereo `out`.
    pub fn process_block(
        &mut self,
        azimuth: f64,
        elevation: f64,
        input: &[Sample],
        out: &mut [Sample],
    ) {
        debug_assert_eq!(input.len(), BLOCK_SIZE);
        debug_assert_eq!(out.len(), BLOCK_SIZE * 2);

        let (target_impulses, target_itd) = dataset().lookup(azimuth, elevation);
        if !self.primed {
            self.prev_impulses = target_impulses;
            self.prev_itd = target_itd;
            self.primed = true;
        }

        self.history[IR_LENGTH - 1..].copy_from_slice(input);

        let inv_block = 1.0 / BLOCK_SIZE as f32;
        for ear in 0..2 {
            let h_prev = &self.prev_impulses[ear];
            let h_targ = &target_impulses[ear];
            let line = &mut self.itd_lines[ear];

            for n in 0..BLOCK_SIZE {
                // ext[n + IR_LENGTH - 1] is input[n]; walk k taps back.
                let window = &self.history[n..n + IR_LENGTH];
                let mut acc_prev = 0.0f32;
                let mut acc_targ = 0.0f32;
                for k in 0..IR_LENGTH {
                    let x = window[IR_LENGTH - 1 - k];
                    acc_prev += h_prev[k] * x;
                    acc_targ += h_targ[k] * x;
                }

                let w = n as f32 * inv_block;
                let convolved = acc_prev * (1.0 - w) + acc_targ * w;
                let delay = self.prev_itd[ear] + (target_itd[ear] - self.prev_itd[ear]) * w;
                out[n * 2 + ear] += line.process(convolved, delay);
            }
        }

        // Slide the history window and commit the new target.
        self.history.copy_within(BLOCK_SIZE.., 0);
        self.prev_impulses = target_impulses;
        self.prev_itd = target_itd;
    }
}

impl Default for HrtfPanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_deterministic() {
        let (ir_a, itd_a) = dataset().lookup(37.5, 12.0);
        let (ir_b, itd_b) = dataset().lookup(37.5, 12.0);
        assert_eq!(ir_a, ir_b);
        assert_eq!(itd_a, itd_b);
    }

    #[test]
    fn test_front_source_is_symmetric() {
        let (ir, itd) = dataset().lookup(0.0, 0.0);
        assert_eq!(ir[0], ir[1]);
        assert!((itd[0] - itd[1]).abs() < 1e-6);
    }

    #[test]
    fn test_right_source_favors_right_ear() {
        let (ir, itd) = dataset().lookup(90.0, 0.0);
        let energy = |h: &[f32; IR_LENGTH]| h.iter().map(|t| t * t).sum::<f32>();
        assert!(energy(&ir[1]) > energy(&ir[0]) * 2.0);
        // Left ear is the far ear: its sound arrives later.
        assert!(itd[0] > itd[1]);
    }

    #[test]
    fn test_itd_within_bounds() {
        for az in 0..36 {
            for el in [-60.0, -30.0, 0.0, 30.0, 60.0] {
                let (_, itd) = dataset().lookup(az as f64 * 10.0, el);
                assert!(itd[0] >= 0.0 && itd[0] < MAX_ITD_SAMPLES as f32);
                assert!(itd[1] >= 0.0 && itd[1] < MAX_ITD_SAMPLES as f32);
            }
        }
    }

    #[test]
    fn test_voice_produces_output() {
        let mut voice = HrtfPanner::new();
        let input = vec![1.0; BLOCK_SIZE];
        let mut out = vec![0.0; BLOCK_SIZE * 2];
        voice.process_block(0.0, 0.0, &input, &mut out);

        let energy: f32 = out.iter().map(|s| s * s).sum();
        assert!(energy > 0.0);
    }

    #[test]
    fn test_steady_direction_settles() {
        // With a fixed direction and DC input the output should converge
        // to the impulse's DC gain and stop changing.
        let mut voice = HrtfPanner::new();
        let input = vec![1.0; BLOCK_SIZE];
        let mut out = vec![0.0; BLOCK_SIZE * 2];
        for _ in 0..4 {
            out.fill(0.0);
            voice.process_block(45.0, 0.0, &input, &mut out);
        }
        let first = out[(BLOCK_SIZE - 2) * 2];
        let last = out[(BLOCK_SIZE - 1) * 2];
        assert!((first - last).abs() < 1e-4);
    }

    #[test]
    fn test_angular_jump_is_crossfaded() {
        let mut voice = HrtfPanner::new();
        let input = vec![1.0; BLOCK_SIZE];
        let mut out = vec![0.0; BLOCK_SIZE * 2];
        voice.process_block(0.0, 0.0, &input, &mut out);

        // Hard jump to the left; the right channel should move smoothly,
        // not step.
        out.fill(0.0);
        voice.process_block(270.0, 0.0, &input, &mut out);
        let mut max_step = 0.0f32;
        for n in 1..BLOCK_SIZE {
            max_step = max_step.max((out[n * 2 + 1] - out[(n - 1) * 2 + 1]).abs());
        }
        assert!(max_step < 0.05, "right channel stepped by {max_step}");
    }
}
