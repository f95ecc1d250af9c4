//! Sources
//!
//! A source mixes its generators into a per-source bus, applies the
//! per-source filter and gain, contributes to any routed effects, then
//! hands the bus to its specialization: direct summing into the master,
//! stereo panning, or HRTF spatialization with distance attenuation.
//!
//! The block pipeline is shared by all source kinds; the specialization
//! is a tagged variant dispatched once per tick, which keeps the per-kind
//! code to exactly the part that differs.

mod direct;
mod panned;
mod source3d;

pub use direct::DirectSource;
pub use panned::{AngularPannedSource, ScalarPannedSource};
pub use source3d::{DistanceModel, Source3D};

use crate::bufcache::BlockBufferCache;
use crate::channel_mixing::ChannelMatrix;
use crate::effects::EffectEntry;
use crate::events::EventSender;
use crate::filters::BiquadFilter;
use crate::gc::{Owned, Shared};
use crate::generators::GeneratorEntry;
use crate::panner::{PannerBank, VoiceHandle};
use crate::properties::{ObjectCore, Property, PropertySnapshot};
use crate::router::Router;
use crate::types::{GainRamp, ObjectId, Sample, BLOCK_SIZE, MAX_CHANNELS};

/// The listener frame derived from the context's position/orientation
/// properties, recomputed once per tick.
#[derive(Debug, Clone, Copy)]
pub struct Listener {
    pub position: [f64; 3],
    pub at: [f64; 3],
    pub up: [f64; 3],
    pub right: [f64; 3],
}

fn normalize(v: [f64; 3]) -> [f64; 3] {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if len == 0.0 {
        return [0.0, 0.0, 0.0];
    }
    [v[0] / len, v[1] / len, v[2] / len]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

impl Listener {
    /// Build the frame from a position and a packed (at, up) orientation.
    pub fn new(position: [f64; 3], orientation: [f64; 6]) -> Self {
        let at = normalize([orientation[0], orientation[1], orientation[2]]);
        let up = normalize([orientation[3], orientation[4], orientation[5]]);
        let right = normalize(cross(at, up));
        Self {
            position,
            at,
            up,
            right,
        }
    }

    /// Azimuth (degrees, 0 = front, 90 = right) and elevation (degrees)
    /// of a world-space point, plus its distance.
    pub fn direction_to(&self, point: [f64; 3]) -> (f64, f64, f64) {
        let rel = [
            point[0] - self.position[0],
            point[1] - self.position[1],
            point[2] - self.position[2],
        ];
        let x = dot(rel, self.right);
        let y = dot(rel, self.at);
        let z = dot(rel, self.up);
        let distance = (x * x + y * y + z * z).sqrt();
        if distance == 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let azimuth = x.atan2(y).to_degrees().rem_euclid(360.0);
        let elevation = z.atan2((x * x + y * y).sqrt()).to_degrees();
        (azimuth, elevation, distance)
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new([0.0; 3], [0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }
}

/// Which specialization a source runs.
pub enum SourceKind {
    Direct,
    ScalarPanned,
    AngularPanned,
    ThreeD,
}

/// Everything a source needs during its slice of the tick.
pub struct SourceTickContext<'a> {
    pub cache: &'a BlockBufferCache,
    pub events: &'a EventSender,
    pub panners: &'a mut PannerBank,
    pub router: &'a mut Router,
    pub effects: &'a mut [Owned<EffectEntry>],
    pub listener: &'a Listener,
    /// Interleaved stereo master bus for this block.
    pub master: &'a mut [Sample],
}

/// A source as the audio thread owns it.
pub struct SourceNode {
    core: Shared<ObjectCore>,
    snapshot: PropertySnapshot,
    gain: GainRamp,
    filter: BiquadFilter,
    generators: Vec<Owned<GeneratorEntry>>,
    kind: SourceKind,
    voice: Option<VoiceHandle>,
}

impl SourceNode {
    pub fn new(core: Shared<ObjectCore>, kind: SourceKind) -> Self {
        let snapshot = PropertySnapshot::new(core.props());
        let gain = GainRamp::new(snapshot.f64(core.props(), Property::Gain) as f32);
        Self {
            snapshot,
            gain,
            filter: BiquadFilter::new(1),
            generators: Vec::with_capacity(8),
            kind,
            voice: None,
            core,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    pub fn attach_generator(&mut self, entry: Owned<GeneratorEntry>) {
        self.generators.push(entry);
    }

    pub fn detach_generator(&mut self, id: ObjectId) -> Option<Owned<GeneratorEntry>> {
        let idx = self.generators.iter().position(|g| g.id() == id)?;
        Some(self.generators.remove(idx))
    }

    /// Move every attached generator out (used when the source dies while
    /// generator handles are still alive).
    pub fn take_generators(&mut self) -> Vec<Owned<GeneratorEntry>> {
        std::mem::take(&mut self.generators)
    }

    pub fn has_generator(&self, id: ObjectId) -> bool {
        self.generators.iter().any(|g| g.id() == id)
    }

    pub fn generator_mut(&mut self, id: ObjectId) -> Option<&mut GeneratorEntry> {
        let idx = self.generators.iter().position(|g| g.id() == id)?;
        Some(&mut *self.generators[idx])
    }

    /// Hand the spatialization voice back before the node is dropped.
    pub fn release_voice(&mut self, panners: &mut PannerBank) {
        if let Some(voice) = self.voice.take() {
            panners.release(voice);
        }
    }

    /// Bus channel count this tick: the widest attached generator.
    pub fn channels(&self) -> usize {
        self.generators
            .iter()
            .map(|g| g.channels())
            .max()
            .unwrap_or(1)
            .min(MAX_CHANNELS)
    }

    /// Run the shared pipeline and the specialization for one block.
    pub fn tick(&mut self, cx: &mut SourceTickContext<'_>) {
        self.snapshot.drain(self.core.props());
        let props = self.core.props();
        if self.snapshot.changed(props, Property::Gain) {
            self.gain.set(self.snapshot.f64(props, Property::Gain) as f32);
        }

        let channels = self.channels();
        if self.filter.channels() != channels {
            self.filter = BiquadFilter::new(channels);
            self.filter.configure(self.snapshot.biquad(props, Property::Filter));
        } else if self.snapshot.changed(props, Property::Filter) {
            self.filter.configure(self.snapshot.biquad(props, Property::Filter));
        }

        // 1. Mix the generators into a zeroed source bus.
        let mut bus_guard = cx.cache.acquire();
        let bus = bus_guard.bus_mut(channels);
        for generator in &mut self.generators {
            let gen_channels = generator.channels();
            let mut scratch = cx.cache.acquire();
            let gen_bus = scratch.bus_mut(gen_channels);
            generator.tick(cx.events, gen_bus);
            ChannelMatrix::new(gen_channels, channels).mix_into(BLOCK_SIZE, gen_bus, bus);
        }

        // 2. Per-source filter and click-free gain.
        self.filter.process_block(bus);
        self.gain.apply(bus, channels);
        self.gain.settle();

        // 3. Routing contributions to global effects.
        cx.router.contribute(self.core.id(), bus, channels, cx.effects);

        // 4. Specialization.
        match self.kind {
            SourceKind::Direct => {
                ChannelMatrix::new(channels, 2).mix_into(BLOCK_SIZE, bus, cx.master);
            }
            SourceKind::ScalarPanned => {
                let pan = self.snapshot.f64(props, Property::PanningScalar);
                let mut mono = cx.cache.acquire();
                let mono_bus = mono.bus_mut(1);
                ChannelMatrix::new(channels, 1).mix_into(BLOCK_SIZE, bus, mono_bus);
                self.pan_stereo(cx, mono_bus, |panner| panner.set_pan(pan as f32));
            }
            SourceKind::AngularPanned => {
                let azimuth = self.snapshot.f64(props, Property::Azimuth);
                let mut mono = cx.cache.acquire();
                let mono_bus = mono.bus_mut(1);
                ChannelMatrix::new(channels, 1).mix_into(BLOCK_SIZE, bus, mono_bus);
                self.pan_stereo(cx, mono_bus, |panner| panner.set_azimuth(azimuth));
            }
            SourceKind::ThreeD => {
                let position = self.snapshot.double3(props, Property::Position);
                let (azimuth, elevation, distance) = cx.listener.direction_to(position);
                let distance_gain = self.distance_gain(distance);

                let mut mono = cx.cache.acquire();
                let mono_bus = mono.bus_mut(1);
                ChannelMatrix::new(channels, 1).mix_into_with_gain(
                    BLOCK_SIZE,
                    bus,
                    mono_bus,
                    |_| distance_gain,
                );

                if self.voice.is_none() {
                    self.voice = cx.panners.acquire_hrtf();
                }
                match self.voice {
                    Some(voice) => {
                        cx.panners
                            .hrtf_voice(voice)
                            .process_block(azimuth, elevation, mono_bus, cx.master);
                    }
                    // Pool exhausted: unspatialized fallback.
                    None => {
                        ChannelMatrix::new(1, 2).mix_into(BLOCK_SIZE, mono_bus, cx.master);
                    }
                }
            }
        }
    }

    fn pan_stereo(
        &mut self,
        cx: &mut SourceTickContext<'_>,
        mono: &[Sample],
        configure: impl FnOnce(&mut crate::panner::StereoPanner),
    ) {
        if self.voice.is_none() {
            self.voice = cx.panners.acquire_stereo();
        }
        match self.voice {
            Some(voice) => {
                let panner = cx.panners.stereo_voice(voice);
                configure(panner);
                panner.process_block(mono, cx.master);
            }
            None => {
                ChannelMatrix::new(1, 2).mix_into(BLOCK_SIZE, mono, cx.master);
            }
        }
    }

    /// Distance attenuation per the configured model, clamped to [0, 1].
    fn distance_gain(&self, distance: f64) -> f32 {
        let props = self.core.props();
        let model = DistanceModel::from_i64(self.snapshot.i64(props, Property::DistanceModel));
        let reference = self.snapshot.f64(props, Property::DistanceRef);
        let max = self.snapshot.f64(props, Property::DistanceMax).max(reference + 1e-9);
        let rolloff = self.snapshot.f64(props, Property::Rolloff);

        let gain = match model {
            DistanceModel::Inverse => {
                reference / (reference + rolloff * (distance.max(reference) - reference))
            }
            DistanceModel::Linear => {
                1.0 - rolloff * (distance.clamp(reference, max) - reference) / (max - reference)
            }
            DistanceModel::Exponential => (distance.max(reference) / reference).powf(-rolloff),
        };
        gain.clamp(0.0, 1.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_directions() {
        let listener = Listener::default();

        // Straight ahead (+y with the default orientation).
        let (az, el, d) = listener.direction_to([0.0, 5.0, 0.0]);
        assert!(az.abs() < 1e-9);
        assert!(el.abs() < 1e-9);
        assert!((d - 5.0).abs() < 1e-9);

        // Right of the listener.
        let (az, _, _) = listener.direction_to([3.0, 0.0, 0.0]);
        assert!((az - 90.0).abs() < 1e-9);

        // Behind.
        let (az, _, _) = listener.direction_to([0.0, -1.0, 0.0]);
        assert!((az - 180.0).abs() < 1e-9);

        // Above.
        let (_, el, _) = listener.direction_to([0.0, 0.0, 2.0]);
        assert!((el - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_listener_frame_follows_orientation() {
        // Face +x instead of +y: a point at +x is now "front".
        let listener = Listener::new([0.0; 3], [1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let (az, _, _) = listener.direction_to([4.0, 0.0, 0.0]);
        assert!(az.abs() < 1e-9);
        let (az, _, _) = listener.direction_to([0.0, 4.0, 0.0]);
        assert!((az - 270.0).abs() < 1e-9);
    }
}
