//! Buffer generator
//!
//! Plays an immutable decoded [`Buffer`] with looping and sub-sample
//! pitch bend. `playback_position` (seconds) is a property: external sets
//! seek, and the audio thread publishes the advancing position back to the
//! shadow slot every tick.

use crate::buffer::{Buffer, BufferData};
use crate::command::{CommandSender, EngineCommand};
use crate::error::Result;
use crate::events::EventKind;
use crate::gc::{deletion_handle, Owned, Shared};
use crate::properties::{schema, ObjectCore, Property, PropertyValue};
use crate::types::{ObjectId, Sample, BLOCK_SIZE, SAMPLE_RATE};

use super::{Generator, GeneratorContext, GeneratorEntry};

/// Audio-thread state.
pub struct BufferGeneratorNode {
    buffer: Option<Shared<BufferData>>,
    /// Read head in frames (fractional while pitch-bent).
    position: f64,
    finished_sent: bool,
}

impl BufferGeneratorNode {
    pub fn new() -> Self {
        Self {
            buffer: None,
            position: 0.0,
            finished_sent: false,
        }
    }

    pub fn set_buffer(&mut self, buffer: Shared<BufferData>) {
        self.buffer = Some(buffer);
        self.position = 0.0;
        self.finished_sent = false;
    }
}

impl Default for BufferGeneratorNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Generator for BufferGeneratorNode {
    fn channels(&self) -> usize {
        self.buffer.as_ref().map_or(1, |b| b.channels())
    }

    fn set_buffer(&mut self, buffer: Shared<BufferData>) {
        BufferGeneratorNode::set_buffer(self, buffer);
    }

    fn generate(&mut self, cx: &mut GeneratorContext<'_>, out: &mut [Sample]) {
        let Some(buffer) = self.buffer.as_ref() else {
            return;
        };
        let props = cx.core.props();
        let pitch = cx.props.f64(props, Property::PitchBend);
        let looping = cx.props.bool(props, Property::Looping);

        if cx.props.changed(props, Property::PlaybackPosition) {
            self.position =
                cx.props.f64(props, Property::PlaybackPosition) * SAMPLE_RATE as f64;
            self.finished_sent = false;
        }

        let channels = buffer.channels();
        let frames = buffer.frames() as f64;

        for frame in 0..BLOCK_SIZE {
            if self.position >= frames {
                if looping && frames > 0.0 {
                    self.position %= frames;
                    cx.events.send(cx.core.id(), EventKind::Looped);
                } else {
                    if !self.finished_sent {
                        cx.events.send(cx.core.id(), EventKind::Finished);
                        self.finished_sent = true;
                    }
                    break;
                }
            }

            let idx = self.position as usize;
            let frac = (self.position - idx as f64) as f32;
            let next = idx + 1;
            for c in 0..channels {
                let a = buffer.sample(idx, c);
                let b = if looping && next >= buffer.frames() {
                    buffer.sample(0, c)
                } else {
                    buffer.sample(next, c)
                };
                out[frame * channels + c] += a + (b - a) * frac;
            }
            self.position += pitch;
        }

        let seconds = self.position / SAMPLE_RATE as f64;
        cx.props
            .publish(props, Property::PlaybackPosition, PropertyValue::F64(seconds));
    }
}

/// Handle to a buffer generator.
///
/// Dropping the handle releases the generator: the audio thread detaches
/// it on the next tick and its node is destroyed on the deletion thread.
pub struct BufferGenerator {
    core: Shared<ObjectCore>,
    commands: CommandSender,
}

impl BufferGenerator {
    pub(crate) fn create(commands: CommandSender) -> Result<Self> {
        let core = Shared::new(
            &deletion_handle(),
            ObjectCore::new(schema::BUFFER_GENERATOR),
        );
        let entry = GeneratorEntry::new(core.clone(), Box::new(BufferGeneratorNode::new()));
        commands.send(EngineCommand::RegisterGenerator(Owned::new(
            &deletion_handle(),
            entry,
        )))?;
        Ok(Self { core, commands })
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    /// Point the generator at a buffer. Takes effect on the next tick.
    pub fn set_buffer(&self, buffer: &Buffer) -> Result<()> {
        self.commands.send(EngineCommand::SetGeneratorBuffer {
            generator: self.core.id(),
            buffer: buffer.data().clone(),
        })
    }

    pub fn gain(&self) -> Result<f64> {
        self.core.props().get_f64(Property::Gain)
    }

    pub fn set_gain(&self, gain: f64) -> Result<()> {
        self.core.props().set_f64(Property::Gain, gain)
    }

    pub fn pitch_bend(&self) -> Result<f64> {
        self.core.props().get_f64(Property::PitchBend)
    }

    pub fn set_pitch_bend(&self, pitch: f64) -> Result<()> {
        self.core.props().set_f64(Property::PitchBend, pitch)
    }

    pub fn looping(&self) -> Result<bool> {
        self.core.props().get_bool(Property::Looping)
    }

    pub fn set_looping(&self, looping: bool) -> Result<()> {
        self.core.props().set_bool(Property::Looping, looping)
    }

    /// Playback position in seconds, as last published by the audio thread.
    pub fn playback_position(&self) -> Result<f64> {
        self.core.props().get_f64(Property::PlaybackPosition)
    }

    /// Seek to a position in seconds.
    pub fn seek(&self, seconds: f64) -> Result<()> {
        self.core.props().set_f64(Property::PlaybackPosition, seconds)
    }

    pub(crate) fn core(&self) -> &Shared<ObjectCore> {
        &self.core
    }
}

impl Drop for BufferGenerator {
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

    fn make_entry(samples: Vec<Sample>, channels: usize) -> (Shared<ObjectCore>, GeneratorEntry) {
        let core = Shared::new(
            &deletion_handle(),
            ObjectCore::new(schema::BUFFER_GENERATOR),
        );
        let buffer = Buffer::from_samples(samples, channels).unwrap();
        let mut node = BufferGeneratorNode::new();
        node.set_buffer(buffer.data().clone());
        let entry = GeneratorEntry::new(core.clone(), Box::new(node));
        (core, entry)
    }

    #[test]
    fn test_plays_buffer_then_finishes() {
        let (core, mut entry) = make_entry(vec![0.5; BLOCK_SIZE / 2], 1);
        let (tx, rx) = event_channel();

        let mut out = vec![0.0; BLOCK_SIZE];
        entry.tick(&tx, &mut out);

        assert!(out[..BLOCK_SIZE / 2].iter().all(|&s| s == 0.5));
        assert!(out[BLOCK_SIZE / 2..].iter().all(|&s| s == 0.0));
        assert_eq!(rx.try_next().map(|e| e.kind), Some(EventKind::Finished));
        let _ = core;
    }

    #[test]
    fn test_looping_wraps_and_reports() {
        let (core, mut entry) = make_entry(vec![1.0; 100], 1);
        core.props().set_bool(Property::Looping, true).unwrap();
        let (tx, rx) = event_channel();

        let mut out = vec![0.0; BLOCK_SIZE];
        entry.tick(&tx, &mut out);

        assert!(out.iter().all(|&s| s == 1.0));
        assert_eq!(rx.try_next().map(|e| e.kind), Some(EventKind::Looped));
    }

    #[test]
    fn test_position_published_after_tick() {
        let (core, mut entry) = make_entry(vec![0.0; BLOCK_SIZE * 4], 1);
        let (tx, _rx) = event_channel();

        let mut out = vec![0.0; BLOCK_SIZE];
        entry.tick(&tx, &mut out);

        let pos = core.props().get_f64(Property::PlaybackPosition).unwrap();
        let expected = BLOCK_SIZE as f64 / SAMPLE_RATE as f64;
        assert!((pos - expected).abs() < 1e-9, "published {pos}");
    }

    #[test]
    fn test_seek_applies_before_block() {
        let samples: Vec<Sample> = (0..BLOCK_SIZE * 2).map(|i| i as f32).collect();
        let (core, mut entry) = make_entry(samples, 1);
        let (tx, _rx) = event_channel();

        let seek_seconds = BLOCK_SIZE as f64 / SAMPLE_RATE as f64;
        core.props()
            .set_f64(Property::PlaybackPosition, seek_seconds)
            .unwrap();

        let mut out = vec![0.0; BLOCK_SIZE];
        entry.tick(&tx, &mut out);
        assert_eq!(out[0], BLOCK_SIZE as f32);
    }

    #[test]
    fn test_pitch_bend_halves_rate() {
        let samples: Vec<Sample> = (0..100).map(|i| i as f32).collect();
        let (core, mut entry) = make_entry(samples, 1);
        core.props().set_f64(Property::PitchBend, 0.5).unwrap();
        let (tx, _rx) = event_channel();

        let mut out = vec![0.0; BLOCK_SIZE];
        entry.tick(&tx, &mut out);

        // Half-rate playback with linear interpolation: 0, 0.5, 1, 1.5 ...
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_snapshot_gain_ramps_into_block() {
        let (core, mut entry) = make_entry(vec![1.0; BLOCK_SIZE * 4], 1);
        core.props().set_f64(Property::Gain, 0.0).unwrap();
        let (tx, _rx) = event_channel();

        let mut out = vec![0.0; BLOCK_SIZE];
        entry.tick(&tx, &mut out);
        // Gain change ramps from the default 1.0 down to 0.0 across the
        // block.
        assert!(out[0] > 0.9);
        assert!(out[BLOCK_SIZE - 1] < 0.05);

        out.fill(0.0);
        entry.tick(&tx, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }
}
