//! Streaming generator
//!
//! Decode runs on a dedicated background thread that pushes interleaved
//! frames into an audio ring; the audio-thread node pulls exactly one
//! block per tick. Underflow is recoverable: the node emits silence for
//! the tick, posts [`EventKind::StreamUnderflow`] once per gap, and
//! resumes when the decoder catches up. Looping and seeking are handled
//! decode-side via a control channel.

use std::thread;
use std::time::Duration;

use crate::command::{CommandSender, EngineCommand};
use crate::decoder::Decoder;
use crate::error::Result;
use crate::events::{EventKind, EventSender};
use crate::gc::{deletion_handle, Owned, Shared};
use crate::properties::{schema, ObjectCore, Property};
use crate::ring::{audio_ring, RingReader, RingWriter};
use crate::types::{ObjectId, Sample, BLOCK_SIZE};

use super::{Generator, GeneratorContext, GeneratorEntry};

/// Messages from the handle/audio thread to the decode thread.
enum StreamControl {
    SetLooping(bool),
    Seek(u64),
}

/// Audio-thread state: the read side of the ring.
pub struct StreamingGeneratorNode {
    channels: usize,
    reader: RingReader,
    control: flume::Sender<StreamControl>,
    looping_sent: bool,
    underflow_active: bool,
}

impl Generator for StreamingGeneratorNode {
    fn channels(&self) -> usize {
        self.channels
    }

    fn generate(&mut self, cx: &mut GeneratorContext<'_>, out: &mut [Sample]) {
        let props = cx.core.props();
        if cx.props.changed(props, Property::Looping) || !self.looping_sent {
            let _ = self
                .control
                .try_send(StreamControl::SetLooping(cx.props.bool(props, Property::Looping)));
            self.looping_sent = true;
        }

        let needed = self.channels * BLOCK_SIZE;
        let regions = self.reader.begin_read(needed, false);
        if regions.is_empty() {
            // Underflow: this block is silence. Flag once per gap.
            drop(regions);
            if !self.underflow_active && !self.reader.is_writer_closed() {
                cx.events.send(cx.core.id(), EventKind::StreamUnderflow);
                self.underflow_active = true;
            }
            return;
        }

        let copied = regions.copy_to(&mut out[..needed]);
        debug_assert_eq!(copied, needed);
        drop(regions);
        self.reader.end_read(needed);
        self.underflow_active = false;
    }
}

/// Frames the decode thread produces per ring write.
const DECODE_CHUNK_FRAMES: usize = BLOCK_SIZE;

/// Decode-thread main loop.
fn decode_loop(
    mut decoder: Box<dyn Decoder>,
    mut writer: RingWriter,
    control: flume::Receiver<StreamControl>,
    events: EventSender,
    id: ObjectId,
) {
    let channels = decoder.channels();
    let chunk_samples = channels * DECODE_CHUNK_FRAMES;
    let mut scratch = vec![0.0; chunk_samples];
    let mut looping = false;
    let mut finished = false;

    loop {
        while let Ok(msg) = control.try_recv() {
            match msg {
                StreamControl::SetLooping(value) => looping = value,
                StreamControl::Seek(frame) => {
                    if let Err(e) = decoder.seek(frame) {
                        log::warn!("stream {id}: seek failed: {e}");
                    }
                    finished = false;
                }
            }
        }

        if finished {
            // Nothing to produce until a seek or loop change; park
            // briefly instead of spinning.
            if writer.is_reader_closed() {
                return;
            }
            match control.recv_timeout(Duration::from_millis(50)) {
                Ok(StreamControl::SetLooping(value)) => {
                    looping = value;
                    if looping {
                        let _ = decoder.seek(0);
                        finished = false;
                    }
                }
                Ok(StreamControl::Seek(frame)) => {
                    let _ = decoder.seek(frame);
                    finished = false;
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => return,
            }
            continue;
        }

        let (frames, eof) = match decoder.decode(&mut scratch) {
            Ok(result) => result,
            Err(e) => {
                // Degrade to silence for this chunk and tell the host.
                log::warn!("stream {id}: decode error: {e}");
                events.send(id, EventKind::StreamUnderflow);
                (0, false)
            }
        };

        if frames > 0 {
            let samples = frames * channels;
            // Blocks until the audio thread frees space; None means the
            // generator was released.
            let Some(mut regions) = writer.begin_write(samples, false) else {
                return;
            };
            regions.copy_from(&scratch[..samples]);
            drop(regions);
            writer.end_write(samples);
        } else if !eof {
            // Decoder had nothing this round (a starving network stream);
            // back off instead of busy-looping.
            if writer.is_reader_closed() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if eof {
            if looping {
                if decoder.seek(0).is_ok() {
                    events.send(id, EventKind::Looped);
                } else {
                    finished = true;
                }
            } else {
                events.send(id, EventKind::Finished);
                finished = true;
            }
        }
    }
}

/// Handle to a streaming generator.
///
/// Owns the decode thread through the control channel: dropping the
/// handle unregisters the node, which drops the ring reader, which makes
/// the decode thread unwind.
pub struct StreamingGenerator {
    core: Shared<ObjectCore>,
    commands: CommandSender,
    control: flume::Sender<StreamControl>,
}

impl StreamingGenerator {
    pub(crate) fn create(
        commands: CommandSender,
        events: EventSender,
        decoder: Box<dyn Decoder>,
        ring_blocks: usize,
    ) -> Result<Self> {
        let core = Shared::new(
            &deletion_handle(),
            ObjectCore::new(schema::STREAMING_GENERATOR),
        );
        let channels = decoder.channels();
        let capacity = channels * BLOCK_SIZE * ring_blocks.max(2);
        let (writer, reader) = audio_ring(capacity);
        let (control_tx, control_rx) = flume::bounded(16);

        let id = core.id();
        thread::Builder::new()
            .name(format!("synthizer-decode-{}", id.0))
            .spawn(move || decode_loop(decoder, writer, control_rx, events, id))
            .map_err(|e| crate::error::Error::Backend(format!("failed to spawn decode thread: {e}")))?;

        let node = StreamingGeneratorNode {
            channels,
            reader,
            control: control_tx.clone(),
            looping_sent: false,
            underflow_active: false,
        };
        let entry = GeneratorEntry::new(core.clone(), Box::new(node));
        commands.send(EngineCommand::RegisterGenerator(Owned::new(
            &deletion_handle(),
            entry,
        )))?;

        Ok(Self {
            core,
            commands,
            control: control_tx,
        })
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

    pub fn looping(&self) -> Result<bool> {
        self.core.props().get_bool(Property::Looping)
    }

    pub fn set_looping(&self, looping: bool) -> Result<()> {
        self.core.props().set_bool(Property::Looping, looping)?;
        let _ = self.control.try_send(StreamControl::SetLooping(looping));
        Ok(())
    }

    /// Seek the underlying decoder to an absolute frame.
    ///
    /// Already-buffered audio still plays out; the seek becomes audible
    /// one ring's worth of frames later.
    pub fn seek(&self, frame: u64) -> Result<()> {
        self.control
            .try_send(StreamControl::Seek(frame))
            .map_err(|_| crate::error::Error::ResourceExhausted("stream control queue full"))
    }

    pub(crate) fn core(&self) -> &Shared<ObjectCore> {
        &self.core
    }
}

impl Drop for StreamingGenerator {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(EngineCommand::UnregisterGenerator(self.core.id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::MemoryDecoder;
    use crate::events::event_channel;
    use crate::types::SAMPLE_RATE;

    fn spawn_node(
        decoder: Box<dyn Decoder>,
        events: EventSender,
    ) -> (Shared<ObjectCore>, GeneratorEntry) {
        let core = Shared::new(
            &deletion_handle(),
            ObjectCore::new(schema::STREAMING_GENERATOR),
        );
        let channels = decoder.channels();
        let (writer, reader) = audio_ring(channels * BLOCK_SIZE * 8);
        let (control_tx, control_rx) = flume::bounded(16);
        let id = core.id();
        thread::spawn(move || decode_loop(decoder, writer, control_rx, events, id));

        let node = StreamingGeneratorNode {
            channels,
            reader,
            control: control_tx,
            looping_sent: false,
            underflow_active: false,
        };
        let entry = GeneratorEntry::new(core.clone(), Box::new(node));
        (core, entry)
    }

    fn wait_for_fill() {
        thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn test_streams_decoded_audio() {
        let decoder = MemoryDecoder::new(vec![0.25; BLOCK_SIZE * 4], 1, SAMPLE_RATE);
        let (tx, rx) = event_channel();
        let (_core, mut entry) = spawn_node(Box::new(decoder), tx.clone());
        wait_for_fill();

        let mut out = vec![0.0; BLOCK_SIZE];
        entry.tick(&tx, &mut out);
        assert!(out.iter().all(|&s| s == 0.25));

        // End of data arrives as a Finished event from the decode thread.
        let mut saw_finished = false;
        for _ in 0..4 {
            entry.tick(&tx, &mut out);
        }
        while let Some(e) = rx.try_next() {
            saw_finished |= e.kind == EventKind::Finished;
        }
        assert!(saw_finished);
    }

    #[test]
    fn test_underflow_emits_silence_and_one_event() {
        // Decoder with nothing at all: ring never fills.
        let decoder = MemoryDecoder::new(vec![], 1, SAMPLE_RATE);
        let (tx, rx) = event_channel();
        let (_core, mut entry) = spawn_node(Box::new(decoder), tx.clone());
        wait_for_fill();

        let mut out = vec![0.1; BLOCK_SIZE];
        out.fill(0.0);
        entry.tick(&tx, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        entry.tick(&tx, &mut out);
        entry.tick(&tx, &mut out);

        let underflows = std::iter::from_fn(|| rx.try_next())
            .filter(|e| e.kind == EventKind::StreamUnderflow)
            .count();
        assert!(underflows <= 1, "one underflow event per gap, got {underflows}");
    }

    #[test]
    fn test_looping_stream_keeps_producing() {
        let decoder = MemoryDecoder::new(vec![0.5; BLOCK_SIZE], 1, SAMPLE_RATE);
        let (tx, rx) = event_channel();
        let (core, mut entry) = spawn_node(Box::new(decoder), tx.clone());
        core.props().set_bool(Property::Looping, true).unwrap();

        let mut out = vec![0.0; BLOCK_SIZE];
        // First tick pushes the looping flag to the decode thread; give it
        // a few blocks to wrap.
        for _ in 0..8 {
            out.fill(0.0);
            entry.tick(&tx, &mut out);
            thread::sleep(Duration::from_millis(20));
        }
        assert!(out.iter().all(|&s| s == 0.5), "loop went silent");

        let looped = std::iter::from_fn(|| rx.try_next()).any(|e| e.kind == EventKind::Looped);
        assert!(looped);
    }
}
