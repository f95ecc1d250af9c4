//! Immutable decoded audio buffers
//!
//! A [`Buffer`] is decoded PCM shared by reference count: generators on
//! the audio thread and handles on external threads hold the same
//! [`Shared`] data, and the last drop lands on the deletion thread, never
//! inline on audio. Buffers are converted to the engine sample rate at
//! construction so the generator's hot path never resamples across rates
//! (pitch bend still interpolates sub-sample positions).

use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::gc::{deletion_handle, Shared};
use crate::types::{ObjectId, Sample, MAX_CHANNELS, SAMPLE_RATE};

/// Decode chunk size in frames while filling a buffer.
const DECODE_CHUNK_FRAMES: usize = 4096;

/// Immutable PCM at the engine rate, interleaved.
pub struct BufferData {
    channels: usize,
    frames: usize,
    samples: Vec<Sample>,
}

impl BufferData {
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Interleaved sample storage, `frames * channels` long.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Sample for `(frame, channel)`; frames past the end read as silence.
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> Sample {
        if frame >= self.frames {
            return 0.0;
        }
        self.samples[frame * self.channels + channel]
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames as f64 / SAMPLE_RATE as f64
    }
}

/// Handle to an immutable decoded buffer.
#[derive(Clone)]
pub struct Buffer {
    id: ObjectId,
    data: Shared<BufferData>,
}

impl Buffer {
    /// Decode everything the decoder has into a buffer, converting the
    /// sample rate if it differs from the engine rate.
    pub fn from_decoder(decoder: &mut dyn Decoder) -> Result<Self> {
        let channels = decoder.channels();
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(Error::DecodeError(format!(
                "buffer channel count {channels} out of range"
            )));
        }

        let mut samples = Vec::new();
        let mut chunk = vec![0.0; DECODE_CHUNK_FRAMES * channels];
        loop {
            let (frames, eof) = decoder.decode(&mut chunk)?;
            samples.extend_from_slice(&chunk[..frames * channels]);
            if eof || frames == 0 {
                break;
            }
        }

        let source_rate = decoder.sample_rate();
        if source_rate != SAMPLE_RATE {
            samples = resample_linear(&samples, channels, source_rate, SAMPLE_RATE);
        }

        let frames = samples.len() / channels;
        let data = BufferData {
            channels,
            frames,
            samples,
        };
        Ok(Self {
            id: ObjectId::next(),
            data: Shared::new(&deletion_handle(), data),
        })
    }

    /// Wrap interleaved samples already at the engine rate.
    pub fn from_samples(samples: Vec<Sample>, channels: usize) -> Result<Self> {
        if channels == 0 || channels > MAX_CHANNELS || samples.len() % channels != 0 {
            return Err(Error::DecodeError(
                "sample count is not a whole number of frames".to_string(),
            ));
        }
        let frames = samples.len() / channels;
        Ok(Self {
            id: ObjectId::next(),
            data: Shared::new(
                &deletion_handle(),
                BufferData {
                    channels,
                    frames,
                    samples,
                },
            ),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn channels(&self) -> usize {
        self.data.channels
    }

    pub fn frames(&self) -> usize {
        self.data.frames
    }

    pub fn duration_seconds(&self) -> f64 {
        self.data.duration_seconds()
    }

    pub(crate) fn data(&self) -> &Shared<BufferData> {
        &self.data
    }
}

/// Linear-interpolation rate conversion, per channel, at load time.
fn resample_linear(samples: &[Sample], channels: usize, from: u32, to: u32) -> Vec<Sample> {
    let in_frames = samples.len() / channels;
    if in_frames == 0 {
        return Vec::new();
    }
    let ratio = from as f64 / to as f64;
    let out_frames = ((in_frames as f64) / ratio).round() as usize;

    let mut out = vec![0.0; out_frames * channels];
    for frame in 0..out_frames {
        let pos = frame as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let next = (idx + 1).min(in_frames - 1);
        for c in 0..channels {
            let a = samples[idx * channels + c];
            let b = samples[next * channels + c];
            out[frame * channels + c] = a + (b - a) * frac;
        }
    }
    out
}
