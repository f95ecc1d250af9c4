//! Decoder and byte-stream interfaces
//!
//! Format decoding (FLAC, MP3, WAV, ...) lives outside the engine; this
//! module defines the boundary the engine consumes. Decoders run on
//! background threads only — buffer construction and streaming decode both
//! happen off the audio thread.

use crate::error::Result;
use crate::types::Sample;

/// A pull decoder producing interleaved f32 frames.
pub trait Decoder: Send {
    /// Decode up to `out.len() / channels()` frames into `out`
    /// (interleaved). Returns the number of frames written and whether the
    /// end of the underlying data was reached.
    fn decode(&mut self, out: &mut [Sample]) -> Result<(usize, bool)>;

    /// Seek to an absolute frame position.
    fn seek(&mut self, frame: u64) -> Result<()>;

    /// Channel count of the decoded data.
    fn channels(&self) -> usize;

    /// Native sample rate of the decoded data.
    fn sample_rate(&self) -> u32;
}

/// A byte-oriented data source consumed by decoders.
///
/// Closing happens on drop.
pub trait ByteStream: Send {
    /// Read up to `out.len()` bytes; returns bytes read (0 at EOF).
    fn read(&mut self, out: &mut [u8]) -> Result<usize>;

    /// Seek to an absolute byte offset.
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Current byte offset.
    fn tell(&self) -> u64;
}

/// A decoder over PCM already in memory. Useful for tests and for hosts
/// that do their own format decoding up front.
pub struct MemoryDecoder {
    samples: Vec<Sample>,
    channels: usize,
    sample_rate: u32,
    /// Read head in frames.
    position: u64,
}

impl MemoryDecoder {
    /// Wrap interleaved samples. `samples.len()` must be a multiple of
    /// `channels`.
    pub fn new(samples: Vec<Sample>, channels: usize, sample_rate: u32) -> Self {
        assert!(channels > 0);
        assert_eq!(samples.len() % channels, 0);
        Self {
            samples,
            channels,
            sample_rate,
            position: 0,
        }
    }

    /// A mono sine wave, handy as a test signal.
    pub fn sine(frequency: f32, seconds: f32, amplitude: f32, sample_rate: u32) -> Self {
        let frames = (seconds * sample_rate as f32) as usize;
        let step = 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
        let samples = (0..frames)
            .map(|i| (i as f32 * step).sin() * amplitude)
            .collect();
        Self::new(samples, 1, sample_rate)
    }

    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.channels) as u64
    }
}

impl Decoder for MemoryDecoder {
    fn decode(&mut self, out: &mut [Sample]) -> Result<(usize, bool)> {
        let want = out.len() / self.channels;
        let remaining = (self.frames() - self.position) as usize;
        let frames = want.min(remaining);

        let start = self.position as usize * self.channels;
        let n = frames * self.channels;
        out[..n].copy_from_slice(&self.samples[start..start + n]);
        self.position += frames as u64;

        Ok((frames, self.position >= self.frames()))
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        self.position = frame.min(self.frames());
        Ok(())
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_decoder_decodes_all() {
        let mut dec = MemoryDecoder::new(vec![1.0, 2.0, 3.0, 4.0], 2, 44_100);
        let mut out = [0.0; 6];
        let (frames, eof) = dec.decode(&mut out).unwrap();
        assert_eq!(frames, 2);
        assert!(eof);
        assert_eq!(&out[..4], &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_memory_decoder_partial_then_eof() {
        let mut dec = MemoryDecoder::new(vec![1.0, 2.0, 3.0], 1, 44_100);
        let mut out = [0.0; 2];
        let (frames, eof) = dec.decode(&mut out).unwrap();
        assert_eq!(frames, 2);
        assert!(!eof);
        let (frames, eof) = dec.decode(&mut out).unwrap();
        assert_eq!(frames, 1);
        assert!(eof);
    }

    #[test]
    fn test_seek_rewinds() {
        let mut dec = MemoryDecoder::new(vec![1.0, 2.0], 1, 44_100);
        let mut out = [0.0; 2];
        dec.decode(&mut out).unwrap();
        dec.seek(0).unwrap();
        let (frames, _) = dec.decode(&mut out).unwrap();
        assert_eq!(frames, 2);
        assert_eq!(out[0], 1.0);
    }

    #[test]
    fn test_sine_amplitude() {
        let dec = MemoryDecoder::sine(440.0, 0.1, 0.5, 44_100);
        let peak = dec.samples.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(peak <= 0.5 && peak > 0.49);
    }
}
