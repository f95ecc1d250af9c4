//! Synthizer — real-time audio synthesis and 3D spatialization
//!
//! A pull-based, block-synchronous mixing engine meant to be embedded in
//! games and interactive applications. A [`Context`] owns one audio
//! thread; sources consume generators, optionally route into global
//! effects, and are spatialized per source with HRTF convolution or
//! equal-power panning. Property changes from any thread land coherently
//! on block boundaries, and nothing on the audio thread blocks,
//! allocates, or runs a destructor.
//!
//! ```no_run
//! use synthizer::{Buffer, Context, CpalBackend, EngineConfig, MemoryDecoder};
//!
//! # fn main() -> synthizer::Result<()> {
//! let ctx = Context::new(CpalBackend::default_device(), EngineConfig::default())?;
//!
//! let mut decoder = MemoryDecoder::sine(440.0, 1.0, 0.8, 44_100);
//! let buffer = Buffer::from_decoder(&mut decoder)?;
//!
//! let generator = ctx.new_buffer_generator()?;
//! generator.set_buffer(&buffer)?;
//!
//! let source = ctx.new_source_3d()?;
//! source.add_generator(&generator)?;
//! source.set_position([2.0, 1.0, 0.0])?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod bufcache;
pub mod buffer;
pub mod channel_mixing;
pub mod command;
pub mod config;
pub mod context;
pub mod decoder;
pub mod effects;
pub mod error;
pub mod events;
pub mod filters;
pub mod gc;
pub mod generators;
pub mod panner;
pub mod properties;
pub mod ring;
pub mod router;
pub mod sources;
pub mod types;

pub use audio::{manual_pair, AudioBackend, CpalBackend, ManualControl};
pub use buffer::Buffer;
pub use config::EngineConfig;
pub use context::{Context, RouteSource, RouteTarget};
pub use decoder::{ByteStream, Decoder, MemoryDecoder};
pub use effects::{EchoTapConfig, GlobalEcho, GlobalFdnReverb};
pub use error::{Error, Result};
pub use events::{Event, EventKind};
pub use filters::{
    design_bandpass, design_high_shelf, design_highpass, design_identity, design_low_shelf,
    design_lowpass, design_notch, design_peaking, BiquadConfig,
};
pub use generators::{
    BufferGenerator, FastSineBank, NoiseGenerator, NoiseType, SineBankConfig, SineWaveConfig,
    StreamingGenerator,
};
pub use sources::{
    AngularPannedSource, DirectSource, DistanceModel, ScalarPannedSource, Source3D,
};
pub use types::{ObjectId, Sample, BLOCK_SIZE, MAX_CHANNELS, SAMPLE_RATE};
