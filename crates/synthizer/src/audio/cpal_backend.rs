//! cpal output backend
//!
//! The device callback and the engine's audio thread are decoupled by an
//! SPSC frame ring: the engine fills it one block at a time, the device
//! callback drains whatever the device period needs and reports freed
//! block slots back through the ready callback. The ring starts empty, so
//! `start` immediately signals one ready per slot to prime the pipeline.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use crate::error::{Error, Result};
use crate::types::{Sample, BLOCK_SIZE};

use super::backend::{AudioBackend, BlockReadyFn, StartedBackend};

/// Ring depth in blocks between the engine and the device callback.
const RING_BLOCKS: usize = 4;

/// Backend configuration prior to `start`.
pub struct CpalBackend {
    device_name: Option<String>,
}

impl CpalBackend {
    /// Use the system default output device.
    pub fn default_device() -> Self {
        Self { device_name: None }
    }

    /// Use a named output device.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    fn find_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host
                .default_output_device()
                .ok_or_else(|| Error::Backend("no default output device".to_string())),
            Some(name) => host
                .output_devices()
                .map_err(|e| Error::Backend(format!("failed to enumerate devices: {e}")))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| Error::Backend(format!("output device {name:?} not found"))),
        }
    }
}

impl AudioBackend for CpalBackend {
    fn start(
        self: Box<Self>,
        sample_rate: u32,
        channels: usize,
        on_block_ready: BlockReadyFn,
    ) -> Result<Box<dyn StartedBackend>> {
        let device = self.find_device()?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        log::info!("using output device: {device_name}");

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let block_samples = BLOCK_SIZE * channels;
        let (producer, mut consumer) = rtrb::RingBuffer::<Sample>::new(block_samples * RING_BLOCKS);

        let ready = on_block_ready.clone();
        let mut freed_samples = 0usize;
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [Sample], _info| {
                    let mut written = 0;
                    while written < data.len() {
                        match consumer.pop() {
                            Ok(sample) => {
                                data[written] = sample;
                                written += 1;
                            }
                            // Underrun: the engine fell behind the device.
                            Err(_) => {
                                data[written..].fill(0.0);
                                break;
                            }
                        }
                    }
                    freed_samples += written;
                    while freed_samples >= block_samples {
                        freed_samples -= block_samples;
                        ready();
                    }
                },
                move |err| {
                    log::error!("output stream error: {err}");
                },
                None,
            )
            .map_err(|e| Error::Backend(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| Error::Backend(format!("failed to start output stream: {e}")))?;

        log::info!(
            "audio stream started: {channels} channels, {sample_rate} Hz, {RING_BLOCKS} block ring"
        );

        // Prime: every empty slot is a block the engine may produce now.
        for _ in 0..RING_BLOCKS {
            on_block_ready();
        }

        Ok(Box::new(StartedCpal {
            _stream: stream,
            producer,
        }))
    }
}

struct StartedCpal {
    /// Keeps the device stream alive; dropped on stop.
    _stream: Stream,
    producer: rtrb::Producer<Sample>,
}

impl StartedBackend for StartedCpal {
    fn submit(&mut self, frames: &[Sample]) {
        for &sample in frames {
            // Ready accounting keeps the ring from filling; a failed push
            // means a lost block, which the underrun path already covers.
            if self.producer.push(sample).is_err() {
                log::debug!("output ring full; dropping remainder of block");
                break;
            }
        }
    }

    fn stop(&mut self) {
        log::info!("audio stream stopped");
    }
}
