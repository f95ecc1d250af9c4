//! Context: the root object and its audio thread
//!
//! A context owns exactly one audio thread. Each tick the thread drains
//! property writes and commands, runs every live source (which mixes
//! generators, filters, and contributes to routed effects), runs the
//! effects, applies the context gain, and hands the finished block to the
//! backend. The backend's ready callback is the only thing the thread
//! waits on.
//!
//! Dropping the [`Context`] posts a shutdown command, lets the thread
//! finish its in-flight block, stops the backend on that thread, and
//! joins. Everything the audio thread owned is wrapped in
//! [`Owned`]/[`Shared`], so the teardown destructors all land on the
//! deletion thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::{AudioBackend, BlockReadyFn};
use crate::bufcache::BlockBufferCache;
use crate::command::{command_channel, CommandReceiver, CommandSender, EngineCommand};
use crate::config::EngineConfig;
use crate::decoder::Decoder;
use crate::effects::{EffectEntry, EffectNodeCommand, GlobalEcho, GlobalFdnReverb};
use crate::error::{Error, Result};
use crate::events::{event_channel, Event, EventKind, EventReceiver, EventSender};
use crate::gc::{deletion_handle, Owned, Shared};
use crate::generators::{
    BufferGenerator, FastSineBank, GeneratorEntry, NoiseGenerator, SineBankConfig,
    StreamingGenerator,
};
use crate::panner::PannerBank;
use crate::properties::{schema, ObjectCore, Property, PropertySnapshot};
use crate::router::Router;
use crate::sources::{
    AngularPannedSource, DirectSource, Listener, ScalarPannedSource, Source3D, SourceNode,
    SourceTickContext,
};
use crate::types::{GainRamp, ObjectId, Sample, BLOCK_SIZE, SAMPLE_RATE};

/// Output channel count of the master bus.
const OUTPUT_CHANNELS: usize = 2;

/// Pending automation markers per context.
const AUTOMATION_RESERVE: usize = 256;

/// Anything that can be the source end of a route.
pub trait RouteSource {
    fn route_source_id(&self) -> ObjectId;
}

impl RouteSource for DirectSource {
    fn route_source_id(&self) -> ObjectId {
        self.id()
    }
}

impl RouteSource for ScalarPannedSource {
    fn route_source_id(&self) -> ObjectId {
        self.id()
    }
}

impl RouteSource for AngularPannedSource {
    fn route_source_id(&self) -> ObjectId {
        self.id()
    }
}

impl RouteSource for Source3D {
    fn route_source_id(&self) -> ObjectId {
        self.id()
    }
}

/// Anything that can be the effect end of a route.
pub trait RouteTarget {
    fn route_target_id(&self) -> ObjectId;
}

impl RouteTarget for GlobalEcho {
    fn route_target_id(&self) -> ObjectId {
        self.id()
    }
}

impl RouteTarget for GlobalFdnReverb {
    fn route_target_id(&self) -> ObjectId {
        self.id()
    }
}

/// A host automation marker waiting for the engine clock.
struct PendingAutomation {
    time_samples: u64,
    object: ObjectId,
    param: u64,
}

/// The engine's audio-thread state.
struct EngineState {
    core: Shared<ObjectCore>,
    snapshot: PropertySnapshot,
    master_gain: GainRamp,
    sources: Vec<Owned<SourceNode>>,
    effects: Vec<Owned<EffectEntry>>,
    detached_generators: Vec<Owned<GeneratorEntry>>,
    router: Router,
    panners: PannerBank,
    cache: BlockBufferCache,
    events: EventSender,
    commands: CommandReceiver,
    master: Vec<Sample>,
    pending_automation: Vec<PendingAutomation>,
    /// Blocks emitted so far; the engine clock for automation markers.
    time_in_blocks: u64,
    /// Reserve limits from the config, checked explicitly so overruns are
    /// detected in release builds too.
    object_reserve: usize,
    effect_reserve: usize,
    failed: Arc<AtomicBool>,
    shutting_down: bool,
}

impl EngineState {
    fn new(
        core: Shared<ObjectCore>,
        config: &EngineConfig,
        events: EventSender,
        commands: CommandReceiver,
        failed: Arc<AtomicBool>,
    ) -> Self {
        let snapshot = PropertySnapshot::new(core.props());
        let master_gain = GainRamp::new(snapshot.f64(core.props(), Property::Gain) as f32);
        let effect_reserve = config.object_reserve.min(64);
        Self {
            snapshot,
            master_gain,
            sources: Vec::with_capacity(config.object_reserve),
            effects: Vec::with_capacity(effect_reserve),
            detached_generators: Vec::with_capacity(config.object_reserve),
            router: Router::with_reserve(config.object_reserve),
            panners: PannerBank::new(config.stereo_voices, config.hrtf_voices),
            cache: BlockBufferCache::with_reserve(config.block_buffer_reserve),
            events,
            commands,
            master: vec![0.0; BLOCK_SIZE * OUTPUT_CHANNELS],
            pending_automation: Vec::with_capacity(AUTOMATION_RESERVE),
            time_in_blocks: 0,
            object_reserve: config.object_reserve,
            effect_reserve,
            failed,
            shutting_down: false,
            core,
        }
    }

    /// An engine invariant was violated. Aborts in debug builds; in
    /// release it logs, marks the context failed, and stops the audio
    /// thread. External calls observe `Error::InternalError` afterwards.
    fn fail(&mut self, what: &'static str) {
        debug_assert!(false, "engine invariant violated: {what}");
        log::error!("engine invariant violated: {what}; stopping context");
        self.failed.store(true, Ordering::Release);
        self.shutting_down = true;
    }

    /// Apply everything queued from external threads.
    fn drain_commands(&mut self) {
        while let Some(cmd) = self.commands.pop() {
            match cmd {
                EngineCommand::AddSource(node) => {
                    if self.sources.len() == self.object_reserve {
                        self.fail("source reserve exhausted");
                    } else {
                        self.sources.push(node);
                    }
                }
                EngineCommand::RemoveSource(id) => {
                    if let Some(idx) = self.sources.iter().position(|s| s.id() == id) {
                        let mut node = self.sources.swap_remove(idx);
                        node.release_voice(&mut self.panners);
                        // Attached generators outlive their source; their
                        // handles may still be alive.
                        self.detached_generators.extend(node.take_generators());
                        self.router.remove_routes_for(id);
                    }
                }
                EngineCommand::AddEffect(entry) => {
                    if self.effects.len() == self.effect_reserve {
                        self.fail("effect reserve exhausted");
                    } else {
                        self.effects.push(entry);
                    }
                }
                EngineCommand::RemoveEffect(id) => {
                    if let Some(idx) = self.effects.iter().position(|e| e.id() == id) {
                        self.effects.swap_remove(idx);
                        self.router.remove_routes_for(id);
                    }
                }
                EngineCommand::RegisterGenerator(entry) => {
                    if self.detached_generators.len() == self.object_reserve {
                        self.fail("generator reserve exhausted");
                    } else {
                        self.detached_generators.push(entry);
                    }
                }
                EngineCommand::UnregisterGenerator(id) => {
                    if let Some(idx) = self.detached_generators.iter().position(|g| g.id() == id) {
                        self.detached_generators.swap_remove(idx);
                    } else {
                        for source in &mut self.sources {
                            if source.detach_generator(id).is_some() {
                                break;
                            }
                        }
                    }
                }
                EngineCommand::AttachGenerator { source, generator } => {
                    let Some(idx) = self
                        .detached_generators
                        .iter()
                        .position(|g| g.id() == generator)
                    else {
                        // Already attached somewhere or released; ignore.
                        log::debug!("attach of generator {generator} skipped: not detached");
                        continue;
                    };
                    if let Some(node) = self.sources.iter_mut().find(|s| s.id() == source) {
                        let entry = self.detached_generators.swap_remove(idx);
                        node.attach_generator(entry);
                    }
                }
                EngineCommand::DetachGenerator { source, generator } => {
                    if let Some(node) = self.sources.iter_mut().find(|s| s.id() == source) {
                        if let Some(entry) = node.detach_generator(generator) {
                            self.detached_generators.push(entry);
                        }
                    }
                }
                EngineCommand::SetGeneratorBuffer { generator, buffer } => {
                    if let Some(entry) = self.find_generator(generator) {
                        entry.node_mut().set_buffer(buffer);
                    }
                }
                EngineCommand::SetEchoTaps { effect, taps } => {
                    if let Some(entry) = self.effects.iter_mut().find(|e| e.id() == effect) {
                        entry.command(EffectNodeCommand::SetEchoTaps(taps));
                    }
                }
                EngineCommand::ConfigRoute {
                    source,
                    effect,
                    gain,
                    fade_time,
                } => {
                    let source_channels = self
                        .sources
                        .iter()
                        .find(|s| s.id() == source)
                        .map(|s| s.channels());
                    let effect_channels =
                        self.effects.iter().find(|e| e.id() == effect).map(|e| e.channels());
                    if let (Some(sc), Some(ec)) = (source_channels, effect_channels) {
                        if !self.router.config_route(source, effect, gain, fade_time, sc, ec) {
                            self.fail("route reserve exhausted");
                        }
                    }
                }
                EngineCommand::RemoveRoute {
                    source,
                    effect,
                    fade_time,
                } => {
                    self.router.remove_route(source, effect, fade_time);
                }
                EngineCommand::ScheduleAutomationEvent {
                    object,
                    time_samples,
                    param,
                } => {
                    if self.pending_automation.len() == AUTOMATION_RESERVE {
                        self.fail("automation marker reserve exhausted");
                    } else {
                        self.pending_automation.push(PendingAutomation {
                            time_samples,
                            object,
                            param,
                        });
                    }
                }
                EngineCommand::Shutdown => {
                    self.shutting_down = true;
                }
            }
        }
    }

    fn find_generator(&mut self, id: ObjectId) -> Option<&mut GeneratorEntry> {
        if let Some(idx) = self.detached_generators.iter().position(|g| g.id() == id) {
            return Some(&mut self.detached_generators[idx]);
        }
        for source in &mut self.sources {
            if source.has_generator(id) {
                return source.generator_mut(id);
            }
        }
        None
    }

    /// Produce one block into the master buffer.
    fn tick(&mut self) {
        // 1. Context properties and the listener frame for this tick.
        self.snapshot.drain(self.core.props());
        let props = self.core.props();
        if self.snapshot.changed(props, Property::Gain) {
            self.master_gain
                .set(self.snapshot.f64(props, Property::Gain) as f32);
        }
        let listener = Listener::new(
            self.snapshot.double3(props, Property::Position),
            self.snapshot.double6(props, Property::Orientation),
        );

        // 2. External mutations.
        self.drain_commands();

        // 3. Sources, including their routing contributions.
        self.master.fill(0.0);
        let EngineState {
            sources,
            effects,
            router,
            panners,
            cache,
            events,
            master,
            ..
        } = self;
        for source in sources.iter_mut() {
            let mut cx = SourceTickContext {
                cache: &*cache,
                events: &*events,
                panners: &mut *panners,
                router: &mut *router,
                effects: effects.as_mut_slice(),
                listener: &listener,
                master: master.as_mut_slice(),
            };
            source.tick(&mut cx);
        }

        // 4. Effects into the master; each zeroes its own input bus.
        for effect in effects.iter_mut() {
            effect.tick(master);
        }

        // 5. Fades advance; dead routes drop.
        router.finish_block();

        // 6. Context gain.
        self.master_gain.apply(&mut self.master, OUTPUT_CHANNELS);
        self.master_gain.settle();

        // 7. Engine clock and block-accurate automation markers: a marker
        // fires once the block containing its sample has been emitted.
        self.time_in_blocks += 1;
        let emitted = self.time_in_blocks * BLOCK_SIZE as u64;
        let events = &self.events;
        self.pending_automation.retain(|marker| {
            if marker.time_samples < emitted {
                events.send(
                    marker.object,
                    EventKind::UserAutomation {
                        param: marker.param,
                    },
                );
                false
            } else {
                true
            }
        });

        // A scratch acquisition past the reserve this tick is a sizing
        // invariant violation, even though the fallback kept audio going.
        if self.cache.overflowed() {
            self.fail("block buffer reserve exhausted");
        }
    }
}

fn audio_thread_main(
    mut state: EngineState,
    backend: Box<dyn AudioBackend>,
    tick_rx: flume::Receiver<()>,
    tick_tx: flume::Sender<()>,
    shutdown: Arc<AtomicBool>,
) {
    let ready: BlockReadyFn = Arc::new(move || {
        // A full tick channel means we are behind; the signal is not lost,
        // the backlog already encodes it.
        let _ = tick_tx.try_send(());
    });

    let mut started = match backend.start(SAMPLE_RATE, OUTPUT_CHANNELS, ready) {
        Ok(started) => started,
        Err(e) => {
            log::error!("audio backend failed to start: {e}");
            return;
        }
    };

    loop {
        match tick_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(()) => {
                state.tick();
                started.submit(&state.master);
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                // No block wanted; still service commands so shutdown and
                // object churn don't stall with a silent backend.
                state.drain_commands();
            }
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
        if state.shutting_down || shutdown.load(Ordering::Acquire) {
            break;
        }
    }

    started.stop();
    log::info!("audio thread exiting");
    // Dropping the state here pushes every node onto the deletion queue.
}

/// The root engine object.
///
/// Creating a context spawns its audio thread; dropping it shuts the
/// thread down. The context also carries the listener's position and
/// orientation and the master gain as properties.
pub struct Context {
    core: Shared<ObjectCore>,
    commands: CommandSender,
    events: EventReceiver,
    event_sender: EventSender,
    config: EngineConfig,
    shutdown: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl Context {
    /// Create a context producing audio through `backend`.
    pub fn new(backend: impl AudioBackend + 'static, config: EngineConfig) -> Result<Self> {
        let core = Shared::new(&deletion_handle(), ObjectCore::new(schema::CONTEXT));
        let (commands, command_rx) = command_channel();
        let (event_sender, events) = event_channel();
        let (tick_tx, tick_rx) = flume::bounded(64);
        let shutdown = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let state = EngineState::new(
            core.clone(),
            &config,
            event_sender.clone(),
            command_rx,
            failed.clone(),
        );
        let backend: Box<dyn AudioBackend> = Box::new(backend);
        let thread_shutdown = shutdown.clone();
        let audio_thread = thread::Builder::new()
            .name("synthizer-audio".to_string())
            .spawn(move || audio_thread_main(state, backend, tick_rx, tick_tx, thread_shutdown))
            .map_err(|e| Error::Backend(format!("failed to spawn audio thread: {e}")))?;

        log::info!("context {} created", core.id());
        Ok(Self {
            core,
            commands,
            events,
            event_sender,
            config,
            shutdown,
            failed,
            audio_thread: Some(audio_thread),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    /// True once an engine invariant violation stopped the audio thread.
    /// A failed context only answers property reads and event drains;
    /// everything else returns [`Error::InternalError`].
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_failed() {
            return Err(Error::InternalError("context is in a failed state"));
        }
        Ok(())
    }

    // --- Object creation ---

    pub fn new_direct_source(&self) -> Result<DirectSource> {
        self.ensure_live()?;
        DirectSource::create(self.commands.clone())
    }

    pub fn new_scalar_panned_source(&self) -> Result<ScalarPannedSource> {
        self.ensure_live()?;
        ScalarPannedSource::create(self.commands.clone())
    }

    pub fn new_angular_panned_source(&self) -> Result<AngularPannedSource> {
        self.ensure_live()?;
        AngularPannedSource::create(self.commands.clone())
    }

    pub fn new_source_3d(&self) -> Result<Source3D> {
        self.ensure_live()?;
        Source3D::create(self.commands.clone())
    }

    pub fn new_buffer_generator(&self) -> Result<BufferGenerator> {
        self.ensure_live()?;
        BufferGenerator::create(self.commands.clone())
    }

    pub fn new_streaming_generator(&self, decoder: Box<dyn Decoder>) -> Result<StreamingGenerator> {
        self.ensure_live()?;
        StreamingGenerator::create(
            self.commands.clone(),
            self.event_sender.clone(),
            decoder,
            self.config.stream_ring_blocks,
        )
    }

    pub fn new_noise_generator(&self) -> Result<NoiseGenerator> {
        self.ensure_live()?;
        NoiseGenerator::create(self.commands.clone())
    }

    pub fn new_sine_bank(&self, config: SineBankConfig, frequency: f64) -> Result<FastSineBank> {
        self.ensure_live()?;
        FastSineBank::create(self.commands.clone(), config, frequency)
    }

    pub fn new_echo(&self) -> Result<GlobalEcho> {
        self.ensure_live()?;
        GlobalEcho::create(self.commands.clone())
    }

    pub fn new_fdn_reverb(&self) -> Result<GlobalFdnReverb> {
        self.ensure_live()?;
        GlobalFdnReverb::create(self.commands.clone())
    }

    // --- Routing ---

    /// Create or update a route from `source` into `effect`.
    pub fn config_route(
        &self,
        source: &dyn RouteSource,
        effect: &dyn RouteTarget,
        gain: f64,
        fade_time: f64,
    ) -> Result<()> {
        self.ensure_live()?;
        if !(gain.is_finite() && gain >= 0.0) {
            return Err(Error::InvalidPropertyValue { tag: "route gain" });
        }
        if !(fade_time.is_finite() && fade_time >= 0.0) {
            return Err(Error::InvalidPropertyValue { tag: "route fade_time" });
        }
        self.commands.send(EngineCommand::ConfigRoute {
            source: source.route_source_id(),
            effect: effect.route_target_id(),
            gain,
            fade_time,
        })
    }

    /// Fade a route out over `fade_time` seconds and remove it.
    pub fn remove_route(
        &self,
        source: &dyn RouteSource,
        effect: &dyn RouteTarget,
        fade_time: f64,
    ) -> Result<()> {
        self.ensure_live()?;
        if !(fade_time.is_finite() && fade_time >= 0.0) {
            return Err(Error::InvalidPropertyValue { tag: "route fade_time" });
        }
        self.commands.send(EngineCommand::RemoveRoute {
            source: source.route_source_id(),
            effect: effect.route_target_id(),
            fade_time,
        })
    }

    // --- Automation markers ---

    /// Schedule a [`EventKind::UserAutomation`] event carrying `param` for
    /// when the engine clock reaches `time_seconds`. Delivery is
    /// block-accurate: the event posts once the block containing that
    /// time has been emitted. A time already in the past fires on the
    /// next block.
    pub fn schedule_user_automation(&self, time_seconds: f64, param: u64) -> Result<()> {
        self.ensure_live()?;
        if !(time_seconds.is_finite() && time_seconds >= 0.0) {
            return Err(Error::InvalidPropertyValue { tag: "automation time" });
        }
        self.commands.send(EngineCommand::ScheduleAutomationEvent {
            object: self.core.id(),
            time_samples: (time_seconds * SAMPLE_RATE as f64) as u64,
            param,
        })
    }

    // --- Events ---

    /// Pop the next pending engine event, if any.
    pub fn next_event(&self) -> Option<Event> {
        self.events.try_next()
    }

    // --- Listener / master properties ---

    pub fn gain(&self) -> Result<f64> {
        self.core.props().get_f64(Property::Gain)
    }

    pub fn set_gain(&self, gain: f64) -> Result<()> {
        self.core.props().set_f64(Property::Gain, gain)
    }

    pub fn position(&self) -> Result<[f64; 3]> {
        self.core.props().get_double3(Property::Position)
    }

    /// Move the listener.
    pub fn set_position(&self, position: [f64; 3]) -> Result<()> {
        self.core.props().set_double3(Property::Position, position)
    }

    pub fn orientation(&self) -> Result<[f64; 6]> {
        self.core.props().get_double6(Property::Orientation)
    }

    /// Set the listener's packed `(at, up)` orientation.
    pub fn set_orientation(&self, orientation: [f64; 6]) -> Result<()> {
        self.core
            .props()
            .set_double6(Property::Orientation, orientation)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.commands.send(EngineCommand::Shutdown);
        if let Some(handle) = self.audio_thread.take() {
            if handle.join().is_err() {
                log::error!("audio thread panicked during shutdown");
            }
        }
        log::info!("context {} destroyed", self.core.id());
    }
}
