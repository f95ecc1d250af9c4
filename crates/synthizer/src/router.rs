//! Source → effect routing
//!
//! Routes are directed edges from a source to a global effect, held in an
//! array kept sorted by `(source_id, effect_id)`. Each route carries a
//! gain envelope: configure starts a linear ramp toward the target gain,
//! removal fades to zero and then drops the route at end-of-tick.
//! The router only ever accumulates into effect input buses; zeroing them
//! is the effects' job after they run.
//!
//! All mutations arrive through the command queue, so everything here runs
//! on the audio thread.

use crate::channel_mixing::ChannelMatrix;
use crate::effects::EffectEntry;
use crate::gc::Owned;
use crate::types::{seconds_to_samples, ObjectId, Sample, BLOCK_SIZE};

/// Lifecycle of a route's gain envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    FadingIn,
    Steady,
    FadingOut,
    Dead,
}

/// One (source, effect) edge.
#[derive(Debug)]
struct Route {
    source: ObjectId,
    effect: ObjectId,
    state: RouteState,
    /// Gain at the start of the current block.
    current_gain: f32,
    target_gain: f32,
    samples_remaining_in_fade: usize,
    matrix: ChannelMatrix,
}

impl Route {
    /// Gain at frame `i` of the current block.
    #[inline]
    fn gain_at(&self, frame: usize) -> f32 {
        if self.samples_remaining_in_fade == 0 {
            return self.current_gain;
        }
        let progress = frame.min(self.samples_remaining_in_fade) as f32
            / self.samples_remaining_in_fade as f32;
        self.current_gain + (self.target_gain - self.current_gain) * progress
    }

    /// Advance the envelope by one block.
    fn finish_block(&mut self) {
        if self.samples_remaining_in_fade > 0 {
            let step = BLOCK_SIZE.min(self.samples_remaining_in_fade);
            self.current_gain = self.gain_at(step);
            self.samples_remaining_in_fade -= step;
        }
        if self.samples_remaining_in_fade == 0 {
            self.current_gain = self.target_gain;
            self.state = match self.state {
                RouteState::FadingOut | RouteState::Dead => RouteState::Dead,
                _ => RouteState::Steady,
            };
        }
    }
}

/// Convert a fade time to samples; a nonzero request shorter than one
/// block still fades across one block so the crossfade the caller asked
/// for actually happens.
fn fade_samples(fade_seconds: f64) -> usize {
    let samples = seconds_to_samples(fade_seconds);
    if fade_seconds > 0.0 && samples < BLOCK_SIZE {
        BLOCK_SIZE
    } else {
        samples
    }
}

/// The per-context route table.
pub struct Router {
    routes: Vec<Route>,
    reserve: usize,
}

impl Router {
    pub fn with_reserve(reserve: usize) -> Self {
        Self {
            routes: Vec::with_capacity(reserve),
            reserve,
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    fn position_of(&self, source: ObjectId, effect: ObjectId) -> Result<usize, usize> {
        self.routes
            .binary_search_by_key(&(source, effect), |r| (r.source, r.effect))
    }

    /// Create or update a route.
    ///
    /// New routes with a nonzero fade start silent and fade in; updates
    /// keep the current gain and ramp toward the new target. Returns
    /// `false` when a new route would exceed the reserve; the caller
    /// treats that as an invariant failure.
    pub fn config_route(
        &mut self,
        source: ObjectId,
        effect: ObjectId,
        gain: f64,
        fade_seconds: f64,
        source_channels: usize,
        effect_channels: usize,
    ) -> bool {
        let fade = fade_samples(fade_seconds);
        let gain = gain as f32;
        match self.position_of(source, effect) {
            Ok(idx) => {
                let route = &mut self.routes[idx];
                route.target_gain = gain;
                route.samples_remaining_in_fade = fade;
                if fade == 0 {
                    route.current_gain = gain;
                }
                route.state = RouteState::Steady;
                route.matrix = ChannelMatrix::new(source_channels, effect_channels);
            }
            Err(idx) => {
                if self.routes.len() == self.reserve {
                    return false;
                }
                let (state, current) = if fade > 0 {
                    (RouteState::FadingIn, 0.0)
                } else {
                    (RouteState::Steady, gain)
                };
                self.routes.insert(
                    idx,
                    Route {
                        source,
                        effect,
                        state,
                        current_gain: current,
                        target_gain: gain,
                        samples_remaining_in_fade: fade,
                        matrix: ChannelMatrix::new(source_channels, effect_channels),
                    },
                );
            }
        }
        true
    }

    /// Begin fading a route out; it dies when the fade lands at zero.
    pub fn remove_route(&mut self, source: ObjectId, effect: ObjectId, fade_seconds: f64) {
        if let Ok(idx) = self.position_of(source, effect) {
            let route = &mut self.routes[idx];
            let fade = fade_samples(fade_seconds);
            route.target_gain = 0.0;
            route.samples_remaining_in_fade = fade;
            if fade == 0 {
                route.current_gain = 0.0;
                route.state = RouteState::Dead;
            } else {
                route.state = RouteState::FadingOut;
            }
        }
    }

    /// Drop every route touching a released endpoint, immediately.
    pub fn remove_routes_for(&mut self, endpoint: ObjectId) {
        self.routes
            .retain(|r| r.source != endpoint && r.effect != endpoint);
    }

    /// Mix one source's block into the input buses of every effect it
    /// routes to, applying the per-sample fade ramp and the cached channel
    /// matrix.
    pub fn contribute(
        &mut self,
        source: ObjectId,
        source_bus: &[Sample],
        source_channels: usize,
        effects: &mut [Owned<EffectEntry>],
    ) {
        // Find the start of this source's run in the sorted table.
        let start = self
            .routes
            .partition_point(|r| (r.source, r.effect) < (source, ObjectId(0)));

        for route in self.routes[start..]
            .iter_mut()
            .take_while(|r| r.source == source)
        {
            if route.state == RouteState::Dead {
                continue;
            }
            let Some(entry) = effects.iter_mut().find(|e| e.id() == route.effect) else {
                continue;
            };

            // A generator change can alter the source channel count after
            // the route was configured; rebuild the matrix on mismatch.
            if route.matrix.in_channels() != source_channels
                || route.matrix.out_channels() != entry.channels()
            {
                route.matrix = ChannelMatrix::new(source_channels, entry.channels());
            }

            let r = &*route;
            r.matrix.mix_into_with_gain(
                BLOCK_SIZE,
                source_bus,
                entry.input_bus_mut(),
                |frame| r.gain_at(frame),
            );
        }
    }

    /// Advance fades and drop dead routes. Call once per tick, after all
    /// sources have contributed.
    pub fn finish_block(&mut self) {
        for route in &mut self.routes {
            route.finish_block();
        }
        self.routes.retain(|r| r.state != RouteState::Dead);
    }

    #[cfg(test)]
    fn gain_of(&self, source: ObjectId, effect: ObjectId) -> Option<f32> {
        self.position_of(source, effect)
            .ok()
            .map(|i| self.routes[i].current_gain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SAMPLE_RATE;

    fn ids() -> (ObjectId, ObjectId) {
        (ObjectId::next(), ObjectId::next())
    }

    #[test]
    fn test_new_route_with_fade_starts_silent() {
        let (s, e) = ids();
        let mut router = Router::with_reserve(8);
        router.config_route(s, e, 1.0, 1.0, 1, 1);
        assert_eq!(router.gain_of(s, e), Some(0.0));
    }

    #[test]
    fn test_new_route_without_fade_starts_at_gain() {
        let (s, e) = ids();
        let mut router = Router::with_reserve(8);
        router.config_route(s, e, 0.8, 0.0, 1, 1);
        assert_eq!(router.gain_of(s, e), Some(0.8));
    }

    #[test]
    fn test_fade_reaches_target_monotonically() {
        let (s, e) = ids();
        let mut router = Router::with_reserve(8);
        let fade_seconds = 0.1;
        router.config_route(s, e, 1.0, fade_seconds, 1, 1);

        let blocks = seconds_to_samples(fade_seconds).div_ceil(BLOCK_SIZE);
        let mut last = -1.0f32;
        for _ in 0..blocks {
            let g = router.gain_of(s, e).unwrap();
            assert!(g >= last, "fade went backwards: {last} -> {g}");
            last = g;
            router.finish_block();
        }
        assert_eq!(router.gain_of(s, e), Some(1.0));
    }

    #[test]
    fn test_subblock_fade_rounds_up_to_one_block() {
        let (s, e) = ids();
        let mut router = Router::with_reserve(8);
        // Less than a block at the engine rate.
        router.config_route(s, e, 1.0, 1.0 / SAMPLE_RATE as f64, 1, 1);
        assert_eq!(router.gain_of(s, e), Some(0.0));
        router.finish_block();
        assert_eq!(router.gain_of(s, e), Some(1.0));
    }

    #[test]
    fn test_remove_with_fade_then_dies() {
        let (s, e) = ids();
        let mut router = Router::with_reserve(8);
        router.config_route(s, e, 1.0, 0.0, 1, 1);
        let fade_blocks = 4;
        router.remove_route(s, e, fade_blocks as f64 * BLOCK_SIZE as f64 / SAMPLE_RATE as f64);

        for _ in 0..fade_blocks {
            assert_eq!(router.route_count(), 1);
            router.finish_block();
        }
        assert_eq!(router.route_count(), 0);
    }

    #[test]
    fn test_remove_without_fade_is_immediate() {
        let (s, e) = ids();
        let mut router = Router::with_reserve(8);
        router.config_route(s, e, 1.0, 0.0, 1, 1);
        router.remove_route(s, e, 0.0);
        router.finish_block();
        assert_eq!(router.route_count(), 0);
    }

    #[test]
    fn test_reserve_rejects_new_routes() {
        let (s, e) = ids();
        let (s2, e2) = ids();
        let mut router = Router::with_reserve(1);
        assert!(router.config_route(s, e, 1.0, 0.0, 1, 1));
        // Updating the existing route is fine at capacity.
        assert!(router.config_route(s, e, 0.5, 0.0, 1, 1));
        // A second route does not fit.
        assert!(!router.config_route(s2, e2, 1.0, 0.0, 1, 1));
        assert_eq!(router.route_count(), 1);
    }

    #[test]
    fn test_endpoint_release_tears_down() {
        let (s, e) = ids();
        let (s2, e2) = ids();
        let mut router = Router::with_reserve(8);
        router.config_route(s, e, 1.0, 0.0, 1, 1);
        router.config_route(s2, e, 1.0, 0.0, 1, 1);
        router.config_route(s2, e2, 1.0, 0.0, 1, 1);

        router.remove_routes_for(e);
        assert_eq!(router.route_count(), 1);
        router.remove_routes_for(s2);
        assert_eq!(router.route_count(), 0);
    }

    #[test]
    fn test_gain_at_midpoint_of_fade() {
        let (s, e) = ids();
        let mut router = Router::with_reserve(8);
        // Fade over exactly two blocks.
        let fade = 2.0 * BLOCK_SIZE as f64 / SAMPLE_RATE as f64;
        router.config_route(s, e, 1.0, fade, 1, 1);
        router.finish_block();
        let mid = router.gain_of(s, e).unwrap();
        assert!((mid - 0.5).abs() < 1e-3, "midpoint gain {mid}");
    }
}
