//! Panner voice pools
//!
//! Spatialized sources borrow a voice from a bounded pool allocated at
//! context startup. Acquisition happens on the audio thread the first
//! time a source needs to spatialize, so it must not allocate; the pools
//! are plain pre-built vectors with free lists. When a pool is exhausted
//! the source falls back to direct mixing and the bank logs once.

pub mod hrtf;
pub mod stereo;

pub use hrtf::{HrtfPanner, IR_LENGTH};
pub use stereo::StereoPanner;

/// Which pool a voice came from, plus its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceHandle {
    Stereo(usize),
    Hrtf(usize),
}

/// Fixed pools of spatialization voices.
pub struct PannerBank {
    stereo: Vec<StereoPanner>,
    stereo_free: Vec<usize>,
    hrtf: Vec<HrtfPanner>,
    hrtf_free: Vec<usize>,
    exhaustion_logged: bool,
}

impl PannerBank {
    pub fn new(stereo_voices: usize, hrtf_voices: usize) -> Self {
        Self {
            stereo: (0..stereo_voices).map(|_| StereoPanner::new()).collect(),
            stereo_free: (0..stereo_voices).rev().collect(),
            hrtf: (0..hrtf_voices).map(|_| HrtfPanner::new()).collect(),
            hrtf_free: (0..hrtf_voices).rev().collect(),
            exhaustion_logged: false,
        }
    }

    /// Borrow a stereo voice, or `None` when the pool is dry.
    pub fn acquire_stereo(&mut self) -> Option<VoiceHandle> {
        match self.stereo_free.pop() {
            Some(slot) => {
                self.stereo[slot].reset();
                Some(VoiceHandle::Stereo(slot))
            }
            None => {
                self.log_exhaustion("stereo");
                None
            }
        }
    }

    /// Borrow an HRTF voice, or `None` when the pool is dry.
    pub fn acquire_hrtf(&mut self) -> Option<VoiceHandle> {
        match self.hrtf_free.pop() {
            Some(slot) => {
                self.hrtf[slot].reset();
                Some(VoiceHandle::Hrtf(slot))
            }
            None => {
                self.log_exhaustion("HRTF");
                None
            }
        }
    }

    /// Return a voice to its pool.
    pub fn release(&mut self, handle: VoiceHandle) {
        match handle {
            VoiceHandle::Stereo(slot) => self.stereo_free.push(slot),
            VoiceHandle::Hrtf(slot) => self.hrtf_free.push(slot),
        }
    }

    pub fn stereo_voice(&mut self, handle: VoiceHandle) -> &mut StereoPanner {
        match handle {
            VoiceHandle::Stereo(slot) => &mut self.stereo[slot],
            VoiceHandle::Hrtf(_) => panic!("stereo voice requested with an HRTF handle"),
        }
    }

    pub fn hrtf_voice(&mut self, handle: VoiceHandle) -> &mut HrtfPanner {
        match handle {
            VoiceHandle::Hrtf(slot) => &mut self.hrtf[slot],
            VoiceHandle::Stereo(_) => panic!("HRTF voice requested with a stereo handle"),
        }
    }

    pub fn free_stereo(&self) -> usize {
        self.stereo_free.len()
    }

    pub fn free_hrtf(&self) -> usize {
        self.hrtf_free.len()
    }

    fn log_exhaustion(&mut self, pool: &str) {
        if !self.exhaustion_logged {
            log::warn!("{pool} panner pool exhausted; sources fall back to direct mixing");
            self.exhaustion_logged = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycles() {
        let mut bank = PannerBank::new(2, 1);
        let a = bank.acquire_stereo().unwrap();
        let b = bank.acquire_stereo().unwrap();
        assert!(bank.acquire_stereo().is_none());

        bank.release(a);
        let c = bank.acquire_stereo().unwrap();
        bank.release(b);
        bank.release(c);
        assert_eq!(bank.free_stereo(), 2);
    }

    #[test]
    fn test_hrtf_pool_bounded() {
        let mut bank = PannerBank::new(0, 1);
        let v = bank.acquire_hrtf().unwrap();
        assert!(bank.acquire_hrtf().is_none());
        bank.release(v);
        assert_eq!(bank.free_hrtf(), 1);
    }

    #[test]
    fn test_voice_lookup_matches_handle() {
        let mut bank = PannerBank::new(1, 1);
        let s = bank.acquire_stereo().unwrap();
        let h = bank.acquire_hrtf().unwrap();
        // Both resolve without panicking.
        bank.stereo_voice(s).set_pan(0.5);
        let _ = bank.hrtf_voice(h);
    }
}
