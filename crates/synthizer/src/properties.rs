//! Cross-thread property protocol
//!
//! Every externally visible object carries a block of typed properties
//! addressed by [`Property`] tags. Each property lives in three places:
//!
//! - a bounded per-object write queue, drained once at the start of each
//!   audio tick, after which the audio-thread snapshot is authoritative
//!   for that tick;
//! - a shadow slot readable from any thread with a seqlock, so `get`
//!   never blocks on the audio thread;
//! - the audio-thread snapshot itself, owned by the node that ticks.
//!
//! Writes take a per-object serial before they are enqueued; both the
//! shadow slot and the drain apply writes in serial order, so concurrent
//! setters linearize at serial acquisition and a thread always reads its
//! own latest write back. Audio-thread publishes (playback position and
//! friends) reuse the serial of the last applied external write, which
//! makes external writes win at the next tick boundary.
//!
//! Object schemas are static tables of `(tag, kind, default, validator)`;
//! generic set/get operates on the table, so adding a property to a type
//! is one table row.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

use crate::error::{Error, Result};
use crate::filters::BiquadConfig;
use crate::types::ObjectId;

/// Capacity of each object's pending-write queue.
const WRITE_QUEUE_CAPACITY: usize = 128;

/// Property tags. A given object type accepts the subset listed in its
/// schema table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    Gain,
    PitchBend,
    Looping,
    PlaybackPosition,
    Position,
    Orientation,
    Filter,
    FilterInput,
    PanningScalar,
    Azimuth,
    Elevation,
    DistanceModel,
    DistanceRef,
    DistanceMax,
    Rolloff,
    Frequency,
    NoiseType,
    T60,
    MeanFreePath,
    LateReflectionsLfRolloff,
}

impl Property {
    pub fn name(&self) -> &'static str {
        match self {
            Property::Gain => "gain",
            Property::PitchBend => "pitch_bend",
            Property::Looping => "looping",
            Property::PlaybackPosition => "playback_position",
            Property::Position => "position",
            Property::Orientation => "orientation",
            Property::Filter => "filter",
            Property::FilterInput => "filter_input",
            Property::PanningScalar => "panning_scalar",
            Property::Azimuth => "azimuth",
            Property::Elevation => "elevation",
            Property::DistanceModel => "distance_model",
            Property::DistanceRef => "distance_ref",
            Property::DistanceMax => "distance_max",
            Property::Rolloff => "rolloff",
            Property::Frequency => "frequency",
            Property::NoiseType => "noise_type",
            Property::T60 => "t60",
            Property::MeanFreePath => "mean_free_path",
            Property::LateReflectionsLfRolloff => "late_reflections_lf_rolloff",
        }
    }
}

/// The type of a property slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    F64,
    I64,
    Bool,
    Double3,
    Double6,
    Biquad,
}

/// A property value. Fixed-size union so queue entries never allocate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    F64(f64),
    I64(i64),
    Bool(bool),
    Double3([f64; 3]),
    Double6([f64; 6]),
    Biquad(BiquadConfig),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::F64(_) => PropertyKind::F64,
            PropertyValue::I64(_) => PropertyKind::I64,
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::Double3(_) => PropertyKind::Double3,
            PropertyValue::Double6(_) => PropertyKind::Double6,
            PropertyValue::Biquad(_) => PropertyKind::Biquad,
        }
    }

    fn encode(&self) -> [u64; 6] {
        let mut words = [0u64; 6];
        match *self {
            PropertyValue::F64(v) => words[0] = v.to_bits(),
            PropertyValue::I64(v) => words[0] = v as u64,
            PropertyValue::Bool(v) => words[0] = v as u64,
            PropertyValue::Double3(v) => {
                for (w, x) in words.iter_mut().zip(v.iter()) {
                    *w = x.to_bits();
                }
            }
            PropertyValue::Double6(v) => {
                for (w, x) in words.iter_mut().zip(v.iter()) {
                    *w = x.to_bits();
                }
            }
            PropertyValue::Biquad(c) => {
                words = [
                    c.b0.to_bits(),
                    c.b1.to_bits(),
                    c.b2.to_bits(),
                    c.a1.to_bits(),
                    c.a2.to_bits(),
                    c.gain.to_bits(),
                ];
            }
        }
        words
    }

    fn decode(kind: PropertyKind, words: [u64; 6]) -> PropertyValue {
        match kind {
            PropertyKind::F64 => PropertyValue::F64(f64::from_bits(words[0])),
            PropertyKind::I64 => PropertyValue::I64(words[0] as i64),
            PropertyKind::Bool => PropertyValue::Bool(words[0] != 0),
            PropertyKind::Double3 => PropertyValue::Double3([
                f64::from_bits(words[0]),
                f64::from_bits(words[1]),
                f64::from_bits(words[2]),
            ]),
            PropertyKind::Double6 => {
                let mut v = [0.0; 6];
                for (x, w) in v.iter_mut().zip(words.iter()) {
                    *x = f64::from_bits(*w);
                }
                PropertyValue::Double6(v)
            }
            PropertyKind::Biquad => PropertyValue::Biquad(BiquadConfig {
                b0: f64::from_bits(words[0]),
                b1: f64::from_bits(words[1]),
                b2: f64::from_bits(words[2]),
                a1: f64::from_bits(words[3]),
                a2: f64::from_bits(words[4]),
                gain: f64::from_bits(words[5]),
            }),
        }
    }
}

/// Validation callback run on the setting thread.
pub type Validator = fn(&PropertyValue) -> bool;

/// One row of an object type's property schema.
pub struct PropertyDef {
    pub tag: Property,
    pub kind: PropertyKind,
    pub default: PropertyValue,
    pub validator: Validator,
}

/// Shadow storage for one property: up to six words plus a seqlock and the
/// serial of the last committed write.
///
/// Writers (external setters and the end-of-tick publish) serialize on a
/// short spin flag; the critical section is a handful of stores. Readers
/// never write and retry on a torn read.
struct ShadowSlot {
    seq: AtomicU64,
    serial: AtomicU64,
    write_flag: AtomicBool,
    words: [AtomicU64; 6],
}

impl ShadowSlot {
    fn new(initial: [u64; 6]) -> Self {
        Self {
            seq: AtomicU64::new(0),
            serial: AtomicU64::new(0),
            write_flag: AtomicBool::new(false),
            words: initial.map(AtomicU64::new),
        }
    }

    /// Commit `words` if `serial` is newer than the slot's. With
    /// `allow_equal`, an equal serial also commits (the audio thread
    /// republishing a value it owns).
    fn write(&self, serial: u64, words: [u64; 6], allow_equal: bool) {
        while self.write_flag.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        let current = self.serial.load(Ordering::Relaxed);
        let newer = serial > current || (allow_equal && serial == current);
        if newer {
            self.seq.fetch_add(1, Ordering::Release);
            for (slot, w) in self.words.iter().zip(words.iter()) {
                slot.store(*w, Ordering::Relaxed);
            }
            self.seq.fetch_add(1, Ordering::Release);
            self.serial.store(serial, Ordering::Relaxed);
        }
        self.write_flag.store(false, Ordering::Release);
    }

    fn read(&self) -> [u64; 6] {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let mut words = [0u64; 6];
            for (w, slot) in words.iter_mut().zip(self.words.iter()) {
                *w = slot.load(Ordering::Acquire);
            }
            if self.seq.load(Ordering::Acquire) == before {
                return words;
            }
        }
    }
}

/// A pending external write.
pub struct PropertyWrite {
    index: usize,
    serial: u64,
    value: PropertyValue,
}

/// The shared, thread-safe half of an object's properties.
pub struct PropertyBlock {
    defs: &'static [PropertyDef],
    shadow: Box<[ShadowSlot]>,
    queue: ArrayQueue<PropertyWrite>,
    next_serial: AtomicU64,
}

impl PropertyBlock {
    pub fn new(defs: &'static [PropertyDef]) -> Self {
        assert!(defs.len() <= 64, "property schema exceeds changed-bitmask width");
        let shadow = defs
            .iter()
            .map(|d| ShadowSlot::new(d.default.encode()))
            .collect();
        Self {
            defs,
            shadow,
            queue: ArrayQueue::new(WRITE_QUEUE_CAPACITY),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn defs(&self) -> &'static [PropertyDef] {
        self.defs
    }

    fn index_of(&self, tag: Property) -> Option<usize> {
        self.defs.iter().position(|d| d.tag == tag)
    }

    /// Validate and issue a write from any thread.
    ///
    /// On success the value is visible to `get` immediately and to the
    /// audio thread at the next tick boundary. Queue exhaustion (an
    /// unserviced burst of more writes than the pre-allocated pool) is
    /// reported as `ResourceExhausted` and the write is not issued.
    pub fn set(&self, tag: Property, value: PropertyValue) -> Result<()> {
        let index = self.index_of(tag).ok_or(Error::UnknownProperty { tag: tag.name() })?;
        let def = &self.defs[index];
        if def.kind != value.kind() {
            return Err(Error::PropertyTypeMismatch {
                tag: tag.name(),
                expected: def.kind,
                got: value.kind(),
            });
        }
        if !(def.validator)(&value) {
            return Err(Error::InvalidPropertyValue { tag: tag.name() });
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        self.queue
            .push(PropertyWrite { index, serial, value })
            .map_err(|_| Error::ResourceExhausted("property write queue full"))?;
        self.shadow[index].write(serial, value.encode(), false);
        Ok(())
    }

    /// Read the current externally visible value.
    pub fn get(&self, tag: Property) -> Result<PropertyValue> {
        let index = self.index_of(tag).ok_or(Error::UnknownProperty { tag: tag.name() })?;
        let words = self.shadow[index].read();
        Ok(PropertyValue::decode(self.defs[index].kind, words))
    }

    // Typed conveniences used by the handle types.

    pub fn set_f64(&self, tag: Property, v: f64) -> Result<()> {
        self.set(tag, PropertyValue::F64(v))
    }

    pub fn get_f64(&self, tag: Property) -> Result<f64> {
        match self.get(tag)? {
            PropertyValue::F64(v) => Ok(v),
            other => Err(Error::PropertyTypeMismatch {
                tag: tag.name(),
                expected: PropertyKind::F64,
                got: other.kind(),
            }),
        }
    }

    pub fn set_i64(&self, tag: Property, v: i64) -> Result<()> {
        self.set(tag, PropertyValue::I64(v))
    }

    pub fn get_i64(&self, tag: Property) -> Result<i64> {
        match self.get(tag)? {
            PropertyValue::I64(v) => Ok(v),
            other => Err(Error::PropertyTypeMismatch {
                tag: tag.name(),
                expected: PropertyKind::I64,
                got: other.kind(),
            }),
        }
    }

    pub fn set_bool(&self, tag: Property, v: bool) -> Result<()> {
        self.set(tag, PropertyValue::Bool(v))
    }

    pub fn get_bool(&self, tag: Property) -> Result<bool> {
        match self.get(tag)? {
            PropertyValue::Bool(v) => Ok(v),
            other => Err(Error::PropertyTypeMismatch {
                tag: tag.name(),
                expected: PropertyKind::Bool,
                got: other.kind(),
            }),
        }
    }

    pub fn set_double3(&self, tag: Property, v: [f64; 3]) -> Result<()> {
        self.set(tag, PropertyValue::Double3(v))
    }

    pub fn get_double3(&self, tag: Property) -> Result<[f64; 3]> {
        match self.get(tag)? {
            PropertyValue::Double3(v) => Ok(v),
            other => Err(Error::PropertyTypeMismatch {
                tag: tag.name(),
                expected: PropertyKind::Double3,
                got: other.kind(),
            }),
        }
    }

    pub fn set_double6(&self, tag: Property, v: [f64; 6]) -> Result<()> {
        self.set(tag, PropertyValue::Double6(v))
    }

    pub fn get_double6(&self, tag: Property) -> Result<[f64; 6]> {
        match self.get(tag)? {
            PropertyValue::Double6(v) => Ok(v),
            other => Err(Error::PropertyTypeMismatch {
                tag: tag.name(),
                expected: PropertyKind::Double6,
                got: other.kind(),
            }),
        }
    }

    pub fn set_biquad(&self, tag: Property, v: BiquadConfig) -> Result<()> {
        self.set(tag, PropertyValue::Biquad(v))
    }

    pub fn get_biquad(&self, tag: Property) -> Result<BiquadConfig> {
        match self.get(tag)? {
            PropertyValue::Biquad(v) => Ok(v),
            other => Err(Error::PropertyTypeMismatch {
                tag: tag.name(),
                expected: PropertyKind::Biquad,
                got: other.kind(),
            }),
        }
    }
}

/// The audio-thread view: values drained from the queue, stable within a
/// tick, with a changed-bitmask per drain.
pub struct PropertySnapshot {
    values: Vec<PropertyValue>,
    serials: Vec<u64>,
    changed: u64,
}

impl PropertySnapshot {
    pub fn new(block: &PropertyBlock) -> Self {
        Self {
            values: block.defs.iter().map(|d| d.default).collect(),
            serials: vec![0; block.defs.len()],
            changed: 0,
        }
    }

    /// Drain pending writes at tick start. Serial order keeps concurrent
    /// setters coherent: a write that lost the serial race never clobbers
    /// a newer one.
    pub fn drain(&mut self, block: &PropertyBlock) {
        self.changed = 0;
        while let Some(write) = block.queue.pop() {
            if write.serial > self.serials[write.index] {
                self.serials[write.index] = write.serial;
                self.values[write.index] = write.value;
                self.changed |= 1 << write.index;
            }
        }
    }

    fn index_of(&self, block: &PropertyBlock, tag: Property) -> usize {
        block
            .index_of(tag)
            .expect("audio thread read of a property missing from the schema")
    }

    /// True if the last drain changed `tag`.
    pub fn changed(&self, block: &PropertyBlock, tag: Property) -> bool {
        self.changed & (1 << self.index_of(block, tag)) != 0
    }

    pub fn get(&self, block: &PropertyBlock, tag: Property) -> PropertyValue {
        self.values[self.index_of(block, tag)]
    }

    pub fn f64(&self, block: &PropertyBlock, tag: Property) -> f64 {
        match self.get(block, tag) {
            PropertyValue::F64(v) => v,
            _ => unreachable!("schema kind mismatch"),
        }
    }

    pub fn i64(&self, block: &PropertyBlock, tag: Property) -> i64 {
        match self.get(block, tag) {
            PropertyValue::I64(v) => v,
            _ => unreachable!("schema kind mismatch"),
        }
    }

    pub fn bool(&self, block: &PropertyBlock, tag: Property) -> bool {
        match self.get(block, tag) {
            PropertyValue::Bool(v) => v,
            _ => unreachable!("schema kind mismatch"),
        }
    }

    pub fn double3(&self, block: &PropertyBlock, tag: Property) -> [f64; 3] {
        match self.get(block, tag) {
            PropertyValue::Double3(v) => v,
            _ => unreachable!("schema kind mismatch"),
        }
    }

    pub fn double6(&self, block: &PropertyBlock, tag: Property) -> [f64; 6] {
        match self.get(block, tag) {
            PropertyValue::Double6(v) => v,
            _ => unreachable!("schema kind mismatch"),
        }
    }

    pub fn biquad(&self, block: &PropertyBlock, tag: Property) -> BiquadConfig {
        match self.get(block, tag) {
            PropertyValue::Biquad(v) => v,
            _ => unreachable!("schema kind mismatch"),
        }
    }

    /// Publish an audio-thread-owned value (e.g. playback position) to the
    /// shadow slot at end-of-tick. Reuses the serial of the last applied
    /// external write so any not-yet-drained external set still wins.
    pub fn publish(&mut self, block: &PropertyBlock, tag: Property, value: PropertyValue) {
        let index = self.index_of(block, tag);
        debug_assert_eq!(block.defs[index].kind, value.kind());
        self.values[index] = value;
        block.shadow[index].write(self.serials[index], value.encode(), true);
    }
}

/// Shared identity + properties for every engine object.
pub struct ObjectCore {
    id: ObjectId,
    props: PropertyBlock,
}

impl ObjectCore {
    pub fn new(defs: &'static [PropertyDef]) -> Self {
        Self {
            id: ObjectId::next(),
            props: PropertyBlock::new(defs),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn props(&self) -> &PropertyBlock {
        &self.props
    }
}

// --- Validators ---

pub fn v_any(_: &PropertyValue) -> bool {
    true
}

pub fn v_non_negative(v: &PropertyValue) -> bool {
    matches!(v, PropertyValue::F64(x) if *x >= 0.0 && x.is_finite())
}

pub fn v_positive(v: &PropertyValue) -> bool {
    matches!(v, PropertyValue::F64(x) if *x > 0.0 && x.is_finite())
}

pub fn v_unit_scalar(v: &PropertyValue) -> bool {
    matches!(v, PropertyValue::F64(x) if (-1.0..=1.0).contains(x))
}

pub fn v_finite3(v: &PropertyValue) -> bool {
    matches!(v, PropertyValue::Double3(x) if x.iter().all(|c| c.is_finite()))
}

/// Orientation is two unit-ish vectors (at, up); both must be nonzero.
pub fn v_orientation(v: &PropertyValue) -> bool {
    match v {
        PropertyValue::Double6(x) => {
            let at = x[0] * x[0] + x[1] * x[1] + x[2] * x[2];
            let up = x[3] * x[3] + x[4] * x[4] + x[5] * x[5];
            x.iter().all(|c| c.is_finite()) && at > 0.0 && up > 0.0
        }
        _ => false,
    }
}

pub fn v_distance_model(v: &PropertyValue) -> bool {
    matches!(v, PropertyValue::I64(x) if (0..=2).contains(x))
}

pub fn v_noise_type(v: &PropertyValue) -> bool {
    matches!(v, PropertyValue::I64(x) if (0..=2).contains(x))
}

// --- Schema tables ---

/// Per-object-type property schemas.
pub mod schema {
    use super::*;

    const IDENTITY: BiquadConfig = BiquadConfig {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
        gain: 1.0,
    };

    const DEFAULT_ORIENTATION: [f64; 6] = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

    macro_rules! def {
        ($tag:ident, F64, $default:expr, $validator:ident) => {
            PropertyDef {
                tag: Property::$tag,
                kind: PropertyKind::F64,
                default: PropertyValue::F64($default),
                validator: $validator,
            }
        };
        ($tag:ident, I64, $default:expr, $validator:ident) => {
            PropertyDef {
                tag: Property::$tag,
                kind: PropertyKind::I64,
                default: PropertyValue::I64($default),
                validator: $validator,
            }
        };
        ($tag:ident, Bool, $default:expr, $validator:ident) => {
            PropertyDef {
                tag: Property::$tag,
                kind: PropertyKind::Bool,
                default: PropertyValue::Bool($default),
                validator: $validator,
            }
        };
        ($tag:ident, Double3, $default:expr, $validator:ident) => {
            PropertyDef {
                tag: Property::$tag,
                kind: PropertyKind::Double3,
                default: PropertyValue::Double3($default),
                validator: $validator,
            }
        };
        ($tag:ident, Double6, $default:expr, $validator:ident) => {
            PropertyDef {
                tag: Property::$tag,
                kind: PropertyKind::Double6,
                default: PropertyValue::Double6($default),
                validator: $validator,
            }
        };
        ($tag:ident, Biquad, $default:expr, $validator:ident) => {
            PropertyDef {
                tag: Property::$tag,
                kind: PropertyKind::Biquad,
                default: PropertyValue::Biquad($default),
                validator: $validator,
            }
        };
    }

    pub static CONTEXT: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(Position, Double3, [0.0; 3], v_finite3),
        def!(Orientation, Double6, DEFAULT_ORIENTATION, v_orientation),
    ];

    pub static DIRECT_SOURCE: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(Filter, Biquad, IDENTITY, v_any),
    ];

    pub static SCALAR_PANNED_SOURCE: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(Filter, Biquad, IDENTITY, v_any),
        def!(PanningScalar, F64, 0.0, v_unit_scalar),
    ];

    pub static ANGULAR_PANNED_SOURCE: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(Filter, Biquad, IDENTITY, v_any),
        def!(Azimuth, F64, 0.0, v_any),
        def!(Elevation, F64, 0.0, v_any),
    ];

    pub static SOURCE_3D: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(Filter, Biquad, IDENTITY, v_any),
        def!(Position, Double3, [0.0; 3], v_finite3),
        def!(Orientation, Double6, DEFAULT_ORIENTATION, v_orientation),
        def!(DistanceModel, I64, 0, v_distance_model),
        def!(DistanceRef, F64, 1.0, v_positive),
        def!(DistanceMax, F64, 50.0, v_positive),
        def!(Rolloff, F64, 1.0, v_non_negative),
    ];

    pub static BUFFER_GENERATOR: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(PitchBend, F64, 1.0, v_positive),
        def!(Looping, Bool, false, v_any),
        def!(PlaybackPosition, F64, 0.0, v_non_negative),
    ];

    pub static STREAMING_GENERATOR: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(Looping, Bool, false, v_any),
    ];

    pub static NOISE_GENERATOR: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(NoiseType, I64, 0, v_noise_type),
    ];

    pub static SINE_BANK_GENERATOR: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(Frequency, F64, 440.0, v_positive),
    ];

    pub static ECHO_EFFECT: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(FilterInput, Biquad, IDENTITY, v_any),
    ];

    pub static REVERB_EFFECT: &[PropertyDef] = &[
        def!(Gain, F64, 1.0, v_non_negative),
        def!(FilterInput, Biquad, IDENTITY, v_any),
        def!(T60, F64, 1.0, v_positive),
        def!(MeanFreePath, F64, 0.1, v_positive),
        def!(LateReflectionsLfRolloff, F64, 1.0, v_non_negative),
    ];
}
