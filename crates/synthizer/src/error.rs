//! Engine error types

use thiserror::Error;

use crate::properties::PropertyKind;

/// Errors surfaced by the public API.
///
/// The audio thread never reports errors synchronously; it degrades
/// (silence on underflow, skip on missing voice) or posts an event.
/// External calls report validation failures immediately and enqueue the
/// rest, so most of these fire on the calling thread.
#[derive(Error, Debug)]
pub enum Error {
    /// The referenced object was released or never existed
    #[error("invalid handle: object {0} is closed or unknown")]
    InvalidHandle(crate::types::ObjectId),

    /// Property tag not valid for this object type
    #[error("unknown property {tag:?} for this object")]
    UnknownProperty { tag: &'static str },

    /// Property exists but the value has the wrong type
    #[error("property {tag:?} expects {expected:?}, got {got:?}")]
    PropertyTypeMismatch {
        tag: &'static str,
        expected: PropertyKind,
        got: PropertyKind,
    },

    /// Value failed the property's validator
    #[error("invalid value for property {tag:?}")]
    InvalidPropertyValue { tag: &'static str },

    /// A bounded resource (panner voice, queue slot, ring space) ran out
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A decoder failed; the stream degrades to silence
    #[error("decode error: {0}")]
    DecodeError(String),

    /// Operation not supported by this object type
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Audio backend failure (device missing, stream build failure, ...)
    #[error("audio backend error: {0}")]
    Backend(String),

    /// An engine invariant was violated; the context enters a failed state
    #[error("internal error: {0}")]
    InternalError(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
