//! Error types.
//!
//! Nothing in here is produced on the render thread. The render path degrades
//! to silence instead of failing; these errors surface setup problems and
//! control-thread requests that could not be queued.

use thiserror::Error;

use crate::param::TimelineError;

/// Errors reported by graph construction, editing and device setup.
#[derive(Debug, Error)]
pub enum Error {
    /// A node or param mutation queue is at capacity. The request was dropped.
    #[error("mutation queue for `{node}` is full")]
    QueueFull { node: String },

    /// `synchronize_connections` returned before every queued edit was applied.
    ///
    /// The remaining edits stay queued and apply at the next service point.
    #[error("timed out with {pending} graph edits still pending")]
    Timeout { pending: usize },

    #[error("`{node}` has no input {index}")]
    InvalidInput { node: String, index: usize },

    #[error("`{node}` has no output {index}")]
    InvalidOutput { node: String, index: usize },

    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(f32),

    #[error("invalid channel count: {0}")]
    InvalidChannelCount(usize),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error("no param named `{0}`")]
    UnknownParam(String),

    #[error("no setting named `{0}`")]
    UnknownSetting(String),

    /// A typed setter was used on a setting of another type.
    #[error("setting `{name}` is not of type {expected}")]
    SettingType { name: String, expected: &'static str },

    #[error("context is closed")]
    ContextClosed,

    /// Audio backend failure.
    #[error("audio device error: {0}")]
    Device(String),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
