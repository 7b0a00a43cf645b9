//! Stream and context configuration.

use crate::bus::MAX_BUS_CHANNELS;
use crate::error::{Error, Result};

/// Number of frames rendered per graph invocation.
///
/// Every sample-accurate array in the crate (param values, scheduler offsets,
/// node busses) is sized to this.
pub const RENDER_QUANTUM_FRAMES: usize = 128;

/// Requested stream shape, negotiated with a device backend.
///
/// ```
/// use schall::AudioStreamConfig;
///
/// let config = AudioStreamConfig::default()
///     .with_channels(1)
///     .with_sample_rate(44_100.0);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AudioStreamConfig {
    /// Backend device index, `None` for the system default.
    pub device_index: Option<usize>,
    pub channels: usize,
    pub sample_rate: f32,
}

impl Default for AudioStreamConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            channels: 2,
            sample_rate: 48_000.0,
        }
    }
}

impl AudioStreamConfig {
    pub fn with_device(mut self, index: usize) -> Self {
        self.device_index = Some(index);
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: f32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Reject configurations no bus can represent.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > MAX_BUS_CHANNELS {
            return Err(Error::InvalidChannelCount(self.channels));
        }
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(Error::InvalidSampleRate(self.sample_rate));
        }
        Ok(())
    }
}

/// Capacities and pump behaviour for a [`Context`](crate::Context).
#[derive(Clone, Copy, Debug)]
pub struct ContextOptions {
    /// Slots in the deferred event queue shared by every node.
    pub event_queue_capacity: usize,
    /// Slots in each node's and param's mutation queue.
    pub node_queue_capacity: usize,
    /// Slots for node references the render thread hands back to be dropped.
    pub retire_queue_capacity: usize,
    /// Spawn a thread that dispatches completion events as they arrive.
    ///
    /// When false the application calls
    /// [`Context::dispatch_events`](crate::Context::dispatch_events) itself.
    pub background_events: bool,
    /// Frames per graph invocation. Devices must call the renderer with
    /// exactly this many frames.
    pub render_quantum_frames: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            event_queue_capacity: 1024,
            node_queue_capacity: 256,
            retire_queue_capacity: 1024,
            background_events: false,
            render_quantum_frames: RENDER_QUANTUM_FRAMES,
        }
    }
}

impl ContextOptions {
    pub fn with_background_events(mut self, enabled: bool) -> Self {
        self.background_events = enabled;
        self
    }

    pub fn with_render_quantum_frames(mut self, frames: usize) -> Self {
        self.render_quantum_frames = frames.max(1);
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_node_queue_capacity(mut self, capacity: usize) -> Self {
        self.node_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_retire_queue_capacity(mut self, capacity: usize) -> Self {
        self.retire_queue_capacity = capacity.max(1);
        self
    }
}
