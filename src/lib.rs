//! Schall - pull-driven real-time audio graph
//!
//! Design principles:
//! - The destination pulls each quantum through the graph; upstream never pushes
//! - Control threads never touch render state directly: edits are queued per
//!   node and per param and applied when the render thread reaches them
//! - Params carry a sample-accurate automation timeline and sum any number of
//!   driver nodes at unity gain
//! - Sources start and stop on exact sample frames with a short fade
//! - Devices are swappable: hardware (cpal), offline, or stepped by hand in tests

pub mod bus;
mod config;
mod context;
pub mod device;
mod error;
mod graph;
mod listener;
pub mod node;
pub mod nodes;
pub mod param;
mod render;
mod scheduler;
pub mod setting;

pub use bus::{Bus, Channel, ChannelInterpretation, ChannelLayout, Speaker};
pub use config::{AudioStreamConfig, ContextOptions, RENDER_QUANTUM_FRAMES};
pub use context::{Context, EventCallback};
pub use device::{AudioDevice, AudioDeviceInfo, MockDevice, OfflineDevice, RenderCallback, Renderer};
pub use error::{Error, Result};
pub use listener::Listener;
pub use node::{AudioProcessor, Node, NodeDescriptor, ProcessContext};
pub use param::{Param, ParamDescriptor, TimelineError};
pub use render::{Clock, SamplingInfo};
pub use scheduler::{Scheduler, SchedulingState, FADE_FRAMES};
pub use setting::{Setting, SettingDescriptor, SettingType};

#[cfg(feature = "cpal_sink")]
pub use device::{list_devices, CpalDevice};
