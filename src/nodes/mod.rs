//! Built-in audio nodes.
//!
//! Nodes are organized into three categories:
//!
//! ## Sources ([`source`])
//!
//! Generate audio with no audio inputs:
//! - [`OscillatorNode`] - Sine, square, sawtooth or triangle oscillator with
//!   frequency, detune, amplitude and bias params
//! - [`ConstantSourceNode`] - Outputs its `offset` param, handy as a param driver
//! - [`LiveInputNode`] - The device's capture input
//!
//! ## Effects ([`effect`])
//!
//! Process audio (inputs → outputs):
//! - [`GainNode`] - Volume control, de-zippered or automated per sample
//!
//! ## Sinks ([`sink`])
//!
//! Consume audio:
//! - [`RecorderNode`] - Record into a ring buffer; pulled automatically
//!
//! Every context also owns a destination node, reached through
//! [`Context::destination`](crate::Context::destination).
//!
//! # Handles
//!
//! Each node type comes as a processor (e.g. [`Oscillator`]) implementing
//! [`AudioProcessor`](crate::AudioProcessor) and a handle (e.g.
//! [`OscillatorNode`]) that dereferences to [`Node`](crate::Node) and names
//! the type's params.

pub mod source;
pub mod effect;
pub mod sink;

// Re-export common types at the top level for convenience
pub use source::{ConstantSource, ConstantSourceNode, LiveInput, LiveInputNode, Oscillator, OscillatorNode, OscillatorType};
pub use effect::{Gain, GainNode};
pub use sink::{Recorder, RecorderNode};
