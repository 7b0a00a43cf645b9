//! Gain/volume control effect

use std::ops::Deref;
use std::sync::Arc;

use crate::bus::Bus;
use crate::context::Context;
use crate::node::{AudioProcessor, Node, NodeDescriptor, ProcessContext};
use crate::param::{Param, ParamDescriptor};

const GAIN: usize = 0;

const PARAMS: &[ParamDescriptor] = &[ParamDescriptor::new("gain", "GAIN", 1.0, 0.0, 10_000.0)];

pub const GAIN_NODE: NodeDescriptor = NodeDescriptor {
    params: PARAMS,
    settings: &[],
};

/// Scales its input by the `gain` param.
///
/// A control-rate gain is de-zippered by the output bus. An automated or
/// driven gain is applied per sample.
pub struct Gain {
    last_gain: f32,
    values: Vec<f32>,
}

impl Gain {
    pub fn new(frames: usize) -> Self {
        Self {
            last_gain: 1.0,
            values: vec![0.0; frames],
        }
    }
}

impl AudioProcessor for Gain {
    fn name(&self) -> &'static str {
        "gain"
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>, inputs: &[&Bus], outputs: &mut [&mut Bus]) {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return;
        };
        let frames = ctx.frames();

        if ctx.param(GAIN).has_sample_accurate_values() && self.values.len() >= frames {
            let values = &mut self.values[..frames];
            ctx.param_values(GAIN, values);
            output.copy_with_sample_accurate_gain_values_from(input, values);
            self.last_gain = values[frames - 1];
        } else {
            let target = ctx.param_final_value(GAIN);
            output.copy_with_gain_from(input, &mut self.last_gain, target);
        }
    }

    fn reset(&mut self) {
        self.last_gain = 1.0;
    }
}

#[derive(Clone, Debug)]
pub struct GainNode {
    node: Node,
}

impl GainNode {
    pub fn new(context: &Context) -> Self {
        Self {
            node: Node::new(context, &GAIN_NODE, Gain::new(context.render_quantum_frames())),
        }
    }

    pub fn gain(&self) -> &Arc<Param> {
        &self.node.params()[GAIN]
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Deref for GainNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}
