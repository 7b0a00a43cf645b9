//! Hardware input as a graph source

use std::ops::Deref;

use crate::bus::{Bus, ChannelInterpretation};
use crate::context::Context;
use crate::node::{AudioProcessor, Node, NodeDescriptor, ProcessContext};

/// Copies the device input published for the current quantum.
///
/// Outputs silence when the device captures nothing.
pub struct LiveInput {
    channels: usize,
}

impl AudioProcessor for LiveInput {
    fn name(&self) -> &'static str {
        "live_input"
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>, _inputs: &[&Bus], outputs: &mut [&mut Bus]) {
        let Some(output) = outputs.first_mut() else {
            return;
        };
        match ctx.live_input() {
            Some(live) => output.copy_from(&live, ChannelInterpretation::Speakers),
            None => output.zero(),
        }
    }

    fn propagates_silence(&self) -> bool {
        false
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        0
    }

    fn output_channels(&self, _output: usize, _input_channels: &[usize]) -> usize {
        self.channels
    }
}

#[derive(Clone, Debug)]
pub struct LiveInputNode {
    node: Node,
}

impl LiveInputNode {
    pub fn new(context: &Context) -> Self {
        let processor = LiveInput {
            channels: context.config().channels,
        };
        Self {
            node: Node::new(context, &NodeDescriptor::EMPTY, processor),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Deref for LiveInputNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}
