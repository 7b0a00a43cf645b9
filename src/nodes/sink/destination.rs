//! Graph root

use crate::bus::{Bus, ChannelInterpretation};
use crate::context::Shared;
use crate::node::{AudioProcessor, Node, NodeDescriptor, ProcessContext};

/// The node every context renders from. Mixes whatever reaches its input to
/// the device channel count.
pub(crate) struct Destination {
    channels: usize,
}

impl Destination {
    pub(crate) fn node(shared: &Shared) -> Node {
        let processor = Destination {
            channels: shared.config.channels,
        };
        Node::build(shared, &NodeDescriptor::EMPTY, processor)
    }
}

impl AudioProcessor for Destination {
    fn name(&self) -> &'static str {
        "destination"
    }

    fn process(&mut self, _ctx: &mut ProcessContext<'_>, inputs: &[&Bus], outputs: &mut [&mut Bus]) {
        let Some(output) = outputs.first_mut() else {
            return;
        };
        match inputs.first() {
            Some(input) => output.copy_from(input, ChannelInterpretation::Speakers),
            None => output.zero(),
        }
    }

    fn output_channels(&self, _output: usize, _input_channels: &[usize]) -> usize {
        self.channels
    }
}
