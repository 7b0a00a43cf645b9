//! Constant signal source

use std::ops::Deref;
use std::sync::Arc;

use crate::bus::Bus;
use crate::context::Context;
use crate::node::{AudioProcessor, Node, NodeDescriptor, ProcessContext};
use crate::param::{Param, ParamDescriptor};

const OFFSET: usize = 0;

const PARAMS: &[ParamDescriptor] = &[ParamDescriptor::new("offset", "OFFS", 1.0, f32::MIN, f32::MAX)];

pub const CONSTANT_SOURCE: NodeDescriptor = NodeDescriptor {
    params: PARAMS,
    settings: &[],
};

/// Outputs its `offset` param. Useful as a param driver or a DC source.
pub struct ConstantSource;

impl AudioProcessor for ConstantSource {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>, _inputs: &[&Bus], outputs: &mut [&mut Bus]) {
        let Some(output) = outputs.first_mut() else {
            return;
        };
        let frames = ctx.frames();
        let offset = ctx.render_offset().min(frames);
        let end = (offset + ctx.render_length()).min(frames);

        let data = output.channel_mut(0).mutable_data();
        ctx.param_values(OFFSET, &mut data[..frames]);
        data[..offset].fill(0.0);
        data[end..frames].fill(0.0);
    }

    fn propagates_silence(&self) -> bool {
        false
    }

    fn is_scheduled(&self) -> bool {
        true
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        0
    }

    fn output_channels(&self, _output: usize, _input_channels: &[usize]) -> usize {
        1
    }
}

#[derive(Clone, Debug)]
pub struct ConstantSourceNode {
    node: Node,
}

impl ConstantSourceNode {
    pub fn new(context: &Context) -> Self {
        Self {
            node: Node::new(context, &CONSTANT_SOURCE, ConstantSource),
        }
    }

    pub fn offset(&self) -> &Arc<Param> {
        &self.node.params()[OFFSET]
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Deref for ConstantSourceNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}
