//! Capture graph audio into a ring buffer

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::debug;

use crate::bus::{Bus, ChannelInterpretation};
use crate::context::{AutomaticPull, Context};
use crate::node::{AudioProcessor, Node, NodeDescriptor, ProcessContext};
use crate::setting::{SettingDescriptor, SettingType};

const RECORDING: usize = 0;

const SETTINGS: &[SettingDescriptor] = &[SettingDescriptor::new("recording", "REC", SettingType::Bool)];

pub const RECORDER: NodeDescriptor = NodeDescriptor {
    params: &[],
    settings: SETTINGS,
};

/// Pushes its input into an rtrb ring buffer as interleaved samples and
/// passes it through unchanged.
///
/// A quantum that does not fit whole is dropped and counted.
pub struct Recorder {
    producer: Producer<f32>,
    channels: usize,
    dropped: Arc<AtomicU64>,
}

impl AudioProcessor for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>, inputs: &[&Bus], outputs: &mut [&mut Bus]) {
        let Some(input) = inputs.first() else {
            return;
        };
        if let Some(output) = outputs.first_mut() {
            output.copy_from(input, ChannelInterpretation::Discrete);
        }

        if !ctx.setting(RECORDING).value_bool() {
            return;
        }

        let frames = ctx.frames();
        let needed = frames * self.channels;
        if self.producer.slots() < needed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // interleave, repeating the last channel when the input is narrower
        let available = input.number_of_channels();
        for frame in 0..frames {
            for ch in 0..self.channels {
                let sample = match available {
                    0 => 0.0,
                    n => input.channel(ch.min(n - 1)).data()[frame],
                };
                let _ = self.producer.push(sample);
            }
        }
    }

    fn propagates_silence(&self) -> bool {
        false
    }

    fn output_channels(&self, _output: usize, input_channels: &[usize]) -> usize {
        input_channels.first().copied().unwrap_or(1)
    }
}

/// Handle to a recorder. Registered for automatic pull on creation, so it
/// renders without being connected downstream, and unregistered when the
/// handle drops.
pub struct RecorderNode {
    node: Node,
    _pull: AutomaticPull,
    consumer: Mutex<Consumer<f32>>,
    channels: usize,
    dropped: Arc<AtomicU64>,
}

impl RecorderNode {
    /// Record `channels` interleaved channels, buffering up to `seconds` of
    /// audio between drains.
    pub fn new(context: &Context, channels: usize, seconds: f64) -> Self {
        let channels = channels.max(1);
        let frames = (seconds.max(0.0) * context.sample_rate() as f64).ceil() as usize;
        let capacity = frames.max(context.render_quantum_frames()) * channels;
        let (producer, consumer) = RingBuffer::new(capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let processor = Recorder {
            producer,
            channels,
            dropped: dropped.clone(),
        };
        let node = Node::new(context, &RECORDER, processor);
        let pull = context.automatic_pull_guard(&node);
        debug!(channels, capacity, "recorder created");

        Self {
            node,
            _pull: pull,
            consumer: Mutex::new(consumer),
            channels,
            dropped,
        }
    }

    pub fn start_recording(&self) {
        let _ = self.node.settings()[RECORDING].set_bool(true, true);
    }

    pub fn stop_recording(&self) {
        let _ = self.node.settings()[RECORDING].set_bool(false, true);
    }

    pub fn is_recording(&self) -> bool {
        self.node.settings()[RECORDING].value_bool()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples waiting to be drained.
    pub fn available(&self) -> usize {
        self.consumer.lock().slots()
    }

    /// Quanta lost because the buffer was full.
    pub fn dropped_quanta(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append every buffered sample to `out`. Returns how many were moved.
    pub fn drain_into(&self, out: &mut Vec<f32>) -> usize {
        let mut consumer = self.consumer.lock();
        let count = consumer.slots();
        match consumer.read_chunk(count) {
            Ok(chunk) => {
                out.extend(chunk);
                count
            }
            Err(_) => 0,
        }
    }

    /// Everything buffered so far, interleaved.
    pub fn take_recording(&self) -> Vec<f32> {
        let mut out = Vec::new();
        self.drain_into(&mut out);
        out
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Deref for RecorderNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl std::fmt::Debug for RecorderNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderNode")
            .field("node", &self.node)
            .field("channels", &self.channels)
            .field("recording", &self.is_recording())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioStreamConfig, ContextOptions};
    use crate::device::{AudioDevice, MockDevice};
    use crate::nodes::ConstantSourceNode;

    #[test]
    fn records_interleaved_while_enabled() {
        let ctx = Context::new(
            AudioStreamConfig::default(),
            ContextOptions::default().with_render_quantum_frames(4),
        )
        .unwrap();
        let source = ConstantSourceNode::new(&ctx);
        let recorder = RecorderNode::new(&ctx, 2, 0.01);
        ctx.connect(&recorder, &source, 0, 0).unwrap();
        source.start(0.0);

        let mut device = MockDevice::new(&ctx);
        device.start().unwrap();
        device.render_quantum();
        assert_eq!(recorder.available(), 0, "nothing recorded before start_recording");

        recorder.start_recording();
        device.render_quanta(2);
        let samples = recorder.take_recording();
        assert_eq!(samples.len(), 2 * 4 * 2);
        // mono source duplicated into both channels
        assert!(samples.chunks(2).all(|f| f[0] == f[1]));
        assert!(samples.iter().all(|&x| x == 1.0));

        recorder.stop_recording();
        device.render_quantum();
        assert_eq!(recorder.available(), 0);
    }

    #[test]
    fn full_buffer_drops_whole_quanta() {
        let ctx = Context::new(
            AudioStreamConfig::default(),
            ContextOptions::default().with_render_quantum_frames(4),
        )
        .unwrap();
        let recorder = RecorderNode::new(&ctx, 1, 0.0);
        recorder.start_recording();

        let mut device = MockDevice::new(&ctx);
        device.start().unwrap();
        device.render_quanta(3);
        assert_eq!(recorder.available(), 4);
        assert_eq!(recorder.dropped_quanta(), 2);
    }

    #[test]
    fn dropping_handle_stops_automatic_pull() {
        let ctx = Context::new(AudioStreamConfig::default(), ContextOptions::default()).unwrap();
        let recorder = RecorderNode::new(&ctx, 1, 0.01);
        let kept = RecorderNode::new(&ctx, 1, 0.01);
        assert_eq!(ctx.automatic_pull_nodes().len(), 2);

        drop(recorder);
        let remaining = ctx.automatic_pull_nodes();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].ptr_eq(&kept));

        drop(kept);
        assert!(ctx.automatic_pull_nodes().is_empty());
    }
}
