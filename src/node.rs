//! Graph vertices.
//!
//! A [`Node`] wraps an [`AudioProcessor`] with everything the engine needs
//! around it: input slots, owned output busses, the params and settings
//! declared by the node type, a [`Scheduler`] and the queue through which
//! control threads edit its inputs.
//!
//! Nodes are reference counted. Every edge holds a [`Node`] clone of its
//! upstream end, so a node lives as long as the application or any downstream
//! input references it. Cycles are legal; a node reached twice in one quantum
//! returns its previous output.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::bus::{Bus, ChannelInterpretation};
use crate::context::{Context, EventCallback, Shared};
use crate::error::{Error, Result};
use crate::graph::{Edge, EdgeSnapshot, InputSlot, NodeOp, OpQueue, Source};
use crate::param::{Param, ParamDescriptor};
use crate::render::RenderPass;
use crate::scheduler::{Scheduler, SchedulingState, FADE_FRAMES};
use crate::setting::{Setting, SettingDescriptor};

/// Params and settings a node type declares. This is the introspectable
/// surface of every node.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeDescriptor {
    pub params: &'static [ParamDescriptor],
    pub settings: &'static [SettingDescriptor],
}

impl NodeDescriptor {
    pub const EMPTY: NodeDescriptor = NodeDescriptor {
        params: &[],
        settings: &[],
    };
}

/// Per-type signal processing.
///
/// `process` runs on the render thread once per quantum. It must not block,
/// allocate or log.
pub trait AudioProcessor: Send + 'static {
    fn name(&self) -> &'static str;

    /// Fill `outputs` from `inputs`. Both are exactly one quantum long.
    fn process(&mut self, ctx: &mut ProcessContext<'_>, inputs: &[&Bus], outputs: &mut [&mut Bus]);

    /// Called on the render thread after [`Node::reset`].
    fn reset(&mut self) {}

    /// Seconds the output keeps ringing after the input goes silent.
    fn tail_time(&self) -> f64 {
        0.0
    }

    fn latency_time(&self) -> f64 {
        0.0
    }

    /// Whether the node may skip `process` and output silence once its
    /// inputs have been silent for longer than its tail and latency.
    /// Sources return false.
    fn propagates_silence(&self) -> bool {
        true
    }

    /// Scheduled nodes only render while their scheduler is active, and only
    /// inside its render window.
    fn is_scheduled(&self) -> bool {
        false
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        1
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        1
    }

    /// Channel count of `output` given the channel count of every input.
    ///
    /// Only consulted when input connectivity changes.
    fn output_channels(&self, _output: usize, input_channels: &[usize]) -> usize {
        input_channels.first().copied().unwrap_or(1)
    }
}

/// What a processor sees of the engine during [`AudioProcessor::process`].
pub struct ProcessContext<'a> {
    pass: &'a RenderPass<'a>,
    params: &'a [Arc<Param>],
    settings: &'a [Arc<Setting>],
    scheduler: &'a Scheduler,
}

impl<'a> ProcessContext<'a> {
    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.pass.sample_rate()
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.pass.frames
    }

    #[inline]
    pub fn current_sample_frame(&self) -> u64 {
        self.pass.info.current_sample_frame
    }

    #[inline]
    pub fn current_time(&self) -> f64 {
        self.pass.current_time()
    }

    /// First frame of this quantum the scheduler lets the node render.
    pub fn render_offset(&self) -> usize {
        self.scheduler.render_offset()
    }

    pub fn render_length(&self) -> usize {
        self.scheduler.render_length()
    }

    pub fn playback_state(&self) -> SchedulingState {
        self.scheduler.playback_state()
    }

    pub fn param(&self, index: usize) -> &Param {
        &self.params[index]
    }

    /// Fill `values` with the param's per-sample values for this quantum.
    ///
    /// Returns false, leaving the smoothed control-rate value broadcast into
    /// `values`, when nothing makes the param vary within the quantum.
    pub fn param_values(&self, index: usize, values: &mut [f32]) -> bool {
        let param = &self.params[index];
        if param.has_sample_accurate_values() {
            param.calculate_sample_accurate_values(self.pass, values);
            true
        } else {
            values.fill(param.smoothed_value());
            false
        }
    }

    /// Control-rate value: timeline and intrinsic value plus drivers.
    pub fn param_final_value(&self, index: usize) -> f32 {
        self.params[index].final_value()
    }

    pub fn smoothed_param(&self, index: usize) -> f32 {
        self.params[index].smoothed_value()
    }

    pub fn setting(&self, index: usize) -> &Setting {
        &self.settings[index]
    }

    /// Mark the node finished, e.g. a player that ran out of material.
    pub fn finish(&mut self) {
        self.scheduler.finish(self.pass);
    }

    /// Run `callback` later on the control thread.
    pub fn enqueue_event(&self, callback: EventCallback) {
        self.pass.enqueue_event(callback);
    }

    /// The context's hardware input for this quantum.
    pub fn live_input(&self) -> Option<MutexGuard<'a, Bus>> {
        self.pass.live_input()
    }
}

struct NodeState {
    processor: Box<dyn AudioProcessor>,
    inputs: Vec<InputSlot>,
    last_non_silent_time: f64,
    channels_dirty: bool,
}

struct NodeInner {
    id: u64,
    name: &'static str,
    epoch: AtomicU64,
    state: Mutex<NodeState>,
    outputs: Vec<Mutex<Bus>>,
    params: Vec<Arc<Param>>,
    settings: Vec<Arc<Setting>>,
    param_index: HashMap<&'static str, usize>,
    setting_index: HashMap<&'static str, usize>,
    scheduler: Scheduler,
    queue: OpQueue<NodeOp>,
    edges: EdgeSnapshot,
    requested_inputs: AtomicUsize,
    frames: usize,
}

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to a graph vertex.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl Node {
    /// Build a node for `context` from a processor and its type's descriptor.
    pub fn new(context: &Context, descriptor: &NodeDescriptor, processor: impl AudioProcessor) -> Node {
        Self::build(context.shared(), descriptor, processor)
    }

    pub(crate) fn build(shared: &Shared, descriptor: &NodeDescriptor, processor: impl AudioProcessor) -> Node {
        let frames = shared.quantum_frames();
        let capacity = shared.options.node_queue_capacity;

        let params: Vec<Arc<Param>> = descriptor
            .params
            .iter()
            .map(|d| {
                let queue = OpQueue::new(capacity, shared.pending.clone());
                Arc::new(Param::new(*d, queue, shared.clock.clone()))
            })
            .collect();
        let settings: Vec<Arc<Setting>> = descriptor
            .settings
            .iter()
            .map(|d| Arc::new(Setting::new(*d)))
            .collect();

        let param_index = descriptor
            .params
            .iter()
            .enumerate()
            .flat_map(|(i, d)| [(d.name, i), (d.short_name, i)])
            .collect();
        let setting_index = descriptor
            .settings
            .iter()
            .enumerate()
            .flat_map(|(i, d)| [(d.name, i), (d.short_name, i)])
            .collect();

        let num_inputs = processor.num_inputs();
        let input_channels = vec![1; num_inputs];
        let outputs = (0..processor.num_outputs())
            .map(|i| {
                let channels = processor.output_channels(i, &input_channels);
                Mutex::new(Bus::new(channels, frames).with_sample_rate(shared.config.sample_rate))
            })
            .collect();

        let name = processor.name();
        Node(Arc::new(NodeInner {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            epoch: AtomicU64::new(0),
            state: Mutex::new(NodeState {
                processor: Box::new(processor),
                inputs: (0..num_inputs).map(|_| InputSlot::new(frames)).collect(),
                last_non_silent_time: -1.0,
                channels_dirty: true,
            }),
            outputs,
            params,
            settings,
            param_index,
            setting_index,
            scheduler: Scheduler::new(shared.clock.clone()),
            queue: OpQueue::new(capacity, shared.pending.clone()),
            edges: EdgeSnapshot::new(),
            requested_inputs: AtomicUsize::new(num_inputs),
            frames,
        }))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.0.name
    }

    /// Whether both handles refer to the same node.
    #[inline]
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Input count including inputs requested but not yet added.
    pub fn number_of_inputs(&self) -> usize {
        self.0.requested_inputs.load(Ordering::Acquire)
    }

    pub fn number_of_outputs(&self) -> usize {
        self.0.outputs.len()
    }

    pub fn params(&self) -> &[Arc<Param>] {
        &self.0.params
    }

    /// Look up a param by name or short name.
    pub fn param(&self, name: &str) -> Result<&Arc<Param>> {
        self.0
            .param_index
            .get(name)
            .map(|&i| &self.0.params[i])
            .ok_or_else(|| Error::UnknownParam(name.to_owned()))
    }

    pub fn param_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.params.iter().map(|p| p.name())
    }

    pub fn settings(&self) -> &[Arc<Setting>] {
        &self.0.settings
    }

    pub fn setting(&self, name: &str) -> Result<&Arc<Setting>> {
        self.0
            .setting_index
            .get(name)
            .map(|&i| &self.0.settings[i])
            .ok_or_else(|| Error::UnknownSetting(name.to_owned()))
    }

    pub fn setting_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.settings.iter().map(|s| s.name())
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.0.scheduler
    }

    /// Start rendering `when` seconds from now. See [`Scheduler::start`].
    pub fn start(&self, when: f64) -> bool {
        self.0.scheduler.start(when)
    }

    pub fn stop(&self, when: f64) -> bool {
        self.0.scheduler.stop(when)
    }

    /// Return the node to its unscheduled state and reset the processor on
    /// the next quantum.
    pub fn reset(&self) {
        self.0.scheduler.reset();
    }

    pub fn playback_state(&self) -> SchedulingState {
        self.0.scheduler.playback_state()
    }

    pub fn set_on_ended(&self, callback: Option<EventCallback>) {
        self.0.scheduler.set_on_ended(callback);
    }

    pub fn set_on_start(&self, callback: Option<EventCallback>) {
        self.0.scheduler.set_on_start(callback);
    }

    /// An output bus, unless it is being written right now.
    ///
    /// Contents are only meaningful between renders.
    pub fn output_bus(&self, index: usize) -> Option<MutexGuard<'_, Bus>> {
        self.0.outputs.get(index)?.try_lock()
    }

    /// Whether `source`'s output `output` feeds input `input`.
    ///
    /// Only applied edits are visible; use
    /// [`Context::synchronize_connections`] to wait for queued ones.
    pub fn is_input_connected(&self, input: usize, source: &Node, output: usize) -> bool {
        let wanted = Edge {
            input,
            source: source.id(),
            output,
        };
        self.0.edges.any(|e| *e == wanted)
    }

    /// Whether any output of `source` feeds any input.
    pub fn is_connected_from(&self, source: &Node) -> bool {
        let id = source.id();
        self.0.edges.any(|e| e.source == id)
    }

    /// Queue a change to how sources are mixed into input `input`.
    pub fn set_channel_interpretation(&self, input: usize, interpretation: ChannelInterpretation) -> Result<()> {
        if input >= self.number_of_inputs() {
            return Err(Error::InvalidInput {
                node: self.name().to_owned(),
                index: input,
            });
        }
        self.0
            .queue
            .push(NodeOp::SetInterpretation { input, interpretation }, self.name())
    }

    /// Queue an extra input slot. Returns its index.
    pub fn add_input(&self) -> Result<usize> {
        self.0.queue.push(NodeOp::AddInput, self.name())?;
        Ok(self.0.requested_inputs.fetch_add(1, Ordering::AcqRel))
    }

    pub(crate) fn queue_connect(&self, input: usize, source: &Node, output: usize) -> Result<()> {
        self.check_edge(input, source, output)?;
        self.0.queue.push(
            NodeOp::Connect {
                input,
                source: Source::new(source.clone(), output),
            },
            self.name(),
        )
    }

    pub(crate) fn queue_disconnect(&self, input: usize, source: &Node, output: usize) -> Result<()> {
        self.check_edge(input, source, output)?;
        self.0.queue.push(
            NodeOp::Disconnect {
                input,
                source: Source::new(source.clone(), output),
            },
            self.name(),
        )
    }

    pub(crate) fn queue_disconnect_input(&self, input: usize) -> Result<()> {
        if input >= self.number_of_inputs() {
            return Err(Error::InvalidInput {
                node: self.name().to_owned(),
                index: input,
            });
        }
        self.0.queue.push(NodeOp::DisconnectInput(input), self.name())
    }

    pub(crate) fn queue_disconnect_all(&self) -> Result<()> {
        self.0.queue.push(NodeOp::DisconnectAll, self.name())
    }

    fn check_edge(&self, input: usize, source: &Node, output: usize) -> Result<()> {
        if input >= self.number_of_inputs() {
            return Err(Error::InvalidInput {
                node: self.name().to_owned(),
                index: input,
            });
        }
        if output >= source.number_of_outputs() {
            return Err(Error::InvalidOutput {
                node: source.name().to_owned(),
                index: output,
            });
        }
        Ok(())
    }

    /// Queued input and param edits not yet applied.
    pub fn pending_edits(&self) -> usize {
        self.0.queue.len() + self.0.params.iter().filter(|p| p.has_pending_edits()).count()
    }

    /// Drop every upstream reference held by this node and its params.
    /// Returns them so the caller can continue through the graph.
    pub(crate) fn detach_upstream(&self) -> Vec<Node> {
        let mut upstream: Vec<Node> = {
            let mut state = self.0.state.lock();
            state
                .inputs
                .iter_mut()
                .flat_map(|slot| slot.take_sources())
                .map(Source::into_node)
                .collect()
        };
        for param in self.0.params.iter() {
            upstream.extend(param.clear_drivers());
        }
        // queued edits may hold references too
        let mut drained = 0;
        for op in self.0.queue.drain() {
            drained += 1;
            match op {
                NodeOp::Connect { source, .. } | NodeOp::Disconnect { source, .. } => {
                    upstream.push(source.into_node());
                }
                NodeOp::AddInput
                | NodeOp::DisconnectInput(_)
                | NodeOp::DisconnectAll
                | NodeOp::SetInterpretation { .. } => {}
            }
        }
        self.0.queue.settle(drained + self.0.edges.clear());
        upstream
    }

    fn silence_outputs(&self) {
        for output in self.0.outputs.iter() {
            if let Some(mut bus) = output.try_lock() {
                bus.zero();
            }
        }
    }

    /// Render this node for the pass's quantum unless it already has been.
    pub(crate) fn process_if_necessary(&self, pass: &RenderPass<'_>) {
        let inner = &*self.0;

        // stamp first: a cycle back to this node must see it as done
        if inner.epoch.swap(pass.epoch, Ordering::AcqRel) == pass.epoch {
            return;
        }

        let Some(mut guard) = inner.state.try_lock() else {
            self.silence_outputs();
            return;
        };
        let state = &mut *guard;

        self.service_queue(state, pass);
        if inner.edges.is_stale() {
            let edges = state
                .inputs
                .iter()
                .enumerate()
                .flat_map(|(input, slot)| slot.sources().iter().map(move |s| s.edge(input)));
            inner.queue.settle(inner.edges.publish(edges));
        }

        for param in inner.params.iter() {
            param.service_queue(pass);
            param.pull_drivers(pass);
            param.smooth();
        }

        let mut channels_changed = state.channels_dirty;
        for slot in state.inputs.iter_mut() {
            channels_changed |= slot.pull(pass);
        }
        if channels_changed {
            state.channels_dirty = !self.update_output_channels(state);
        }

        let previous = inner.scheduler.update(pass);
        if previous == SchedulingState::Resetting {
            state.processor.reset();
            for param in inner.params.iter() {
                param.reset_smoothed_value(param.value());
            }
        }

        let scheduled = state.processor.is_scheduled();
        let playback = inner.scheduler.playback_state();
        if scheduled && !playback.is_active() {
            self.silence_outputs();
            return;
        }

        let frames = pass.frames;
        let inputs_silent = state.inputs.iter().all(|slot| slot.bus().is_silent());
        if !inputs_silent {
            state.last_non_silent_time =
                (pass.info.current_sample_frame + frames as u64) as f64 / pass.sample_rate() as f64;
        }

        let processor = &mut state.processor;
        if inputs_silent
            && processor.propagates_silence()
            && state.last_non_silent_time + processor.latency_time() + processor.tail_time() < pass.current_time()
        {
            self.silence_outputs();
            return;
        }

        let mut guards: SmallVec<[MutexGuard<'_, Bus>; 2]> = SmallVec::new();
        for output in inner.outputs.iter() {
            match output.try_lock() {
                Some(bus) => guards.push(bus),
                // being read elsewhere; keep last quantum's output
                None => return,
            }
        }

        let inputs: SmallVec<[&Bus; 4]> = state.inputs.iter().map(InputSlot::bus).collect();
        let mut outputs: SmallVec<[&mut Bus; 2]> = guards.iter_mut().map(|g| &mut **g).collect();

        let mut ctx = ProcessContext {
            pass,
            params: &inner.params,
            settings: &inner.settings,
            scheduler: &inner.scheduler,
        };
        processor.process(&mut ctx, &inputs, &mut outputs);

        for bus in outputs.iter_mut() {
            bus.clear_silent_flag();
        }

        if scheduled {
            let offset = inner.scheduler.render_offset().min(frames);
            let length = inner.scheduler.render_length().min(frames - offset);
            for bus in outputs.iter_mut() {
                apply_render_window(bus, playback, offset, length);
            }
        }
    }

    /// Apply queued input edits in FIFO order.
    fn service_queue(&self, state: &mut NodeState, pass: &RenderPass<'_>) {
        if self.0.queue.is_empty() {
            return;
        }
        let mut applied = 0;
        for op in self.0.queue.drain() {
            applied += 1;
            match op {
                NodeOp::AddInput => {
                    state.inputs.push(InputSlot::new(self.0.frames));
                    state.channels_dirty = true;
                }
                NodeOp::Connect { input, source } => match state.inputs.get_mut(input) {
                    Some(slot) => {
                        if let Some(duplicate) = slot.connect(source) {
                            pass.retire(duplicate.into_node());
                        }
                    }
                    None => pass.retire(source.into_node()),
                },
                NodeOp::Disconnect { input, source } => {
                    if let Some(removed) = state.inputs.get_mut(input).and_then(|slot| slot.disconnect(&source)) {
                        pass.retire(removed.into_node());
                    }
                    pass.retire(source.into_node());
                }
                NodeOp::DisconnectInput(input) => {
                    if let Some(slot) = state.inputs.get_mut(input) {
                        for source in slot.take_sources() {
                            pass.retire(source.into_node());
                        }
                    }
                }
                NodeOp::DisconnectAll => {
                    for slot in state.inputs.iter_mut() {
                        for source in slot.take_sources() {
                            pass.retire(source.into_node());
                        }
                    }
                }
                NodeOp::SetInterpretation { input, interpretation } => {
                    if let Some(slot) = state.inputs.get_mut(input) {
                        slot.set_interpretation(interpretation);
                    }
                }
            }
        }
        self.0.edges.applied(applied);
    }

    /// Resize outputs to what the processor asks for given the current input
    /// shapes. Returns false if an output could not be locked.
    fn update_output_channels(&self, state: &NodeState) -> bool {
        let input_channels: SmallVec<[usize; 4]> = state.inputs.iter().map(InputSlot::number_of_channels).collect();
        let mut done = true;
        for (index, output) in self.0.outputs.iter().enumerate() {
            let channels = state.processor.output_channels(index, &input_channels);
            match output.try_lock() {
                Some(mut bus) => bus.set_number_of_channels(channels),
                None => done = false,
            }
        }
        done
    }

    /// Current channel count of output `index`.
    pub fn output_channels(&self, index: usize) -> Option<usize> {
        self.output_bus(index).map(|b| b.number_of_channels())
    }
}

/// Zero everything outside `[offset, offset + length)` and ramp the edges of
/// a start or stop.
fn apply_render_window(bus: &mut Bus, playback: SchedulingState, offset: usize, length: usize) {
    let frames = bus.length();
    let end = offset + length;
    bus.zero_range(0, offset);
    bus.zero_range(end, frames);
    if length == 0 {
        bus.zero();
        return;
    }

    let fade = FADE_FRAMES.min(length);
    match playback {
        SchedulingState::FadeIn => {
            for channel in bus.channels_mut() {
                let data = &mut channel.mutable_data()[offset..offset + fade];
                for (i, x) in data.iter_mut().enumerate() {
                    *x *= i as f32 / fade as f32;
                }
            }
        }
        SchedulingState::Stopping => {
            for channel in bus.channels_mut() {
                let data = &mut channel.mutable_data()[end - fade..end];
                for (i, x) in data.iter_mut().enumerate() {
                    *x *= 1.0 - (i + 1) as f32 / fade as f32;
                }
            }
        }
        _ => {}
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Node {}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("outputs", &self.0.outputs.len())
            .field("state", &self.0.scheduler.playback_state())
            .finish()
    }
}
