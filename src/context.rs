//! The audio context: one graph, one clock, one device.
//!
//! ```
//! use schall::{AudioDevice, AudioStreamConfig, Context, ContextOptions, MockDevice};
//! use schall::nodes::OscillatorNode;
//!
//! let context = Context::new(AudioStreamConfig::default(), ContextOptions::default()).unwrap();
//! let osc = OscillatorNode::new(&context);
//! context.connect(&context.destination(), &osc, 0, 0).unwrap();
//! osc.start(0.0);
//!
//! let mut device = MockDevice::new(&context);
//! device.start().unwrap();
//! device.render_quanta(3);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::select;
use hashbrown::HashSet;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::config::{AudioStreamConfig, ContextOptions};
use crate::device::{AudioDevice, Renderer};
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::node::Node;
use crate::nodes::sink::Destination;
use crate::param::Param;
use crate::render::{Clock, ControlQueues, RenderPass, SamplingInfo};

/// Callback deferred from the render thread to a control thread.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Render-thread view of the graph roots.
pub(crate) struct RenderState {
    pub destination: Option<Node>,
    pub automatic_pull: Vec<Node>,
}

/// State shared between a [`Context`], its [`Renderer`] and its nodes.
pub(crate) struct Shared {
    pub config: AudioStreamConfig,
    pub options: ContextOptions,
    pub clock: Arc<Clock>,
    /// Graph edits queued on any node or param of this context.
    pub pending: Arc<AtomicUsize>,
    pub render: Mutex<RenderState>,
    pub live_input: Mutex<Bus>,
    /// Control-side automatic-pull list.
    automatic_pull: Mutex<Vec<Node>>,
    /// Next automatic-pull list for the render thread to swap in.
    incoming_pull: Mutex<Option<Vec<Node>>>,
    control: ControlQueues,
    listener: Listener,
    initialized: AtomicBool,
    suspended: AtomicBool,
    closed: AtomicBool,
    offline: bool,
}

impl Shared {
    #[inline]
    pub(crate) fn quantum_frames(&self) -> usize {
        self.options.render_quantum_frames
    }

    #[inline]
    pub(crate) fn is_rendering(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
            && !self.suspended.load(Ordering::Acquire)
            && !self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Release);
    }

    fn add_automatic_pull(&self, node: &Node) {
        let mut list = self.automatic_pull.lock();
        if list.iter().any(|n| n.ptr_eq(node)) {
            return;
        }
        list.push(node.clone());
        *self.incoming_pull.lock() = Some(list.clone());
        debug!(node = node.name(), "automatic pull added");
    }

    fn remove_automatic_pull(&self, node: &Node) {
        let mut list = self.automatic_pull.lock();
        let before = list.len();
        list.retain(|n| !n.ptr_eq(node));
        if list.len() != before {
            *self.incoming_pull.lock() = Some(list.clone());
            debug!(node = node.name(), "automatic pull removed");
        }
    }

    /// Swap in staged structural changes and advance the clock.
    pub(crate) fn handle_pre_render_tasks<'a>(
        &'a self,
        state: &mut RenderState,
        info: &SamplingInfo,
        frames: usize,
    ) -> RenderPass<'a> {
        self.clock.set_frame(info.current_sample_frame);
        let epoch = self.clock.next_epoch();
        let pass = RenderPass::new(*info, epoch, frames, &self.control).with_live_input(&self.live_input);

        if let Some(mut incoming) = self.incoming_pull.try_lock() {
            if let Some(list) = incoming.take() {
                let previous = std::mem::replace(&mut state.automatic_pull, list);
                pass.retire_list(previous);
            }
        }

        self.listener.update(&pass);
        pass
    }

    pub(crate) fn handle_post_render_tasks(&self, _pass: &RenderPass<'_>) {
        self.listener.clear_dirty();
        self.control.flush_backlog();
    }
}

/// One audio universe: a graph rooted at a destination node, the sample
/// clock it runs on and the device that drives it.
pub struct Context {
    shared: Arc<Shared>,
    destination: Node,
    device: Mutex<Option<Box<dyn AudioDevice>>>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Automatic-pull registration that removes itself when dropped.
///
/// Holds the context weakly, so it never keeps a closed context alive.
pub(crate) struct AutomaticPull {
    shared: Weak<Shared>,
    node: Node,
}

impl Drop for AutomaticPull {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_automatic_pull(&self.node);
        }
    }
}

impl Context {
    /// A context for real-time rendering. Nothing renders until a device is
    /// attached and started.
    pub fn new(config: AudioStreamConfig, options: ContextOptions) -> Result<Self> {
        Self::build(config, options, false)
    }

    /// A context meant to be driven by an [`OfflineDevice`](crate::OfflineDevice).
    pub fn offline(config: AudioStreamConfig, options: ContextOptions) -> Result<Self> {
        Self::build(config, options, true)
    }

    fn build(config: AudioStreamConfig, options: ContextOptions, offline: bool) -> Result<Self> {
        config.validate()?;
        let frames = options.render_quantum_frames;

        let clock = Arc::new(Clock::new(config.sample_rate));
        let pending = Arc::new(AtomicUsize::new(0));
        let control = ControlQueues::new(options.event_queue_capacity, options.retire_queue_capacity);
        let listener = Listener::new(clock.clone(), pending.clone(), options.node_queue_capacity);

        let shared = Arc::new(Shared {
            config,
            options,
            clock,
            pending,
            render: Mutex::new(RenderState {
                destination: None,
                automatic_pull: Vec::new(),
            }),
            live_input: Mutex::new(Bus::new(config.channels, frames).with_sample_rate(config.sample_rate)),
            automatic_pull: Mutex::new(Vec::new()),
            incoming_pull: Mutex::new(None),
            control,
            listener,
            initialized: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            offline,
        });

        let destination = Destination::node(&shared);
        shared.render.lock().destination = Some(destination.clone());

        let event_thread = if options.background_events {
            Some(spawn_event_thread(shared.clone())?)
        } else {
            None
        };

        info!(
            sample_rate = config.sample_rate,
            channels = config.channels,
            quantum = frames,
            offline,
            "context created"
        );

        Ok(Self {
            shared,
            destination,
            device: Mutex::new(None),
            event_thread: Mutex::new(event_thread),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// The render callback a device backend drives.
    pub fn renderer(&self) -> Renderer {
        Renderer::new(self.shared.clone())
    }

    /// Attach a device, replacing and stopping any previous one, and start it.
    pub fn set_device(&self, mut device: Box<dyn AudioDevice>) -> Result<()> {
        self.ensure_open()?;
        let mut slot = self.device.lock();
        if let Some(mut previous) = slot.take() {
            previous.stop()?;
        }
        device.start()?;
        info!("device started");
        *slot = Some(device);
        Ok(())
    }

    pub fn config(&self) -> &AudioStreamConfig {
        &self.shared.config
    }

    pub fn options(&self) -> &ContextOptions {
        &self.shared.options
    }

    pub fn sample_rate(&self) -> f32 {
        self.shared.config.sample_rate
    }

    pub fn render_quantum_frames(&self) -> usize {
        self.shared.quantum_frames()
    }

    pub fn current_sample_frame(&self) -> u64 {
        self.shared.clock.current_sample_frame()
    }

    pub fn current_time(&self) -> f64 {
        self.shared.clock.current_time()
    }

    /// Current time extrapolated by the wall-clock time since the last
    /// quantum was rendered.
    pub fn predicted_current_time(&self) -> f64 {
        self.shared.clock.predicted_current_time()
    }

    pub fn destination(&self) -> Node {
        self.destination.clone()
    }

    pub fn listener(&self) -> &Listener {
        &self.shared.listener
    }

    pub fn is_offline(&self) -> bool {
        self.shared.offline
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ContextClosed)
        } else {
            Ok(())
        }
    }

    /// Feed output `source_output` of `source` into input `destination_input`
    /// of `destination`.
    ///
    /// The edge exists once `destination` is next rendered.
    pub fn connect(&self, destination: &Node, source: &Node, destination_input: usize, source_output: usize) -> Result<()> {
        self.ensure_open()?;
        destination
            .queue_connect(destination_input, source, source_output)
            .inspect_err(|e| warn!(error = %e, "connect dropped"))?;
        debug!(
            destination = destination.name(),
            source = source.name(),
            destination_input,
            source_output,
            "connect queued"
        );
        Ok(())
    }

    pub fn disconnect(&self, destination: &Node, source: &Node, destination_input: usize, source_output: usize) -> Result<()> {
        self.ensure_open()?;
        destination
            .queue_disconnect(destination_input, source, source_output)
            .inspect_err(|e| warn!(error = %e, "disconnect dropped"))?;
        debug!(
            destination = destination.name(),
            source = source.name(),
            destination_input,
            source_output,
            "disconnect queued"
        );
        Ok(())
    }

    /// Remove every source from one input.
    pub fn disconnect_input(&self, destination: &Node, destination_input: usize) -> Result<()> {
        self.ensure_open()?;
        destination.queue_disconnect_input(destination_input)?;
        debug!(destination = destination.name(), destination_input, "input disconnect queued");
        Ok(())
    }

    /// Remove every source from every input of `destination`.
    pub fn disconnect_all_inputs(&self, destination: &Node) -> Result<()> {
        self.ensure_open()?;
        destination.queue_disconnect_all()?;
        debug!(destination = destination.name(), "disconnect all queued");
        Ok(())
    }

    /// Whether any output of `source` currently feeds `destination`.
    pub fn is_connected(&self, destination: &Node, source: &Node) -> bool {
        destination.is_connected_from(source)
    }

    /// Sum output `output` of `driver` into `param` at audio rate.
    pub fn connect_param(&self, param: &Param, driver: &Node, output: usize) -> Result<()> {
        self.ensure_open()?;
        check_output(driver, output)?;
        param.connect(driver, output)?;
        debug!(param = param.name(), driver = driver.name(), output, "param connect queued");
        Ok(())
    }

    pub fn disconnect_param(&self, param: &Param, driver: &Node, output: usize) -> Result<()> {
        self.ensure_open()?;
        check_output(driver, output)?;
        param.disconnect(driver, output)?;
        debug!(param = param.name(), driver = driver.name(), output, "param disconnect queued");
        Ok(())
    }

    pub fn disconnect_param_drivers(&self, param: &Param) -> Result<()> {
        self.ensure_open()?;
        param.disconnect_all()?;
        debug!(param = param.name(), "param disconnect all queued");
        Ok(())
    }

    /// Render `node` every quantum even when nothing downstream pulls it.
    pub fn add_automatic_pull_node(&self, node: &Node) {
        self.shared.add_automatic_pull(node);
    }

    pub fn remove_automatic_pull_node(&self, node: &Node) {
        self.shared.remove_automatic_pull(node);
    }

    /// Register `node` for automatic pull until the returned guard drops.
    pub(crate) fn automatic_pull_guard(&self, node: &Node) -> AutomaticPull {
        self.shared.add_automatic_pull(node);
        AutomaticPull {
            shared: Arc::downgrade(&self.shared),
            node: node.clone(),
        }
    }

    pub fn automatic_pull_nodes(&self) -> Vec<Node> {
        self.shared.automatic_pull.lock().clone()
    }

    /// Queued graph edits across every node and param of this context.
    pub fn pending_edits(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Block until every queued edit has been applied or `timeout` elapses.
    ///
    /// A timeout leaves the edits queued; they still apply when their owner
    /// is next rendered.
    pub fn synchronize_connections(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.pending_edits();
            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(pending, "synchronize_connections timed out");
                return Err(Error::Timeout { pending });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Defer `callback` to the event pump.
    pub fn enqueue_event(&self, callback: EventCallback) -> Result<()> {
        if self.shared.control.try_send_event(callback) {
            Ok(())
        } else {
            Err(Error::QueueFull {
                node: "event queue".to_owned(),
            })
        }
    }

    /// Completion callbacks the render thread lost to a full event queue.
    pub fn dropped_events(&self) -> u64 {
        self.shared.control.dropped_events()
    }

    /// Node references the render thread had to release itself because the
    /// retire queue and its backlog were both full.
    pub fn dropped_retires(&self) -> u64 {
        self.shared.control.dropped_retires()
    }

    /// Run every pending completion callback on the calling thread and drop
    /// retired nodes. Returns the number of callbacks run.
    ///
    /// Not needed when the context was created with background events.
    pub fn dispatch_events(&self) -> usize {
        self.shared.control.dispatch()
    }

    pub fn suspend(&self) {
        if !self.shared.suspended.swap(true, Ordering::AcqRel) {
            info!("context suspended");
        }
    }

    pub fn resume(&self) {
        if self.shared.suspended.swap(false, Ordering::AcqRel) {
            info!("context resumed");
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    /// Stop the device and the event pump and release the graph.
    ///
    /// Safe from any thread, including an event callback running on the
    /// background pump: that thread is left to exit on its own.
    ///
    /// Nodes the application still holds stay usable as objects; they just
    /// no longer render.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(mut device) = self.device.lock().take() {
            if let Err(e) = device.stop() {
                warn!(error = %e, "device stop failed");
            }
        }
        if let Some(thread) = self.event_thread.lock().take() {
            if thread.thread().id() == std::thread::current().id() {
                debug!("closed from the event thread");
            } else if thread.join().is_err() {
                warn!("event thread panicked");
            }
        }

        let mut roots = {
            let mut render = self.shared.render.lock();
            let mut roots = std::mem::take(&mut render.automatic_pull);
            roots.extend(render.destination.take());
            roots
        };
        roots.extend(std::mem::take(&mut *self.shared.automatic_pull.lock()));
        roots.extend(self.shared.incoming_pull.lock().take().into_iter().flatten());
        roots.push(self.destination.clone());
        roots.extend(self.shared.listener.detach_drivers());
        roots.extend(self.shared.control.take_retired());

        let released = break_cycles(roots);
        self.shared.control.dispatch();
        info!(released, "context closed");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("sample_rate", &self.sample_rate())
            .field("channels", &self.shared.config.channels)
            .field("frame", &self.current_sample_frame())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn check_output(node: &Node, output: usize) -> Result<()> {
    if output >= node.number_of_outputs() {
        return Err(Error::InvalidOutput {
            node: node.name().to_owned(),
            index: output,
        });
    }
    Ok(())
}

/// Walk the graph from `roots`, dropping every edge so reference cycles can
/// be freed. Returns the number of distinct nodes visited.
fn break_cycles(roots: Vec<Node>) -> usize {
    let mut seen = HashSet::new();
    let mut stack = roots;
    while let Some(node) = stack.pop() {
        if !seen.insert(node.id()) {
            continue;
        }
        stack.extend(node.detach_upstream());
    }
    seen.len()
}

fn spawn_event_thread(shared: Arc<Shared>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("schall-events".into())
        .spawn(move || {
            debug!("event thread running");
            let events = shared.control.events();
            let retired = shared.control.retired();
            while !shared.closed.load(Ordering::Acquire) {
                select! {
                    recv(events) -> callback => match callback {
                        Ok(callback) => callback(),
                        Err(_) => break,
                    },
                    recv(retired) -> nodes => match nodes {
                        Ok(nodes) => drop(nodes),
                        Err(_) => break,
                    },
                    default(Duration::from_millis(20)) => {}
                }
            }
            debug!("event thread exiting");
        })
        .map_err(|e| Error::Device(format!("failed to spawn event thread: {e}")))
}
