//! The per-quantum render driver and the context timebase.
//!
//! [`pull_graph`] is the single entry point a device backend reaches through
//! [`RenderCallback::render`](crate::device::RenderCallback::render). It never
//! blocks: if the render lock is contended or the context is not running, the
//! destination is zeroed and the call returns.
//!
//! REAL-TIME SAFE: nothing reachable from here logs, and allocation only
//! happens when graph connectivity changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};

use crate::bus::{Bus, ChannelInterpretation};
use crate::context::{EventCallback, Shared};
use crate::node::Node;

/// Timing snapshot handed to the render callback by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SamplingInfo {
    pub current_sample_frame: u64,
    pub current_time: f64,
    pub sampling_rate: f32,
}

impl SamplingInfo {
    pub fn at_frame(current_sample_frame: u64, sampling_rate: f32) -> Self {
        Self {
            current_sample_frame,
            current_time: current_sample_frame as f64 / sampling_rate as f64,
            sampling_rate,
        }
    }
}

/// Monotonic sample clock shared by a context and its nodes.
#[derive(Debug)]
pub struct Clock {
    sample_rate: f32,
    frame: AtomicU64,
    epoch: AtomicU64,
    rendered_at: Mutex<Option<Instant>>,
}

impl Clock {
    pub(crate) fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            frame: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            rendered_at: Mutex::new(None),
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// First frame of the quantum being (or last) rendered.
    #[inline]
    pub fn current_sample_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub fn current_time(&self) -> f64 {
        self.current_sample_frame() as f64 / self.sample_rate as f64
    }

    /// Context time extrapolated by the wall-clock time since the last render.
    pub fn predicted_current_time(&self) -> f64 {
        let elapsed = self
            .rendered_at
            .try_lock()
            .and_then(|at| *at)
            .map_or(0.0, |at| at.elapsed().as_secs_f64());
        self.current_time() + elapsed
    }

    /// Number of quanta rendered so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn set_frame(&self, frame: u64) {
        self.frame.store(frame, Ordering::Release);
        if let Some(mut at) = self.rendered_at.try_lock() {
            *at = Some(Instant::now());
        }
    }

    #[cfg(test)]
    pub(crate) fn advance(&self, frames: u64) {
        self.frame.fetch_add(frames, Ordering::AcqRel);
    }

    /// Start a new quantum. Epochs start at 1 so a fresh node never looks
    /// already-processed.
    pub(crate) fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Node references released on the render thread, dropped on a control
/// thread.
pub(crate) enum Retired {
    Node(Node),
    List(Vec<Node>),
}

impl Retired {
    fn into_nodes(self, out: &mut Vec<Node>) {
        match self {
            Retired::Node(node) => out.push(node),
            Retired::List(nodes) => out.extend(nodes),
        }
    }
}

/// Render-to-control handoff.
///
/// Completion callbacks and retired nodes travel on separate bounded
/// channels, so a burst of graph edits never crowds out an event. A retire
/// that finds its channel full is parked in a backlog with preallocated
/// capacity and sent again after the quantum.
pub(crate) struct ControlQueues {
    events_tx: Sender<EventCallback>,
    events_rx: Receiver<EventCallback>,
    retired_tx: Sender<Retired>,
    retired_rx: Receiver<Retired>,
    backlog: Mutex<Vec<Retired>>,
    dropped_events: AtomicU64,
    dropped_retires: AtomicU64,
}

impl ControlQueues {
    pub(crate) fn new(event_capacity: usize, retire_capacity: usize) -> Self {
        let retire_capacity = retire_capacity.max(1);
        let (events_tx, events_rx) = bounded(event_capacity.max(1));
        let (retired_tx, retired_rx) = bounded(retire_capacity);
        Self {
            events_tx,
            events_rx,
            retired_tx,
            retired_rx,
            backlog: Mutex::new(Vec::with_capacity(retire_capacity)),
            dropped_events: AtomicU64::new(0),
            dropped_retires: AtomicU64::new(0),
        }
    }

    pub(crate) fn try_send_event(&self, callback: EventCallback) -> bool {
        self.events_tx.try_send(callback).is_ok()
    }

    fn send_event(&self, callback: EventCallback) {
        if !self.try_send_event(callback) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn retire(&self, retired: Retired) {
        let retired = match self.retired_tx.try_send(retired) {
            Ok(()) => return,
            Err(TrySendError::Full(r) | TrySendError::Disconnected(r)) => r,
        };
        if let Some(mut backlog) = self.backlog.try_lock() {
            // within capacity, so the push never allocates
            if backlog.len() < backlog.capacity() {
                backlog.push(retired);
                return;
            }
        }
        self.dropped_retires.fetch_add(1, Ordering::Relaxed);
        drop(retired);
    }

    /// Move parked retires into the channel while it has room.
    pub(crate) fn flush_backlog(&self) {
        let Some(mut backlog) = self.backlog.try_lock() else {
            return;
        };
        while let Some(retired) = backlog.pop() {
            if let Err(TrySendError::Full(r) | TrySendError::Disconnected(r)) = self.retired_tx.try_send(retired) {
                backlog.push(r);
                break;
            }
        }
    }

    pub(crate) fn events(&self) -> &Receiver<EventCallback> {
        &self.events_rx
    }

    pub(crate) fn retired(&self) -> &Receiver<Retired> {
        &self.retired_rx
    }

    /// Drop every retired node, then run every queued callback, on the
    /// calling thread. Returns the number of callbacks run.
    pub(crate) fn dispatch(&self) -> usize {
        while let Ok(retired) = self.retired_rx.try_recv() {
            drop(retired);
        }
        let mut events = 0;
        while let Ok(callback) = self.events_rx.try_recv() {
            callback();
            events += 1;
        }
        events
    }

    /// Every node still waiting to be retired, queued or parked.
    pub(crate) fn take_retired(&self) -> Vec<Node> {
        let mut nodes = Vec::new();
        while let Ok(retired) = self.retired_rx.try_recv() {
            retired.into_nodes(&mut nodes);
        }
        for retired in self.backlog.lock().drain(..) {
            retired.into_nodes(&mut nodes);
        }
        nodes
    }

    /// Callbacks lost because the event queue was full.
    pub(crate) fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Node references that had to be released on the render thread.
    pub(crate) fn dropped_retires(&self) -> u64 {
        self.dropped_retires.load(Ordering::Relaxed)
    }
}

/// Everything one quantum's traversal needs to know.
pub(crate) struct RenderPass<'a> {
    pub info: SamplingInfo,
    pub epoch: u64,
    pub frames: usize,
    control: &'a ControlQueues,
    live_input: Option<&'a Mutex<Bus>>,
}

impl<'a> RenderPass<'a> {
    pub(crate) fn new(info: SamplingInfo, epoch: u64, frames: usize, control: &'a ControlQueues) -> Self {
        Self {
            info,
            epoch,
            frames,
            control,
            live_input: None,
        }
    }

    pub(crate) fn with_live_input(mut self, live_input: &'a Mutex<Bus>) -> Self {
        self.live_input = Some(live_input);
        self
    }

    /// This quantum's hardware input, unless it is being published right now.
    pub fn live_input(&self) -> Option<MutexGuard<'a, Bus>> {
        self.live_input.and_then(Mutex::try_lock)
    }

    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.info.sampling_rate
    }

    #[inline]
    pub fn current_time(&self) -> f64 {
        self.info.current_time
    }

    /// Defer a callback to the control-thread pump. Counted as dropped if the
    /// queue is full.
    pub fn enqueue_event(&self, callback: EventCallback) {
        self.control.send_event(callback);
    }

    /// Hand a node reference to the control thread so its last drop never
    /// happens here.
    pub fn retire(&self, node: Node) {
        self.control.retire(Retired::Node(node));
    }

    pub fn retire_list(&self, nodes: Vec<Node>) {
        if nodes.is_empty() {
            return;
        }
        self.control.retire(Retired::List(nodes));
    }
}

/// Flush-to-zero and denormals-are-zero for the lifetime of the guard.
pub(crate) struct DenormalGuard {
    #[cfg(target_arch = "x86_64")]
    previous: u32,
}

#[cfg(target_arch = "x86_64")]
const FTZ_DAZ: u32 = 0x8040;

impl DenormalGuard {
    #[cfg(target_arch = "x86_64")]
    #[allow(deprecated)]
    pub(crate) fn new() -> Self {
        use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};
        // SAFETY: SSE is part of the x86_64 baseline; only the FTZ and DAZ
        // bits change and the previous word is restored on drop.
        let previous = unsafe { _mm_getcsr() };
        unsafe { _mm_setcsr(previous | FTZ_DAZ) };
        Self { previous }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub(crate) fn new() -> Self {
        Self {}
    }
}

impl Drop for DenormalGuard {
    #[cfg(target_arch = "x86_64")]
    #[allow(deprecated)]
    fn drop(&mut self) {
        use std::arch::x86_64::_mm_setcsr;
        // SAFETY: restores the control word read in `new`.
        unsafe { _mm_setcsr(self.previous) };
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn drop(&mut self) {}
}

/// Render one quantum of the graph into `destination`.
///
/// `source` is the live hardware input for this quantum, if the device has
/// one. `frames` must equal the context's quantum size.
pub(crate) fn pull_graph(
    shared: &Shared,
    source: Option<&Bus>,
    destination: &mut Bus,
    frames: usize,
    info: &SamplingInfo,
) {
    let Some(mut state) = shared.render.try_lock() else {
        destination.zero();
        return;
    };

    if !shared.is_rendering() || frames != shared.quantum_frames() {
        debug_assert!(frames == shared.quantum_frames(), "device asked for {frames} frames");
        destination.zero();
        return;
    }

    let _denormals = DenormalGuard::new();

    let pass = shared.handle_pre_render_tasks(&mut state, info, frames);

    if let Some(mut live) = shared.live_input.try_lock() {
        match source {
            Some(source) => live.copy_from(source, ChannelInterpretation::Speakers),
            None => live.zero(),
        }
    }

    match state.destination.as_ref() {
        Some(root) => {
            root.process_if_necessary(&pass);
            match root.output_bus(0) {
                Some(output) => destination.copy_from(&output, ChannelInterpretation::Speakers),
                None => destination.zero(),
            }
        }
        None => destination.zero(),
    }

    for node in state.automatic_pull.iter() {
        node.process_if_necessary(&pass);
    }

    shared.handle_post_render_tasks(&pass);
}
