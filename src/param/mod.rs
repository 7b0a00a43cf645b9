//! Automatable parameters.
//!
//! A [`Param`] combines three sources into the value a node reads each quantum:
//!
//! 1. the intrinsic value set with [`Param::set_value`] (de-zippered by
//!    [`Param::smooth`]),
//! 2. a [`Timeline`] of scheduled automation events (sample accurate, bypasses
//!    smoothing),
//! 3. audio-rate drivers: node outputs connected to the param, summed at unity
//!    gain on top of the intrinsic value.
//!
//! Driver connections follow the same discipline as node edges: requests are
//! queued and applied when the owning node next renders.

mod timeline;

pub use timeline::{ParamEvent, ParamEventKind, Timeline, TimelineError};

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::graph::{EdgeSnapshot, OpQueue, Source};
use crate::node::Node;
use crate::render::{Clock, RenderPass};

/// Default per-quantum smoothing factor for intrinsic value changes.
pub const DEFAULT_SMOOTHING_CONSTANT: f32 = 0.05;

/// Smoothed values closer than this to the target snap to it.
pub const SNAP_THRESHOLD: f32 = 0.001;

/// Static description of a param, declared once per node type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamDescriptor {
    pub name: &'static str,
    pub short_name: &'static str,
    pub default: f32,
    pub min: f32,
    pub max: f32,
}

impl ParamDescriptor {
    pub const fn new(name: &'static str, short_name: &'static str, default: f32, min: f32, max: f32) -> Self {
        Self {
            name,
            short_name,
            default,
            min,
            max,
        }
    }
}

#[derive(Default)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    #[inline]
    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release)
    }
}

pub(crate) enum ParamOp {
    Connect(Source),
    Disconnect(Source),
    DisconnectAll,
}

/// Render-thread state: the drivers summed into the param.
#[derive(Default)]
struct Junction {
    sources: Vec<Source>,
}

/// A sample-accurate automatable value.
pub struct Param {
    descriptor: ParamDescriptor,
    value: AtomicF32,
    smoothed: AtomicF32,
    smoothing_constant: AtomicF32,
    timeline: Mutex<Timeline>,
    event_count: AtomicUsize,
    junction: Mutex<Junction>,
    driver_count: AtomicUsize,
    queue: OpQueue<ParamOp>,
    edges: EdgeSnapshot,
    clock: Arc<Clock>,
}

impl Param {
    pub(crate) fn new(descriptor: ParamDescriptor, queue: OpQueue<ParamOp>, clock: Arc<Clock>) -> Self {
        Self {
            descriptor,
            value: AtomicF32::new(descriptor.default),
            smoothed: AtomicF32::new(descriptor.default),
            smoothing_constant: AtomicF32::new(DEFAULT_SMOOTHING_CONSTANT),
            timeline: Mutex::new(Timeline::new()),
            event_count: AtomicUsize::new(0),
            junction: Mutex::new(Junction::default()),
            driver_count: AtomicUsize::new(0),
            queue,
            edges: EdgeSnapshot::new(),
            clock,
        }
    }

    pub fn descriptor(&self) -> &ParamDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn short_name(&self) -> &'static str {
        self.descriptor.short_name
    }

    pub fn default_value(&self) -> f32 {
        self.descriptor.default
    }

    pub fn min_value(&self) -> f32 {
        self.descriptor.min
    }

    pub fn max_value(&self) -> f32 {
        self.descriptor.max
    }

    /// The intrinsic value, without drivers.
    pub fn value(&self) -> f32 {
        self.value.load()
    }

    /// Set the intrinsic value. NaN and infinities are ignored.
    pub fn set_value(&self, value: f32) {
        if value.is_finite() {
            self.value.store(value);
        }
    }

    pub fn smoothed_value(&self) -> f32 {
        self.smoothed.load()
    }

    /// Snap the smoothed value, e.g. after a node reset.
    pub fn reset_smoothed_value(&self, value: f32) {
        if value.is_finite() {
            self.smoothed.store(value);
        }
    }

    pub fn smoothing_constant(&self) -> f32 {
        self.smoothing_constant.load()
    }

    pub fn set_smoothing_constant(&self, k: f32) {
        if k.is_finite() {
            self.smoothing_constant.store(k.clamp(0.0, 1.0));
        }
    }

    fn edit_timeline(&self, edit: impl FnOnce(&mut Timeline) -> std::result::Result<(), TimelineError>) -> Result<()> {
        let mut timeline = self.timeline.lock();
        let result = edit(&mut timeline);
        self.event_count.store(timeline.len(), Ordering::Release);
        Ok(result?)
    }

    pub fn set_value_at_time(&self, value: f32, time: f64) -> Result<()> {
        self.edit_timeline(|t| {
            t.insert(ParamEvent {
                kind: ParamEventKind::SetValue,
                value,
                time,
            })
        })
    }

    pub fn linear_ramp_to_value_at_time(&self, value: f32, time: f64) -> Result<()> {
        self.edit_timeline(|t| {
            t.insert(ParamEvent {
                kind: ParamEventKind::LinearRamp,
                value,
                time,
            })
        })
    }

    pub fn exponential_ramp_to_value_at_time(&self, value: f32, time: f64) -> Result<()> {
        self.edit_timeline(|t| {
            t.insert(ParamEvent {
                kind: ParamEventKind::ExponentialRamp,
                value,
                time,
            })
        })
    }

    /// Approach `target` from `time` on with time constant `time_constant` seconds.
    pub fn set_target_at_time(&self, target: f32, time: f64, time_constant: f64) -> Result<()> {
        self.edit_timeline(|t| {
            t.insert(ParamEvent {
                kind: ParamEventKind::SetTarget { time_constant },
                value: target,
                time,
            })
        })
    }

    /// Play `curve` stretched over `duration` seconds starting at `time`.
    pub fn set_value_curve_at_time(&self, curve: impl Into<Arc<[f32]>>, time: f64, duration: f64) -> Result<()> {
        let curve = curve.into();
        self.edit_timeline(|t| {
            t.insert(ParamEvent {
                kind: ParamEventKind::SetValueCurve { curve, duration },
                value: 0.0,
                time,
            })
        })
    }

    pub fn cancel_scheduled_values(&self, start_time: f64) {
        let _ = self.edit_timeline(|t| {
            t.cancel_scheduled_values(start_time);
            Ok(())
        });
    }

    /// Number of events currently on the timeline.
    pub fn scheduled_event_count(&self) -> usize {
        self.event_count.load(Ordering::Acquire)
    }

    /// Queue a driver connection. Applied at the owning node's next render.
    pub(crate) fn connect(&self, driver: &Node, output: usize) -> Result<()> {
        self.queue.push(ParamOp::Connect(Source::new(driver.clone(), output)), self.name())
    }

    pub(crate) fn disconnect(&self, driver: &Node, output: usize) -> Result<()> {
        self.queue.push(ParamOp::Disconnect(Source::new(driver.clone(), output)), self.name())
    }

    pub(crate) fn disconnect_all(&self) -> Result<()> {
        self.queue.push(ParamOp::DisconnectAll, self.name())
    }

    /// Whether `driver`'s output is currently summed into this param.
    ///
    /// Reflects applied edits only; queued ones are not visible yet.
    pub fn is_connected(&self, driver: &Node, output: usize) -> bool {
        let id = driver.id();
        self.edges.any(|e| e.source == id && e.output == output)
    }

    pub fn number_of_drivers(&self) -> usize {
        self.driver_count.load(Ordering::Acquire)
    }

    /// True when this quantum's value must be computed per sample: the
    /// timeline has events, a driver is connected, or driver edits are pending.
    pub fn has_sample_accurate_values(&self) -> bool {
        self.scheduled_event_count() > 0 || self.number_of_drivers() > 0 || !self.queue.is_empty()
    }

    /// Apply queued driver edits in FIFO order. Render thread only.
    pub(crate) fn service_queue(&self, pass: &RenderPass<'_>) {
        if self.queue.is_empty() && !self.edges.is_stale() {
            return;
        }
        let Some(mut junction) = self.junction.try_lock() else {
            return;
        };
        let mut applied = 0;
        for op in self.queue.drain() {
            applied += 1;
            match op {
                ParamOp::Connect(source) => {
                    if junction.sources.contains(&source) {
                        pass.retire(source.into_node());
                    } else {
                        junction.sources.push(source);
                    }
                }
                ParamOp::Disconnect(source) => {
                    if let Some(at) = junction.sources.iter().position(|s| *s == source) {
                        pass.retire(junction.sources.swap_remove(at).into_node());
                    }
                    pass.retire(source.into_node());
                }
                ParamOp::DisconnectAll => {
                    for source in junction.sources.drain(..) {
                        pass.retire(source.into_node());
                    }
                }
            }
        }
        self.driver_count.store(junction.sources.len(), Ordering::Release);
        self.edges.applied(applied);
        self.queue
            .settle(self.edges.publish(junction.sources.iter().map(|s| s.edge(0))));
    }

    /// Render every driver for this quantum. Render thread only.
    pub(crate) fn pull_drivers(&self, pass: &RenderPass<'_>) {
        if self.number_of_drivers() == 0 {
            return;
        }
        if let Some(junction) = self.junction.try_lock() {
            for source in junction.sources.iter() {
                source.node().process_if_necessary(pass);
            }
        }
    }

    /// Intrinsic value at the current context time (timeline applied, no
    /// smoothing, no drivers).
    pub(crate) fn value_for_current_time(&self) -> f32 {
        let current = self.value.load();
        if self.scheduled_event_count() == 0 {
            return current;
        }
        let timeline_value = self.timeline.try_lock().and_then(|t| {
            t.value_at(
                self.clock.current_time(),
                current,
                self.clock.sample_rate() as f64,
                crate::config::RENDER_QUANTUM_FRAMES,
            )
        });
        match timeline_value {
            Some(v) => {
                self.value.store(v);
                v
            }
            None => current,
        }
    }

    /// Move the smoothed value one step toward the intrinsic value.
    ///
    /// Timeline values are taken exactly. Returns true once the smoothed
    /// value has converged.
    pub(crate) fn smooth(&self) -> bool {
        let had_timeline = self.scheduled_event_count() > 0;
        let value = self.value_for_current_time();
        let smoothed = self.smoothed.load();

        if smoothed == value {
            return true;
        }

        let next = if had_timeline {
            value
        } else {
            let k = self.smoothing_constant.load();
            let step = smoothed + (value - smoothed) * k;
            if (step - value).abs() < SNAP_THRESHOLD {
                value
            } else {
                step
            }
        };
        self.smoothed.store(next);
        false
    }

    /// Control-rate value: intrinsic (with timeline) plus the first sample of
    /// every driver.
    pub(crate) fn final_value(&self) -> f32 {
        let mut value = self.value_for_current_time();
        if self.number_of_drivers() > 0 {
            if let Some(junction) = self.junction.try_lock() {
                for source in junction.sources.iter() {
                    if let Some(bus) = source.output_bus() {
                        if bus.number_of_channels() > 0 && !bus.channel(0).is_silent() {
                            value += bus.channel(0).data().first().copied().unwrap_or(0.0);
                        }
                    }
                }
            }
        }
        value
    }

    /// Fill `values` with this quantum's per-sample values: the timeline (or
    /// the intrinsic value broadcast) plus the unity-gain sum of every
    /// driver's channel 0.
    pub(crate) fn calculate_sample_accurate_values(&self, pass: &RenderPass<'_>, values: &mut [f32]) {
        if values.is_empty() {
            return;
        }

        let sample_rate = pass.sample_rate() as f64;
        let start = pass.current_time();
        let end = start + values.len() as f64 / sample_rate;
        let current = self.value.load();

        let last = match self.timeline.try_lock() {
            Some(timeline) => {
                timeline.values_for_time_range(start, end, current, values, sample_rate, sample_rate)
            }
            None => {
                values.fill(current);
                current
            }
        };
        self.value.store(last);

        if self.number_of_drivers() == 0 {
            return;
        }
        let Some(junction) = self.junction.try_lock() else {
            return;
        };
        for source in junction.sources.iter() {
            let Some(bus) = source.output_bus() else {
                continue;
            };
            if bus.number_of_channels() == 0 || bus.channel(0).is_silent() {
                continue;
            }
            for (v, d) in values.iter_mut().zip(bus.channel(0).data()) {
                *v += *d;
            }
        }
    }

    /// Drop all driver references. Used when a context closes to break cycles.
    pub(crate) fn clear_drivers(&self) -> Vec<Node> {
        let mut junction = self.junction.lock();
        self.driver_count.store(0, Ordering::Release);
        let mut drivers: Vec<Node> = junction.sources.drain(..).map(Source::into_node).collect();
        let mut drained = 0;
        for op in self.queue.drain() {
            drained += 1;
            match op {
                ParamOp::Connect(source) | ParamOp::Disconnect(source) => drivers.push(source.into_node()),
                ParamOp::DisconnectAll => {}
            }
        }
        self.queue.settle(drained + self.edges.clear());
        drivers
    }

    pub(crate) fn has_pending_edits(&self) -> bool {
        !self.queue.is_empty()
    }
}

impl std::fmt::Debug for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.descriptor.name)
            .field("value", &self.value())
            .field("events", &self.scheduled_event_count())
            .field("drivers", &self.number_of_drivers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const GAIN: ParamDescriptor = ParamDescriptor::new("gain", "G", 1.0, 0.0, 10.0);

    fn param() -> Param {
        let clock = Arc::new(Clock::new(48_000.0));
        let queue = OpQueue::new(8, Arc::new(AtomicUsize::new(0)));
        Param::new(GAIN, queue, clock)
    }

    #[test]
    fn descriptor_values() {
        let p = param();
        assert_eq!(p.name(), "gain");
        assert_eq!(p.short_name(), "G");
        assert_eq!(p.value(), 1.0);
        assert_eq!(p.min_value(), 0.0);
        assert_eq!(p.max_value(), 10.0);
    }

    #[test]
    fn non_finite_values_rejected() {
        let p = param();
        p.set_value(0.25);
        p.set_value(f32::NAN);
        p.set_value(f32::INFINITY);
        assert_eq!(p.value(), 0.25);
    }

    #[test]
    fn smoothing_approaches_and_snaps() {
        let p = param();
        p.set_value(0.0);
        assert!(!p.smooth());
        assert!((p.smoothed_value() - 0.95).abs() < 1e-6);

        let mut steps = 1;
        while !p.smooth() {
            steps += 1;
            assert!(steps < 1000);
        }
        assert_eq!(p.smoothed_value(), 0.0);
    }

    #[test]
    fn timeline_bypasses_smoothing() {
        let p = param();
        p.set_value_at_time(0.5, 0.0).unwrap();
        p.smooth();
        assert_eq!(p.smoothed_value(), 0.5);
        assert_eq!(p.value(), 0.5);
    }

    #[test]
    fn sample_accurate_flag() {
        let p = param();
        assert!(!p.has_sample_accurate_values());
        p.linear_ramp_to_value_at_time(0.0, 1.0).unwrap();
        assert!(p.has_sample_accurate_values());
        p.cancel_scheduled_values(0.0);
        assert!(!p.has_sample_accurate_values());
    }
}
