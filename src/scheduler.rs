//! Per-node start/stop state machine.
//!
//! Control threads call [`Scheduler::start`], [`Scheduler::stop`] and
//! [`Scheduler::reset`]; the render thread calls [`Scheduler::update`] once per
//! quantum from the owning node's processing step. Boundaries are absolute
//! sample frames on the context clock, so a start can land mid-quantum: the
//! update computes a render window (`render_offset`, `render_length`) and the
//! node zeroes everything outside it.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::EventCallback;
use crate::render::{Clock, RenderPass};

/// Length of the linear ramp applied where a scheduled node starts or stops.
pub const FADE_FRAMES: usize = 32;

const NEVER: u64 = u64::MAX;

/// Playback state of a scheduled node.
///
/// Ordering matters: the variants are declared in lifecycle order and the
/// scheduler compares them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SchedulingState {
    /// Created, not yet scheduled.
    Unscheduled = 0,
    /// A start boundary is pending.
    Scheduled,
    /// First audible quantum, rendered with a fade in.
    FadeIn,
    Playing,
    /// Last audible quantum, rendered with a fade out.
    Stopping,
    /// Returning to `Unscheduled` at the next update.
    Resetting,
    Finishing,
    Finished,
}

impl SchedulingState {
    pub fn name(self) -> &'static str {
        match self {
            SchedulingState::Unscheduled => "UNSCHEDULED",
            SchedulingState::Scheduled => "SCHEDULED",
            SchedulingState::FadeIn => "FADE_IN",
            SchedulingState::Playing => "PLAYING",
            SchedulingState::Stopping => "STOPPING",
            SchedulingState::Resetting => "RESETTING",
            SchedulingState::Finishing => "FINISHING",
            SchedulingState::Finished => "FINISHED",
        }
    }

    /// States in which the node produces sound.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SchedulingState::FadeIn | SchedulingState::Playing | SchedulingState::Stopping
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulingState::Unscheduled,
            1 => SchedulingState::Scheduled,
            2 => SchedulingState::FadeIn,
            3 => SchedulingState::Playing,
            4 => SchedulingState::Stopping,
            5 => SchedulingState::Resetting,
            6 => SchedulingState::Finishing,
            _ => SchedulingState::Finished,
        }
    }
}

impl std::fmt::Display for SchedulingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Start/stop bookkeeping for one node.
pub struct Scheduler {
    state: AtomicU8,
    /// State to return to if a pending reset is cancelled.
    before_reset: AtomicU8,
    start_when: AtomicU64,
    stop_when: AtomicU64,
    /// Sample frame of the quantum most recently updated.
    epoch: AtomicU64,
    render_offset: AtomicUsize,
    render_length: AtomicUsize,
    clock: Arc<Clock>,
    on_ended: Mutex<Option<EventCallback>>,
    on_start: Mutex<Option<EventCallback>>,
}

impl Scheduler {
    pub(crate) fn new(clock: Arc<Clock>) -> Self {
        Self {
            state: AtomicU8::new(SchedulingState::Unscheduled as u8),
            before_reset: AtomicU8::new(SchedulingState::Unscheduled as u8),
            start_when: AtomicU64::new(NEVER),
            stop_when: AtomicU64::new(NEVER),
            epoch: AtomicU64::new(0),
            render_offset: AtomicUsize::new(0),
            render_length: AtomicUsize::new(0),
            clock,
            on_ended: Mutex::new(None),
            on_start: Mutex::new(None),
        }
    }

    pub fn playback_state(&self) -> SchedulingState {
        SchedulingState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn has_finished(&self) -> bool {
        self.playback_state() == SchedulingState::Finished
    }

    /// First frame of this quantum that should be audible.
    pub fn render_offset(&self) -> usize {
        self.render_offset.load(Ordering::Relaxed)
    }

    /// Audible frames this quantum, counted from `render_offset`.
    pub fn render_length(&self) -> usize {
        self.render_length.load(Ordering::Relaxed)
    }

    /// Absolute start frame, if one is pending or reached.
    pub fn start_frame(&self) -> Option<u64> {
        Some(self.start_when.load(Ordering::Acquire)).filter(|w| *w != NEVER)
    }

    pub fn stop_frame(&self) -> Option<u64> {
        Some(self.stop_when.load(Ordering::Acquire)).filter(|w| *w != NEVER)
    }

    /// Called once the node stops or finishes. Dispatched off the render thread.
    pub fn set_on_ended(&self, callback: Option<EventCallback>) {
        *self.on_ended.lock() = callback;
    }

    /// Called when the node's first audible quantum renders.
    pub fn set_on_start(&self, callback: Option<EventCallback>) {
        *self.on_start.lock() = callback;
    }

    fn frames_from_now(&self, when: f64) -> u64 {
        let now = self.clock.current_sample_frame();
        let offset = (when.max(0.0) * self.clock.sample_rate() as f64).round() as u64;
        now.saturating_add(offset)
    }

    /// Schedule a start `when` seconds from the current context time.
    ///
    /// Only an unscheduled node can be started. A non-finite `when` instead
    /// cancels a pending stop or reset. Returns whether anything changed.
    pub fn start(&self, when: f64) -> bool {
        if !when.is_finite() {
            return self.cancel_pending();
        }

        // both boundaries are NEVER while unscheduled, so until the store
        // below lands the render thread just keeps waiting
        let claimed = self
            .state
            .compare_exchange(
                SchedulingState::Unscheduled as u8,
                SchedulingState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            self.start_when
                .store(self.frames_from_now(when), Ordering::Release);
        }
        claimed
    }

    fn cancel_pending(&self) -> bool {
        let state = self.playback_state();
        if state == SchedulingState::Resetting {
            let previous = self.before_reset.load(Ordering::Acquire);
            return self
                .state
                .compare_exchange(
                    SchedulingState::Resetting as u8,
                    previous,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        }
        if state < SchedulingState::Stopping {
            return self.stop_when.swap(NEVER, Ordering::AcqRel) != NEVER;
        }
        false
    }

    /// Schedule a stop `when` seconds from the current context time.
    ///
    /// Refused for nodes that were never started or are already stopping.
    pub fn stop(&self, when: f64) -> bool {
        let state = self.playback_state();
        if state < SchedulingState::Scheduled || state >= SchedulingState::Stopping {
            return false;
        }
        if !when.is_finite() {
            return false;
        }
        self.stop_when
            .store(self.frames_from_now(when), Ordering::Release);
        true
    }

    /// Force the node back to `Unscheduled` at the next update.
    pub fn reset(&self) {
        let previous = self.state.swap(SchedulingState::Resetting as u8, Ordering::AcqRel);
        if previous != SchedulingState::Resetting as u8 {
            self.before_reset.store(previous, Ordering::Release);
        }
    }

    /// Mark the node finished, firing the completion callback once.
    ///
    /// Used by sources that run out of material before any stop boundary.
    pub(crate) fn finish(&self, pass: &RenderPass<'_>) {
        let previous = self.state.swap(SchedulingState::Finished as u8, Ordering::AcqRel);
        if previous < SchedulingState::Finishing as u8 && previous >= SchedulingState::Scheduled as u8 {
            self.fire(&self.on_ended, pass);
        }
    }

    fn fire(&self, slot: &Mutex<Option<EventCallback>>, pass: &RenderPass<'_>) {
        // never wait on the render thread; a contended slot means the
        // callback is being replaced right now
        if let Some(guard) = slot.try_lock() {
            if let Some(callback) = guard.as_ref() {
                pass.enqueue_event(callback.clone());
            }
        }
    }

    /// Advance the state machine for the quantum starting at
    /// `pass.info.current_sample_frame`. Returns the state held before the
    /// update.
    pub(crate) fn update(&self, pass: &RenderPass<'_>) -> SchedulingState {
        let epoch = pass.info.current_sample_frame;
        let frames = pass.frames;
        let quantum_end = epoch + frames as u64;
        self.epoch.store(epoch, Ordering::Relaxed);

        let mut offset = 0usize;
        let mut length = frames;
        let previous = self.playback_state();
        let mut next = previous;

        match previous {
            SchedulingState::Unscheduled => {}
            SchedulingState::Scheduled => {
                let start = self.start_when.load(Ordering::Acquire);
                if start < quantum_end {
                    offset = start.saturating_sub(epoch) as usize;
                    length = frames - offset;
                    next = SchedulingState::FadeIn;
                    self.fire(&self.on_start, pass);
                }
            }
            SchedulingState::FadeIn | SchedulingState::Playing => {
                next = SchedulingState::Playing;
                let stop = self.stop_when.load(Ordering::Acquire);
                if stop < quantum_end {
                    length = stop.saturating_sub(epoch) as usize;
                    next = SchedulingState::Stopping;
                }
            }
            SchedulingState::Stopping => {
                next = SchedulingState::Unscheduled;
                length = 0;
                self.start_when.store(NEVER, Ordering::Release);
                self.stop_when.store(NEVER, Ordering::Release);
                self.fire(&self.on_ended, pass);
            }
            SchedulingState::Resetting => {
                next = SchedulingState::Unscheduled;
                length = 0;
                self.start_when.store(NEVER, Ordering::Release);
                self.stop_when.store(NEVER, Ordering::Release);
            }
            SchedulingState::Finishing | SchedulingState::Finished => {
                length = 0;
            }
        }

        if next != previous {
            // a control thread may have reset or restarted us meanwhile
            let _ = self.state.compare_exchange(
                previous as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        self.render_offset.store(offset, Ordering::Relaxed);
        self.render_length.store(length, Ordering::Relaxed);
        previous
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.playback_state())
            .field("start", &self.start_frame())
            .field("stop", &self.stop_frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{ControlQueues, SamplingInfo};
    use std::sync::atomic::AtomicUsize as Counter;

    const QUANTUM: usize = 128;

    struct Harness {
        clock: Arc<Clock>,
        queues: ControlQueues,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                clock: Arc::new(Clock::new(48_000.0)),
                queues: ControlQueues::new(16, 16),
            }
        }

        /// Run one update at the clock's current frame, then advance it.
        fn quantum(&self, scheduler: &Scheduler) -> SchedulingState {
            let info = SamplingInfo::at_frame(self.clock.current_sample_frame(), 48_000.0);
            let pass = RenderPass::new(info, 1, QUANTUM, &self.queues);
            scheduler.update(&pass);
            self.clock.advance(QUANTUM as u64);
            scheduler.playback_state()
        }

        fn fire_events(&self) -> usize {
            self.queues.dispatch()
        }
    }

    #[test]
    fn start_fade_in_then_play() {
        let h = Harness::new();
        let s = Scheduler::new(h.clock.clone());

        assert_eq!(s.playback_state(), SchedulingState::Unscheduled);
        assert!(s.start(0.0));
        assert_eq!(s.playback_state(), SchedulingState::Scheduled);
        assert!(!s.start(0.0), "already scheduled");

        assert_eq!(h.quantum(&s), SchedulingState::FadeIn);
        assert_eq!(s.render_offset(), 0);
        assert_eq!(s.render_length(), QUANTUM);

        assert_eq!(h.quantum(&s), SchedulingState::Playing);
        assert_eq!(h.quantum(&s), SchedulingState::Playing);
    }

    #[test]
    fn mid_quantum_start_sets_offset() {
        let h = Harness::new();
        let s = Scheduler::new(h.clock.clone());

        // 200 frames from now: second quantum, offset 72
        s.start(200.0 / 48_000.0);
        assert_eq!(h.quantum(&s), SchedulingState::Scheduled);
        assert_eq!(h.quantum(&s), SchedulingState::FadeIn);
        assert_eq!(s.render_offset(), 72);
        assert_eq!(s.render_length(), QUANTUM - 72);
    }

    #[test]
    fn stop_fires_exactly_one_event() {
        let h = Harness::new();
        let s = Scheduler::new(h.clock.clone());
        let ended = Arc::new(Counter::new(0));
        let counter = ended.clone();
        s.set_on_ended(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        s.start(0.0);
        h.quantum(&s);
        h.quantum(&s);
        assert_eq!(s.playback_state(), SchedulingState::Playing);

        assert!(s.stop(0.0));
        assert_eq!(h.quantum(&s), SchedulingState::Stopping);
        assert_eq!(s.render_length(), 0);
        assert!(!s.stop(0.0), "already stopping");

        assert_eq!(h.quantum(&s), SchedulingState::Unscheduled);
        h.quantum(&s);
        h.quantum(&s);

        assert_eq!(h.fire_events(), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refused_start_changes_nothing() {
        let h = Harness::new();
        let s = Scheduler::new(h.clock.clone());

        s.start(1.0);
        let start = s.start_frame();
        assert!(!s.start(0.0), "already scheduled");
        assert_eq!(s.start_frame(), start);
        assert_eq!(h.quantum(&s), SchedulingState::Scheduled);

        let s = Scheduler::new(h.clock.clone());
        s.start(0.0);
        h.quantum(&s);
        h.quantum(&s);
        assert!(s.stop(0.0));
        let stop = s.stop_frame();
        assert!(!s.start(0.0), "already playing");
        assert_eq!(s.stop_frame(), stop);
        assert_eq!(h.quantum(&s), SchedulingState::Stopping);
        assert_eq!(h.quantum(&s), SchedulingState::Unscheduled);
    }

    #[test]
    fn stop_mid_quantum_limits_length() {
        let h = Harness::new();
        let s = Scheduler::new(h.clock.clone());
        s.start(0.0);
        h.quantum(&s);
        s.stop(40.0 / 48_000.0);
        assert_eq!(h.quantum(&s), SchedulingState::Stopping);
        assert_eq!(s.render_offset(), 0);
        assert_eq!(s.render_length(), 40);
    }

    #[test]
    fn stop_refused_before_start() {
        let h = Harness::new();
        let s = Scheduler::new(h.clock.clone());
        assert!(!s.stop(0.0));
    }

    #[test]
    fn reset_returns_to_unscheduled() {
        let h = Harness::new();
        let s = Scheduler::new(h.clock.clone());
        s.start(0.0);
        h.quantum(&s);
        s.reset();
        assert_eq!(s.playback_state(), SchedulingState::Resetting);
        assert_eq!(h.quantum(&s), SchedulingState::Unscheduled);
        assert!(s.start(0.0), "restartable after reset");
    }

    #[test]
    fn non_finite_start_cancels_stop_and_reset() {
        let h = Harness::new();
        let s = Scheduler::new(h.clock.clone());
        s.start(0.0);
        h.quantum(&s);
        h.quantum(&s);

        s.stop(1.0);
        assert!(s.stop_frame().is_some());
        assert!(s.start(f64::INFINITY));
        assert!(s.stop_frame().is_none());

        s.reset();
        assert!(s.start(f64::NAN));
        assert_eq!(s.playback_state(), SchedulingState::Playing);
    }

    #[test]
    fn finish_fires_once() {
        let h = Harness::new();
        let s = Scheduler::new(h.clock.clone());
        s.set_on_ended(Some(Arc::new(|| {})));
        s.start(0.0);
        h.quantum(&s);

        let info = SamplingInfo::at_frame(h.clock.current_sample_frame(), 48_000.0);
        let pass = RenderPass::new(info, 2, QUANTUM, &h.queues);
        s.finish(&pass);
        s.finish(&pass);
        assert!(s.has_finished());
        assert_eq!(h.fire_events(), 1);
    }
}
