//! Scheduled automation events for a [`Param`](super::Param).

use std::sync::Arc;

use thiserror::Error;

/// Rejected timeline insertions.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TimelineError {
    #[error("timeline event has a non-finite or negative field")]
    InvalidEvent,
    #[error("value curve at {time}s overlaps an existing event")]
    CurveOverlap { time: f64 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParamEventKind {
    SetValue,
    LinearRamp,
    ExponentialRamp,
    SetTarget { time_constant: f64 },
    SetValueCurve { curve: Arc<[f32]>, duration: f64 },
}

impl ParamEventKind {
    fn same_type(&self, other: &ParamEventKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// One automation point. `time` is in context seconds.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamEvent {
    pub kind: ParamEventKind,
    pub value: f32,
    pub time: f64,
}

impl ParamEvent {
    fn is_valid(&self) -> bool {
        let fields_ok = self.value.is_finite() && self.time.is_finite() && self.time >= 0.0;
        match &self.kind {
            ParamEventKind::SetTarget { time_constant } => fields_ok && time_constant.is_finite() && *time_constant >= 0.0,
            ParamEventKind::SetValueCurve { duration, .. } => fields_ok && duration.is_finite() && *duration >= 0.0,
            _ => fields_ok,
        }
    }

    fn curve_end(&self) -> Option<f64> {
        match &self.kind {
            ParamEventKind::SetValueCurve { duration, .. } => Some(self.time + duration),
            _ => None,
        }
    }
}

#[inline]
fn time_to_sample_frame(time: f64, sample_rate: f64) -> usize {
    (time * sample_rate).round().max(0.0) as usize
}

/// `1 - e^(-1 / (rate * time_constant))`
#[inline]
fn discrete_time_constant(time_constant: f64, rate: f64) -> f64 {
    1.0 - (-1.0 / (rate * time_constant)).exp()
}

/// Time-ordered automation events.
#[derive(Clone, Debug, Default)]
pub struct Timeline {
    events: Vec<ParamEvent>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[ParamEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Insert keeping events sorted by time. An event of the same type at the
    /// same time replaces the existing one; value curves may not overlap other
    /// events.
    pub fn insert(&mut self, event: ParamEvent) -> Result<(), TimelineError> {
        if !event.is_valid() {
            return Err(TimelineError::InvalidEvent);
        }

        let mut index = self.events.len();
        for (i, existing) in self.events.iter().enumerate() {
            if let Some(end) = event.curve_end() {
                if existing.time > event.time && existing.time < end {
                    return Err(TimelineError::CurveOverlap { time: event.time });
                }
            } else if let Some(end) = existing.curve_end() {
                if event.time >= existing.time && event.time < end {
                    return Err(TimelineError::CurveOverlap { time: existing.time });
                }
            }

            if existing.time == event.time && existing.kind.same_type(&event.kind) {
                self.events[i] = event;
                return Ok(());
            }

            if existing.time > event.time {
                index = i;
                break;
            }
        }

        self.events.insert(index, event);
        Ok(())
    }

    /// Drop every event at or after `start_time`.
    pub fn cancel_scheduled_values(&mut self, start_time: f64) {
        if let Some(first) = self.events.iter().position(|e| e.time >= start_time) {
            self.events.truncate(first);
        }
    }

    /// Single value at `time`, or `None` before the first event.
    ///
    /// Evaluated at control rate, one step per quantum.
    pub fn value_at(&self, time: f64, default: f32, sample_rate: f64, quantum: usize) -> Option<f32> {
        let first = self.events.first()?;
        if time < first.time {
            return None;
        }
        let end = time + 1.1 / sample_rate;
        let control_rate = sample_rate / quantum as f64;
        let mut value = [default];
        Some(self.values_for_time_range(time, end, default, &mut value, sample_rate, control_rate))
    }

    /// Fill `values` with the automation curve over `[start, end)`.
    ///
    /// Before the first event `default` is used. Returns the last value
    /// written, which callers store as the param's intrinsic value.
    pub fn values_for_time_range(
        &self,
        start: f64,
        end: f64,
        default: f32,
        values: &mut [f32],
        sample_rate: f64,
        control_rate: f64,
    ) -> f32 {
        let count = values.len();
        match self.events.first() {
            Some(first) if end > first.time => {}
            _ => {
                values.fill(default);
                return default;
            }
        }

        let mut current_time = start;
        let mut write = 0usize;

        let first_time = self.events[0].time;
        if first_time > start {
            let fill_to_time = end.min(first_time);
            let fill_to = time_to_sample_frame(fill_to_time - start, sample_rate).min(count);
            values[write..fill_to].fill(default);
            write = fill_to;
            current_time = fill_to_time;
        }

        let mut value = default;
        let frame_time = 1.0 / sample_rate;
        let n = self.events.len();

        for i in 0..n {
            if write >= count {
                break;
            }
            let event = &self.events[i];
            let next = self.events.get(i + 1);

            if let Some(next) = next {
                if next.time < current_time {
                    continue;
                }
            }

            let value1 = event.value;
            let time1 = event.time;
            let value2 = next.map_or(value1, |e| e.value);
            let time2 = next.map_or(end + 1.0, |e| e.time);

            let delta_time = time2 - time1;
            let k = if delta_time > 0.0 { 1.0 / delta_time } else { 0.0 };

            let mut fill_to_time = end.min(time2);
            let mut fill_to = time_to_sample_frame(fill_to_time - start, sample_rate).min(count);

            match next.map(|e| &e.kind) {
                Some(ParamEventKind::LinearRamp) => {
                    while write < fill_to {
                        let x = ((current_time - time1) * k) as f32;
                        value = (1.0 - x) * value1 + x * value2;
                        values[write] = value;
                        current_time += frame_time;
                        write += 1;
                    }
                }
                Some(ParamEventKind::ExponentialRamp) => {
                    if value1 <= 0.0 || value2 <= 0.0 {
                        // undefined for non-positive endpoints; hold
                        values[write..fill_to.max(write)].fill(value);
                        write = write.max(fill_to);
                    } else {
                        let frames = delta_time * sample_rate;
                        let ratio = (value2 / value1) as f64;
                        let multiplier = ratio.powf(1.0 / frames) as f32;
                        let elapsed = time_to_sample_frame(current_time - time1, sample_rate) as f64;
                        value = value1 * ratio.powf(elapsed / frames) as f32;
                        while write < fill_to {
                            values[write] = value;
                            value *= multiplier;
                            current_time += frame_time;
                            write += 1;
                        }
                    }
                }
                _ => match &event.kind {
                    ParamEventKind::SetValue
                    | ParamEventKind::LinearRamp
                    | ParamEventKind::ExponentialRamp => {
                        current_time = fill_to_time;
                        value = event.value;
                        if write < fill_to {
                            values[write..fill_to].fill(value);
                            write = fill_to;
                        }
                    }
                    ParamEventKind::SetTarget { time_constant } => {
                        current_time = fill_to_time;
                        let target = event.value;
                        let step = discrete_time_constant(*time_constant, control_rate) as f32;
                        while write < fill_to {
                            values[write] = value;
                            value += (target - value) * step;
                            write += 1;
                        }
                    }
                    ParamEventKind::SetValueCurve { curve, duration } => {
                        let points = curve.len();
                        if points == 0 || *duration <= 0.0 || sample_rate <= 0.0 {
                            current_time = fill_to_time;
                            if write < fill_to {
                                values[write..fill_to].fill(value);
                                write = fill_to;
                            }
                            continue;
                        }

                        let points_per_frame = (points - 1) as f64 / duration / sample_rate;
                        let next_fill_to = fill_to;
                        let next_fill_to_time = fill_to_time;

                        fill_to_time = end.min(time1 + duration);
                        fill_to = time_to_sample_frame((fill_to_time - start).max(0.0), sample_rate).min(count);

                        let mut virtual_index = 0.0f64;
                        if time1 < current_time {
                            let frame_offset = (current_time - time1) * sample_rate;
                            virtual_index = points_per_frame * frame_offset;
                        }

                        while write < fill_to {
                            let index = (0.5 + virtual_index) as usize;
                            virtual_index += points_per_frame;
                            if index < points {
                                value = curve[index];
                            }
                            values[write] = value;
                            write += 1;
                        }

                        while write < next_fill_to {
                            values[write] = value;
                            write += 1;
                        }
                        current_time = next_fill_to_time;
                    }
                },
            }
        }

        if write < count {
            values[write..].fill(value);
        }
        value
    }
}
