//! Multichannel sample blocks.
//!
//! A [`Bus`] is N planar [`Channel`]s of equal length. Every node output and
//! every input slot owns one. Busses carry a silent flag so that consumers can
//! skip work: a bus is silent iff all its channels are, and the flag is only
//! lowered by an explicit write ([`Bus::clear_silent_flag`], or a copy/sum of
//! non-silent data).
//!
//! Channel-count mismatches are resolved by [`ChannelInterpretation`]:
//! `Speakers` mixes between the canonical layouts (mono, stereo, quad, 5.0,
//! 5.1, 7.1) and `Discrete` truncates or zero-pads.

use crate::config::RENDER_QUANTUM_FRAMES;

/// Upper bound on the channel count of any bus.
pub const MAX_BUS_CHANNELS: usize = 32;

/// Gain ramp step per sample used by [`Bus::copy_with_gain_from`].
pub const DEZIPPER_RATE: f32 = 0.005;

/// Ramps closer than this to their target snap to it.
pub const GAIN_EPSILON: f32 = 0.001;

/// Canonical channel counts.
pub mod layout {
    pub const MONO: usize = 1;
    pub const STEREO: usize = 2;
    pub const QUAD: usize = 4;
    pub const SURROUND_5_0: usize = 5;
    pub const SURROUND_5_1: usize = 6;
    pub const SURROUND_7_1: usize = 8;
}

/// How channel-count mismatches are handled when copying or summing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelInterpretation {
    /// Up/down-mix between speaker layouts.
    #[default]
    Speakers,
    /// Copy channel-by-channel, dropping or zeroing the excess.
    Discrete,
}

/// Whether a bus's channels follow a speaker layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelLayout {
    #[default]
    Canonical,
    Discrete,
}

/// Speaker positions addressable through [`Bus::channel_by_type`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Speaker {
    Left,
    Right,
    Center,
    Lfe,
    SurroundLeft,
    SurroundRight,
    BackLeft,
    BackRight,
}

impl Speaker {
    /// Channel index of this speaker in a canonical bus with `channels`
    /// channels, if that layout has it.
    pub fn index_in(self, channels: usize) -> Option<usize> {
        use Speaker::*;
        match (channels, self) {
            (layout::MONO, Left) => Some(0),
            (layout::STEREO, Left) => Some(0),
            (layout::STEREO, Right) => Some(1),
            (layout::QUAD, Left) => Some(0),
            (layout::QUAD, Right) => Some(1),
            (layout::QUAD, SurroundLeft) => Some(2),
            (layout::QUAD, SurroundRight) => Some(3),
            (layout::SURROUND_5_0, Left) => Some(0),
            (layout::SURROUND_5_0, Right) => Some(1),
            (layout::SURROUND_5_0, Center) => Some(2),
            (layout::SURROUND_5_0, SurroundLeft) => Some(3),
            (layout::SURROUND_5_0, SurroundRight) => Some(4),
            (layout::SURROUND_5_1, s) | (layout::SURROUND_7_1, s) => {
                let index = match s {
                    Left => 0,
                    Right => 1,
                    Center => 2,
                    Lfe => 3,
                    SurroundLeft => 4,
                    SurroundRight => 5,
                    BackLeft => 6,
                    BackRight => 7,
                };
                (index < channels).then_some(index)
            }
            _ => None,
        }
    }
}

/// One fixed-length planar sample buffer.
#[derive(Clone, Debug)]
pub struct Channel {
    data: Vec<f32>,
    silent: bool,
}

impl Channel {
    /// A zeroed, silent channel of `length` samples.
    pub fn new(length: usize) -> Self {
        Self {
            data: vec![0.0; length],
            silent: true,
        }
    }

    /// Wrap existing samples. The channel is marked non-silent.
    pub fn from_samples(data: Vec<f32>) -> Self {
        Self {
            data,
            silent: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Raw write access. Does not touch the silent flag: a writer that puts
    /// audible data here must call [`clear_silent_flag`](Self::clear_silent_flag).
    #[inline]
    pub fn mutable_data(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    #[inline]
    pub fn clear_silent_flag(&mut self) {
        self.silent = false;
    }

    /// Zero the samples and raise the silent flag.
    pub fn zero(&mut self) {
        self.data.fill(0.0);
        self.silent = true;
    }

    pub fn copy_from(&mut self, source: &Channel) {
        debug_assert!(source.len() >= self.len());
        if source.is_silent() {
            self.zero();
            return;
        }
        let n = self.len().min(source.len());
        self.data[..n].copy_from_slice(&source.data[..n]);
        self.silent = false;
    }

    /// Copy `source[start..end]` into the front of this channel.
    pub fn copy_from_range(&mut self, source: &Channel, start: usize, end: usize) {
        let safe = start < end && end <= source.len() && end - start <= self.len();
        debug_assert!(safe, "range {start}..{end} out of bounds");
        if !safe {
            return;
        }
        let n = end - start;
        if source.is_silent() {
            if n == self.len() {
                self.zero();
            } else {
                self.data[..n].fill(0.0);
            }
            return;
        }
        self.data[..n].copy_from_slice(&source.data[start..end]);
        self.silent = false;
    }

    pub fn sum_from(&mut self, source: &Channel) {
        if source.is_silent() {
            return;
        }
        if self.is_silent() {
            self.copy_from(source);
            return;
        }
        for (d, s) in self.data.iter_mut().zip(source.data.iter()) {
            *d += *s;
        }
    }

    /// `self += source * scale`
    fn sum_scaled_from(&mut self, source: &Channel, scale: f32) {
        if source.is_silent() {
            return;
        }
        if self.is_silent() {
            self.data.fill(0.0);
            self.silent = false;
        }
        for (d, s) in self.data.iter_mut().zip(source.data.iter()) {
            *d += *s * scale;
        }
    }

    pub fn scale(&mut self, scale: f32) {
        if self.is_silent() {
            return;
        }
        self.data.iter_mut().for_each(|s| *s *= scale);
    }

    pub fn max_abs_value(&self) -> f32 {
        if self.is_silent() {
            return 0.0;
        }
        self.data.iter().fold(0.0f32, |max, s| max.max(s.abs()))
    }

    fn resize(&mut self, length: usize) {
        self.data.resize(length, 0.0);
    }
}

/// A block of multichannel audio.
///
/// ```
/// use schall::bus::{Bus, ChannelInterpretation};
///
/// let mut mono = Bus::new(1, 4);
/// mono.channel_mut(0).mutable_data().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
/// mono.clear_silent_flag();
///
/// let mut stereo = Bus::new(2, 4);
/// stereo.copy_from(&mono, ChannelInterpretation::Speakers);
/// assert_eq!(stereo.channel(1).data(), &[1.0, 2.0, 3.0, 4.0]);
/// ```
#[derive(Clone, Debug)]
pub struct Bus {
    channels: Vec<Channel>,
    length: usize,
    sample_rate: f32,
    layout: ChannelLayout,
    bus_gain: f32,
    last_gain: f32,
    is_first_time: bool,
}

impl Bus {
    pub fn new(channels: usize, length: usize) -> Self {
        debug_assert!(channels <= MAX_BUS_CHANNELS);
        let channels = channels.min(MAX_BUS_CHANNELS);
        Self {
            channels: (0..channels).map(|_| Channel::new(length)).collect(),
            length,
            sample_rate: 0.0,
            layout: ChannelLayout::Canonical,
            bus_gain: 1.0,
            last_gain: 1.0,
            is_first_time: true,
        }
    }

    /// A silent bus of one render quantum.
    pub fn quantum(channels: usize) -> Self {
        Self::new(channels, RENDER_QUANTUM_FRAMES)
    }

    /// Build a bus from planar sample vectors of equal length.
    pub fn from_channels(data: Vec<Vec<f32>>, sample_rate: f32) -> Self {
        let length = data.first().map_or(0, Vec::len);
        debug_assert!(data.iter().all(|c| c.len() == length));
        let mut bus = Self::new(0, length);
        bus.channels = data.into_iter().map(Channel::from_samples).collect();
        bus.sample_rate = sample_rate;
        bus
    }

    pub fn with_sample_rate(mut self, sample_rate: f32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_layout(mut self, layout: ChannelLayout) -> Self {
        self.layout = layout;
        self
    }

    #[inline]
    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    #[inline]
    pub fn channel(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut Channel {
        &mut self.channels[index]
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [Channel] {
        &mut self.channels
    }

    /// Speaker lookup; `None` for discrete busses and positions the layout lacks.
    pub fn channel_by_type(&self, speaker: Speaker) -> Option<&Channel> {
        if self.layout != ChannelLayout::Canonical {
            return None;
        }
        speaker
            .index_in(self.channels.len())
            .map(|i| &self.channels[i])
    }

    pub fn channel_by_type_mut(&mut self, speaker: Speaker) -> Option<&mut Channel> {
        if self.layout != ChannelLayout::Canonical {
            return None;
        }
        speaker
            .index_in(self.channels.len())
            .map(move |i| &mut self.channels[i])
    }

    /// Change the channel count. New channels start silent.
    ///
    /// Allocates when growing, so the graph only calls this when
    /// connectivity changes.
    pub fn set_number_of_channels(&mut self, channels: usize) {
        debug_assert!(channels <= MAX_BUS_CHANNELS);
        let channels = channels.min(MAX_BUS_CHANNELS);
        if channels == self.channels.len() {
            return;
        }
        let length = self.length;
        self.channels.resize_with(channels, || Channel::new(length));
    }

    pub fn set_length(&mut self, length: usize) {
        self.length = length;
        self.channels.iter_mut().for_each(|c| c.resize(length));
    }

    pub fn zero(&mut self) {
        self.channels.iter_mut().for_each(Channel::zero);
    }

    /// Zero frames `[start, end)` of every channel, leaving the flags alone.
    pub fn zero_range(&mut self, start: usize, end: usize) {
        let end = end.min(self.length);
        if start >= end {
            return;
        }
        for channel in self.channels.iter_mut() {
            channel.mutable_data()[start..end].fill(0.0);
        }
    }

    /// True iff every channel is silent.
    pub fn is_silent(&self) -> bool {
        self.channels.iter().all(Channel::is_silent)
    }

    pub fn clear_silent_flag(&mut self) {
        self.channels.iter_mut().for_each(Channel::clear_silent_flag);
    }

    /// Same channel count and `bus` holds at least as many frames.
    pub fn topology_matches(&self, bus: &Bus) -> bool {
        self.number_of_channels() == bus.number_of_channels() && self.length <= bus.length
    }

    pub fn copy_from(&mut self, source: &Bus, interpretation: ChannelInterpretation) {
        if self.number_of_channels() == source.number_of_channels() {
            for (d, s) in self.channels.iter_mut().zip(source.channels.iter()) {
                d.copy_from(s);
            }
            return;
        }
        match interpretation {
            ChannelInterpretation::Speakers => self.speakers_copy_from(source),
            ChannelInterpretation::Discrete => self.discrete_copy_from(source),
        }
    }

    pub fn sum_from(&mut self, source: &Bus, interpretation: ChannelInterpretation) {
        if self.number_of_channels() == source.number_of_channels() {
            for (d, s) in self.channels.iter_mut().zip(source.channels.iter()) {
                d.sum_from(s);
            }
            return;
        }
        match interpretation {
            ChannelInterpretation::Speakers => self.speakers_sum_from(source),
            ChannelInterpretation::Discrete => self.discrete_sum_from(source),
        }
    }

    fn speakers_copy_from(&mut self, source: &Bus) {
        use layout::*;
        let (dst, src) = (self.number_of_channels(), source.number_of_channels());
        match (dst, src) {
            (STEREO, MONO) => {
                let mono = &source.channels[0];
                self.channels[0].copy_from(mono);
                self.channels[1].copy_from(mono);
            }
            (MONO, STEREO) => {
                self.zero();
                self.speakers_sum_from(source);
            }
            (SURROUND_5_1, MONO) | (SURROUND_7_1, MONO) => {
                self.zero();
                self.channels[2].copy_from(&source.channels[0]);
            }
            (MONO, SURROUND_5_1) | (MONO, SURROUND_7_1) => {
                self.zero();
                self.sum_surround_to_mono(source);
            }
            _ => self.discrete_copy_from(source),
        }
    }

    fn speakers_sum_from(&mut self, source: &Bus) {
        use layout::*;
        let (dst, src) = (self.number_of_channels(), source.number_of_channels());
        match (dst, src) {
            (STEREO, MONO) => {
                let mono = &source.channels[0];
                self.channels[0].sum_from(mono);
                self.channels[1].sum_from(mono);
            }
            (MONO, STEREO) => {
                // out += 0.5 * (L + R)
                let [l, r] = [&source.channels[0], &source.channels[1]];
                let out = &mut self.channels[0];
                out.sum_scaled_from(l, 0.5);
                out.sum_scaled_from(r, 0.5);
            }
            (SURROUND_5_1, MONO) | (SURROUND_7_1, MONO) => {
                self.channels[2].sum_from(&source.channels[0]);
            }
            (MONO, SURROUND_5_1) | (MONO, SURROUND_7_1) => self.sum_surround_to_mono(source),
            _ => self.discrete_sum_from(source),
        }
    }

    /// 5.1 or 7.1 down to mono: 0.7071 (L + R) + 0.5 (SL + SR) [+ 0.5 (BL + BR)] + C.
    fn sum_surround_to_mono(&mut self, source: &Bus) {
        let out = &mut self.channels[0];
        let src = &source.channels;
        out.sum_scaled_from(&src[0], 0.7071);
        out.sum_scaled_from(&src[1], 0.7071);
        out.sum_scaled_from(&src[4], 0.5);
        out.sum_scaled_from(&src[5], 0.5);
        if src.len() == layout::SURROUND_7_1 {
            out.sum_scaled_from(&src[6], 0.5);
            out.sum_scaled_from(&src[7], 0.5);
        }
        out.sum_from(&src[2]);
    }

    fn discrete_copy_from(&mut self, source: &Bus) {
        let shared = self.number_of_channels().min(source.number_of_channels());
        for i in 0..shared {
            self.channels[i].copy_from(&source.channels[i]);
        }
        for channel in self.channels.iter_mut().skip(shared) {
            channel.zero();
        }
    }

    fn discrete_sum_from(&mut self, source: &Bus) {
        for (d, s) in self.channels.iter_mut().zip(source.channels.iter()) {
            d.sum_from(s);
        }
    }

    /// Copy `source` scaled by a de-zippered gain.
    ///
    /// The gain ramps from `*last_gain` toward `target_gain * bus_gain` by
    /// [`DEZIPPER_RATE`] per sample. Once within [`GAIN_EPSILON`] it is applied
    /// as a constant. The first call after construction or
    /// [`reset_smoothing`](Self::reset_smoothing) snaps straight to the target.
    /// `*last_gain` is left holding the gain reached, for the next quantum.
    pub fn copy_with_gain_from(&mut self, source: &Bus, last_gain: &mut f32, target_gain: f32) {
        if !self.topology_matches(source) || source.is_silent() {
            self.zero();
            return;
        }

        let total_desired = self.bus_gain * target_gain;
        let mut gain = if self.is_first_time {
            total_desired
        } else {
            *last_gain
        };
        self.is_first_time = false;

        let frames = self.length;
        let dezipper = (total_desired - gain).abs() >= GAIN_EPSILON;

        if dezipper {
            let start = gain;
            for (d, s) in self.channels.iter_mut().zip(source.channels.iter()) {
                let mut g = start;
                let src = &s.data()[..frames];
                for (out, x) in d.mutable_data()[..frames].iter_mut().zip(src) {
                    g += (total_desired - g) * DEZIPPER_RATE;
                    g = flush_denormal(g);
                    *out = *x * g;
                }
                d.clear_silent_flag();
                gain = g;
            }
        } else {
            gain = total_desired;
            for (d, s) in self.channels.iter_mut().zip(source.channels.iter()) {
                let src = &s.data()[..frames];
                for (out, x) in d.mutable_data()[..frames].iter_mut().zip(src) {
                    *out = *x * gain;
                }
                d.clear_silent_flag();
            }
        }

        *last_gain = gain;
    }

    /// [`copy_with_gain_from`](Self::copy_with_gain_from) using the bus's own
    /// stored last gain.
    pub fn copy_with_gain(&mut self, source: &Bus, target_gain: f32) {
        let mut last = self.last_gain;
        self.copy_with_gain_from(source, &mut last, target_gain);
        self.last_gain = last;
    }

    /// Multiply `source` by per-sample gains. A mono source fans out to every
    /// channel.
    pub fn copy_with_sample_accurate_gain_values_from(&mut self, source: &Bus, gains: &[f32]) {
        let fan_out = source.number_of_channels() == layout::MONO;
        if !fan_out && !self.topology_matches(source) {
            debug_assert!(false, "bus topology mismatch");
            self.zero();
            return;
        }
        if gains.len() > source.length() {
            debug_assert!(false, "more gain values than source frames");
            return;
        }
        if source.is_silent() {
            self.zero();
            return;
        }
        for (index, d) in self.channels.iter_mut().enumerate() {
            let s = if fan_out {
                &source.channels[0]
            } else {
                &source.channels[index]
            };
            for ((out, x), g) in d.mutable_data().iter_mut().zip(s.data()).zip(gains) {
                *out = *x * *g;
            }
            d.clear_silent_flag();
        }
    }

    pub fn scale(&mut self, scale: f32) {
        self.channels.iter_mut().for_each(|c| c.scale(scale));
    }

    pub fn max_abs_value(&self) -> f32 {
        self.channels
            .iter()
            .fold(0.0f32, |max, c| max.max(c.max_abs_value()))
    }

    /// Scale so the loudest sample has magnitude 1.
    pub fn normalize(&mut self) {
        let max = self.max_abs_value();
        if max > 0.0 {
            self.scale(1.0 / max);
        }
    }

    pub fn bus_gain(&self) -> f32 {
        self.bus_gain
    }

    pub fn set_bus_gain(&mut self, gain: f32) {
        self.bus_gain = gain;
    }

    /// Make the next gain copy snap instead of ramp.
    pub fn reset_smoothing(&mut self) {
        self.is_first_time = true;
    }

    /// An exact copy, including the silent flags.
    pub fn create_by_cloning(source: &Bus) -> Bus {
        let mut bus = Bus::new(source.number_of_channels(), source.length())
            .with_sample_rate(source.sample_rate());
        for (d, s) in bus.channels.iter_mut().zip(source.channels.iter()) {
            d.copy_from_range(s, 0, source.length());
        }
        bus
    }

    /// Frames `[start, end)` of `source` as a new bus.
    pub fn create_buffer_from_range(source: &Bus, start: usize, end: usize) -> Option<Bus> {
        let safe = start < end && end <= source.length();
        debug_assert!(safe, "range {start}..{end} out of bounds");
        if !safe {
            return None;
        }
        let mut bus = Bus::new(source.number_of_channels(), end - start)
            .with_sample_rate(source.sample_rate());
        for (d, s) in bus.channels.iter_mut().zip(source.channels.iter()) {
            d.copy_from_range(s, start, end);
        }
        Some(bus)
    }

    /// Average all channels down to one.
    pub fn create_by_mixing_to_mono(source: &Bus) -> Bus {
        let length = source.length();
        if source.is_silent() {
            return Bus::new(layout::MONO, length).with_sample_rate(source.sample_rate());
        }
        if source.number_of_channels() == layout::MONO {
            return Bus::create_by_cloning(source);
        }

        let mut bus = Bus::new(layout::MONO, length).with_sample_rate(source.sample_rate());
        let count = source.number_of_channels() as f32;
        let out = bus.channels[0].mutable_data();
        for channel in source.channels.iter() {
            for (d, s) in out.iter_mut().zip(channel.data()) {
                *d += *s;
            }
        }
        out.iter_mut().for_each(|s| *s /= count);
        bus.clear_silent_flag();
        bus
    }

    /// Convert `source` to `new_sample_rate`, optionally mixing to mono first.
    ///
    /// Uses linear interpolation. Returns `None` when the source has no known
    /// sample rate or the target rate is not positive.
    pub fn create_by_sample_rate_converting(
        source: &Bus,
        mix_to_mono: bool,
        new_sample_rate: f32,
    ) -> Option<Bus> {
        let source_rate = source.sample_rate();
        if source_rate <= 0.0 || !(new_sample_rate > 0.0) {
            return None;
        }
        let mix_to_mono = mix_to_mono && source.number_of_channels() != layout::MONO;

        if source_rate == new_sample_rate {
            return if mix_to_mono {
                Some(Bus::create_by_mixing_to_mono(source))
            } else {
                Some(Bus::create_by_cloning(source))
            };
        }

        let ratio = source_rate as f64 / new_sample_rate as f64;
        let out_length = (source.length() as f64 / ratio) as usize;

        if source.is_silent() {
            return Some(
                Bus::new(source.number_of_channels(), out_length).with_sample_rate(new_sample_rate),
            );
        }

        let mixed;
        let input = if mix_to_mono {
            mixed = Bus::create_by_mixing_to_mono(source);
            &mixed
        } else {
            source
        };

        let mut bus = Bus::new(input.number_of_channels(), out_length).with_sample_rate(new_sample_rate);
        let last = input.length().saturating_sub(1);
        for (d, s) in bus.channels.iter_mut().zip(input.channels.iter()) {
            let src = s.data();
            for (i, out) in d.mutable_data().iter_mut().enumerate() {
                let position = i as f64 * ratio;
                let index = (position as usize).min(last);
                let next = (index + 1).min(last);
                let frac = (position - index as f64) as f32;
                *out = src[index] + (src[next] - src[index]) * frac;
            }
        }
        bus.clear_silent_flag();
        Some(bus)
    }
}

/// Values this small are flushed to zero to keep ramps out of denormal range.
#[inline]
pub(crate) fn flush_denormal(x: f32) -> f32 {
    if x.abs() < f32::MIN_POSITIVE {
        0.0
    } else {
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn filled(channels: usize, length: usize, value: f32) -> Bus {
        let mut bus = Bus::new(channels, length);
        for c in bus.channels_mut() {
            c.mutable_data().fill(value);
        }
        bus.clear_silent_flag();
        bus
    }

    #[test]
    fn fresh_bus_is_silent_until_cleared() {
        let mut bus = Bus::new(2, 8);
        assert!(bus.is_silent());

        bus.channel_mut(0).mutable_data()[0] = 1.0;
        assert!(bus.is_silent(), "raw writes do not lower the flag");

        bus.clear_silent_flag();
        assert!(!bus.is_silent());
    }

    #[test]
    fn copy_from_silent_source_stays_silent_and_zeroed() {
        let silent = Bus::new(2, 8);
        let mut dst = filled(2, 8, 0.5);
        dst.copy_from(&silent, ChannelInterpretation::Speakers);

        assert!(dst.is_silent());
        assert!(dst.channels().iter().all(|c| c.data().iter().all(|s| *s == 0.0)));
    }

    #[test]
    fn stereo_to_mono_averages() {
        let mut stereo = Bus::new(2, 4);
        stereo.channel_mut(0).mutable_data().fill(1.0);
        stereo.channel_mut(1).mutable_data().fill(3.0);
        stereo.clear_silent_flag();

        let mut mono = Bus::new(1, 4);
        mono.copy_from(&stereo, ChannelInterpretation::Speakers);
        assert_eq!(mono.channel(0).data(), &[2.0; 4]);
        assert!(!mono.is_silent());
    }

    #[test]
    fn surround_down_mix_weights() {
        let mut surround = Bus::new(layout::SURROUND_7_1, 2);
        for (i, c) in surround.channels_mut().iter_mut().enumerate() {
            c.mutable_data().fill(i as f32 + 1.0);
        }
        surround.clear_silent_flag();

        let mut mono = Bus::new(1, 2);
        mono.copy_from(&surround, ChannelInterpretation::Speakers);

        // L=1 R=2 C=3 LFE=4 SL=5 SR=6 BL=7 BR=8, LFE dropped
        let expected = 0.7071 * (1.0 + 2.0) + 0.5 * (5.0 + 6.0) + 0.5 * (7.0 + 8.0) + 3.0;
        assert_relative_eq!(mono.channel(0).data()[0], expected, epsilon = 1e-5);

        let mut five_one = Bus::new(layout::SURROUND_5_1, 2);
        five_one.copy_from(&surround, ChannelInterpretation::Speakers);
        assert_eq!(five_one.channel(5).data(), &[6.0, 6.0], "no speaker rule, discrete copy");
    }

    #[test]
    fn mono_up_mix_fills_center_only() {
        let mono = filled(1, 4, 0.25);
        let mut surround = filled(layout::SURROUND_5_1, 4, 9.0);
        surround.copy_from(&mono, ChannelInterpretation::Speakers);

        for (i, c) in surround.channels().iter().enumerate() {
            let expected = if i == 2 { 0.25 } else { 0.0 };
            assert!(c.data().iter().all(|s| *s == expected), "channel {i}");
        }
    }

    #[test]
    fn discrete_truncates_and_pads() {
        let mut quad = Bus::new(4, 2);
        for (i, c) in quad.channels_mut().iter_mut().enumerate() {
            c.mutable_data().fill(i as f32);
        }
        quad.clear_silent_flag();

        let mut stereo = Bus::new(2, 2);
        stereo.copy_from(&quad, ChannelInterpretation::Discrete);
        assert_eq!(stereo.channel(1).data(), &[1.0, 1.0]);

        let mut wide = filled(6, 2, 7.0);
        wide.copy_from(&quad, ChannelInterpretation::Discrete);
        assert_eq!(wide.channel(3).data(), &[3.0, 3.0]);
        assert!(wide.channel(5).is_silent());

        wide.sum_from(&quad, ChannelInterpretation::Discrete);
        assert_eq!(wide.channel(3).data(), &[6.0, 6.0]);
    }

    #[test]
    fn sum_onto_silent_destination_copies() {
        let a = filled(1, 4, 1.0);
        let b = filled(1, 4, 2.0);
        let mut dst = Bus::new(1, 4);
        dst.sum_from(&a, ChannelInterpretation::Speakers);
        dst.sum_from(&b, ChannelInterpretation::Speakers);
        assert_eq!(dst.channel(0).data(), &[3.0; 4]);
    }

    #[test]
    fn gain_first_call_snaps() {
        let src = filled(1, 8, 1.0);
        let mut dst = Bus::new(1, 8);
        let mut last = 0.0;
        dst.copy_with_gain_from(&src, &mut last, 0.5);
        assert_eq!(last, 0.5);
        assert!(dst.channel(0).data().iter().all(|s| *s == 0.5));
    }

    #[test]
    fn gain_ramps_toward_target() {
        let src = filled(1, 128, 1.0);
        let mut dst = Bus::new(1, 128);
        let mut last = 0.0;
        dst.copy_with_gain_from(&src, &mut last, 0.0);
        dst.copy_with_gain_from(&src, &mut last, 1.0);

        let out = dst.channel(0).data();
        assert_relative_eq!(out[0], DEZIPPER_RATE, epsilon = 1e-6);
        assert!(out.windows(2).all(|w| w[1] > w[0]));
        assert!(last > 0.0 && last < 1.0);
        assert_eq!(last, out[127]);
    }

    #[test]
    fn gain_is_idempotent_at_convergence() {
        let src = filled(2, 16, 1.0);
        let mut dst = Bus::new(2, 16);
        let mut last = 0.0;
        dst.copy_with_gain_from(&src, &mut last, 0.8);
        let converged = last;

        for _ in 0..4 {
            dst.copy_with_gain_from(&src, &mut last, 0.8);
            assert_eq!(last, converged);
            assert!(dst.channel(1).data().iter().all(|s| *s == 0.8));
        }
    }

    #[test]
    fn gain_mismatch_zeroes() {
        let src = filled(2, 8, 1.0);
        let mut dst = filled(1, 8, 1.0);
        let mut last = 1.0;
        dst.copy_with_gain_from(&src, &mut last, 1.0);
        assert!(dst.is_silent());
    }

    #[test]
    fn range_and_clone() {
        let mut src = Bus::new(1, 6).with_sample_rate(44_100.0);
        src.channel_mut(0)
            .mutable_data()
            .copy_from_slice(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        src.clear_silent_flag();

        let range = Bus::create_buffer_from_range(&src, 2, 5).unwrap();
        assert_eq!(range.channel(0).data(), &[2.0, 3.0, 4.0]);
        assert_eq!(range.sample_rate(), 44_100.0);
        assert!(Bus::create_buffer_from_range(&src, 4, 4).is_none());

        let clone = Bus::create_by_cloning(&src);
        assert_eq!(clone.channel(0).data(), src.channel(0).data());
    }

    #[test]
    fn sample_rate_conversion_halves_length() {
        let mut src = Bus::new(2, 8).with_sample_rate(48_000.0);
        src.channel_mut(0)
            .mutable_data()
            .copy_from_slice(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        src.channel_mut(1).mutable_data().fill(2.0);
        src.clear_silent_flag();

        let down = Bus::create_by_sample_rate_converting(&src, false, 24_000.0).unwrap();
        assert_eq!(down.length(), 4);
        assert_eq!(down.channel(0).data(), &[0.0, 2.0, 4.0, 6.0]);
        assert_eq!(down.sample_rate(), 24_000.0);

        let mono = Bus::create_by_sample_rate_converting(&src, true, 24_000.0).unwrap();
        assert_eq!(mono.number_of_channels(), 1);
        assert_relative_eq!(mono.channel(0).data()[1], 2.0);

        let unknown = Bus::new(1, 8);
        assert!(Bus::create_by_sample_rate_converting(&unknown, false, 24_000.0).is_none());
    }

    #[test]
    fn speaker_lookup_follows_layout() {
        let quad = Bus::new(layout::QUAD, 1);
        assert!(quad.channel_by_type(Speaker::SurroundRight).is_some());
        assert!(quad.channel_by_type(Speaker::Center).is_none());
        assert_eq!(Speaker::SurroundLeft.index_in(layout::SURROUND_5_0), Some(3));

        let discrete = Bus::new(2, 1).with_layout(ChannelLayout::Discrete);
        assert!(discrete.channel_by_type(Speaker::Left).is_none());
    }
}
