//! Hardware output through CPAL.
//!
//! The CPAL stream runs on its own thread and pulls interleaved samples from
//! an `rtrb` ring buffer. A render thread keeps that ring topped up one
//! quantum at a time, so the engine never runs inside the driver callback and
//! the quantum size is independent of the hardware buffer size.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use crossbeam_channel::bounded;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, warn};

use super::{AudioDevice, AudioDeviceInfo, RenderCallback, Renderer};
use crate::bus::Bus;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::render::SamplingInfo;

const CANDIDATE_RATES: [u32; 6] = [22_050, 44_100, 48_000, 88_200, 96_000, 192_000];

fn device_error(e: impl std::fmt::Display) -> Error {
    Error::Device(e.to_string())
}

/// Every device the default host reports, in the order
/// [`AudioStreamConfig::device_index`](crate::AudioStreamConfig::device_index)
/// refers to them.
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let Ok(devices) = host.devices() else {
        return Vec::new();
    };
    devices
        .enumerate()
        .map(|(index, device)| {
            let name = device.name().unwrap_or_else(|_| "Unknown".into());
            let is_default_output = default_name.as_deref() == Some(name.as_str());
            AudioDeviceInfo {
                index,
                output_channels: device
                    .default_output_config()
                    .map(|c| c.channels() as usize)
                    .unwrap_or(0),
                input_channels: device
                    .default_input_config()
                    .map(|c| c.channels() as usize)
                    .unwrap_or(0),
                sample_rates: supported_rates(&device),
                is_default_output,
                name,
            }
        })
        .collect()
}

fn supported_rates(device: &cpal::Device) -> Vec<f32> {
    let Ok(ranges) = device.supported_output_configs() else {
        return Vec::new();
    };
    let ranges: Vec<_> = ranges.collect();
    CANDIDATE_RATES
        .iter()
        .copied()
        .filter(|rate| {
            ranges
                .iter()
                .any(|r| r.min_sample_rate().0 <= *rate && *rate <= r.max_sample_rate().0)
        })
        .map(|rate| rate as f32)
        .collect()
}

struct Capture {
    device: cpal::Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

/// A hardware output device, with the default input captured when one
/// supports the context's sample rate.
pub struct CpalDevice {
    renderer: Renderer,
    device: cpal::Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    capture: Option<Capture>,
    running: Arc<AtomicBool>,
    underruns: Arc<AtomicUsize>,
    samples_consumed: Arc<AtomicUsize>,
    next_frame: Arc<AtomicU64>,
    threads: Vec<JoinHandle<()>>,
}

impl CpalDevice {
    /// Open the device the context's stream config names and negotiate its
    /// format.
    pub fn new(context: &Context) -> Result<Self> {
        let renderer = context.renderer();
        let config = *renderer.config();
        let host = cpal::default_host();

        let device = match config.device_index {
            Some(index) => host
                .devices()
                .map_err(device_error)?
                .nth(index)
                .ok_or_else(|| Error::Device(format!("no device at index {index}")))?,
            None => host
                .default_output_device()
                .ok_or_else(|| Error::Device("no default output device".into()))?,
        };

        let rate = config.sample_rate as u32;
        let supported = device
            .supported_output_configs()
            .map_err(device_error)?
            .filter(|r| r.channels() as usize >= config.channels)
            .find(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
            .ok_or(Error::InvalidSampleRate(config.sample_rate))?
            .with_sample_rate(SampleRate(rate));

        let sample_format = supported.sample_format();
        let stream_config = StreamConfig {
            channels: supported.channels(),
            sample_rate: SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let capture = host.default_input_device().and_then(|input| {
            let range = input
                .supported_input_configs()
                .ok()?
                .find(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)?
                .with_sample_rate(SampleRate(rate));
            Some(Capture {
                sample_format: range.sample_format(),
                config: StreamConfig {
                    channels: range.channels(),
                    sample_rate: SampleRate(rate),
                    buffer_size: cpal::BufferSize::Default,
                },
                device: input,
            })
        });

        info!(
            device = %device.name().unwrap_or_else(|_| "Unknown".into()),
            channels = stream_config.channels,
            sample_rate = rate,
            format = ?sample_format,
            capture = capture.is_some(),
            "cpal device opened"
        );

        Ok(Self {
            renderer,
            device,
            config: stream_config,
            sample_format,
            capture,
            running: Arc::new(AtomicBool::new(false)),
            underruns: Arc::new(AtomicUsize::new(0)),
            samples_consumed: Arc::new(AtomicUsize::new(0)),
            next_frame: Arc::new(AtomicU64::new(0)),
            threads: Vec::new(),
        })
    }

    pub fn name(&self) -> String {
        self.device.name().unwrap_or_else(|_| "Unknown".into())
    }

    pub fn channels(&self) -> usize {
        self.config.channels as usize
    }

    /// Samples the hardware has played so far.
    #[inline]
    pub fn samples_consumed(&self) -> usize {
        self.samples_consumed.load(Ordering::Relaxed)
    }

    /// Hardware callbacks that found the ring empty.
    #[inline]
    pub fn underruns(&self) -> usize {
        self.underruns.load(Ordering::Relaxed)
    }

    fn ring_size(&self) -> usize {
        // ~100ms of audio to absorb scheduling jitter
        let samples = ((self.config.sample_rate.0 as f32 * 0.1) as usize) * self.channels();
        samples.next_power_of_two().max(8192)
    }

    /// Spawn a thread owning a stream built by `build`, and wait until it
    /// plays.
    fn spawn_stream<F>(&self, name: &str, build: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() -> std::result::Result<cpal::Stream, String> + Send + 'static,
    {
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);
        let running = self.running.clone();
        let thread = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let stream = match build().and_then(|s| s.play().map(|_| s).map_err(|e| e.to_string())) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // the stream lives as long as this thread
                while running.load(Ordering::Acquire) {
                    std::thread::park_timeout(Duration::from_millis(50));
                }
                drop(stream);
            })
            .map_err(device_error)?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(thread),
            Ok(Err(e)) => Err(Error::Device(e)),
            Err(_) => Err(Error::Device(format!("{name} exited before starting"))),
        }
    }
}

impl AudioDevice for CpalDevice {
    fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let device_channels = self.channels();
        let (producer, consumer) = RingBuffer::<f32>::new(self.ring_size());

        let output = {
            let device = self.device.clone();
            let config = self.config.clone();
            let format = self.sample_format;
            let underruns = self.underruns.clone();
            let consumed = self.samples_consumed.clone();
            self.spawn_stream("schall-cpal-out", move || {
                build_output_stream(&device, format, &config, consumer, underruns, consumed)
            })
        };
        let output = match output {
            Ok(thread) => thread,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        self.threads.push(output);

        let mut capture_ring = None;
        if let Some(capture) = self.capture.as_ref() {
            let channels = capture.config.channels as usize;
            let (input_producer, input_consumer) = RingBuffer::<f32>::new(self.ring_size());
            let device = capture.device.clone();
            let config = capture.config.clone();
            let format = capture.sample_format;
            match self.spawn_stream("schall-cpal-in", move || {
                build_input_stream(&device, format, &config, input_producer)
            }) {
                Ok(thread) => {
                    self.threads.push(thread);
                    capture_ring = Some((input_consumer, channels));
                }
                // output still works without capture
                Err(e) => warn!(error = %e, "input capture unavailable"),
            }
        }

        let renderer = self.renderer.clone();
        let running = self.running.clone();
        let next_frame = self.next_frame.clone();
        renderer.start();
        let render = std::thread::Builder::new()
            .name("schall-render".into())
            .spawn(move || render_loop(renderer, running, next_frame, producer, device_channels, capture_ring))
            .map_err(device_error)?;
        self.threads.push(render);

        info!("cpal device started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.renderer.stop();
        for thread in self.threads.drain(..) {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("cpal worker thread panicked");
            }
        }
        info!(underruns = self.underruns(), "cpal device stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "cpal device stop failed");
        }
    }
}

/// Render quanta while the ring has room for one, interleaving each into it.
/// `next_frame` carries the timebase across restarts.
fn render_loop(
    renderer: Renderer,
    running: Arc<AtomicBool>,
    next_frame: Arc<AtomicU64>,
    mut producer: Producer<f32>,
    device_channels: usize,
    mut capture: Option<(Consumer<f32>, usize)>,
) {
    let frames = renderer.quantum_frames();
    let config = *renderer.config();
    let mut destination = renderer.output_bus();
    let mut source = capture
        .as_ref()
        .map(|(_, channels)| Bus::new(*channels, frames).with_sample_rate(config.sample_rate));
    let samples_needed = frames * device_channels;
    let mut frame = next_frame.load(Ordering::Acquire);

    debug!(frames, device_channels, "render loop running");
    while running.load(Ordering::Acquire) {
        if producer.slots() < samples_needed {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        let mut live = None;
        if let (Some((consumer, channels)), Some(bus)) = (capture.as_mut(), source.as_mut()) {
            if consumer.slots() >= frames * *channels {
                deinterleave(consumer, bus, *channels, frames);
                live = Some(&*bus);
            }
        }

        let info = SamplingInfo::at_frame(frame, config.sample_rate);
        renderer.render(live, &mut destination, frames, &info);
        frame += frames as u64;
        next_frame.store(frame, Ordering::Release);

        let bus_channels = destination.number_of_channels();
        for i in 0..frames {
            for ch in 0..device_channels {
                // extra device channels repeat the last bus channel
                let src = ch.min(bus_channels - 1);
                let _ = producer.push(destination.channel(src).data()[i]);
            }
        }
    }
    debug!("render loop exiting");
}

fn deinterleave(consumer: &mut Consumer<f32>, bus: &mut Bus, channels: usize, frames: usize) {
    for i in 0..frames {
        for ch in 0..channels {
            let sample = consumer.pop().unwrap_or(0.0);
            bus.channel_mut(ch).mutable_data()[i] = sample;
        }
    }
    bus.clear_silent_flag();
}

fn pull_samples<T>(
    data: &mut [T],
    consumer: &mut Consumer<f32>,
    underruns: &AtomicUsize,
    consumed: &AtomicUsize,
    convert: impl Fn(f32) -> T,
) {
    let mut underrun = false;
    for sample in data.iter_mut() {
        let s = consumer.pop().unwrap_or_else(|_| {
            underrun = true;
            0.0
        });
        *sample = convert(s);
    }
    if underrun {
        underruns.fetch_add(1, Ordering::Relaxed);
    }
    consumed.fetch_add(data.len(), Ordering::Relaxed);
}

fn build_output_stream(
    device: &cpal::Device,
    sample_format: SampleFormat,
    config: &StreamConfig,
    mut consumer: Consumer<f32>,
    underruns: Arc<AtomicUsize>,
    consumed: Arc<AtomicUsize>,
) -> std::result::Result<cpal::Stream, String> {
    let on_error = |err: cpal::StreamError| warn!("cpal stream error: {err:?}");
    let stream = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            config,
            move |data: &mut [f32], _| pull_samples(data, &mut consumer, &underruns, &consumed, |s| s),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            config,
            move |data: &mut [i16], _| {
                pull_samples(data, &mut consumer, &underruns, &consumed, |s| {
                    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                })
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_output_stream(
            config,
            move |data: &mut [u16], _| {
                pull_samples(data, &mut consumer, &underruns, &consumed, |s| {
                    ((s.clamp(-1.0, 1.0) + 1.0) * 0.5 * u16::MAX as f32) as u16
                })
            },
            on_error,
            None,
        ),
        other => return Err(format!("unsupported output sample format: {other:?}")),
    };
    stream.map_err(|e| e.to_string())
}

fn build_input_stream(
    device: &cpal::Device,
    sample_format: SampleFormat,
    config: &StreamConfig,
    mut producer: Producer<f32>,
) -> std::result::Result<cpal::Stream, String> {
    let on_error = |err: cpal::StreamError| warn!("cpal input stream error: {err:?}");
    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _| {
                for s in data {
                    // overrun: drop what does not fit
                    let _ = producer.push(*s);
                }
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _| {
                for s in data {
                    let _ = producer.push(*s as f32 / i16::MAX as f32);
                }
            },
            on_error,
            None,
        ),
        other => return Err(format!("unsupported input sample format: {other:?}")),
    };
    stream.map_err(|e| e.to_string())
}
