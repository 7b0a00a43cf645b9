//! Device boundary.
//!
//! A backend owns periodic invocation: it calls [`RenderCallback::render`]
//! once per quantum with a destination bus shaped like the context's stream
//! config. Three backends ship with the crate:
//!
//! - [`MockDevice`] renders only when asked, for tests.
//! - [`OfflineDevice`] renders a fixed duration as fast as possible on its own thread.
//! - `CpalDevice` (feature `cpal_sink`) drives a hardware stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::config::AudioStreamConfig;
use crate::context::{Context, Shared};
use crate::error::{Error, Result};
use crate::render::{pull_graph, SamplingInfo};

#[cfg(feature = "cpal_sink")]
mod cpal_backend;

#[cfg(feature = "cpal_sink")]
pub use self::cpal_backend::{list_devices, CpalDevice};

/// What a backend calls into.
pub trait RenderCallback: Send + Sync {
    /// Render one quantum into `destination`. `source` is the hardware input
    /// for the same period, if the backend captures any.
    fn render(&self, source: Option<&Bus>, destination: &mut Bus, frames: usize, info: &SamplingInfo);

    fn start(&self);

    fn stop(&self);

    fn current_sample_frame(&self) -> u64;

    fn current_time(&self) -> f64;
}

/// A platform backend driving a [`RenderCallback`].
pub trait AudioDevice: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Description of a hardware device as reported by the backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioDeviceInfo {
    pub index: usize,
    pub name: String,
    pub output_channels: usize,
    pub input_channels: usize,
    pub sample_rates: Vec<f32>,
    pub is_default_output: bool,
}

/// The context's render entry point, handed to backends.
#[derive(Clone)]
pub struct Renderer {
    shared: Arc<Shared>,
}

impl Renderer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Frames a backend must pass to every [`render`](RenderCallback::render).
    pub fn quantum_frames(&self) -> usize {
        self.shared.quantum_frames()
    }

    pub fn config(&self) -> &AudioStreamConfig {
        &self.shared.config
    }

    /// A destination bus shaped for this context.
    pub fn output_bus(&self) -> Bus {
        Bus::new(self.shared.config.channels, self.quantum_frames()).with_sample_rate(self.shared.config.sample_rate)
    }
}

impl RenderCallback for Renderer {
    fn render(&self, source: Option<&Bus>, destination: &mut Bus, frames: usize, info: &SamplingInfo) {
        pull_graph(&self.shared, source, destination, frames, info);
    }

    fn start(&self) {
        self.shared.set_initialized(true);
        debug!("renderer started");
    }

    fn stop(&self) {
        self.shared.set_initialized(false);
        debug!("renderer stopped");
    }

    fn current_sample_frame(&self) -> u64 {
        self.shared.clock.current_sample_frame()
    }

    fn current_time(&self) -> f64 {
        self.shared.clock.current_time()
    }
}

/// A device that renders only when told to.
pub struct MockDevice {
    renderer: Renderer,
    output: Bus,
    input: Option<Bus>,
    frame: u64,
    running: bool,
}

impl MockDevice {
    pub fn new(context: &Context) -> Self {
        let renderer = context.renderer();
        Self {
            output: renderer.output_bus(),
            renderer,
            input: None,
            frame: 0,
            running: false,
        }
    }

    /// Feed `input` as the live hardware input of every quantum.
    pub fn with_input(mut self, input: Bus) -> Self {
        self.input = Some(input);
        self
    }

    pub fn set_input(&mut self, input: Option<Bus>) {
        self.input = input;
    }

    /// Render one quantum. A stopped device outputs silence and does not
    /// advance.
    pub fn render_quantum(&mut self) -> &Bus {
        if !self.running {
            self.output.zero();
            return &self.output;
        }
        let frames = self.renderer.quantum_frames();
        let info = SamplingInfo::at_frame(self.frame, self.renderer.config().sample_rate);
        self.renderer.render(self.input.as_ref(), &mut self.output, frames, &info);
        self.frame += frames as u64;
        &self.output
    }

    pub fn render_quanta(&mut self, count: usize) -> &Bus {
        for _ in 0..count {
            self.render_quantum();
        }
        &self.output
    }

    /// The last rendered quantum.
    pub fn output(&self) -> &Bus {
        &self.output
    }

    /// First frame of the next quantum to render.
    pub fn current_sample_frame(&self) -> u64 {
        self.frame
    }
}

impl AudioDevice for MockDevice {
    fn start(&mut self) -> Result<()> {
        self.renderer.start();
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.renderer.stop();
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Renders a fixed duration on a background thread, as fast as possible.
pub struct OfflineDevice {
    renderer: Renderer,
    total_frames: u64,
    running: Arc<AtomicBool>,
    rendered: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
    on_complete: Option<CompletionCallback>,
}

impl OfflineDevice {
    /// Render `seconds` of audio once started.
    pub fn new(context: &Context, seconds: f64) -> Self {
        let renderer = context.renderer();
        let total_frames = (seconds.max(0.0) * renderer.config().sample_rate as f64).ceil() as u64;
        Self {
            renderer,
            total_frames,
            running: Arc::new(AtomicBool::new(false)),
            rendered: Arc::new(AtomicU64::new(0)),
            thread: None,
            on_complete: None,
        }
    }

    /// Run `callback` on the render thread once the whole duration has been
    /// rendered.
    pub fn on_complete(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn rendered_frames(&self) -> u64 {
        self.rendered.load(Ordering::Acquire)
    }

    /// Block until rendering has finished.
    pub fn wait(&mut self) -> Result<()> {
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::Device("offline render thread panicked".to_owned()))?;
        }
        Ok(())
    }
}

impl AudioDevice for OfflineDevice {
    fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        let renderer = self.renderer.clone();
        let running = self.running.clone();
        let rendered = self.rendered.clone();
        let total = self.total_frames;
        let on_complete = self.on_complete.take();

        running.store(true, Ordering::Release);
        renderer.start();
        info!(frames = total, "offline render started");

        let thread = std::thread::Builder::new()
            .name("schall-offline".into())
            .spawn(move || {
                let frames = renderer.quantum_frames();
                let sample_rate = renderer.config().sample_rate;
                let mut destination = renderer.output_bus();
                let mut frame = 0u64;
                while frame < total && running.load(Ordering::Acquire) {
                    let info = SamplingInfo::at_frame(frame, sample_rate);
                    renderer.render(None, &mut destination, frames, &info);
                    frame += frames as u64;
                    rendered.store(frame.min(total), Ordering::Release);
                }
                renderer.stop();
                let completed = running.swap(false, Ordering::AcqRel);
                if completed {
                    if let Some(callback) = on_complete {
                        callback();
                    }
                }
            })
            .map_err(|e| Error::Device(format!("failed to spawn offline render thread: {e}")))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.wait()?;
        info!(frames = self.rendered_frames(), "offline render stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for OfflineDevice {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if self.wait().is_err() {
            warn!("offline render thread panicked");
        }
    }
}
