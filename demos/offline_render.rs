//! Render a short automated tone offline and report its envelope
//!
//! Run with: cargo run --example offline_render
//!
//! No audio device is needed; the graph renders as fast as possible on a
//! background thread and a recorder captures the result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use schall::nodes::{GainNode, OscillatorNode, RecorderNode};
use schall::{AudioDevice, AudioStreamConfig, Context, ContextOptions, OfflineDevice};

fn main() -> schall::Result<()> {
    tracing_subscriber::fmt().init();

    let config = AudioStreamConfig::default().with_channels(1);
    let context = Context::offline(config, ContextOptions::default())?;

    let osc = OscillatorNode::new(&context);
    let envelope = GainNode::new(&context);
    let recorder = RecorderNode::new(&context, 1, 1.0);

    context.connect(&envelope, &osc, 0, 0)?;
    context.connect(&recorder, &envelope, 0, 0)?;
    context.connect(&context.destination(), &recorder, 0, 0)?;

    // half a second attack, half a second release
    envelope.gain().set_value_at_time(0.0, 0.0)?;
    envelope.gain().linear_ramp_to_value_at_time(1.0, 0.5)?;
    envelope.gain().linear_ramp_to_value_at_time(0.0, 1.0)?;

    osc.start(0.0);
    recorder.start_recording();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let mut device = OfflineDevice::new(&context, 1.0).on_complete(move || flag.store(true, Ordering::SeqCst));
    device.start()?;
    device.wait()?;

    let samples = recorder.take_recording();
    println!(
        "rendered {} frames (complete: {}), recorded {} samples",
        device.rendered_frames(),
        done.load(Ordering::SeqCst),
        samples.len()
    );

    // peak per tenth of a second
    for (i, block) in samples.chunks(samples.len().max(10) / 10).enumerate() {
        let peak = block.iter().fold(0.0f32, |m, x| m.max(x.abs()));
        println!("{:>4} ms  {}", i * 100, "#".repeat((peak * 40.0) as usize));
    }

    context.close();
    Ok(())
}
