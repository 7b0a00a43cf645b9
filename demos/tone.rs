//! Play a detuned two-oscillator tone on a hardware device
//!
//! Run with: cargo run --example tone --features cpal_sink
//!
//! Lists available devices and lets you pick one, then plays two seconds of
//! a 220Hz sawtooth against a slowly swept sine.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use schall::nodes::{GainNode, OscillatorNode, OscillatorType};
use schall::{list_devices, AudioStreamConfig, Context, ContextOptions, CpalDevice};

fn main() -> schall::Result<()> {
    tracing_subscriber::fmt().init();

    let devices = list_devices();
    if devices.is_empty() {
        eprintln!("No audio output devices found!");
        return Ok(());
    }

    println!("Available audio output devices:");
    for device in devices.iter() {
        println!(
            "  [{}] {} ({:?}Hz, {} ch){}",
            device.index,
            device.name,
            device.sample_rates,
            device.output_channels,
            if device.is_default_output { " *" } else { "" }
        );
    }

    print!("\nSelect device [default]: ");
    let _ = io::stdout().flush();
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    let chosen = input.trim().parse::<usize>().ok().and_then(|i| devices.iter().find(|d| d.index == i));
    let info = chosen.or_else(|| devices.iter().find(|d| d.is_default_output));
    let sample_rate = info.and_then(|d| d.sample_rates.first().copied()).unwrap_or(48_000.0);

    let mut config = AudioStreamConfig::default().with_sample_rate(sample_rate);
    if let Some(device) = chosen {
        config = config.with_device(device.index);
    }

    let context = Context::new(config, ContextOptions::default().with_background_events(true))?;

    let master = GainNode::new(&context);
    master.gain().set_value(0.2);
    context.connect(&context.destination(), &master, 0, 0)?;

    let saw = OscillatorNode::with_type(&context, OscillatorType::Sawtooth)?;
    saw.frequency().set_value(220.0);
    context.connect(&master, &saw, 0, 0)?;

    let sine = OscillatorNode::new(&context);
    sine.frequency().set_value_at_time(220.0, 0.0)?;
    sine.frequency().exponential_ramp_to_value_at_time(330.0, 2.0)?;
    context.connect(&master, &sine, 0, 0)?;

    sine.set_on_ended(Some(Arc::new(|| println!("sine ended"))));

    let device = CpalDevice::new(&context)?;
    println!("\nUsing: {} ({} ch)", device.name(), device.channels());
    context.set_device(Box::new(device))?;

    saw.start(0.0);
    sine.start(0.0);
    saw.stop(2.0);
    sine.stop(2.0);

    sleep(Duration::from_millis(2200));
    context.close();
    Ok(())
}
