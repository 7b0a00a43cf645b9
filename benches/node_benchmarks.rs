use criterion::{black_box, criterion_group, criterion_main, Criterion};

use schall::bus::{Bus, ChannelInterpretation};
use schall::nodes::{GainNode, OscillatorNode};
use schall::{AudioDevice, AudioStreamConfig, Context, ContextOptions, MockDevice};

fn noise_bus(channels: usize) -> Bus {
    let data = (0..channels)
        .map(|c| (0..128).map(|i| ((i * 31 + c * 7) % 17) as f32 / 17.0 - 0.5).collect())
        .collect();
    Bus::from_channels(data, 48_000.0)
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("render quantum: 8 oscillators -> gain -> destination", |b| {
        let ctx = Context::new(AudioStreamConfig::default(), ContextOptions::default()).unwrap();
        let gain = GainNode::new(&ctx);
        gain.gain().set_value(0.1);
        ctx.connect(&ctx.destination(), &gain, 0, 0).unwrap();
        let oscillators: Vec<_> = (0..8)
            .map(|i| {
                let osc = OscillatorNode::new(&ctx);
                osc.frequency().set_value(110.0 * (i + 1) as f32);
                ctx.connect(&gain, &osc, 0, 0).unwrap();
                osc.start(0.0);
                osc
            })
            .collect();

        let mut device = MockDevice::new(&ctx);
        device.start().unwrap();
        device.render_quanta(4);

        b.iter(|| {
            black_box(device.render_quantum());
        });
        drop(oscillators);
    });

    c.bench_function("Bus.sum_from() mono -> stereo", |b| {
        let source = noise_bus(1);
        let mut destination = Bus::new(2, 128);
        b.iter(|| destination.sum_from(black_box(&source), ChannelInterpretation::Speakers))
    });

    c.bench_function("Bus.copy_from() 5.1 -> mono", |b| {
        let source = noise_bus(6);
        let mut destination = Bus::new(1, 128);
        b.iter(|| destination.copy_from(black_box(&source), ChannelInterpretation::Speakers))
    });

    c.bench_function("Bus.copy_with_gain_from() ramping", |b| {
        let source = noise_bus(2);
        let mut destination = Bus::new(2, 128);
        let mut last = 0.0;
        let mut target = 1.0;
        b.iter(|| {
            target = 1.0 - target;
            destination.copy_with_gain_from(black_box(&source), &mut last, target)
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
