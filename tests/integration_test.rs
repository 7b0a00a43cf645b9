use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use parking_lot::Mutex;

use schall::nodes::{ConstantSourceNode, GainNode, LiveInputNode, OscillatorNode, OscillatorType, RecorderNode};
use schall::{
    AudioDevice, AudioProcessor, AudioStreamConfig, Bus, ChannelInterpretation, Context, ContextOptions, Error,
    MockDevice, Node, NodeDescriptor, OfflineDevice, ParamDescriptor, ProcessContext, SchedulingState,
};

const SYNC: Duration = Duration::from_millis(200);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn context() -> Context {
    init_tracing();
    Context::new(AudioStreamConfig::default(), ContextOptions::default()).unwrap()
}

fn context_with_quantum(frames: usize) -> Context {
    init_tracing();
    Context::new(
        AudioStreamConfig::default(),
        ContextOptions::default().with_render_quantum_frames(frames),
    )
    .unwrap()
}

fn running_device(ctx: &Context) -> MockDevice {
    let mut device = MockDevice::new(ctx);
    device.start().unwrap();
    device
}

/// Constant mono signal that is never silent and counts its renders.
struct Dc {
    value: f32,
    renders: Arc<AtomicUsize>,
}

impl AudioProcessor for Dc {
    fn name(&self) -> &'static str {
        "dc"
    }

    fn process(&mut self, _ctx: &mut ProcessContext<'_>, _inputs: &[&Bus], outputs: &mut [&mut Bus]) {
        self.renders.fetch_add(1, Ordering::SeqCst);
        outputs[0].channel_mut(0).mutable_data().fill(self.value);
    }

    fn propagates_silence(&self) -> bool {
        false
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn output_channels(&self, _output: usize, _input_channels: &[usize]) -> usize {
        1
    }
}

fn dc(ctx: &Context, value: f32) -> (Node, Arc<AtomicUsize>) {
    let renders = Arc::new(AtomicUsize::new(0));
    let processor = Dc {
        value,
        renders: renders.clone(),
    };
    (Node::new(ctx, &NodeDescriptor::EMPTY, processor), renders)
}

/// Sums every input into its output and counts its renders.
struct Mix {
    inputs: usize,
    renders: Arc<AtomicUsize>,
}

impl AudioProcessor for Mix {
    fn name(&self) -> &'static str {
        "mix"
    }

    fn process(&mut self, _ctx: &mut ProcessContext<'_>, inputs: &[&Bus], outputs: &mut [&mut Bus]) {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let output = &mut *outputs[0];
        output.zero();
        for input in inputs {
            output.sum_from(input, ChannelInterpretation::Speakers);
        }
    }

    fn num_inputs(&self) -> usize {
        self.inputs
    }
}

fn mix(ctx: &Context, inputs: usize) -> (Node, Arc<AtomicUsize>) {
    let renders = Arc::new(AtomicUsize::new(0));
    let processor = Mix {
        inputs,
        renders: renders.clone(),
    };
    (Node::new(ctx, &NodeDescriptor::EMPTY, processor), renders)
}

const TAP_PARAMS: &[ParamDescriptor] = &[ParamDescriptor::new("level", "LVL", 0.0, -10.0, 10.0)];

const TAP: NodeDescriptor = NodeDescriptor {
    params: TAP_PARAMS,
    settings: &[],
};

/// Records its input and its `level` param for the last quantum.
struct Tap {
    input: Arc<Mutex<Vec<f32>>>,
    level: Arc<Mutex<Vec<f32>>>,
}

impl AudioProcessor for Tap {
    fn name(&self) -> &'static str {
        "tap"
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>, inputs: &[&Bus], _outputs: &mut [&mut Bus]) {
        let mut level = vec![0.0; ctx.frames()];
        ctx.param_values(0, &mut level);
        *self.level.lock() = level;
        *self.input.lock() = inputs[0].channel(0).data().to_vec();
    }

    fn propagates_silence(&self) -> bool {
        false
    }
}

struct TapHandle {
    node: Node,
    input: Arc<Mutex<Vec<f32>>>,
    level: Arc<Mutex<Vec<f32>>>,
}

fn tap(ctx: &Context) -> TapHandle {
    let input = Arc::new(Mutex::new(Vec::new()));
    let level = Arc::new(Mutex::new(Vec::new()));
    let processor = Tap {
        input: input.clone(),
        level: level.clone(),
    };
    let node = Node::new(ctx, &TAP, processor);
    ctx.add_automatic_pull_node(&node);
    TapHandle { node, input, level }
}

#[test]
fn diamond_renders_each_node_once() {
    let ctx = context();
    let (source, source_renders) = dc(&ctx, 1.0);
    let (left, left_renders) = mix(&ctx, 1);
    let (right, right_renders) = mix(&ctx, 1);
    let (join, join_renders) = mix(&ctx, 2);

    ctx.connect(&left, &source, 0, 0).unwrap();
    ctx.connect(&right, &source, 0, 0).unwrap();
    ctx.connect(&join, &left, 0, 0).unwrap();
    ctx.connect(&join, &right, 1, 0).unwrap();
    ctx.connect(&ctx.destination(), &join, 0, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quanta(3);

    assert_eq!(source_renders.load(Ordering::SeqCst), 3);
    assert_eq!(left_renders.load(Ordering::SeqCst), 3);
    assert_eq!(right_renders.load(Ordering::SeqCst), 3);
    assert_eq!(join_renders.load(Ordering::SeqCst), 3);

    let out = device.output();
    assert_eq!(out.number_of_channels(), 2);
    for x in out.channel(1).data() {
        assert_abs_diff_eq!(*x, 2.0);
    }
}

#[test]
fn feedback_cycle_terminates() {
    let ctx = context();
    let (source, source_renders) = dc(&ctx, 0.5);
    let (a, a_renders) = mix(&ctx, 2);
    let (b, b_renders) = mix(&ctx, 1);

    ctx.connect(&a, &source, 0, 0).unwrap();
    ctx.connect(&a, &b, 1, 0).unwrap();
    ctx.connect(&b, &a, 0, 0).unwrap();
    ctx.connect(&ctx.destination(), &a, 0, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quanta(4);

    assert_eq!(source_renders.load(Ordering::SeqCst), 4);
    assert_eq!(a_renders.load(Ordering::SeqCst), 4);
    // b first hears a's silent initial output and skips that quantum
    assert_eq!(b_renders.load(Ordering::SeqCst), 3);
    assert!(device.output().max_abs_value() > 0.5, "feedback accumulates");
    ctx.close();
}

#[test]
fn unconnected_destination_is_silent() {
    let ctx = context();
    let mut device = running_device(&ctx);
    assert!(device.render_quantum().is_silent());
    assert!(device.render_quantum().is_silent());
}

#[test]
fn connect_disconnect_round_trip() {
    let ctx = context();
    let destination = ctx.destination();
    let (a, _) = dc(&ctx, 1.0);
    let (b, _) = dc(&ctx, 1.0);
    let (join, _) = mix(&ctx, 1);

    ctx.connect(&join, &a, 0, 0).unwrap();
    ctx.connect(&join, &b, 0, 0).unwrap();
    ctx.connect(&destination, &join, 0, 0).unwrap();
    assert!(!ctx.is_connected(&join, &a), "edits apply on the render thread");

    let mut device = running_device(&ctx);
    device.render_quantum();
    ctx.synchronize_connections(SYNC).unwrap();
    assert!(ctx.is_connected(&join, &a));
    assert!(ctx.is_connected(&join, &b));
    assert_abs_diff_eq!(device.output().channel(0).data()[0], 2.0);

    ctx.disconnect(&join, &a, 0, 0).unwrap();
    device.render_quantum();
    ctx.synchronize_connections(SYNC).unwrap();
    ctx.dispatch_events();

    assert!(!ctx.is_connected(&join, &a));
    assert!(ctx.is_connected(&join, &b), "unrelated edge untouched");
    assert!(join.is_input_connected(0, &b, 0));
    assert_abs_diff_eq!(device.output().channel(0).data()[0], 1.0);
}

#[test]
fn synchronize_times_out_without_rendering() {
    let ctx = context();
    let (a, _) = dc(&ctx, 1.0);
    ctx.connect(&ctx.destination(), &a, 0, 0).unwrap();
    assert_eq!(ctx.pending_edits(), 1);

    let result = ctx.synchronize_connections(Duration::from_millis(5));
    assert!(matches!(result, Err(Error::Timeout { pending: 1 })));

    let mut device = running_device(&ctx);
    device.render_quantum();
    ctx.synchronize_connections(SYNC).unwrap();
    assert_eq!(ctx.pending_edits(), 0);
}

#[test]
fn invalid_edges_are_rejected() {
    let ctx = context();
    let (a, _) = dc(&ctx, 1.0);
    let destination = ctx.destination();
    assert!(matches!(
        ctx.connect(&destination, &a, 3, 0),
        Err(Error::InvalidInput { index: 3, .. })
    ));
    assert!(matches!(
        ctx.connect(&destination, &a, 0, 1),
        Err(Error::InvalidOutput { index: 1, .. })
    ));
    assert_eq!(ctx.pending_edits(), 0);
}

#[test]
fn added_input_accepts_connections() {
    let ctx = context();
    let (a, _) = dc(&ctx, 1.0);
    let (b, _) = dc(&ctx, 2.0);
    let (join, _) = mix(&ctx, 1);

    assert_eq!(join.add_input().unwrap(), 1);
    assert_eq!(join.number_of_inputs(), 2);
    ctx.connect(&join, &a, 0, 0).unwrap();
    ctx.connect(&join, &b, 1, 0).unwrap();
    ctx.connect(&ctx.destination(), &join, 0, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quantum();
    assert_abs_diff_eq!(device.output().channel(0).data()[64], 3.0);
}

#[test]
fn gain_converges_then_holds() {
    let ctx = context();
    let (source, _) = dc(&ctx, 1.0);
    let gain = GainNode::new(&ctx);
    ctx.connect(&gain, &source, 0, 0).unwrap();
    ctx.connect(&ctx.destination(), &gain, 0, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quantum();
    assert_abs_diff_eq!(device.output().channel(0).data()[127], 1.0);

    gain.gain().set_value(0.25);
    let mut previous = 1.0;
    for _ in 0..40 {
        let last = device.render_quantum().channel(0).data()[127];
        assert!(last <= previous + 1e-6, "ramps monotonically toward the target");
        previous = last;
    }
    assert_abs_diff_eq!(previous, 0.25, epsilon = 1e-3);

    // converged: every sample of the next quantum equals the target
    let out = device.render_quantum();
    assert!(out.channel(0).data().iter().all(|&x| (x - 0.25).abs() < 1e-3));
}

#[test]
fn automated_gain_is_sample_accurate() {
    let ctx = context();
    let (source, _) = dc(&ctx, 1.0);
    let gain = GainNode::new(&ctx);
    ctx.connect(&gain, &source, 0, 0).unwrap();
    ctx.connect(&ctx.destination(), &gain, 0, 0).unwrap();

    let quantum = 128.0 / 48_000.0;
    gain.gain().set_value_at_time(0.0, 0.0).unwrap();
    gain.gain().linear_ramp_to_value_at_time(1.0, quantum).unwrap();

    let mut device = running_device(&ctx);
    let out = device.render_quantum().channel(0).data().to_vec();
    assert_abs_diff_eq!(out[0], 0.0, epsilon = 1e-5);
    assert_abs_diff_eq!(out[64], 0.5, epsilon = 1e-4);
    assert!(out.windows(2).all(|w| w[1] >= w[0]));
}

#[test]
fn scheduled_source_lifecycle() {
    let ctx = context();
    let osc = OscillatorNode::new(&ctx);
    ctx.connect(&ctx.destination(), &osc, 0, 0).unwrap();

    let ended = Arc::new(AtomicUsize::new(0));
    let counter = ended.clone();
    osc.set_on_ended(Some(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    assert_eq!(osc.playback_state(), SchedulingState::Unscheduled);
    assert!(osc.start(0.0));
    assert_eq!(osc.playback_state(), SchedulingState::Scheduled);

    let mut device = running_device(&ctx);
    device.render_quantum();
    assert_eq!(osc.playback_state(), SchedulingState::FadeIn);
    device.render_quantum();
    assert_eq!(osc.playback_state(), SchedulingState::Playing);

    assert!(osc.stop(0.0));
    device.render_quantum();
    assert_eq!(osc.playback_state(), SchedulingState::Stopping);
    device.render_quanta(3);
    assert_eq!(osc.playback_state(), SchedulingState::Unscheduled);

    assert_eq!(ctx.dispatch_events(), 1);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.dispatch_events(), 0);
}

#[test]
fn param_sums_timeline_and_driver() {
    let ctx = context();
    let tap = tap(&ctx);
    let (driver, _) = dc(&ctx, 1.0);
    let level = tap.node.param("level").unwrap().clone();

    level.set_value_at_time(0.0, 0.0).unwrap();
    level.linear_ramp_to_value_at_time(1.0, 128.0 / 48_000.0).unwrap();
    ctx.connect_param(&level, &driver, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quantum();

    let values = tap.level.lock().clone();
    assert_eq!(values.len(), 128);
    for (i, v) in values.iter().enumerate() {
        let timeline = i as f32 / 128.0;
        assert_abs_diff_eq!(*v, timeline + 1.0, epsilon = 1e-4);
    }
    assert_eq!(level.number_of_drivers(), 1);
}

#[test]
fn oscillator_reaches_destination() {
    let ctx = context();
    let osc = OscillatorNode::new(&ctx);
    ctx.connect(&ctx.destination(), &osc, 0, 0).unwrap();
    osc.start(0.0);

    let mut device = running_device(&ctx);

    let fade = device.render_quantum().channel(0).data().to_vec();
    assert_eq!(fade[0], 0.0, "fade in starts from zero");

    let quantum = device.render_quantum();
    assert!(!quantum.is_silent());
    assert!(quantum.channel(0).data()[0].abs() > 1e-3, "audible from the first sample");
    assert_eq!(quantum.channel(0).data(), quantum.channel(1).data());

    device.render_quantum();
    assert_eq!(device.current_sample_frame(), 384);
    assert_eq!(osc.playback_state(), SchedulingState::Playing);
    assert!(device.output().max_abs_value() <= 1.0 + 1e-4);
}

#[test]
fn oscillator_shapes_and_detune() {
    let ctx = context();
    let osc = OscillatorNode::with_type(&ctx, OscillatorType::Square).unwrap();
    assert_eq!(osc.oscillator_type(), OscillatorType::Square);
    assert_eq!(osc.setting("type").unwrap().enumeration_name(), Some("square"));

    // an octave down: 880 Hz detuned by -1200 cents
    osc.frequency().set_value(880.0);
    osc.frequency().reset_smoothed_value(880.0);
    osc.detune().set_value(-1200.0);
    osc.detune().reset_smoothed_value(-1200.0);
    ctx.connect(&ctx.destination(), &osc, 0, 0).unwrap();
    osc.start(0.0);

    let mut device = running_device(&ctx);
    let mut signal = Vec::new();
    for _ in 0..20 {
        signal.extend_from_slice(device.render_quantum().channel(0).data());
    }

    // count rising zero crossings after the fade in
    let settled = &signal[128..];
    let crossings = settled.windows(2).filter(|w| w[0] < 0.0 && w[1] >= 0.0).count();
    let seconds = settled.len() as f32 / 48_000.0;
    assert_abs_diff_eq!(crossings as f32 / seconds, 440.0, epsilon = 30.0);
}

#[test]
fn two_sources_sum_into_one_input() {
    let ctx = context_with_quantum(4);
    let tap = tap(&ctx);
    let (a, _) = dc(&ctx, 1.0);
    let (b, _) = dc(&ctx, 2.0);
    ctx.connect(&tap.node, &a, 0, 0).unwrap();
    ctx.connect(&tap.node, &b, 0, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quantum();

    assert_eq!(*tap.input.lock(), vec![3.0, 3.0, 3.0, 3.0]);
}

#[test]
fn duplicate_connection_is_ignored() {
    let ctx = context_with_quantum(4);
    let tap = tap(&ctx);
    let (a, _) = dc(&ctx, 1.0);
    ctx.connect(&tap.node, &a, 0, 0).unwrap();
    ctx.connect(&tap.node, &a, 0, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quantum();
    ctx.dispatch_events();

    assert_eq!(*tap.input.lock(), vec![1.0; 4]);
}

#[test]
fn constant_source_drives_oscillator_frequency() {
    let ctx = context();
    let osc = OscillatorNode::new(&ctx);
    let modulator = ConstantSourceNode::new(&ctx);
    modulator.offset().set_value(100.0);
    modulator.offset().reset_smoothed_value(100.0);
    ctx.connect_param(osc.frequency(), &modulator, 0).unwrap();
    ctx.connect(&ctx.destination(), &osc, 0, 0).unwrap();
    osc.start(0.0);
    modulator.start(0.0);

    let mut device = running_device(&ctx);
    device.render_quanta(2);
    assert!(osc.frequency().is_connected(&modulator, 0));
    assert!(!device.output().is_silent());
}

#[test]
fn live_input_reaches_destination() {
    let ctx = context();
    let live = LiveInputNode::new(&ctx);
    ctx.connect(&ctx.destination(), &live, 0, 0).unwrap();

    let input = Bus::from_channels(vec![vec![0.5; 128]], 48_000.0);
    let mut device = MockDevice::new(&ctx).with_input(input);
    device.start().unwrap();
    device.render_quantum();

    for channel in device.output().channels() {
        assert!(channel.data().iter().all(|&x| x == 0.5));
    }

    device.set_input(None);
    device.render_quantum();
    assert_eq!(device.output().max_abs_value(), 0.0);
}

#[test]
fn recorder_captures_without_downstream() {
    let ctx = context_with_quantum(16);
    let (source, _) = dc(&ctx, 0.25);
    let recorder = RecorderNode::new(&ctx, 1, 1.0);
    ctx.connect(&recorder, &source, 0, 0).unwrap();
    recorder.start_recording();

    let mut device = running_device(&ctx);
    device.render_quanta(4);

    let samples = recorder.take_recording();
    assert_eq!(samples.len(), 64);
    assert!(samples.iter().all(|&x| x == 0.25));
    assert!(ctx.automatic_pull_nodes().iter().any(|n| n.ptr_eq(&recorder)));
}

#[test]
fn silence_propagates_after_tail() {
    let ctx = context();
    let (join, renders) = mix(&ctx, 1);
    ctx.connect(&ctx.destination(), &join, 0, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quanta(3);
    assert_eq!(renders.load(Ordering::SeqCst), 0, "silent inputs skip processing");
    assert!(join.output_bus(0).unwrap().is_silent());
}

#[test]
fn suspended_context_renders_silence() {
    let ctx = context();
    let (a, renders) = dc(&ctx, 1.0);
    ctx.connect(&ctx.destination(), &a, 0, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quantum();
    assert_eq!(renders.load(Ordering::SeqCst), 1);

    ctx.suspend();
    assert!(device.render_quantum().is_silent());
    assert_eq!(renders.load(Ordering::SeqCst), 1);

    ctx.resume();
    device.render_quantum();
    assert_eq!(renders.load(Ordering::SeqCst), 2);
}

#[test]
fn background_events_run_without_dispatch() {
    init_tracing();
    let ctx = Context::new(
        AudioStreamConfig::default(),
        ContextOptions::default().with_background_events(true),
    )
    .unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    ctx.enqueue_event(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap();

    for _ in 0..100 {
        if fired.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    ctx.close();
}

#[test]
fn offline_render_advances_clock() {
    init_tracing();
    let ctx = Context::offline(AudioStreamConfig::default(), ContextOptions::default()).unwrap();
    let osc = OscillatorNode::new(&ctx);
    ctx.connect(&ctx.destination(), &osc, 0, 0).unwrap();
    osc.start(0.0);
    osc.stop(0.25);

    let mut device = OfflineDevice::new(&ctx, 0.5);
    device.start().unwrap();
    device.wait().unwrap();

    assert!(ctx.is_offline());
    assert_eq!(device.rendered_frames(), 24_000);
    assert_eq!(osc.playback_state(), SchedulingState::Unscheduled);
}

#[test]
fn close_releases_cycles() {
    let ctx = context();
    let (a, _) = mix(&ctx, 1);
    let (b, _) = mix(&ctx, 1);
    ctx.connect(&a, &b, 0, 0).unwrap();
    ctx.connect(&b, &a, 0, 0).unwrap();
    ctx.connect(&ctx.destination(), &a, 0, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quantum();
    assert!(ctx.is_connected(&a, &b));

    ctx.close();
    assert!(!ctx.is_connected(&a, &b));
    assert!(!ctx.is_connected(&b, &a));
    assert!(matches!(ctx.connect(&a, &b, 0, 0), Err(Error::ContextClosed)));
}

#[test]
fn start_while_scheduled_or_playing_changes_nothing() {
    let ctx = context();
    let source = ConstantSourceNode::new(&ctx);
    ctx.connect(&ctx.destination(), &source, 0, 0).unwrap();

    assert!(source.start(1.0));
    let start = source.scheduler().start_frame();
    assert!(!source.start(0.0), "already scheduled");
    assert_eq!(source.scheduler().start_frame(), start);

    let late = ConstantSourceNode::new(&ctx);
    ctx.connect(&ctx.destination(), &late, 0, 0).unwrap();
    late.start(0.0);
    let mut device = running_device(&ctx);
    device.render_quanta(2);
    assert_eq!(late.playback_state(), SchedulingState::Playing);
    assert_eq!(source.playback_state(), SchedulingState::Scheduled);

    assert!(late.stop(0.01));
    let stop = late.scheduler().stop_frame();
    assert!(!late.start(0.0), "already playing");
    assert_eq!(late.scheduler().stop_frame(), stop, "pending stop kept");

    device.render_quanta(10);
    assert_eq!(late.playback_state(), SchedulingState::Unscheduled);
}

#[test]
fn close_from_background_callback() {
    init_tracing();
    let ctx = Arc::new(
        Context::new(
            AudioStreamConfig::default(),
            ContextOptions::default().with_background_events(true),
        )
        .unwrap(),
    );
    let done = Arc::new(AtomicUsize::new(0));
    let (handle, flag) = (ctx.clone(), done.clone());
    ctx.enqueue_event(Arc::new(move || {
        handle.close();
        flag.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap();

    for _ in 0..100 {
        if done.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(done.load(Ordering::SeqCst), 1, "close returned on the event thread");
    assert!(ctx.is_closed());
}

#[test]
fn retired_nodes_do_not_crowd_out_completion() {
    init_tracing();
    let ctx = Context::new(
        AudioStreamConfig::default(),
        ContextOptions::default().with_event_queue_capacity(1),
    )
    .unwrap();
    let source = ConstantSourceNode::new(&ctx);
    let (join, _) = mix(&ctx, 1);
    let extras: Vec<Node> = (0..4).map(|_| dc(&ctx, 0.1).0).collect();
    ctx.connect(&join, &source, 0, 0).unwrap();
    for extra in extras.iter() {
        ctx.connect(&join, extra, 0, 0).unwrap();
    }
    ctx.connect(&ctx.destination(), &join, 0, 0).unwrap();

    let ended = Arc::new(AtomicUsize::new(0));
    let counter = ended.clone();
    source.set_on_ended(Some(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));
    source.start(0.0);

    let mut device = running_device(&ctx);
    device.render_quanta(2);
    for extra in extras.iter() {
        ctx.disconnect(&join, extra, 0, 0).unwrap();
    }
    source.stop(0.0);
    device.render_quanta(3);

    assert_eq!(source.playback_state(), SchedulingState::Unscheduled);
    assert_eq!(ctx.dispatch_events(), 1);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.dropped_events(), 0);
    assert_eq!(ctx.dropped_retires(), 0);
}

#[test]
fn connectivity_queries_do_not_interrupt_rendering() {
    let ctx = context();
    let (a, renders) = dc(&ctx, 1.0);
    let destination = ctx.destination();
    ctx.connect(&destination, &a, 0, 0).unwrap();

    let mut device = running_device(&ctx);
    device.render_quantum();
    ctx.synchronize_connections(SYNC).unwrap();

    let stop = AtomicBool::new(false);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                assert!(ctx.is_connected(&destination, &a));
                assert!(destination.is_input_connected(0, &a, 0));
            }
        });
        for _ in 0..200 {
            let out = device.render_quantum();
            assert!(out.channel(0).data().iter().all(|&x| x == 1.0));
        }
        stop.store(true, Ordering::Release);
    });
    assert_eq!(renders.load(Ordering::SeqCst), 201);
}

#[test]
fn channel_interpretation_is_queued() {
    let ctx = context();
    let (join, _) = mix(&ctx, 1);
    ctx.connect(&ctx.destination(), &join, 0, 0).unwrap();

    assert!(matches!(
        join.set_channel_interpretation(3, ChannelInterpretation::Discrete),
        Err(Error::InvalidInput { index: 3, .. })
    ));
    let before = join.pending_edits();
    join.set_channel_interpretation(0, ChannelInterpretation::Discrete).unwrap();
    assert_eq!(join.pending_edits(), before + 1, "applied on the render thread");

    let mut device = running_device(&ctx);
    device.render_quantum();
    ctx.synchronize_connections(SYNC).unwrap();
    assert_eq!(join.pending_edits(), 0);
}
