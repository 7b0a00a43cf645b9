//! Periodic waveform oscillator

use std::f64::consts::TAU;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use crate::bus::Bus;
use crate::context::Context;
use crate::error::Result;
use crate::node::{AudioProcessor, Node, NodeDescriptor, ProcessContext};
use crate::param::{Param, ParamDescriptor};
use crate::setting::SettingDescriptor;

const FREQUENCY: usize = 0;
const DETUNE: usize = 1;
const AMPLITUDE: usize = 2;
const BIAS: usize = 3;

const TYPE: usize = 0;

const PARAMS: &[ParamDescriptor] = &[
    ParamDescriptor::new("frequency", "FREQ", 440.0, 0.0, 100_000.0),
    ParamDescriptor::new("detune", "DTUNE", 0.0, -4800.0, 4800.0),
    ParamDescriptor::new("amplitude", "AMPL", 1.0, 0.0, 100_000.0),
    ParamDescriptor::new("bias", "BIAS", 0.0, -100_000.0, 100_000.0),
];

const TYPE_NAMES: &[&str] = &["sine", "square", "sawtooth", "triangle"];

const SETTINGS: &[SettingDescriptor] = &[SettingDescriptor::enumeration("type", "TYPE", TYPE_NAMES)];

pub const OSCILLATOR: NodeDescriptor = NodeDescriptor {
    params: PARAMS,
    settings: SETTINGS,
};

/// Table length of the non-sine waveforms.
const TABLE_SIZE: usize = 2048;
/// Partials summed into each table.
const HARMONICS: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OscillatorType {
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl OscillatorType {
    fn from_index(index: u32) -> Self {
        match index {
            1 => OscillatorType::Square,
            2 => OscillatorType::Sawtooth,
            3 => OscillatorType::Triangle,
            _ => OscillatorType::Sine,
        }
    }

    pub fn name(self) -> &'static str {
        TYPE_NAMES[self as usize]
    }
}

struct Wavetables {
    square: Vec<f32>,
    sawtooth: Vec<f32>,
    triangle: Vec<f32>,
}

impl Wavetables {
    fn build() -> Self {
        let additive = |partial: fn(usize) -> f64| -> Vec<f32> {
            (0..TABLE_SIZE)
                .map(|i| {
                    let x = TAU * i as f64 / TABLE_SIZE as f64;
                    (1..=HARMONICS).map(|k| partial(k) * (k as f64 * x).sin()).sum::<f64>() as f32
                })
                .collect()
        };

        use std::f64::consts::PI;
        Self {
            square: additive(|k| if k % 2 == 1 { 4.0 / (PI * k as f64) } else { 0.0 }),
            sawtooth: additive(|k| {
                let sign = if k % 2 == 1 { 1.0 } else { -1.0 };
                sign * 2.0 / (PI * k as f64)
            }),
            triangle: additive(|k| {
                if k % 2 == 0 {
                    return 0.0;
                }
                let sign = if (k / 2) % 2 == 0 { 1.0 } else { -1.0 };
                sign * 8.0 / (PI * PI * (k * k) as f64)
            }),
        }
    }

    fn table(&self, kind: OscillatorType) -> Option<&[f32]> {
        match kind {
            OscillatorType::Sine => None,
            OscillatorType::Square => Some(self.square.as_slice()),
            OscillatorType::Sawtooth => Some(self.sawtooth.as_slice()),
            OscillatorType::Triangle => Some(self.triangle.as_slice()),
        }
    }
}

static WAVETABLES: OnceLock<Wavetables> = OnceLock::new();

fn wavetables() -> &'static Wavetables {
    WAVETABLES.get_or_init(Wavetables::build)
}

/// Linear interpolation into a single-cycle table at `phase` in `[0, 1)`.
#[inline]
fn lookup(table: &[f32], phase: f64) -> f32 {
    let position = phase * table.len() as f64;
    let index = position as usize % table.len();
    let next = (index + 1) % table.len();
    let frac = (position - position.floor()) as f32;
    table[index] + (table[next] - table[index]) * frac
}

/// Mono band-limited oscillator.
pub struct Oscillator {
    phase: f64,
    frequency: Vec<f32>,
    detune: Vec<f32>,
    amplitude: Vec<f32>,
    bias: Vec<f32>,
}

impl Oscillator {
    pub fn new(frames: usize) -> Self {
        Self {
            phase: 0.0,
            frequency: vec![0.0; frames],
            detune: vec![0.0; frames],
            amplitude: vec![0.0; frames],
            bias: vec![0.0; frames],
        }
    }
}

impl AudioProcessor for Oscillator {
    fn name(&self) -> &'static str {
        "oscillator"
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>, _inputs: &[&Bus], outputs: &mut [&mut Bus]) {
        let Some(output) = outputs.first_mut() else {
            return;
        };
        let frames = ctx.frames();
        if self.frequency.len() < frames {
            debug_assert!(false, "oscillator built for a smaller quantum");
            output.zero();
            return;
        }

        let offset = ctx.render_offset().min(frames);
        let end = (offset + ctx.render_length()).min(frames);

        let frequency = &mut self.frequency[..frames];
        let detune = &mut self.detune[..frames];
        let amplitude = &mut self.amplitude[..frames];
        let bias = &mut self.bias[..frames];
        ctx.param_values(FREQUENCY, frequency);
        let detune_varies = ctx.param_values(DETUNE, detune);
        ctx.param_values(AMPLITUDE, amplitude);
        ctx.param_values(BIAS, bias);

        let kind = OscillatorType::from_index(ctx.setting(TYPE).value_enumeration());
        let table = wavetables().table(kind);
        let sample_rate = ctx.sample_rate() as f64;
        let fixed_ratio = 2f32.powf(detune.first().copied().unwrap_or(0.0) / 1200.0);

        let data = output.channel_mut(0).mutable_data();
        let mut phase = self.phase;
        for i in offset..end {
            let ratio = if detune_varies {
                2f32.powf(detune[i] / 1200.0)
            } else {
                fixed_ratio
            };
            let value = match table {
                Some(table) => lookup(table, phase),
                None => (phase * TAU).sin() as f32,
            };
            data[i] = value * amplitude[i] + bias[i];

            phase += (frequency[i] * ratio) as f64 / sample_rate;
            phase -= phase.floor();
        }
        self.phase = phase;
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }

    fn propagates_silence(&self) -> bool {
        false
    }

    fn is_scheduled(&self) -> bool {
        true
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        0
    }

    fn output_channels(&self, _output: usize, _input_channels: &[usize]) -> usize {
        1
    }
}

/// Handle to an oscillator in the graph.
///
/// Dereferences to [`Node`] for connection and scheduling.
#[derive(Clone, Debug)]
pub struct OscillatorNode {
    node: Node,
}

impl OscillatorNode {
    pub fn new(context: &Context) -> Self {
        // build the tables off the render thread
        let _ = wavetables();
        let processor = Oscillator::new(context.render_quantum_frames());
        Self {
            node: Node::new(context, &OSCILLATOR, processor),
        }
    }

    pub fn with_type(context: &Context, kind: OscillatorType) -> Result<Self> {
        let osc = Self::new(context);
        osc.set_type(kind)?;
        Ok(osc)
    }

    pub fn frequency(&self) -> &Arc<Param> {
        &self.node.params()[FREQUENCY]
    }

    /// Detune in cents.
    pub fn detune(&self) -> &Arc<Param> {
        &self.node.params()[DETUNE]
    }

    pub fn amplitude(&self) -> &Arc<Param> {
        &self.node.params()[AMPLITUDE]
    }

    pub fn bias(&self) -> &Arc<Param> {
        &self.node.params()[BIAS]
    }

    pub fn oscillator_type(&self) -> OscillatorType {
        OscillatorType::from_index(self.node.settings()[TYPE].value_enumeration())
    }

    pub fn set_type(&self, kind: OscillatorType) -> Result<()> {
        self.node.settings()[TYPE].set_enumeration(kind as u32, true)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Deref for OscillatorNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}
