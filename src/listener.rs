//! The context's spatial reference point.
//!
//! Spatializing nodes read the listener's position, orientation and velocity
//! each quantum. Every component is an ordinary [`Param`], so it can be
//! automated or driven like any node param.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::graph::OpQueue;
use crate::node::Node;
use crate::param::{Param, ParamDescriptor};
use crate::render::{Clock, RenderPass};

const PARAMS: [ParamDescriptor; 14] = [
    ParamDescriptor::new("positionX", "PX", 0.0, f32::MIN, f32::MAX),
    ParamDescriptor::new("positionY", "PY", 0.0, f32::MIN, f32::MAX),
    ParamDescriptor::new("positionZ", "PZ", 0.0, f32::MIN, f32::MAX),
    ParamDescriptor::new("forwardX", "FX", 0.0, -1.0, 1.0),
    ParamDescriptor::new("forwardY", "FY", 0.0, -1.0, 1.0),
    ParamDescriptor::new("forwardZ", "FZ", -1.0, -1.0, 1.0),
    ParamDescriptor::new("upX", "UX", 0.0, -1.0, 1.0),
    ParamDescriptor::new("upY", "UY", 1.0, -1.0, 1.0),
    ParamDescriptor::new("upZ", "UZ", 0.0, -1.0, 1.0),
    ParamDescriptor::new("velocityX", "VX", 0.0, f32::MIN, f32::MAX),
    ParamDescriptor::new("velocityY", "VY", 0.0, f32::MIN, f32::MAX),
    ParamDescriptor::new("velocityZ", "VZ", 0.0, f32::MIN, f32::MAX),
    ParamDescriptor::new("dopplerFactor", "DPLR", 1.0, 0.0, f32::MAX),
    ParamDescriptor::new("speedOfSound", "SOS", 343.3, 0.0, f32::MAX),
];

const POSITION: usize = 0;
const FORWARD: usize = 3;
const UP: usize = 6;
const VELOCITY: usize = 9;
const DOPPLER: usize = 12;
const SPEED_OF_SOUND: usize = 13;

pub struct Listener {
    params: Vec<Arc<Param>>,
    dirty: AtomicBool,
}

impl Listener {
    pub(crate) fn new(clock: Arc<Clock>, pending: Arc<AtomicUsize>, capacity: usize) -> Self {
        let params = PARAMS
            .iter()
            .map(|d| Arc::new(Param::new(*d, OpQueue::new(capacity, pending.clone()), clock.clone())))
            .collect();
        Self {
            params,
            dirty: AtomicBool::new(true),
        }
    }

    fn triple(&self, first: usize) -> [f32; 3] {
        [
            self.params[first].value(),
            self.params[first + 1].value(),
            self.params[first + 2].value(),
        ]
    }

    fn set_triple(&self, first: usize, [x, y, z]: [f32; 3]) {
        self.params[first].set_value(x);
        self.params[first + 1].set_value(y);
        self.params[first + 2].set_value(z);
    }

    pub fn position(&self) -> [f32; 3] {
        self.triple(POSITION)
    }

    pub fn set_position(&self, x: f32, y: f32, z: f32) {
        self.set_triple(POSITION, [x, y, z]);
    }

    pub fn forward(&self) -> [f32; 3] {
        self.triple(FORWARD)
    }

    pub fn up(&self) -> [f32; 3] {
        self.triple(UP)
    }

    /// Set the facing direction and the up vector.
    pub fn set_orientation(&self, forward: [f32; 3], up: [f32; 3]) {
        self.set_triple(FORWARD, forward);
        self.set_triple(UP, up);
    }

    pub fn velocity(&self) -> [f32; 3] {
        self.triple(VELOCITY)
    }

    pub fn set_velocity(&self, x: f32, y: f32, z: f32) {
        self.set_triple(VELOCITY, [x, y, z]);
    }

    pub fn doppler_factor(&self) -> &Arc<Param> {
        &self.params[DOPPLER]
    }

    pub fn speed_of_sound(&self) -> &Arc<Param> {
        &self.params[SPEED_OF_SOUND]
    }

    pub fn params(&self) -> &[Arc<Param>] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Arc<Param>> {
        self.params
            .iter()
            .find(|p| p.name() == name || p.short_name() == name)
    }

    /// True while any component moved during the current quantum.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Apply driver edits, render drivers and advance smoothing.
    pub(crate) fn update(&self, pass: &RenderPass<'_>) {
        let mut moved = false;
        for param in self.params.iter() {
            param.service_queue(pass);
            param.pull_drivers(pass);
            moved |= !param.smooth() || param.has_sample_accurate_values();
        }
        if moved {
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn detach_drivers(&self) -> Vec<Node> {
        self.params.iter().flat_map(|p| p.clear_drivers()).collect()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("position", &self.position())
            .field("forward", &self.forward())
            .field("up", &self.up())
            .field("velocity", &self.velocity())
            .finish()
    }
}
