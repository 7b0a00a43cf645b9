mod gain;

pub use gain::*;
