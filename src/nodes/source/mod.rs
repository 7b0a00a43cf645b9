mod constant;
mod live_input;
mod oscillator;

pub use constant::*;
pub use live_input::*;
pub use oscillator::*;
