mod destination;
mod recorder;

pub(crate) use destination::Destination;
pub use recorder::*;
