mod container;
mod frame;
mod timestamp;

pub use container::*;
pub use frame::*;
pub use timestamp::*;
