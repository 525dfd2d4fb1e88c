//! Work execution: check units, the queue that holds them, and the pool of
//! workers that drains it.

mod monitor;
mod pool;
mod queue;
mod unit;

pub use monitor::*;
pub use pool::*;
pub use queue::*;
pub use unit::*;
