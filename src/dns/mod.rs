//! DNS resolution cache.
//!
//! Tracks one resolution state machine per lookup key and the addresses it
//! produced, plus a table of statically pinned names.

mod cache;
mod key;
mod result;
mod statics;

pub use cache::*;
pub use key::*;
pub use result::ResolutionResult;
pub use statics::*;
