//! Trainer parameter types shared between sweep crates.

mod train;
mod types;

pub use train::*;
pub use types::*;
