//! Configuration types shared between afbench crates.

mod types;

pub use types::*;
