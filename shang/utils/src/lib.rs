//! Shared utilities for the Shang scheduling core.
mod errors;
mod math;

pub use errors::{Error, ErrorKind, ShangResult};
pub use math::{bits_needed_for, ceil_div};
