//! # Shang
//!
//! Scheduling and resource-binding core of a high-level synthesis backend.
//! This crate plumbs the passes of [`shang_opt`] together: build a
//! [`shang_ir::SchedGraph`], then call [synthesize] to obtain the
//! schedule, the micro-states of every block and the register and
//! functional-unit binding.
pub mod driver;

pub use driver::{Synthesized, synthesize, synthesize_relaxed};
