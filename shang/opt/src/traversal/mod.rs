//! Helpers for constructing passes and reading their options.
mod construct;

pub use construct::{ConstructPass, Named, ParseVal, PassOpt};
