//! sb - Minimal bubblewrap sandboxes
//!
//! Resolves the binaries and shared libraries a program needs, places the
//! libraries in a deduplicated object store, and generates the bubblewrap
//! command that exposes exactly that closure.

pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod generate;
pub mod options;
pub mod pool;
pub mod resolve;
pub mod store;
pub mod util;

#[cfg(test)]
mod testing;

pub use error::{SbError, SbResult};
