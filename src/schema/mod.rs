//! Schema module - Configuration, grammar and result types for payload discovery.

mod config;
mod evolution;
mod grammar;

pub use config::*;
pub use evolution::*;
pub use grammar::*;
