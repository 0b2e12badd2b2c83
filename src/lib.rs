pub mod cli;
pub mod error;
pub mod injector;
pub mod k8s;
pub mod network;
pub mod spec;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{ChaosnetError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
