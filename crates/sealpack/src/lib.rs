pub mod config;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod pipeline;
pub mod planner;
pub mod runner;
pub mod runtime;
pub mod shim;
pub mod targets;
pub mod toolchain;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
