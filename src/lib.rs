pub mod archive;
pub mod dataset;
pub mod discovery;
pub mod monitoring;
pub mod runner;
pub mod types;
pub mod utils;

pub use crate::types::*;
