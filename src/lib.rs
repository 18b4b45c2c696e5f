pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod item;
pub mod orchestrator;
pub mod sandbox;

pub use error::{Result, ScriptError};
