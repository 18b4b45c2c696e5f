//! The restricted execution environment scripts run in.
//!
//! An engine evaluates three sources in one fresh realm: the bootstrap that
//! installs the script's globals, the wrapped user program, and an epilogue
//! whose completion value is the settlement envelope as a JSON string.

#[cfg(feature = "boa")]
mod boa;

#[cfg(feature = "boa")]
pub use boa::BoaEngine;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::types::LimitsConfig;
use crate::sandbox::translate::RawScriptError;

/// Limits the engine enforces itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
    /// Promise jobs run after the program body before evaluation is stopped
    pub promise_job_limit: u64,
}

impl From<&LimitsConfig> for EngineLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            loop_iteration_limit: limits.loop_iteration_limit,
            recursion_limit: limits.recursion_limit,
            promise_job_limit: limits.promise_job_limit,
        }
    }
}

/// Sources for one evaluation.
///
/// `program` is `source` with line tracking calls added. Both have the same
/// line structure; engines fall back to `source` when `program` does not parse.
#[derive(Debug, Clone)]
pub struct PreparedScript {
    pub bootstrap: String,
    pub source: String,
    pub program: String,
    pub epilogue: String,
}

/// Stop signal for an evaluation running on another thread.
///
/// Engines check it between promise jobs.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineFailure {
    /// The user program could not be evaluated
    Script(RawScriptError),
    /// The engine or the bootstrap itself failed
    Internal(String),
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Script(raw) => write!(f, "{}: {}", raw.name, raw.message),
            Self::Internal(message) => write!(f, "{message}"),
        }
    }
}

/// A synchronous JavaScript engine with no filesystem, network or process access.
///
/// `evaluate` is called from a blocking thread; implementations create a new
/// realm per call and return once `cancellation` is set.
pub trait ScriptEngine: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        script: &PreparedScript,
        limits: &EngineLimits,
        cancellation: &Cancellation,
    ) -> std::result::Result<String, EngineFailure>;

    /// Parse a wrapped program without running it.
    fn check_syntax(&self, _program: &str) -> std::result::Result<(), EngineFailure> {
        Ok(())
    }
}
