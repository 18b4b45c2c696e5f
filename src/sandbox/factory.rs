use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::types::{
    CodeConfig, ExecutionMode, LimitsConfig, RunnerKind, RunnerUnavailableReason,
    ScriptLanguage, ScriptStepConfig,
};
use crate::error::{Result, ScriptError};
use crate::sandbox::backends::{InProcessSandbox, TaskRunnerClient, TaskRunnerSandbox};
use crate::sandbox::context::SandboxContext;
use crate::sandbox::backends::wrap_program;
use crate::sandbox::engine::{EngineFailure, ScriptEngine};
use crate::sandbox::modules::ModuleResolver;
use crate::sandbox::traits::Sandbox;
use crate::sandbox::translate::ErrorTranslator;
use crate::sandbox::validation::{check_each_item_source, ShapeValidator};

#[cfg(feature = "boa")]
use crate::sandbox::engine::BoaEngine;

/// Where and how one step invocation runs its script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub language: ScriptLanguage,
    pub runner: RunnerKind,
    pub mode: ExecutionMode,
}

/// Builds sandboxes for resolved plans.
///
/// Holds everything shared between sandboxes of a process: the engine, the
/// module resolver and the optional task runner connection.
#[derive(Clone)]
pub struct SandboxFactory {
    code: CodeConfig,
    limits: LimitsConfig,
    engine: Option<Arc<dyn ScriptEngine>>,
    modules: ModuleResolver,
    runner_client: Option<Arc<dyn TaskRunnerClient>>,
    validator: ShapeValidator,
}

impl SandboxFactory {
    pub fn new(config: &ScriptStepConfig, modules: ModuleResolver) -> Self {
        Self {
            code: config.code.clone(),
            limits: config.limits.clone(),
            engine: default_engine(),
            modules,
            runner_client: None,
            validator: ShapeValidator::new(config.code.reserved_item_keys.iter().cloned()),
        }
    }

    /// Factory with the module resolver described by `config`.
    pub fn from_config(config: &ScriptStepConfig) -> Result<Self> {
        Ok(Self::new(config, ModuleResolver::from_config(&config.modules)?))
    }

    pub fn with_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_runner_client(mut self, client: Arc<dyn TaskRunnerClient>) -> Self {
        self.runner_client = Some(client);
        self
    }

    pub fn code_config(&self) -> &CodeConfig {
        &self.code
    }

    /// Decide where a script runs, before anything is executed.
    pub fn resolve_plan(
        &self,
        language: ScriptLanguage,
        mode: ExecutionMode,
    ) -> Result<ExecutionPlan> {
        if !self.code.is_enabled(language) {
            return Err(ScriptError::LanguageDisabled { language });
        }

        let runner = match language {
            ScriptLanguage::JavaScript => {
                if self.code.runner.enabled && self.runner_client.is_some() {
                    RunnerKind::TaskRunner
                } else if self.engine.is_some() {
                    RunnerKind::InProcess
                } else {
                    return Err(ScriptError::Config(
                        "No JavaScript engine is available. Build with the `boa` feature or enable the task runner."
                            .to_string(),
                    ));
                }
            }
            ScriptLanguage::Python | ScriptLanguage::PythonNative => {
                if language == ScriptLanguage::PythonNative && !self.code.runner.python_native_enabled
                {
                    return Err(ScriptError::LanguageDisabled { language });
                }
                self.runner_for_python(language)?
            }
        };

        let plan = ExecutionPlan {
            language,
            runner,
            mode,
        };
        debug!(?plan, "Resolved execution plan");
        Ok(plan)
    }

    fn runner_for_python(&self, language: ScriptLanguage) -> Result<RunnerKind> {
        let unavailable = |reason| ScriptError::RunnerUnavailable { language, reason };

        if !self.code.runner.enabled {
            return Err(unavailable(RunnerUnavailableReason::RunnerDisabled));
        }
        if self.runner_client.is_none() {
            return Err(unavailable(RunnerUnavailableReason::NotConfigured));
        }
        if let Some(reason) = self.code.runner.python_unavailable_reason {
            return Err(unavailable(reason));
        }
        Ok(RunnerKind::TaskRunner)
    }

    /// Check a script without running it.
    ///
    /// Applies the size limit and, for JavaScript, the `EachItem` source check
    /// and a parse of the wrapped program when an engine is available.
    pub fn check_source(&self, language: ScriptLanguage, mode: ExecutionMode, code: &str) -> Result<()> {
        if code.len() > self.limits.max_code_bytes {
            return Err(ScriptError::CodeTooLarge {
                max: self.limits.max_code_bytes,
                actual: code.len(),
            });
        }
        if language != ScriptLanguage::JavaScript {
            return Ok(());
        }
        if mode == ExecutionMode::EachItem {
            check_each_item_source(code, None)?;
        }

        let Some(engine) = &self.engine else {
            debug!("No engine available, skipping the syntax check");
            return Ok(());
        };
        match engine.check_syntax(&wrap_program(code)) {
            Ok(()) => Ok(()),
            Err(EngineFailure::Script(raw)) => {
                Err(ErrorTranslator::new(mode, code).translate(&raw, None))
            }
            Err(EngineFailure::Internal(message)) => Err(ScriptError::Engine(message)),
        }
    }

    /// Create the sandbox for one invocation.
    pub fn create(
        &self,
        plan: &ExecutionPlan,
        code: &str,
        context: SandboxContext,
    ) -> Result<Box<dyn Sandbox>> {
        match plan.runner {
            RunnerKind::InProcess => {
                let engine = self.engine.clone().ok_or_else(|| {
                    ScriptError::Config("No JavaScript engine is available".to_string())
                })?;
                Ok(Box::new(InProcessSandbox::new(
                    code,
                    context,
                    self.modules.clone(),
                    engine,
                    self.limits.clone(),
                    self.validator.clone(),
                )))
            }
            RunnerKind::TaskRunner => {
                let client = self.runner_client.clone().ok_or(ScriptError::RunnerUnavailable {
                    language: plan.language,
                    reason: RunnerUnavailableReason::NotConfigured,
                })?;
                Ok(Box::new(TaskRunnerSandbox::new(
                    plan.language,
                    code,
                    context,
                    client,
                    Duration::from_secs(self.code.runner.timeout_seconds),
                    self.validator.clone(),
                )))
            }
        }
    }
}

#[cfg(feature = "boa")]
fn default_engine() -> Option<Arc<dyn ScriptEngine>> {
    Some(Arc::new(BoaEngine::new()))
}

#[cfg(not(feature = "boa"))]
fn default_engine() -> Option<Arc<dyn ScriptEngine>> {
    None
}
