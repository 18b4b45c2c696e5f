use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::types::{LimitsConfig, RunnerKind};
use crate::error::{Result, ScriptError};
use crate::item::PipelineItem;
use crate::sandbox::context::SandboxContext;
use crate::sandbox::engine::{
    Cancellation, EngineFailure, EngineLimits, PreparedScript, ScriptEngine,
};
use crate::sandbox::modules::{ModuleResolver, RequirableModules};
use crate::sandbox::tracking::track_lines;
use crate::sandbox::traits::{AllItemsOutput, RunOptions, Sandbox};
use crate::sandbox::translate::{ErrorTranslator, RawScriptError, WRAPPER_LINE_OFFSET};
use crate::sandbox::validation::{check_each_item_source, ShapeValidator};
use crate::sandbox::value::ScriptValue;
use crate::sandbox::{finalize_items, finalize_single, ConsoleLevel, ConsoleMessage, ConsoleSink};

const BOOTSTRAP: &str = include_str!("../js/bootstrap.js");
const EPILOGUE: &str = "__scriptstep_envelope();";
const TRACKER: &str = "__scriptstep_at";

const UNFINISHED_SCRIPT: &str = "The script did not finish. It may have exceeded the loop iteration limit or awaited a promise that never resolved.";

/// Wrap a fragment so top-level `return` and `await` are legal.
///
/// Adds exactly one line before the fragment. The wrapper hands the body to
/// the bootstrap's one-shot runner, which settles the result.
pub fn wrap_program(code: &str) -> String {
    format!(
        "__scriptstep_run(async function ({TRACKER}, __scriptstep_caught) {{ try {{\n{code}\n}} catch (error) {{ throw __scriptstep_caught(error); }} }});"
    )
}

/// [`wrap_program`] with statement lines reporting their line number.
fn wrap_tracked_program(code: &str) -> String {
    wrap_program(&track_lines(code, WRAPPER_LINE_OFFSET + 1, TRACKER))
}

/// Stops the engine's evaluation once the caller stops waiting for it.
struct CancelOnDrop(Cancellation);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Second argument of the bootstrap function.
#[derive(Serialize)]
struct BootstrapConfig<'a> {
    context: &'a SandboxContext,
    requirable: RequirableModules,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    settlement: Settlement,
    #[serde(default)]
    console: Vec<EncodedConsoleCall>,
}

#[derive(Debug, Deserialize)]
struct Settlement {
    settled: bool,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    error: Option<RawScriptError>,
}

#[derive(Debug, Deserialize)]
struct EncodedConsoleCall {
    level: ConsoleLevel,
    #[serde(default)]
    args: Vec<Value>,
}

/// Runs JavaScript in a fresh engine realm inside this process.
pub struct InProcessSandbox {
    code: String,
    context: SandboxContext,
    modules: ModuleResolver,
    engine: Arc<dyn ScriptEngine>,
    limits: LimitsConfig,
    validator: ShapeValidator,
}

impl InProcessSandbox {
    pub fn new(
        code: impl Into<String>,
        context: SandboxContext,
        modules: ModuleResolver,
        engine: Arc<dyn ScriptEngine>,
        limits: LimitsConfig,
        validator: ShapeValidator,
    ) -> Self {
        Self {
            code: code.into(),
            context,
            modules,
            engine,
            limits,
            validator,
        }
    }

    fn prepare(&self) -> Result<PreparedScript> {
        let config = BootstrapConfig {
            context: &self.context,
            requirable: self.modules.requirable(),
        };

        Ok(PreparedScript {
            bootstrap: format!("{BOOTSTRAP}(globalThis, {});", serde_json::to_string(&config)?),
            source: wrap_program(&self.code),
            program: wrap_tracked_program(&self.code),
            epilogue: EPILOGUE.to_string(),
        })
    }

    fn translator(&self) -> ErrorTranslator {
        ErrorTranslator::new(self.context.mode, self.code.as_str())
    }

    /// Evaluate the script and return its raw result.
    async fn execute(&self, console: &ConsoleSink) -> Result<ScriptValue> {
        let actual = self.code.len();
        if actual > self.limits.max_code_bytes {
            return Err(ScriptError::CodeTooLarge {
                max: self.limits.max_code_bytes,
                actual,
            });
        }

        let script = self.prepare()?;
        let engine = Arc::clone(&self.engine);
        let limits = EngineLimits::from(&self.limits);

        debug!(
            engine = %engine.name(),
            mode = ?self.context.mode,
            item_index = ?self.context.item_index,
            code_bytes = actual,
            "Executing script in process"
        );
        let started = Instant::now();

        let cancellation = Cancellation::new();
        let _cancel_on_drop = CancelOnDrop(cancellation.clone());

        let task = tokio::task::spawn_blocking(move || {
            engine.evaluate(&script, &limits, &cancellation)
        });
        let outcome = match tokio::time::timeout(self.limits.timeout(), task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(ScriptError::Engine(format!("engine task failed: {e}"))),
            Err(_) => {
                warn!(timeout_ms = self.limits.timeout_ms, "Script timed out");
                return Err(ScriptError::Timeout {
                    millis: self.limits.timeout_ms,
                });
            }
        };

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Script evaluated");

        let envelope = match outcome {
            Ok(envelope) => envelope,
            Err(EngineFailure::Script(raw)) => {
                return Err(self.translator().translate(&raw, self.context.item_index))
            }
            Err(EngineFailure::Internal(message)) => return Err(ScriptError::Engine(message)),
        };

        let envelope: Envelope = serde_json::from_str(&envelope)
            .map_err(|e| ScriptError::Engine(format!("malformed result envelope: {e}")))?;

        forward_console(envelope.console, console);

        let settlement = envelope.settlement;
        if !settlement.settled {
            return Err(ScriptError::Execution {
                message: UNFINISHED_SCRIPT.to_string(),
                description: None,
                line_number: None,
                column: None,
                item_index: self.context.item_index,
            });
        }

        if !settlement.ok {
            let raw = settlement
                .error
                .unwrap_or_else(|| RawScriptError::new("Error", ""));
            return Err(self.translator().translate(&raw, self.context.item_index));
        }

        match settlement.value {
            Some(value) => ScriptValue::decode(&value),
            None => Ok(ScriptValue::Null),
        }
    }
}

fn forward_console(calls: Vec<EncodedConsoleCall>, console: &ConsoleSink) {
    for call in calls {
        let args = call
            .args
            .iter()
            .map(|arg| {
                ScriptValue::decode(arg)
                    .map(|value| value.to_json())
                    .unwrap_or_else(|_| arg.clone())
            })
            .collect();

        if console.send(ConsoleMessage::new(call.level, args)).is_err() {
            debug!("Console receiver dropped, discarding script output");
            return;
        }
    }
}

#[async_trait]
impl Sandbox for InProcessSandbox {
    fn name(&self) -> &str {
        "in-process"
    }

    fn runner(&self) -> RunnerKind {
        RunnerKind::InProcess
    }

    async fn run_code_all_items(
        &self,
        options: RunOptions,
        console: &ConsoleSink,
    ) -> Result<AllItemsOutput> {
        let root = self.execute(console).await?;

        if options.multi_output {
            let branches = self.validator.validate_multi_output(&root)?;
            let branches = branches
                .into_iter()
                .map(|branch| finalize_items(&root, branch))
                .collect::<Result<Vec<_>>>()?;
            return Ok(AllItemsOutput::Multi(branches));
        }

        let items = self.validator.validate_all_items(&root)?;
        Ok(AllItemsOutput::Single(finalize_items(&root, items)?))
    }

    async fn run_code_for_each_item(
        &self,
        item_index: usize,
        console: &ConsoleSink,
    ) -> Result<Option<PipelineItem>> {
        check_each_item_source(&self.code, Some(item_index))?;

        let root = self.execute(console).await?;
        self.validator
            .validate_each_item(&root, item_index)?
            .map(|item| finalize_single(&root, item, item_index))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::item::items_from_json;

    /// Engine that returns a canned outcome and remembers what it was given.
    struct ScriptedEngine {
        outcome: std::result::Result<String, EngineFailure>,
        delay: Option<Duration>,
        calls: AtomicUsize,
        last_script: Mutex<Option<PreparedScript>>,
        last_cancellation: Mutex<Option<Cancellation>>,
    }

    impl ScriptedEngine {
        fn returning(envelope: Value) -> Arc<Self> {
            Self::with_outcome(Ok(envelope.to_string()))
        }

        fn with_outcome(outcome: std::result::Result<String, EngineFailure>) -> Arc<Self> {
            Self::delayed(outcome, None)
        }

        fn delayed(
            outcome: std::result::Result<String, EngineFailure>,
            delay: Option<Duration>,
        ) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                delay,
                calls: AtomicUsize::new(0),
                last_script: Mutex::new(None),
                last_cancellation: Mutex::new(None),
            })
        }
    }

    impl ScriptEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn evaluate(
            &self,
            script: &PreparedScript,
            _limits: &EngineLimits,
            cancellation: &Cancellation,
        ) -> std::result::Result<String, EngineFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_script.lock().unwrap() = Some(script.clone());
            *self.last_cancellation.lock().unwrap() = Some(cancellation.clone());
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.outcome.clone()
        }
    }

    fn batch_context() -> SandboxContext {
        SandboxContext::for_all_items(
            items_from_json(json!([{ "v": 1 }, { "v": 2 }]))
                .unwrap()
                .into(),
        )
    }

    fn sandbox(code: &str, context: SandboxContext, engine: Arc<dyn ScriptEngine>) -> InProcessSandbox {
        InProcessSandbox::new(
            code,
            context,
            ModuleResolver::default(),
            engine,
            LimitsConfig::default(),
            ShapeValidator::default(),
        )
    }

    fn settled(value: Value) -> Value {
        json!({ "settlement": { "settled": true, "ok": true, "value": value }, "console": [] })
    }

    #[test]
    fn test_wrapper_adds_one_line() {
        let program = wrap_program("const a = 1;\nreturn a;");
        let lines: Vec<&str> = program.lines().collect();
        assert_eq!(lines[1], "const a = 1;");
        assert_eq!(lines[2], "return a;");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_tracked_program_keeps_line_structure() {
        let code = "const a = {\n  b: 1,\n};\nthrow new Error('x');";
        let tracked = wrap_tracked_program(code);
        let lines: Vec<&str> = tracked.lines().collect();
        assert_eq!(lines.len(), wrap_program(code).lines().count());
        assert_eq!(lines[1], "__scriptstep_at(2);const a = {");
        assert_eq!(lines[2], "  b: 1,");
        assert_eq!(lines[4], "__scriptstep_at(5);throw new Error('x');");
    }

    #[tokio::test]
    async fn test_all_items_result_is_validated() {
        let engine = ScriptedEngine::returning(settled(json!({
            "k": "a", "id": 0, "v": [
                { "k": "o", "id": 1, "v": [["v", 2]] },
                { "k": "o", "id": 2, "v": [["v", 4]] }
            ]
        })));
        let (tx, _rx) = mpsc::unbounded_channel();

        let output = sandbox("return [];", batch_context(), engine.clone())
            .run_code_all_items(RunOptions::default(), &tx)
            .await
            .unwrap();

        let AllItemsOutput::Single(items) = output else {
            panic!("expected a single output");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].json["v"], json!(4));

        let script = engine.last_script.lock().unwrap().clone().unwrap();
        assert_eq!(script.source.lines().nth(1), Some("return [];"));
        assert_eq!(script.program.lines().nth(1), Some("__scriptstep_at(2);return [];"));
    }

    #[tokio::test]
    async fn test_thrown_error_line_is_relative_to_user_code() {
        let envelope = json!({
            "settlement": {
                "settled": true,
                "ok": false,
                "error": { "name": "TypeError", "message": "boom is not a function", "line": 3, "column": 1 }
            },
            "console": [{ "level": "warn", "args": ["before", { "k": "u" }] }]
        });
        let engine = ScriptedEngine::returning(envelope);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = sandbox("const a = 1;\nboom();", batch_context(), engine)
            .run_code_all_items(RunOptions::default(), &tx)
            .await
            .unwrap_err();

        assert_matches!(err, ScriptError::Execution { line_number: Some(2), .. });
        assert_eq!(err.to_string(), "boom is not a function [line 2]");

        let message = rx.try_recv().unwrap();
        assert_eq!(message.level, ConsoleLevel::Warn);
        assert_eq!(message.args, vec![json!("before"), Value::Null]);
    }

    #[tokio::test]
    async fn test_syntax_error_from_engine_is_translated() {
        let engine = ScriptedEngine::with_outcome(Err(EngineFailure::Script(
            RawScriptError::from_message("SyntaxError: unexpected token at line 2, col 8"),
        )));
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = sandbox("return {;", batch_context(), engine)
            .run_code_all_items(RunOptions::default(), &tx)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "unexpected token [line 1]");
        assert_eq!(err.description(), Some("SyntaxError"));
    }

    #[tokio::test]
    async fn test_unsettled_script_is_an_execution_error() {
        let engine = ScriptedEngine::returning(json!({ "settlement": { "settled": false } }));
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = sandbox("await new Promise(() => {});", batch_context(), engine)
            .run_code_all_items(RunOptions::default(), &tx)
            .await
            .unwrap_err();

        assert_matches!(err, ScriptError::Execution { .. });
        assert!(err.to_string().contains("did not finish"));
    }

    #[tokio::test]
    async fn test_code_size_limit() {
        let engine = ScriptedEngine::returning(settled(Value::Null));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sandbox = sandbox("return [];", batch_context(), engine.clone());
        sandbox.limits.max_code_bytes = 4;

        let err = sandbox
            .run_code_all_items(RunOptions::default(), &tx)
            .await
            .unwrap_err();

        assert_matches!(err, ScriptError::CodeTooLarge { max: 4, actual: 10 });
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let engine = ScriptedEngine::delayed(
            Ok(settled(Value::Null).to_string()),
            Some(Duration::from_millis(300)),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sandbox = sandbox("return [];", batch_context(), engine.clone());
        sandbox.limits.timeout_ms = 20;

        let err = sandbox
            .run_code_all_items(RunOptions::default(), &tx)
            .await
            .unwrap_err();

        assert_matches!(err, ScriptError::Timeout { millis: 20 });

        // The engine call outlives the timeout; once it has run, its stop signal is set
        tokio::time::sleep(Duration::from_millis(400)).await;
        let cancellation = engine.last_cancellation.lock().unwrap().clone().unwrap();
        assert!(cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn test_each_item_static_check_runs_before_engine() {
        let engine = ScriptedEngine::returning(settled(Value::Null));
        let (tx, _rx) = mpsc::unbounded_channel();
        let item = PipelineItem::new(json!({ "v": 1 }).as_object().cloned().unwrap());

        let err = sandbox(
            "const first = $input.first();\nreturn first;",
            SandboxContext::for_item(item, 0),
            engine.clone(),
        )
        .run_code_for_each_item(0, &tx)
        .await
        .unwrap_err();

        assert_matches!(err, ScriptError::Validation { line_number: Some(1), item_index: Some(0), .. });
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_each_item_error_carries_item_index() {
        let engine = ScriptedEngine::returning(json!({
            "settlement": { "settled": true, "ok": false, "error": { "name": "Error", "message": "bad row", "line": 2 } }
        }));
        let (tx, _rx) = mpsc::unbounded_channel();
        let item = PipelineItem::new(json!({ "v": 1 }).as_object().cloned().unwrap());

        let err = sandbox("throw new Error('bad row');", SandboxContext::for_item(item, 3), engine)
            .run_code_for_each_item(3, &tx)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "bad row [line 1, for item 3]");
        assert_eq!(err.item_index(), Some(3));
    }

    #[cfg(feature = "boa")]
    mod boa {
        use super::*;
        use crate::config::types::ModulesConfig;
        use crate::sandbox::engine::BoaEngine;
        use crate::sandbox::modules::ModuleResolverPolicy;
        use crate::sandbox::value::CIRCULAR_MARKER;

        fn boa_sandbox(code: &str, context: SandboxContext) -> InProcessSandbox {
            sandbox(code, context, Arc::new(BoaEngine::new()))
        }

        async fn run_batch(code: &str) -> Result<Vec<PipelineItem>> {
            let (tx, _rx) = mpsc::unbounded_channel();
            boa_sandbox(code, batch_context())
                .run_code_all_items(RunOptions::default(), &tx)
                .await
                .map(|output| output.into_branches().remove(0))
        }

        #[tokio::test]
        async fn test_all_items_transform() {
            let items = run_batch(
                "return $input.all().map((item) => ({ json: { v: item.json.v * 2 } }));",
            )
            .await
            .unwrap();
            let values: Vec<_> = items.iter().map(|i| i.json["v"].clone()).collect();
            assert_eq!(values, vec![json!(2), json!(4)]);
        }

        #[tokio::test]
        async fn test_top_level_await_and_plain_objects() {
            let items = run_batch("const v = await Promise.resolve(5);\nreturn [{ v }];")
                .await
                .unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].json["v"], json!(5));
        }

        #[tokio::test]
        async fn test_null_return_is_empty() {
            assert!(run_batch("return null;").await.unwrap().is_empty());
            assert!(run_batch("const x = 1;").await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_dates_and_cycles_are_standardized() {
            let items = run_batch(
                "const a = { when: new Date(0) };\na.self = a;\nreturn [a];",
            )
            .await
            .unwrap();
            assert_eq!(items[0].json["when"], json!("1970-01-01T00:00:00.000Z"));
            assert_eq!(items[0].json["self"], json!(CIRCULAR_MARKER));
        }

        #[tokio::test]
        async fn test_missing_items_gets_hint() {
            let err = run_batch("return items;").await.unwrap_err();
            assert_matches!(err, ScriptError::Execution { .. });
            assert!(err
                .to_string()
                .starts_with("`items` is not defined. Did you mean `$input.all()`?"));
        }

        #[tokio::test]
        async fn test_syntax_error_is_an_execution_error() {
            let err = run_batch("const a = 1;\nreturn {;").await.unwrap_err();
            assert_matches!(err, ScriptError::Execution { .. });
        }

        #[tokio::test]
        async fn test_runaway_loop_is_stopped() {
            let (tx, _rx) = mpsc::unbounded_channel();
            let mut sandbox = boa_sandbox("while (true) {}", batch_context());
            sandbox.limits.loop_iteration_limit = 10_000;

            let err = sandbox
                .run_code_all_items(RunOptions::default(), &tx)
                .await
                .unwrap_err();
            assert_matches!(err, ScriptError::Execution { .. });
        }

        #[tokio::test]
        async fn test_console_output_reaches_sink() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            boa_sandbox("console.log('hi', { a: 1 });\nconsole.error('oops');\nreturn [];", batch_context())
                .run_code_all_items(RunOptions::default(), &tx)
                .await
                .unwrap();

            let first = rx.try_recv().unwrap();
            assert_eq!(first.level, ConsoleLevel::Log);
            assert_eq!(first.args, vec![json!("hi"), json!({ "a": 1 })]);
            assert_eq!(rx.try_recv().unwrap().level, ConsoleLevel::Error);
        }

        #[tokio::test]
        async fn test_require_is_gated_by_policy() {
            let err = run_batch("const fs = require('fs');\nreturn [];").await.unwrap_err();
            assert!(err.to_string().contains("Cannot find module 'fs'"));

            let modules = ModuleResolver::new(
                ModuleResolverPolicy::from_config(&ModulesConfig {
                    builtins: vec!["util".to_string()],
                    ..ModulesConfig::default()
                }),
                crate::sandbox::modules::ModuleRegistry::with_builtins(),
            );
            let sandbox = InProcessSandbox::new(
                "const util = require('node:util');\nreturn [{ s: util.format('%s=%d', 'a', 1) }];",
                batch_context(),
                modules,
                Arc::new(BoaEngine::new()),
                LimitsConfig::default(),
                ShapeValidator::default(),
            );
            let (tx, _rx) = mpsc::unbounded_channel();
            let output = sandbox
                .run_code_all_items(RunOptions::default(), &tx)
                .await
                .unwrap();
            assert_eq!(output.into_branches()[0][0].json["s"], json!("a=1"));
        }

        #[tokio::test]
        async fn test_multi_output() {
            let (tx, _rx) = mpsc::unbounded_channel();
            let output = boa_sandbox("return [[{ a: 1 }], [{ b: 2 }, { b: 3 }]];", batch_context())
                .run_code_all_items(RunOptions { multi_output: true }, &tx)
                .await
                .unwrap();
            assert_matches!(output, AllItemsOutput::Multi(ref branches) if branches.len() == 2 && branches[1].len() == 2);
        }

        #[tokio::test]
        async fn test_each_item_reads_bound_item() {
            let (tx, _rx) = mpsc::unbounded_channel();
            let item = PipelineItem::new(json!({ "v": 41 }).as_object().cloned().unwrap());
            let output = boa_sandbox(
                "return { json: { v: $input.item.json.v + 1, index: $itemIndex } };",
                SandboxContext::for_item(item, 6),
            )
            .run_code_for_each_item(6, &tx)
            .await
            .unwrap()
            .unwrap();
            assert_eq!(output.json["v"], json!(42));
            assert_eq!(output.json["index"], json!(6));
        }

        #[tokio::test]
        async fn test_runtime_errors_carry_user_line() {
            for (code, message) in [
                ("const a = 1;\nthrow new Error('x');", "x [line 2]"),
                ("const a = 1;\nnull.x;", "[line 2]"),
                ("const a = 1;\nundefinedFn();", "undefinedFn is not defined [line 2]"),
            ] {
                let err = run_batch(code).await.unwrap_err();
                assert_matches!(err, ScriptError::Execution { line_number: Some(2), .. }, "{code}");
                assert!(err.to_string().ends_with(message), "{err}");
            }
        }

        #[tokio::test]
        async fn test_error_inside_function_reports_throwing_line() {
            let err = run_batch("function read(o) {\n  return o.missing.deeper;\n}\nread({});")
                .await
                .unwrap_err();
            assert_matches!(err, ScriptError::Execution { line_number: Some(2), .. });
            assert_eq!(err.description(), Some("TypeError"));
        }

        #[tokio::test]
        async fn test_each_item_error_names_line_and_item() {
            let (tx, _rx) = mpsc::unbounded_channel();
            let item = PipelineItem::new(json!({ "v": 1 }).as_object().cloned().unwrap());
            let err = boa_sandbox(
                "const v = $json.v;\nthrow new Error('bad row');",
                SandboxContext::for_item(item, 4),
            )
            .run_code_for_each_item(4, &tx)
            .await
            .unwrap_err();
            assert_eq!(err.to_string(), "bad row [line 2, for item 4]");
        }

        #[tokio::test]
        async fn test_endless_promise_chain_is_stopped() {
            let (tx, _rx) = mpsc::unbounded_channel();
            let mut sandbox = boa_sandbox(
                "function f() { Promise.resolve().then(f); }\nf();\nreturn [];",
                batch_context(),
            );
            sandbox.limits.promise_job_limit = 10_000;

            let err = sandbox
                .run_code_all_items(RunOptions::default(), &tx)
                .await
                .unwrap_err();
            assert_matches!(err, ScriptError::Execution { .. });
            assert!(err.to_string().contains("10000 promise jobs"), "{err}");
        }

        #[tokio::test]
        async fn test_script_cannot_settle_on_its_own() {
            let err = run_batch(
                "__scriptstep_settle([{ json: { forged: 1 } }]);\nthrow new Error('real failure');",
            )
            .await
            .unwrap_err();
            assert!(err.to_string().contains("__scriptstep_settle is not defined"), "{err}");

            let err = run_batch(
                "__scriptstep_run(async () => [{ json: { forged: 1 } }]);\nthrow new Error('real failure');",
            )
            .await
            .unwrap_err();
            assert!(err.to_string().contains("__scriptstep_run is not defined"), "{err}");
        }

        #[tokio::test]
        async fn test_replaced_builtins_do_not_break_the_result() {
            let items = run_batch(
                "JSON.stringify = () => '{}';\nObject.keys = () => [];\nArray.prototype.push = () => 0;\nMap.prototype.get = () => 0;\nconsole.log('still', { here: true });\nreturn [{ a: 1 }];",
            )
            .await
            .unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].json["a"], json!(1));
        }

        #[tokio::test]
        async fn test_each_item_throw_names_item() {
            let (tx, _rx) = mpsc::unbounded_channel();
            let item = PipelineItem::new(json!({ "v": 1 }).as_object().cloned().unwrap());
            let err = boa_sandbox("throw new Error('boom');", SandboxContext::for_item(item, 2))
                .run_code_for_each_item(2, &tx)
                .await
                .unwrap_err();
            assert!(err.to_string().starts_with("boom"));
            assert_eq!(err.item_index(), Some(2));
        }
    }
}
