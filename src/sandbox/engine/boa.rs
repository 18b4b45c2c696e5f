use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use boa_engine::job::{FutureJob, JobQueue, NativeJob};
use boa_engine::{Context, Script, Source};
use tracing::{debug, trace};

use super::{Cancellation, EngineFailure, EngineLimits, PreparedScript, ScriptEngine};
use crate::sandbox::translate::RawScriptError;

/// Why the job queue stopped before it ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueStop {
    Exhausted,
    Cancelled,
}

/// FIFO promise job queue that runs at most `limit` jobs and checks for
/// cancellation between jobs.
struct BudgetedJobQueue {
    jobs: RefCell<VecDeque<NativeJob>>,
    limit: u64,
    executed: Cell<u64>,
    cancellation: Cancellation,
    stopped: Cell<Option<QueueStop>>,
}

impl BudgetedJobQueue {
    fn new(limit: u64, cancellation: Cancellation) -> Self {
        Self {
            jobs: RefCell::new(VecDeque::new()),
            limit,
            executed: Cell::new(0),
            cancellation,
            stopped: Cell::new(None),
        }
    }

    fn halt(&self, reason: QueueStop) {
        self.stopped.set(Some(reason));
        self.jobs.borrow_mut().clear();
    }
}

impl JobQueue for BudgetedJobQueue {
    fn enqueue_promise_job(&self, job: NativeJob, _context: &mut Context) {
        if self.stopped.get().is_none() {
            self.jobs.borrow_mut().push_back(job);
        }
    }

    fn run_jobs(&self, context: &mut Context) {
        loop {
            if self.cancellation.is_cancelled() {
                self.halt(QueueStop::Cancelled);
                return;
            }

            let next = self.jobs.borrow_mut().pop_front();
            let Some(job) = next else {
                return;
            };

            if self.executed.get() >= self.limit {
                self.halt(QueueStop::Exhausted);
                return;
            }
            self.executed.set(self.executed.get() + 1);

            // Only uncatchable failures (runtime limits) surface here.
            if let Err(e) = job.call(context) {
                trace!(error = %e, "Promise job failed");
                self.jobs.borrow_mut().clear();
                return;
            }
        }
    }

    fn enqueue_future_job(&self, _future: FutureJob, _context: &mut Context) {
        // No host function returns a future.
        trace!("Discarding future job");
    }
}

/// [`ScriptEngine`] on `boa_engine`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoaEngine;

impl BoaEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for BoaEngine {
    fn name(&self) -> &str {
        "boa"
    }

    fn evaluate(
        &self,
        script: &PreparedScript,
        limits: &EngineLimits,
        cancellation: &Cancellation,
    ) -> Result<String, EngineFailure> {
        let queue = Rc::new(BudgetedJobQueue::new(
            limits.promise_job_limit,
            cancellation.clone(),
        ));
        let mut context = Context::builder()
            .job_queue(queue.clone())
            .build()
            .map_err(|e| EngineFailure::Internal(format!("engine setup failed: {e}")))?;
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(limits.loop_iteration_limit);
        context
            .runtime_limits_mut()
            .set_recursion_limit(limits.recursion_limit);

        context
            .eval(Source::from_bytes(&script.bootstrap))
            .map_err(|e| EngineFailure::Internal(format!("bootstrap failed: {e}")))?;

        let parsed = match Script::parse(Source::from_bytes(&script.program), None, &mut context) {
            Ok(parsed) => parsed,
            Err(tracked) => {
                // Parse errors are reported against the untouched source
                let parsed = Script::parse(Source::from_bytes(&script.source), None, &mut context)
                    .map_err(|e| {
                        EngineFailure::Script(RawScriptError::from_message(&e.to_string()))
                    })?;
                debug!(error = %tracked, "Line tracking rejected by the parser, running untracked");
                parsed
            }
        };

        if let Err(e) = parsed.evaluate(&mut context) {
            trace!(error = %e, "Program evaluation failed");
            return Err(EngineFailure::Script(RawScriptError::from_message(
                &e.to_string(),
            )));
        }

        context.run_jobs();

        match queue.stopped.get() {
            Some(QueueStop::Exhausted) => {
                return Err(EngineFailure::Script(RawScriptError::new(
                    "RangeError",
                    format!(
                        "Script exceeded the limit of {} promise jobs",
                        limits.promise_job_limit
                    ),
                )))
            }
            Some(QueueStop::Cancelled) => {
                return Err(EngineFailure::Internal("evaluation cancelled".to_string()))
            }
            None => {}
        }

        let envelope = context
            .eval(Source::from_bytes(&script.epilogue))
            .map_err(|e| EngineFailure::Internal(format!("reading the result failed: {e}")))?;

        envelope
            .as_string()
            .map(|s| s.to_std_string_escaped())
            .ok_or_else(|| EngineFailure::Internal("result envelope is not a string".to_string()))
    }

    fn check_syntax(&self, program: &str) -> Result<(), EngineFailure> {
        let mut context = Context::default();
        Script::parse(Source::from_bytes(program), None, &mut context)
            .map(|_| ())
            .map_err(|e| EngineFailure::Script(RawScriptError::from_message(&e.to_string())))
    }
}
