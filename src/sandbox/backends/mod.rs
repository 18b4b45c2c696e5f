mod in_process;
mod task_runner;

pub use in_process::{wrap_program, InProcessSandbox};
pub use task_runner::{TaskRequest, TaskResponse, TaskRunnerClient, TaskRunnerSandbox};
