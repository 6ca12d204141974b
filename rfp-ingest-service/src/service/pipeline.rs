//! Document pipeline engine.
//!
//! Executions are rows in the `executions` table. A single worker drives each
//! runnable execution state by state until it parks on a task token, schedules
//! a retry or reaches a terminal status:
//! - `execution`: starting, driving, retry and catch handling, timeouts
//! - `steps`: the task states (start, extraction, chunking)
//! - `indexing`: the Map state over the chunk list
//! - `tasks`: task token success / failure signalling
//! - `callback`: text detection notifications
//! - `workers`: background loops

mod callback;
mod execution;
mod indexing;
mod steps;
mod tasks;
mod workers;

pub use callback::CallbackOutcome;

use metrics::counter;

use crate::db::ExecutionStatus;
use crate::workflow::StateName;

fn record_execution_finished(status: ExecutionStatus) {
    counter!("pipeline_executions_finished_total", "status" => status.to_string()).increment(1);
}

fn record_step_failure(state: StateName) {
    counter!("pipeline_step_failures_total", "state" => state.to_string()).increment(1);
}

fn record_task_retry(state: StateName) {
    counter!("pipeline_task_retries_total", "state" => state.to_string()).increment(1);
}
