//! Bounded fan-out of one wave's tasks.
//!
//! Workers pull requests from a shared queue in task-number order and send
//! results back to the calling thread, which is the only one that records them.
//! Once a failure halts the wave, workers drain the rest of the queue without
//! starting it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Result, anyhow};
use crossbeam_channel::unbounded;
use tracing::{debug, warn};

use crate::io::executor::{TaskExecutor, TaskRequest};

/// Outcome of one executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task_id: String,
    pub task_number: u32,
    /// Output on success, error message on failure.
    pub outcome: Result<String, String>,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// What happened to a wave's requests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WaveDispatch {
    /// Results in completion order.
    pub finished: Vec<TaskResult>,
    /// Task ids never handed to the executor because the wave was halted.
    pub not_started: Vec<String>,
}

enum Message {
    Finished(TaskResult),
    NotStarted(String),
}

/// Run `requests` with at most `max_concurrency` executor calls in flight.
///
/// `on_result` is called on the current thread as each task finishes. With
/// `halt_on_failure`, the first failed task stops new tasks from starting;
/// tasks already running are awaited and reported. An error from `on_result`
/// also halts the wave and is returned once every worker has stopped.
pub fn dispatch_wave<E, F>(
    executor: &E,
    requests: Vec<TaskRequest>,
    max_concurrency: usize,
    halt_on_failure: bool,
    mut on_result: F,
) -> Result<WaveDispatch>
where
    E: TaskExecutor + ?Sized,
    F: FnMut(&TaskResult) -> Result<()>,
{
    let total = requests.len();
    let workers = max_concurrency.max(1).min(total);
    let mut summary = WaveDispatch::default();
    if total == 0 {
        return Ok(summary);
    }

    let (job_tx, job_rx) = unbounded::<TaskRequest>();
    let (result_tx, result_rx) = unbounded::<Message>();
    for request in requests {
        job_tx
            .send(request)
            .map_err(|_| anyhow!("task queue closed early"))?;
    }
    drop(job_tx);

    let halted = AtomicBool::new(false);
    let mut callback_error = None;

    thread::scope(|scope| {
        for worker in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let halted = &halted;
            scope.spawn(move || {
                for request in job_rx.iter() {
                    if halted.load(Ordering::SeqCst) {
                        let _ = result_tx.send(Message::NotStarted(request.task_id));
                        continue;
                    }
                    debug!(worker, task_id = %request.task_id, "dispatching task");
                    let outcome = run_one(executor, &request);
                    if halt_on_failure && outcome.is_err() {
                        halted.store(true, Ordering::SeqCst);
                    }
                    let _ = result_tx.send(Message::Finished(TaskResult {
                        task_id: request.task_id,
                        task_number: request.task_number,
                        outcome,
                    }));
                }
            });
        }
        drop(result_tx);

        for message in result_rx.iter().take(total) {
            match message {
                Message::Finished(result) => {
                    if callback_error.is_none()
                        && let Err(err) = on_result(&result)
                    {
                        halted.store(true, Ordering::SeqCst);
                        callback_error = Some(err);
                    }
                    summary.finished.push(result);
                }
                Message::NotStarted(task_id) => summary.not_started.push(task_id),
            }
        }
    });

    match callback_error {
        Some(err) => Err(err),
        None => Ok(summary),
    }
}

fn run_one<E: TaskExecutor + ?Sized>(executor: &E, request: &TaskRequest) -> Result<String, String> {
    match catch_unwind(AssertUnwindSafe(|| executor.execute(request))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(err.message),
        Err(_) => {
            warn!(task_id = %request.task_id, "executor panicked");
            Err("executor panicked".to_string())
        }
    }
}
