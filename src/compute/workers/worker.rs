//! Worker evaluation loop.
//!
//! A worker builds its evaluator once, reports ready, then polls the task
//! queue until asked to stop. Every failure inside an evaluation, including a
//! panic or a non-finite fitness, becomes a failed result and the loop keeps
//! running.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use super::queue::{Outcome, Queue, Task, TaskResult};
use crate::compute::evolution::{Evaluator, EvaluatorFactory};

/// Liveness state shared between one worker thread and the pool.
#[derive(Debug)]
pub(crate) struct WorkerSignals {
    stop: AtomicBool,
    /// Set once the evaluator is built.
    ready: AtomicBool,
    /// Milliseconds since `epoch` at the last heartbeat.
    heartbeat_ms: AtomicU64,
    epoch: Instant,
}

impl WorkerSignals {
    pub(crate) fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            heartbeat_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn beat(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.heartbeat_ms.store(now, Ordering::Relaxed);
    }

    /// Time since the last heartbeat.
    pub(crate) fn silence(&self) -> Duration {
        let last = Duration::from_millis(self.heartbeat_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Time since the worker was spawned.
    pub(crate) fn age(&self) -> Duration {
        self.epoch.elapsed()
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Sent once per worker after evaluator setup.
#[derive(Debug)]
pub(crate) enum StartupReport {
    Ready { worker: usize },
    Failed { worker: usize, reason: String },
}

/// Everything a worker thread needs.
pub(crate) struct WorkerContext {
    pub id: usize,
    pub tasks: Queue<Task>,
    pub results: Queue<TaskResult>,
    pub signals: Arc<WorkerSignals>,
    pub poll_interval: Duration,
    pub startup: Sender<StartupReport>,
}

/// Spawn a named worker thread.
pub(crate) fn spawn(
    context: WorkerContext,
    factory: EvaluatorFactory,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("calibration-worker-{}", context.id))
        .spawn(move || run(context, factory))
}

fn run(context: WorkerContext, factory: EvaluatorFactory) {
    let id = context.id;
    context.signals.beat();

    let setup = panic::catch_unwind(AssertUnwindSafe(|| factory(id)));
    let mut evaluator = match setup {
        Ok(Ok(evaluator)) => evaluator,
        Ok(Err(err)) => {
            report_failure(&context, err.to_string());
            return;
        }
        Err(payload) => {
            report_failure(&context, panic_message(&*payload));
            return;
        }
    };

    context.signals.beat();
    context.signals.mark_ready();
    // The pool may have stopped listening; a ready report is then moot.
    let _ = context.startup.send(StartupReport::Ready { worker: id });
    debug!("Worker {} ready", id);

    while !context.signals.stop_requested() {
        context.signals.beat();
        let Ok(task) = context.tasks.dequeue(context.poll_interval) else {
            continue;
        };

        if context.signals.stop_requested() {
            context.tasks.enqueue(task);
            break;
        }

        debug!(
            "Worker {} evaluating generation {} chromosome {} (attempt {})",
            id, task.generation, task.chromosome, task.attempt
        );
        let result = evaluate_task(&mut *evaluator, &task, id);
        context.results.enqueue(result);
        context.signals.beat();
    }

    info!("Worker {} stopped", id);
}

fn report_failure(context: &WorkerContext, reason: String) {
    warn!("Worker {} failed to initialize: {}", context.id, reason);
    let _ = context.startup.send(StartupReport::Failed {
        worker: context.id,
        reason,
    });
}

/// Run one task against the worker's evaluator, capturing any failure.
pub(crate) fn evaluate_task(
    evaluator: &mut dyn Evaluator,
    task: &Task,
    worker: usize,
) -> TaskResult {
    let evaluated =
        panic::catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(&task.parameters)));

    let outcome = match evaluated {
        Ok(Ok(evaluation)) if evaluation.fitness.is_finite() => Outcome::Completed(evaluation),
        Ok(Ok(evaluation)) => Outcome::Failed {
            diagnostic: format!("non-finite fitness {}", evaluation.fitness),
        },
        Ok(Err(err)) => Outcome::Failed {
            diagnostic: err.to_string(),
        },
        Err(payload) => Outcome::Failed {
            diagnostic: format!("evaluator panicked: {}", panic_message(&*payload)),
        },
    };

    if let Outcome::Failed { diagnostic } = &outcome {
        warn!(
            "Worker {} failed generation {} chromosome {}: {}",
            worker, task.generation, task.chromosome, diagnostic
        );
    }

    TaskResult {
        generation: task.generation,
        chromosome: task.chromosome,
        attempt: task.attempt,
        worker,
        outcome,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::evolution::{Evaluation, EvaluationError, erase_factory};

    fn flaky(parameters: &[f64]) -> Result<Evaluation, EvaluationError> {
        match parameters[0] as i64 {
            0 => Ok(Evaluation::new(1.0).with_metric("steps", 10.0)),
            1 => Err(EvaluationError::Simulation("diverged".into())),
            2 => panic!("model exploded"),
            _ => Ok(Evaluation::new(f64::NAN)),
        }
    }

    #[test]
    fn test_evaluate_task_outcomes() {
        let mut evaluator = flaky;

        let ok = evaluate_task(&mut evaluator, &Task::new(0, 0, vec![0.0]), 4);
        assert_eq!(ok.worker, 4);
        assert_eq!(
            ok.outcome,
            Outcome::Completed(Evaluation::new(1.0).with_metric("steps", 10.0))
        );

        let err = evaluate_task(&mut evaluator, &Task::new(0, 1, vec![1.0]), 4);
        assert!(matches!(
            err.outcome,
            Outcome::Failed { ref diagnostic } if diagnostic.contains("diverged")
        ));

        let panicked = evaluate_task(&mut evaluator, &Task::new(0, 2, vec![2.0]), 4);
        assert!(matches!(
            panicked.outcome,
            Outcome::Failed { ref diagnostic } if diagnostic.contains("model exploded")
        ));

        let nan = evaluate_task(&mut evaluator, &Task::new(0, 3, vec![3.0]), 4);
        assert!(matches!(
            nan.outcome,
            Outcome::Failed { ref diagnostic } if diagnostic.contains("non-finite")
        ));
    }

    #[test]
    fn test_worker_loop_survives_failures() {
        let tasks = Queue::new();
        let results = Queue::new();
        let signals = Arc::new(WorkerSignals::new());
        let (startup_tx, startup_rx) = crossbeam_channel::unbounded();

        let handle = spawn(
            WorkerContext {
                id: 0,
                tasks: tasks.clone(),
                results: results.clone(),
                signals: Arc::clone(&signals),
                poll_interval: Duration::from_millis(10),
                startup: startup_tx,
            },
            erase_factory(|_| Ok(flaky)),
        )
        .unwrap();

        assert!(matches!(
            startup_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            StartupReport::Ready { worker: 0 }
        ));

        for (i, value) in [2.0, 1.0, 0.0].into_iter().enumerate() {
            tasks.enqueue(Task::new(0, i, vec![value]));
        }

        let mut collected: Vec<TaskResult> = (0..3)
            .map(|_| results.dequeue(Duration::from_secs(5)).unwrap())
            .collect();
        collected.sort_by_key(|r| r.chromosome);
        assert!(!collected[0].is_success());
        assert!(!collected[1].is_success());
        assert!(collected[2].is_success());
        assert!(signals.is_ready());
        assert!(signals.silence() < Duration::from_secs(5));

        signals.request_stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_heartbeat_pauses_during_evaluation() {
        let tasks = Queue::new();
        let results = Queue::new();
        let signals = Arc::new(WorkerSignals::new());
        let (startup_tx, startup_rx) = crossbeam_channel::unbounded();

        let handle = spawn(
            WorkerContext {
                id: 1,
                tasks: tasks.clone(),
                results: results.clone(),
                signals: Arc::clone(&signals),
                poll_interval: Duration::from_millis(10),
                startup: startup_tx,
            },
            erase_factory(|_| {
                Ok(|p: &[f64]| -> Result<Evaluation, EvaluationError> {
                    thread::sleep(Duration::from_millis(p[0] as u64));
                    Ok(Evaluation::new(0.0))
                })
            }),
        )
        .unwrap();
        startup_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        tasks.enqueue(Task::new(0, 0, vec![300.0]));
        thread::sleep(Duration::from_millis(200));
        assert!(signals.silence() >= Duration::from_millis(100));

        results.dequeue(Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(signals.silence() < Duration::from_millis(100));

        signals.request_stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_setup_failure_is_reported() {
        let signals = Arc::new(WorkerSignals::new());
        let (startup_tx, startup_rx) = crossbeam_channel::unbounded();

        let handle = spawn(
            WorkerContext {
                id: 3,
                tasks: Queue::new(),
                results: Queue::new(),
                signals,
                poll_interval: Duration::from_millis(10),
                startup: startup_tx,
            },
            erase_factory(|_| -> Result<fn(&[f64]) -> Result<Evaluation, EvaluationError>, _> {
                Err(EvaluationError::Setup("missing scenario".into()))
            }),
        )
        .unwrap();

        handle.join().unwrap();
        match startup_rx.try_recv().unwrap() {
            StartupReport::Failed { worker, reason } => {
                assert_eq!(worker, 3);
                assert!(reason.contains("missing scenario"));
            }
            other => panic!("unexpected report {:?}", other),
        }
    }
}
