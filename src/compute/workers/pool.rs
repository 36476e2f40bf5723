//! Worker pool manager: startup barrier, heartbeat supervision, restart and
//! bounded shutdown.
//!
//! Threads cannot be killed. A worker that is retired (hung) or that misses
//! the shutdown deadline is told to stop and then detached; any result it
//! produces later is discarded by the aggregator's key matching.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};

use super::queue::{Queue, Task, TaskResult};
use super::worker::{self, StartupReport, WorkerContext, WorkerSignals};
use crate::compute::evolution::{
    Dispatch, EvaluationError, Evaluator, EvaluatorFactory, erase_factory,
};
use crate::schema::WorkerConfig;

/// Worker pool failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("Worker startup failed ({ready} of {expected} ready): {reason}")]
    Startup {
        ready: usize,
        expected: usize,
        reason: String,
    },
    #[error("Worker {worker} needs a restart but the pool already restarted {restarts} workers")]
    RestartLimit { worker: usize, restarts: usize },
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct WorkerSlot {
    signals: Arc<WorkerSignals>,
    handle: Option<JoinHandle<()>>,
}

/// Fixed-size pool of supervised worker threads.
pub struct WorkerPool {
    config: WorkerConfig,
    tasks: Queue<Task>,
    results: Queue<TaskResult>,
    factory: EvaluatorFactory,
    workers: Vec<WorkerSlot>,
    retired: Vec<JoinHandle<()>>,
    startup_tx: Sender<StartupReport>,
    startup_rx: Receiver<StartupReport>,
    restarts: usize,
    shut_down: bool,
}

impl WorkerPool {
    /// Spawn every worker and block until all report ready.
    ///
    /// Fails fast if a worker's evaluator setup fails or the startup timeout
    /// elapses; already started workers are shut down first.
    pub fn start<F, E>(config: &WorkerConfig, factory: F) -> Result<Self, WorkerPoolError>
    where
        F: Fn(usize) -> Result<E, EvaluationError> + Send + Sync + 'static,
        E: Evaluator + 'static,
    {
        Self::start_erased(config, erase_factory(factory))
    }

    fn start_erased(
        config: &WorkerConfig,
        factory: EvaluatorFactory,
    ) -> Result<Self, WorkerPoolError> {
        let (startup_tx, startup_rx) = crossbeam_channel::unbounded();
        let mut pool = Self {
            config: config.clone(),
            tasks: Queue::new(),
            results: Queue::new(),
            factory,
            workers: Vec::new(),
            retired: Vec::new(),
            startup_tx,
            startup_rx,
            restarts: 0,
            shut_down: false,
        };

        let expected = config.resolved_count();
        for id in 0..expected {
            let slot = pool.spawn_worker(id)?;
            pool.workers.push(slot);
        }

        if let Err(err) = pool.await_ready(expected) {
            error!("{}", err);
            pool.shutdown();
            return Err(err);
        }

        info!("Worker pool started with {} workers", expected);
        Ok(pool)
    }

    fn spawn_worker(&self, id: usize) -> Result<WorkerSlot, WorkerPoolError> {
        let signals = Arc::new(WorkerSignals::new());
        let handle = worker::spawn(
            WorkerContext {
                id,
                tasks: self.tasks.clone(),
                results: self.results.clone(),
                signals: Arc::clone(&signals),
                poll_interval: self.config.poll_interval(),
                startup: self.startup_tx.clone(),
            },
            Arc::clone(&self.factory),
        )?;
        Ok(WorkerSlot {
            signals,
            handle: Some(handle),
        })
    }

    fn await_ready(&self, expected: usize) -> Result<(), WorkerPoolError> {
        let deadline = Instant::now() + self.config.startup_timeout();
        let mut ready = 0;

        while ready < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.startup_rx.recv_timeout(remaining) {
                Ok(StartupReport::Ready { .. }) => ready += 1,
                Ok(StartupReport::Failed { worker, reason }) => {
                    return Err(WorkerPoolError::Startup {
                        ready,
                        expected,
                        reason: format!("worker {}: {}", worker, reason),
                    });
                }
                Err(_) => {
                    return Err(WorkerPoolError::Startup {
                        ready,
                        expected,
                        reason: format!(
                            "timed out after {} ms",
                            self.config.startup_timeout_ms
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of worker slots.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Restarts performed so far.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Replace crashed or hung workers. Returns how many were restarted.
    ///
    /// A worker is crashed when its thread has exited without a stop request.
    /// It is hung when its heartbeat is older than the grace period, or, while
    /// its evaluator is still being built, when setup outlasts the startup
    /// timeout.
    pub fn supervise(&mut self) -> Result<usize, WorkerPoolError> {
        for report in self.startup_rx.try_iter() {
            match report {
                StartupReport::Ready { worker } => info!("Replacement worker {} ready", worker),
                StartupReport::Failed { worker, reason } => {
                    warn!("Replacement worker {} failed setup: {}", worker, reason)
                }
            }
        }
        self.retired.retain(|handle| !handle.is_finished());

        let grace = self.config.heartbeat_grace();
        let startup_timeout = self.config.startup_timeout();
        let mut restarted = 0;
        for id in 0..self.workers.len() {
            let slot = &self.workers[id];
            let crashed = slot.handle.as_ref().is_none_or(|h| h.is_finished());
            let ready = slot.signals.is_ready();
            let silence = slot.signals.silence();
            let hung = if ready {
                silence > grace
            } else {
                slot.signals.age() > startup_timeout
            };
            if !crashed && !hung {
                continue;
            }

            if self.restarts >= self.config.max_restarts {
                return Err(WorkerPoolError::RestartLimit {
                    worker: id,
                    restarts: self.restarts,
                });
            }

            if crashed {
                warn!("Worker {} exited unexpectedly, restarting", id);
            } else if !ready {
                warn!(
                    "Worker {} still setting up after {:?}, restarting",
                    id, startup_timeout
                );
            } else {
                warn!(
                    "Worker {} silent for {:?} (grace {:?}), restarting",
                    id, silence, grace
                );
            }

            self.retire(id, crashed);
            self.workers[id] = self.spawn_worker(id)?;
            self.restarts += 1;
            restarted += 1;
        }
        Ok(restarted)
    }

    fn retire(&mut self, id: usize, crashed: bool) {
        let slot = &mut self.workers[id];
        slot.signals.request_stop();
        if let Some(handle) = slot.handle.take() {
            if crashed {
                if handle.join().is_err() {
                    warn!("Worker {} thread panicked", id);
                }
            } else {
                self.retired.push(handle);
            }
        }
    }

    /// Stop every worker, waiting up to the shutdown timeout.
    ///
    /// Workers still running at the deadline are abandoned. Returns the
    /// number abandoned. Calling again is a no-op.
    pub fn shutdown(&mut self) -> usize {
        if self.shut_down {
            return 0;
        }
        self.shut_down = true;

        for slot in &self.workers {
            slot.signals.request_stop();
        }

        let mut handles: Vec<JoinHandle<()>> = self
            .workers
            .iter_mut()
            .filter_map(|slot| slot.handle.take())
            .chain(self.retired.drain(..))
            .collect();

        let deadline = Instant::now() + self.config.shutdown_timeout();
        while !handles.is_empty() && Instant::now() < deadline {
            let (finished, running): (Vec<_>, Vec<_>) =
                handles.into_iter().partition(|h| h.is_finished());
            for handle in finished {
                if handle.join().is_err() {
                    warn!("Worker thread panicked during shutdown");
                }
            }
            handles = running;
            if !handles.is_empty() {
                thread::sleep(Duration::from_millis(5));
            }
        }

        let abandoned = handles.len();
        if abandoned > 0 {
            warn!("Abandoning {} worker threads still running after shutdown timeout", abandoned);
        }
        info!("Worker pool shut down");
        abandoned
    }
}

impl Dispatch for WorkerPool {
    fn dispatch(&mut self, task: Task) {
        self.tasks.enqueue(task);
    }

    fn collect(&mut self, timeout: Duration) -> Option<TaskResult> {
        self.results.dequeue(timeout).ok()
    }

    fn supervise(&mut self) -> Result<(), WorkerPoolError> {
        WorkerPool::supervise(self).map(|_| ())
    }

    fn retire_generation(&mut self, generation: usize) {
        let (stale, pending): (Vec<Task>, Vec<Task>) = self
            .tasks
            .drain()
            .into_iter()
            .partition(|task| task.generation <= generation);
        for task in pending {
            self.tasks.enqueue(task);
        }
        if !stale.is_empty() {
            debug!(
                "Purged {} queued tasks of generation {} and earlier",
                stale.len(),
                generation
            );
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
