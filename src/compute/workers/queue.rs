//! Task and result queues shared by the coordinator and the workers.
//!
//! Both directions use an unbounded multi-producer multi-consumer channel.
//! Delivery order across chromosomes is unspecified; results are matched back
//! to their tasks by `(generation, chromosome)`.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::compute::evolution::Evaluation;

/// Nothing arrived within the dequeue timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Timed out waiting for a queued item")]
pub struct DequeueTimeout;

/// FIFO queue safe for concurrent producers and consumers.
///
/// Each handle owns both channel ends, so the channel never disconnects while
/// a handle is alive.
#[derive(Debug)]
pub struct Queue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    /// Append an item without blocking.
    pub fn enqueue(&self, item: T) {
        // Cannot fail: this handle keeps a receiver alive.
        let _ = self.sender.send(item);
    }

    /// Wait up to `timeout` for the next item.
    pub fn dequeue(&self, timeout: Duration) -> Result<T, DequeueTimeout> {
        self.receiver.recv_timeout(timeout).map_err(|_| DequeueTimeout)
    }

    /// Remove every ready item.
    pub fn drain(&self) -> Vec<T> {
        self.receiver.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// One chromosome evaluation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub generation: usize,
    pub chromosome: usize,
    /// Zero for the first dispatch, incremented on every requeue.
    pub attempt: usize,
    /// Decoded parameter vector.
    pub parameters: Vec<f64>,
}

impl Task {
    pub fn new(generation: usize, chromosome: usize, parameters: Vec<f64>) -> Self {
        Self {
            generation,
            chromosome,
            attempt: 0,
            parameters,
        }
    }

    /// `(generation, chromosome)` key.
    pub fn key(&self) -> (usize, usize) {
        (self.generation, self.chromosome)
    }

    /// Same task with the attempt counter replaced.
    pub fn retry(&self, attempt: usize) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

/// Result of one task, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub generation: usize,
    pub chromosome: usize,
    pub attempt: usize,
    /// Worker slot that produced the result.
    pub worker: usize,
    pub outcome: Outcome,
}

impl TaskResult {
    pub fn key(&self) -> (usize, usize) {
        (self.generation, self.chromosome)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Completed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Completed(Evaluation),
    Failed { diagnostic: String },
}
