//! Interruption message queue abstraction
//!
//! Delivery is at-least-once: a message not acknowledged after handling is
//! redelivered, so the ingestor must be idempotent and must only ack once
//! the node has been handed to termination. The in-memory implementation
//! backs the tests; production wiring (e.g. SQS) lives with the adapter.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// A message as pulled from the queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Receipt handle used to acknowledge this delivery
    pub receipt: String,
    /// Raw message body, JSON
    pub body: String,
}

/// The queue the interruption ingestor consumes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Pull a batch of messages; empty when the queue is idle
    async fn receive(&self) -> Result<Vec<QueuedMessage>>;
    /// Acknowledge a handled message so it is not redelivered
    async fn acknowledge(&self, receipt: &str) -> Result<()>;
}

/// In-memory queue with at-least-once semantics for tests
#[derive(Default)]
pub struct InMemoryQueue {
    pending: Mutex<VecDeque<QueuedMessage>>,
    inflight: Mutex<Vec<QueuedMessage>>,
    counter: Mutex<u64>,
}

impl InMemoryQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message body
    pub fn push(&self, body: &str) {
        let mut counter = self.counter.lock();
        *counter += 1;
        self.pending.lock().push_back(QueuedMessage {
            receipt: format!("receipt-{counter}"),
            body: body.to_string(),
        });
    }

    /// Redeliver everything received but never acknowledged
    pub fn redeliver_unacked(&self) {
        let mut inflight = self.inflight.lock();
        let mut pending = self.pending.lock();
        for message in inflight.drain(..) {
            pending.push_back(message);
        }
    }

    /// Messages neither delivered nor in flight
    pub fn depth(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn receive(&self) -> Result<Vec<QueuedMessage>> {
        let mut pending = self.pending.lock();
        let batch: Vec<QueuedMessage> = pending.drain(..).collect();
        self.inflight.lock().extend(batch.iter().cloned());
        Ok(batch)
    }

    async fn acknowledge(&self, receipt: &str) -> Result<()> {
        self.inflight.lock().retain(|m| m.receipt != receipt);
        Ok(())
    }
}
