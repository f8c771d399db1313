//! Message queue between MQTT connections and the ingestion worker.
//!
//! Unbounded FIFO with many producers (one per running connection) and a
//! single consumer. Per-producer order is preserved; nothing is dropped
//! while the consumer is alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pipeline::IngestPipeline;

/// A received message waiting for ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
}

impl QueueStats {
    pub fn pending(&self) -> u64 {
        self.enqueued.saturating_sub(self.dequeued)
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
}

/// Producer handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    tx: mpsc::UnboundedSender<InboundMessage>,
    counters: Arc<Counters>,
}

/// The single consumer end.
#[derive(Debug)]
pub struct MessageReceiver {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    counters: Arc<Counters>,
}

/// Create a connected producer/consumer pair.
pub fn message_queue() -> (MessageQueue, MessageReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    (
        MessageQueue {
            tx,
            counters: counters.clone(),
        },
        MessageReceiver { rx, counters },
    )
}

impl MessageQueue {
    /// Enqueue a message. Returns `false` once the consumer is gone.
    pub fn push(&self, message: InboundMessage) -> bool {
        match self.tx.send(message) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
        }
    }
}

impl MessageReceiver {
    /// Wait for the next message. `None` once every producer is dropped and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        let message = self.rx.recv().await?;
        self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(message)
    }

    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        let message = self.rx.try_recv().ok()?;
        self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(message)
    }
}

/// Spawn the ingestion worker.
///
/// Messages are handed to the pipeline one at a time, so schema reloads and
/// storage writes never overlap. The task ends when the queue closes and
/// returns how many messages it consumed.
pub fn spawn_ingest_worker(pipeline: IngestPipeline, mut receiver: MessageReceiver) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut consumed = 0u64;
        tracing::info!("Ingestion worker started");
        while let Some(message) = receiver.recv().await {
            consumed += 1;
            tracing::debug!(topic = %message.topic, "Dequeued message");
            pipeline.ingest(&message.topic, &message.payload);
        }
        tracing::info!(consumed, "Ingestion worker stopped, queue closed");
        consumed
    })
}
