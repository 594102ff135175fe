//! In-process `QueueClient` backends.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::ports::{DispatchError, OutboundMessage, QueueClient};

/// Message queue disabled (`MQ_TYPE=none`): accepts and discards.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullQueueClient;

#[async_trait]
impl QueueClient for NullQueueClient {
    async fn send_message(
        &self,
        topic: &str,
        _body: serde_json::Value,
    ) -> Result<(), DispatchError> {
        tracing::debug!(topic, "message queue disabled, dropping message");
        Ok(())
    }
}

/// Buffers published messages in memory (`MQ_TYPE=memory`).
///
/// The buffer holds at most `capacity` messages. Publishing into a full
/// buffer drops the oldest message, so a client nobody drains stays
/// bounded; `dropped` counts the losses.
#[derive(Debug)]
pub struct InMemoryQueueClient {
    messages: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl InMemoryQueueClient {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<OutboundMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the next published message.
    pub async fn recv(&self) -> OutboundMessage {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(message) = self.lock().pop_front() {
                return message;
            }
            notified.await;
        }
    }

    /// Take everything published so far.
    pub fn drain(&self) -> Vec<OutboundMessage> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages evicted unread because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn send_message(
        &self,
        topic: &str,
        body: serde_json::Value,
    ) -> Result<(), DispatchError> {
        let evicted = {
            let mut messages = self.lock();
            let evicted = if messages.len() >= self.capacity {
                messages.pop_front()
            } else {
                None
            };
            messages.push_back(OutboundMessage {
                topic: topic.to_string(),
                body,
            });
            evicted
        };
        if let Some(old) = evicted {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                topic = %old.topic,
                capacity = self.capacity,
                dropped,
                "in-memory message buffer full, dropped oldest message"
            );
        }
        self.notify.notify_one();
        Ok(())
    }
}
