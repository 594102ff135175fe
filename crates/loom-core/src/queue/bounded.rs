//! Fixed-capacity FIFO between submission and the worker pool.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("queue is full (capacity={capacity})")]
    Full { capacity: usize },

    #[error("queue is closed")]
    Closed,
}

/// What `dequeue` hands a worker.
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    Item(T),
    /// The queue was closed; the worker should exit.
    Shutdown,
}

struct QueueState<T> {
    items: VecDeque<T>,
    /// Slots handed out by `try_reserve` and not yet filled or released.
    reserved: usize,
    closed: bool,
}

/// A reserved slot in a [`BoundedQueue`].
///
/// Holding a permit guarantees room for one item, so the caller can finish
/// its own bookkeeping before the item becomes visible to workers. Dropping
/// the permit unused gives the slot back.
pub struct Permit<'a, T> {
    queue: &'a BoundedQueue<T>,
    used: bool,
}

impl<T> Permit<'_, T> {
    /// Fill the reserved slot. Hands the item back if the queue was closed
    /// after the reservation.
    pub fn push(mut self, item: T) -> Result<(), T> {
        self.used = true;
        {
            let mut state = self.queue.lock();
            state.reserved -= 1;
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.queue.notify.notify_one();
        Ok(())
    }
}

impl<T> Drop for Permit<'_, T> {
    fn drop(&mut self) {
        if !self.used {
            self.queue.lock().reserved -= 1;
        }
    }
}

/// Bounded FIFO queue.
///
/// - `enqueue` never waits: a full queue is backpressure, reported to the caller.
/// - `dequeue` waits for an item or for `close`.
/// - Capacity is fixed at construction.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                reserved: 0,
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    // Critical sections are single VecDeque operations, so a poisoned lock
    // still guards consistent data.
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError> {
        self.try_reserve()?.push(item).map_err(|_| EnqueueError::Closed)
    }

    /// Reserve room for one item without waiting. Reserved slots count
    /// against capacity but not against `len`.
    pub fn try_reserve(&self) -> Result<Permit<'_, T>, EnqueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EnqueueError::Closed);
        }
        if state.items.len() + state.reserved >= self.capacity {
            return Err(EnqueueError::Full {
                capacity: self.capacity,
            });
        }
        state.reserved += 1;
        Ok(Permit {
            queue: self,
            used: false,
        })
    }

    /// Wait for the next item in FIFO order, or `Shutdown` once closed.
    ///
    /// Items still queued at close time are not handed out; `close` returns
    /// them to the caller instead.
    pub async fn dequeue(&self) -> Dequeued<T> {
        loop {
            let mut notified = pin!(self.notify.notified());
            // Register interest before checking, so a push between the
            // check and the await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Dequeued::Shutdown;
                }
                if let Some(item) = state.items.pop_front() {
                    let more = !state.items.is_empty();
                    drop(state);
                    if more {
                        // pass the wakeup on to another idle worker
                        self.notify.notify_one();
                    }
                    return Dequeued::Item(item);
                }
            }

            notified.await;
        }
    }

    /// Remove the first item matching `pred`, preserving the order of the rest.
    pub fn remove_where(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let mut state = self.lock();
        let index = state.items.iter().position(pred)?;
        state.items.remove(index)
    }

    /// Close the queue: wake every waiting worker with `Shutdown` and
    /// return whatever was still queued.
    pub fn close(&self) -> Vec<T> {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.notify.notify_waiters();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
