//! Cross-task value channels
//!
//! A `Channel` value is a FIFO queue connecting tasks. Sends block while a
//! bounded channel is full; receives block while it is empty. Closing a
//! channel lets receivers drain the remaining values and then yields Nil.
//! FIFO order between one sender and one receiver is the only cross-task
//! ordering guarantee the VM makes.

use std::fmt;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::value::Value;

/// A buffered cross-task value queue.
///
/// The sender half lives behind a mutex so `close` can drop it; once every
/// sender clone is gone the underlying queue disconnects and drained
/// receivers observe the close.
pub struct Channel {
    sender: Mutex<Option<Sender<Value>>>,
    receiver: Receiver<Value>,
    capacity: usize,
}

impl Channel {
    /// Create a channel. Capacity 0 means unbounded.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = if capacity == 0 {
            unbounded()
        } else {
            bounded(capacity)
        };
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            capacity,
        }
    }

    /// Enqueue a value, blocking while a bounded channel is full.
    /// Returns false if the channel has been closed.
    pub fn send(&self, value: Value) -> bool {
        // Clone the sender out of the lock so a blocked send does not hold it.
        let sender = self.sender.lock().clone();
        match sender {
            Some(s) => s.send(value).is_ok(),
            None => false,
        }
    }

    /// Dequeue a value, blocking while the channel is empty.
    /// Yields Nil once the channel is closed and drained.
    pub fn recv(&self) -> Value {
        self.receiver.recv().unwrap_or(Value::Nil)
    }

    /// Non-blocking receive; None when empty or closed-and-drained.
    pub fn try_recv(&self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }

    /// Close the channel. Queued values remain receivable.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Number of values currently queued.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// The configured capacity (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity)
            .field("queued", &self.receiver.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
