/// Bounded FIFO of pending jobs
use crate::config::types::{Result, RuleboxError};
use crossbeam_channel::{Receiver, Sender, TrySendError};

/// What travels through the queue; the record itself stays in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: String,
    pub sequence: u64,
}

/// Capacity counts pending entries only; jobs already taken by a worker do
/// not occupy a slot.
pub struct JobQueue {
    sender: Sender<QueueEntry>,
    receiver: Receiver<QueueEntry>,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Never blocks
    pub fn try_push(&self, entry: QueueEntry) -> Result<()> {
        self.sender.try_send(entry).map_err(|e| match e {
            TrySendError::Full(_) => RuleboxError::QueueFull {
                capacity: self.capacity,
            },
            TrySendError::Disconnected(_) => RuleboxError::ShuttingDown,
        })
    }

    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Consumer side handed to each worker
    pub fn receiver(&self) -> Receiver<QueueEntry> {
        self.receiver.clone()
    }
}
