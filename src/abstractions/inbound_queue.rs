use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::abstractions::Message;

/// Unbounded FIFO of received but unprocessed messages.
///
/// Cloning yields another handle to the same queue: transports hold clones to
/// enqueue, the owning machine drains it. The backlog is an observable
/// property, never an error.
#[derive(Clone, Debug, Default)]
pub struct InboundQueue {
    inner: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    arrival: Notify,
}

#[derive(Debug, Default)]
struct State {
    messages: VecDeque<Message>,
    closed: bool,
}

/// A dequeued message together with the queue size observed just before it
/// was removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dequeued {
    pub message: Message,
    pub backlog: usize,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. A closed queue hands the message back.
    pub fn enqueue(&self, message: Message) -> Result<(), Message> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(message);
            }
            state.messages.push_back(message);
        }
        self.inner.arrival.notify_one();
        Ok(())
    }

    pub fn try_dequeue(&self) -> Option<Message> {
        self.lock().messages.pop_front()
    }

    pub fn try_dequeue_counted(&self) -> Option<Dequeued> {
        let mut state = self.lock();
        let backlog = state.messages.len();
        state
            .messages
            .pop_front()
            .map(|message| Dequeued { message, backlog })
    }

    pub fn size(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Rejects further enqueues and drops whatever is still pending.
    /// Returns the number of discarded messages.
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let discarded = state.messages.len();
        state.messages.clear();
        discarded
    }

    /// Resolves on the next enqueue, or immediately if one happened since the
    /// last wakeup was consumed.
    pub async fn notified(&self) {
        self.inner.arrival.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The state is a plain deque; a panic elsewhere cannot leave it torn.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
