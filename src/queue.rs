use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// FIFO hand-off of framed messages from the listener thread to the poller.
///
/// Clones share the same buffer. The listener only pushes; draining is the
/// poller's job.
#[derive(Debug, Clone, Default)]
pub struct MessageQueue {
    inner: Arc<Mutex<VecDeque<String>>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock still holds a consistent VecDeque, so keep using it.
    fn guard(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, message: String) {
        self.guard().push_back(message);
    }

    /// Push a batch under one lock so it stays contiguous.
    pub fn push_all<I>(&self, messages: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut guard = self.guard();
        let before = guard.len();
        guard.extend(messages);
        guard.len() - before
    }

    pub fn pop(&self) -> Option<String> {
        self.guard().pop_front()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }
}
