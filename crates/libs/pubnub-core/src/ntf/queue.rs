use super::{ContextId, Notification};
use std::collections::VecDeque;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedEvent<T> {
    pub id: ContextId,
    pub target: T,
    pub notification: Notification,
}

/// FIFO of contexts waiting to be processed; each context appears at most once.
#[derive(Debug)]
pub struct EventQueue<T> {
    entries: VecDeque<QueuedEvent<T>>,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self { entries: VecDeque::new() }
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ContextId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Appends `id` unless it is already queued.
    ///
    /// An already queued entry keeps its position and takes the more
    /// significant of the two notifications. Returns whether a new entry was
    /// added.
    pub fn enqueue(&mut self, id: ContextId, target: T, notification: Notification) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) {
            entry.notification = entry.notification.max(notification);
            return false;
        }
        self.entries.push_back(QueuedEvent { id, target, notification });
        true
    }

    /// Moves `id` to the tail, queueing it if it was absent.
    pub fn requeue(&mut self, id: ContextId, target: T, notification: Notification) {
        let notification = match self.take(id) {
            Some(previous) => previous.notification.max(notification),
            None => notification,
        };
        self.entries.push_back(QueuedEvent { id, target, notification });
    }

    pub fn pop_front(&mut self) -> Option<QueuedEvent<T>> {
        self.entries.pop_front()
    }

    pub fn remove(&mut self, id: ContextId) -> bool {
        self.take(id).is_some()
    }

    fn take(&mut self, id: ContextId) -> Option<QueuedEvent<T>> {
        let position = self.entries.iter().position(|entry| entry.id == id)?;
        self.entries.remove(position)
    }
}
