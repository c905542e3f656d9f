//! Storage: a backlog queue feeding one stage of a task
//!
//! Items pushed into a storage accumulate independently of the task's
//! stage dispatch. The task is woken only when an enabled storage goes from
//! idle to having items; a disabled storage collects silently.

use crate::command::Stage;
use crate::entry::{Entry, Resume};
use crate::task::Task;
use crate::ticket::Ticket;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::warn;

/// Type-erased view of a storage inside the task chain
pub(crate) trait StorageEntry: Send + Sync {
    fn stage(&self) -> Stage;
    fn resume(&self) -> Resume;
    /// Dropped from the chain; the next push or enable delivers again
    fn release(&self);
}

struct StorageCore<T> {
    owner: Weak<Task>,
    stage: Stage,
    state: Mutex<StorageState<T>>,
}

struct StorageState<T> {
    queue: VecDeque<T>,
    enabled: bool,
    /// In the task chain or being processed
    queued: bool,
}

impl<T> StorageState<T> {
    /// Claim the task chain slot if the storage should be delivered
    fn claim(&mut self) -> bool {
        if self.queued || !self.enabled || self.queue.is_empty() {
            return false;
        }
        self.queued = true;
        true
    }
}

impl<T: Send + 'static> StorageCore<T> {
    fn deliver(self: &Arc<Self>) {
        if let Some(owner) = self.owner.upgrade() {
            owner.append_entry_and_push(Entry::Storage(self.clone()));
        }
    }
}

impl<T: Send + 'static> StorageEntry for StorageCore<T> {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn resume(&self) -> Resume {
        let mut state = self.state.lock();
        if state.enabled && !state.queue.is_empty() {
            Resume::Requeue
        } else {
            state.queued = false;
            Resume::Discard
        }
    }

    fn release(&self) {
        self.state.lock().queued = false;
    }
}

/// Backlog queue delivering its items to one stage of the owning task
pub struct Storage<T> {
    core: Arc<StorageCore<T>>,
}

impl<T> Clone for Storage<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> Storage<T> {
    pub(crate) fn new(owner: Weak<Task>, stage: Stage, enabled: bool) -> Self {
        Self {
            core: Arc::new(StorageCore {
                owner,
                stage,
                state: Mutex::new(StorageState {
                    queue: VecDeque::new(),
                    enabled,
                    queued: false,
                }),
            }),
        }
    }

    /// Stage the storage delivers
    pub fn stage(&self) -> Stage {
        self.core.stage
    }

    /// Append an item, waking the task if the storage was idle
    pub fn push(&self, item: T) {
        let wake = {
            let mut state = self.core.state.lock();
            state.queue.push_back(item);
            state.claim()
        };
        if wake {
            self.core.deliver();
        }
    }

    /// Resume delivery; wakes the task if items are waiting
    pub fn enable(&self) {
        let wake = {
            let mut state = self.core.state.lock();
            state.enabled = true;
            state.claim()
        };
        if wake {
            self.core.deliver();
        }
    }

    /// Stop delivery; items keep accumulating
    pub fn disable(&self) {
        self.core.state.lock().enabled = false;
    }

    /// Is delivery enabled
    pub fn is_enabled(&self) -> bool {
        self.core.state.lock().enabled
    }

    /// Number of waiting items
    pub fn len(&self) -> usize {
        self.core.state.lock().queue.len()
    }

    /// Are there no waiting items
    pub fn is_empty(&self) -> bool {
        self.core.state.lock().queue.is_empty()
    }

    /// Remove the oldest item
    pub fn take(&self) -> Option<T> {
        self.core.state.lock().queue.pop_front()
    }

    /// Push the ticket's value once it completes; a failed ticket stores
    /// nothing
    pub fn await_ticket(&self, ticket: &Ticket<T>)
    where
        T: Clone,
    {
        let storage = self.clone();
        ticket.sign(move |outcome| match outcome {
            Ok(value) => storage.push(value),
            Err(e) => warn!(stage = %storage.stage(), error = %e, "ticket failed, nothing stored"),
        });
    }

    /// Lock the storage for batch reading
    pub fn read(&self) -> Reader<'_, T> {
        Reader {
            state: self.core.state.lock(),
        }
    }

    /// Lock the storage for batch writing; the task is woken at most once,
    /// when the writer is dropped
    pub fn write(&self) -> Writer<'_, T> {
        Writer {
            core: &self.core,
            state: Some(self.core.state.lock()),
        }
    }
}

impl<T> fmt::Debug for Storage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Storage")
            .field("stage", &self.core.stage)
            .field("len", &state.queue.len())
            .field("enabled", &state.enabled)
            .field("queued", &state.queued)
            .finish()
    }
}

/// Scoped read access to a storage
pub struct Reader<'a, T> {
    state: MutexGuard<'a, StorageState<T>>,
}

impl<T> Reader<'_, T> {
    /// Oldest item
    pub fn peek(&self) -> Option<&T> {
        self.state.queue.front()
    }

    /// Remove the oldest item
    pub fn take(&mut self) -> Option<T> {
        self.state.queue.pop_front()
    }

    /// Remove every item
    pub fn drain(&mut self) -> Vec<T> {
        self.state.queue.drain(..).collect()
    }

    /// Number of waiting items
    pub fn len(&self) -> usize {
        self.state.queue.len()
    }

    /// Are there no waiting items
    pub fn is_empty(&self) -> bool {
        self.state.queue.is_empty()
    }
}

/// Scoped write access to a storage
pub struct Writer<'a, T: Send + 'static> {
    core: &'a Arc<StorageCore<T>>,
    state: Option<MutexGuard<'a, StorageState<T>>>,
}

impl<T: Send + 'static> Writer<'_, T> {
    /// Append an item without waking the task yet
    pub fn push(&mut self, item: T) {
        if let Some(state) = self.state.as_mut() {
            state.queue.push_back(item);
        }
    }

    /// Number of waiting items
    pub fn len(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.queue.len())
    }

    /// Are there no waiting items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Drop for Writer<'_, T> {
    fn drop(&mut self) {
        let wake = match self.state.take() {
            Some(mut state) => state.claim(),
            None => false,
        };
        if wake {
            self.core.deliver();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(enabled: bool) -> Storage<u32> {
        Storage::new(Weak::new(), Stage::new(1), enabled)
    }

    #[test]
    fn test_push_claims_delivery_once() {
        let storage = detached(true);
        storage.push(1);
        storage.push(2);
        let state = storage.core.state.lock();
        assert!(state.queued);
        assert_eq!(state.queue.len(), 2);
    }

    #[test]
    fn test_disabled_storage_accumulates_silently() {
        let storage = detached(false);
        storage.push(1);
        storage.push(2);
        assert!(!storage.core.state.lock().queued);
        assert_eq!(storage.len(), 2);

        storage.enable();
        assert!(storage.core.state.lock().queued);
    }

    #[test]
    fn test_resume_requeues_while_items_remain() {
        let storage = detached(true);
        storage.push(1);
        assert_eq!(storage.core.resume(), Resume::Requeue);
        assert_eq!(storage.take(), Some(1));
        assert_eq!(storage.core.resume(), Resume::Discard);
        assert!(!storage.core.state.lock().queued);
    }

    #[test]
    fn test_release_lets_next_push_deliver() {
        let storage = detached(true);
        storage.push(1);
        storage.core.release();
        assert!(!storage.core.state.lock().queued);
        storage.push(2);
        assert!(storage.core.state.lock().queued);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_ticket_value_is_stored() {
        let storage = detached(false);
        let ticket = Ticket::new();
        storage.await_ticket(&ticket);
        assert!(storage.is_empty());
        ticket.complete(9);
        assert_eq!(storage.take(), Some(9));

        let failed = Ticket::new();
        failed.fail("no data");
        storage.await_ticket(&failed);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_disable_stops_requeue() {
        let storage = detached(true);
        storage.push(1);
        storage.disable();
        assert_eq!(storage.core.resume(), Resume::Discard);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_writer_defers_wakeup_to_drop() {
        let storage = detached(true);
        {
            let mut writer = storage.write();
            writer.push(1);
            writer.push(2);
            assert_eq!(writer.len(), 2);
        }
        assert!(storage.core.state.lock().queued);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_reader_batch_access() {
        let storage = detached(false);
        for i in 0..5 {
            storage.push(i);
        }
        let mut reader = storage.read();
        assert_eq!(reader.peek(), Some(&0));
        assert_eq!(reader.take(), Some(0));
        assert_eq!(reader.drain(), vec![1, 2, 3, 4]);
        assert!(reader.is_empty());
    }
}
