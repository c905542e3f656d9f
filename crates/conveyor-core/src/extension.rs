//! Task extension: stage lock and watched resources
//!
//! The extension is a system entry created on demand the first time a task
//! uses its lock, its watch lists or its loop. It never takes part in stage
//! ordering; the task consults it at the end of each stage and when it
//! finishes.

use crate::entry::LoopEntry;
use crate::task::panic_message;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::error;

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

/// A resource released by the task on its behalf
///
/// Closures returning `anyhow::Result<()>` are resources too, so a task can
/// watch anything by handing over the code that releases it.
pub trait Closeable: Send + 'static {
    /// Release the resource
    fn close(self: Box<Self>) -> anyhow::Result<()>;
}

impl<F> Closeable for F
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    fn close(self: Box<Self>) -> anyhow::Result<()> {
        (*self)()
    }
}

/// Handle of a watched resource, used to close it early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct Watched {
    id: WatchId,
    resource: Box<dyn Closeable>,
}

/// Reentrant lock owned by whichever thread currently runs the task
///
/// A stage may take it and leave it held; whatever the stage still holds is
/// released when the stage ends. Other threads synchronize with the task
/// through [`StageLock::lock`].
pub struct StageLock {
    state: Mutex<LockState>,
    released: Condvar,
}

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    count: usize,
}

impl StageLock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Acquire the lock for the current thread, blocking while another
    /// thread holds it
    pub fn lock(&self) -> StageLockGuard<'_> {
        self.acquire();
        StageLockGuard { lock: self }
    }

    /// Is the lock held by any thread
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// How many times the current thread holds the lock
    pub fn hold_count(&self) -> usize {
        let state = self.state.lock();
        match state.owner {
            Some(owner) if owner == thread::current().id() => state.count,
            _ => 0,
        }
    }

    pub(crate) fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.count = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.count += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    /// Returns false if the current thread didn't hold the lock
    pub(crate) fn release(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return false;
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.released.notify_one();
        }
        true
    }
}

impl fmt::Debug for StageLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StageLock")
            .field("owner", &state.owner)
            .field("count", &state.count)
            .finish()
    }
}

/// Scoped hold of a [`StageLock`]
pub struct StageLockGuard<'a> {
    lock: &'a StageLock,
}

impl Drop for StageLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Lock handle, loop entry and watch lists of one task
pub(crate) struct Extension {
    pub(crate) lock: Arc<StageLock>,
    pub(crate) looper: Arc<LoopEntry>,
    /// Lock holds taken by the current stage
    held: usize,
    /// Released only when the task finishes
    durable: Vec<Watched>,
    /// Released at the end of every stage
    staged: Vec<Watched>,
}

impl Extension {
    pub(crate) fn new(looper: Arc<LoopEntry>) -> Self {
        Self {
            lock: Arc::new(StageLock::new()),
            looper,
            held: 0,
            durable: Vec::new(),
            staged: Vec::new(),
        }
    }

    pub(crate) fn watch(&mut self, resource: Box<dyn Closeable>, durable: bool) -> WatchId {
        let id = WatchId(NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed));
        let item = Watched { id, resource };
        if durable {
            self.durable.push(item);
        } else {
            self.staged.push(item);
        }
        id
    }

    /// Remove a resource from either list so that it can be closed now
    pub(crate) fn detach(&mut self, id: WatchId) -> Option<Box<dyn Closeable>> {
        for list in [&mut self.staged, &mut self.durable] {
            if let Some(index) = list.iter().position(|w| w.id == id) {
                return Some(list.remove(index).resource);
            }
        }
        None
    }

    pub(crate) fn locked(&mut self) {
        self.held += 1;
    }

    /// Returns false if the current stage holds no lock
    pub(crate) fn unlocked(&mut self) -> bool {
        if self.held == 0 {
            return false;
        }
        self.held -= 1;
        true
    }

    /// Anything left for the end of the stage
    pub(crate) fn is_dirty(&self) -> bool {
        self.held > 0 || !self.staged.is_empty()
    }

    /// Lock holds and per-stage resources abandoned by the stage
    pub(crate) fn take_stage(&mut self) -> (usize, Vec<Box<dyn Closeable>>) {
        let held = std::mem::take(&mut self.held);
        let staged = std::mem::take(&mut self.staged);
        (held, staged.into_iter().rev().map(|w| w.resource).collect())
    }

    /// Every watched resource, latest first
    pub(crate) fn take_all(&mut self) -> Vec<Box<dyn Closeable>> {
        let staged = std::mem::take(&mut self.staged);
        let durable = std::mem::take(&mut self.durable);
        staged
            .into_iter()
            .rev()
            .chain(durable.into_iter().rev())
            .map(|w| w.resource)
            .collect()
    }
}

/// Close resources in order, logging failures and panics
pub(crate) fn close_all(owner: &dyn fmt::Display, resources: Vec<Box<dyn Closeable>>) {
    for resource in resources {
        match panic::catch_unwind(AssertUnwindSafe(|| resource.close())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let detail = format!("{:#}", e);
                error!(task = %owner, error = %detail, "failed to close watched resource");
            }
            Err(payload) => {
                error!(task = %owner, panic = %panic_message(payload.as_ref()), "critical failure closing watched resource");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Stage;
    use std::sync::Weak;

    fn extension() -> Extension {
        Extension::new(Arc::new(LoopEntry::new(Weak::new(), Stage::LOOP)))
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Box<dyn Closeable> {
        let log = log.clone();
        Box::new(move || {
            log.lock().push(name);
            Ok(())
        })
    }

    #[test]
    fn test_stage_lock_is_reentrant() {
        let lock = StageLock::new();
        lock.acquire();
        lock.acquire();
        assert_eq!(lock.hold_count(), 2);
        assert!(lock.release());
        assert!(lock.is_locked());
        assert!(lock.release());
        assert!(!lock.is_locked());
        assert!(!lock.release());
    }

    #[test]
    fn test_stage_lock_blocks_other_threads() {
        let lock = Arc::new(StageLock::new());
        let guard = lock.lock();
        let other = lock.clone();
        let handle = thread::spawn(move || {
            let _guard = other.lock();
            other.hold_count()
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        drop(guard);
        assert_eq!(handle.join().unwrap(), 1);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_per_stage_resources_close_latest_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ext = extension();
        ext.watch(recorder(&log, "durable"), true);
        ext.watch(recorder(&log, "first"), false);
        ext.watch(recorder(&log, "second"), false);
        assert!(ext.is_dirty());

        let (held, staged) = ext.take_stage();
        assert_eq!(held, 0);
        close_all(&"test", staged);
        assert_eq!(*log.lock(), vec!["second", "first"]);
        assert!(!ext.is_dirty());

        close_all(&"test", ext.take_all());
        assert_eq!(*log.lock(), vec!["second", "first", "durable"]);
    }

    #[test]
    fn test_detach_removes_resource() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ext = extension();
        let id = ext.watch(recorder(&log, "early"), false);
        ext.watch(recorder(&log, "late"), true);

        let early = ext.detach(id).unwrap();
        close_all(&"test", vec![early]);
        assert!(ext.detach(id).is_none());
        assert!(!ext.is_dirty());

        close_all(&"test", ext.take_all());
        assert_eq!(*log.lock(), vec!["early", "late"]);
    }

    #[test]
    fn test_lock_holds_tracked_per_stage() {
        let mut ext = extension();
        assert!(!ext.unlocked());
        ext.locked();
        ext.locked();
        assert!(ext.unlocked());
        assert!(ext.is_dirty());
        let (held, _) = ext.take_stage();
        assert_eq!(held, 1);
        assert!(!ext.is_dirty());
    }

    #[test]
    fn test_failing_close_does_not_stop_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing: Box<dyn Closeable> = Box::new(|| Err(anyhow::anyhow!("broken pipe")));
        close_all(&"test", vec![failing, recorder(&log, "after")]);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn test_panicking_close_does_not_escape() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let panicking: Box<dyn Closeable> = Box::new(|| -> anyhow::Result<()> { panic!("close exploded") });
        close_all(&"test", vec![panicking, recorder(&log, "after")]);
        assert_eq!(*log.lock(), vec!["after"]);
    }
}
