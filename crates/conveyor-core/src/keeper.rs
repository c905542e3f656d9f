//! Timer keeper
//!
//! Orders every waiting entry of a conveyor by wake instant. Instead of a
//! dedicated thread, the keeper borrows one otherwise idle line (the hybrid
//! line) and parks it precisely until the next deadline. When every line is
//! busy the keeper has no line; busy lines then apply due timers between
//! stages. The conveyor may revoke the borrowed line at any time.

use crate::conveyor::Shared;
use crate::line::{Assignment, Line};
use crate::stats::LineState;
use crate::task::Task;
use crate::time::now_millis;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Waiting entries fired per lock acquisition
pub(crate) const APPLY_PACK_SIZE: usize = 16;

static NEXT_WAITING_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_waiting_id() -> u64 {
    NEXT_WAITING_ID.fetch_add(1, Ordering::Relaxed)
}

/// An entry that can wait in the keeper
pub(crate) trait Waiting: Send + Sync {
    /// Unique id, breaks ties between equal instants
    fn id(&self) -> u64;

    /// The instant filed under has arrived; returns the owner task if it
    /// must be admitted to the conveyor
    fn wakeup(self: Arc<Self>, shared: &Arc<Shared>, instant: u64) -> Option<Arc<Task>>;
}

struct KeeperState {
    queue: BTreeMap<(u64, u64), Arc<dyn Waiting>>,
    /// Earliest instant in `queue`, 0 when empty
    next_wakeup: u64,
    /// Line lent to the keeper
    active: Option<Arc<Line>>,
    /// The active line is parked until `next_wakeup`
    parked: bool,
    /// Conveyor finished; drop everything
    released: bool,
}

pub(crate) struct Keeper {
    state: Mutex<KeeperState>,
    /// Mirror of `next_wakeup` for lock-free passive checks
    next_due: AtomicU64,
    /// Mirror of `active.is_some()`
    attended: AtomicBool,
    size: AtomicUsize,
}

impl Keeper {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(KeeperState {
                queue: BTreeMap::new(),
                next_wakeup: 0,
                active: None,
                parked: false,
                released: false,
            }),
            next_due: AtomicU64::new(0),
            attended: AtomicBool::new(false),
            size: AtomicUsize::new(0),
        }
    }

    /// Number of waiting entries
    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn has_timers(&self) -> bool {
        self.len() > 0
    }

    /// Earliest wake instant
    pub(crate) fn next_wakeup(&self) -> Option<u64> {
        match self.next_due.load(Ordering::Acquire) {
            0 => None,
            next => Some(next),
        }
    }

    /// Something is due and no line is lent to the keeper
    pub(crate) fn is_due(&self, now: u64) -> bool {
        if self.attended.load(Ordering::Acquire) {
            return false;
        }
        matches!(self.next_wakeup(), Some(next) if next <= now)
    }

    pub(crate) fn push(&self, shared: &Arc<Shared>, entry: Arc<dyn Waiting>, instant: u64) {
        let mut state = self.state.lock();
        if state.released {
            return;
        }
        state.queue.insert((instant, entry.id()), entry);
        self.size.store(state.queue.len(), Ordering::Relaxed);
        if state.next_wakeup == 0 || instant < state.next_wakeup {
            self.change_wakeup(&mut state, shared, instant);
        }
    }

    /// Returns false if the entry was not waiting under that instant
    pub(crate) fn take(&self, shared: &Arc<Shared>, id: u64, instant: u64) -> bool {
        let mut state = self.state.lock();
        if state.queue.remove(&(instant, id)).is_none() {
            return false;
        }
        self.size.store(state.queue.len(), Ordering::Relaxed);
        if instant == state.next_wakeup {
            let next = first_instant(&state.queue);
            if next != state.next_wakeup {
                self.change_wakeup(&mut state, shared, next);
            }
        }
        true
    }

    fn change_wakeup(&self, state: &mut MutexGuard<'_, KeeperState>, shared: &Arc<Shared>, next: u64) {
        let old = state.next_wakeup;
        state.next_wakeup = next;
        self.next_due.store(next, Ordering::Release);
        match state.active.clone() {
            Some(line) => {
                let sooner = next != 0 && (old == 0 || next < old);
                if sooner && state.parked {
                    state.parked = false;
                    line.kick();
                }
            }
            None if !state.released && next != 0 => {
                MutexGuard::unlocked(state, || shared.switch_timer());
            }
            None => {}
        }
    }

    /// Fire every entry due at `now` and admit the woken tasks
    pub(crate) fn apply(&self, shared: &Arc<Shared>, now: u64) -> usize {
        let mut fired = 0;
        loop {
            let mut batch = Vec::with_capacity(APPLY_PACK_SIZE);
            {
                let mut state = self.state.lock();
                while batch.len() < APPLY_PACK_SIZE {
                    let Some(entry) = state.queue.first_entry() else {
                        break;
                    };
                    let instant = entry.key().0;
                    if instant > now {
                        break;
                    }
                    batch.push((instant, entry.remove()));
                }
                let next = first_instant(&state.queue);
                state.next_wakeup = next;
                self.next_due.store(next, Ordering::Release);
                self.size.store(state.queue.len(), Ordering::Relaxed);
            }

            let full = batch.len() == APPLY_PACK_SIZE;
            fired += batch.len();
            let tasks: Vec<Arc<Task>> = batch
                .into_iter()
                .filter_map(|(instant, entry)| entry.wakeup(shared, instant))
                .collect();
            if !tasks.is_empty() {
                shared.push_all(tasks);
            }
            if !full {
                break;
            }
        }
        if fired > 0 {
            trace!(conveyor = %shared.name(), fired, "timers applied");
        }
        fired
    }

    /// Lend `line` to the keeper; called with the conveyor locked
    pub(crate) fn invoke(&self, line: Arc<Line>) {
        let mut state = self.state.lock();
        state.active = Some(line);
        state.parked = false;
        self.attended.store(true, Ordering::Release);
    }

    /// Take the lent line back; called with the conveyor locked
    pub(crate) fn revoke(&self) -> Option<Arc<Line>> {
        let mut state = self.state.lock();
        state.parked = false;
        self.attended.store(false, Ordering::Release);
        state.active.take()
    }

    /// Drop `line` after it failed while keeping time
    pub(crate) fn detach(&self, line: &Arc<Line>) -> bool {
        let mut state = self.state.lock();
        if !is_active(&state, line) {
            return false;
        }
        state.parked = false;
        self.attended.store(false, Ordering::Release);
        state.active = None;
        true
    }

    /// Forget every waiting entry and refuse new ones
    pub(crate) fn release(&self) -> Option<Arc<Line>> {
        let mut state = self.state.lock();
        state.released = true;
        state.queue.clear();
        state.next_wakeup = 0;
        state.parked = false;
        self.next_due.store(0, Ordering::Release);
        self.size.store(0, Ordering::Relaxed);
        self.attended.store(false, Ordering::Release);
        state.active.take()
    }

    /// Run the keeper on a lent line until the line is revoked
    pub(crate) fn process(&self, shared: &Arc<Shared>, line: &Arc<Line>) -> Option<Assignment> {
        line.set_state(LineState::Keeper);
        let mut state = self.state.lock();
        while is_active(&state, line) {
            let deadline = state.next_wakeup;
            state.parked = true;
            MutexGuard::unlocked(&mut state, || line.park_until((deadline != 0).then_some(deadline)));
            if !std::mem::replace(&mut state.parked, false) {
                // kicked or revoked
                continue;
            }
            let now = now_millis();
            if state.next_wakeup != 0 && state.next_wakeup <= now {
                line.set_state(LineState::Core);
                MutexGuard::unlocked(&mut state, || self.apply(shared, now));
                line.set_state(LineState::Keeper);
            }
        }
        drop(state);
        line.take_assignment()
    }
}

fn is_active(state: &KeeperState, line: &Arc<Line>) -> bool {
    state.active.as_ref().map_or(false, |active| Arc::ptr_eq(active, line))
}

fn first_instant(queue: &BTreeMap<(u64, u64), Arc<dyn Waiting>>) -> u64 {
    queue.keys().next().map_or(0, |&(instant, _)| instant)
}
