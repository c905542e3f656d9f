//! Entries: units of deferred work attached to a task
//!
//! Every entry names the stage it delivers. After the stage returns, the
//! entry's own resume policy decides whether it goes back to the tail of the
//! chain, waits in the timer keeper, or is dropped.

use crate::command::Stage;
use crate::conveyor::Shared;
use crate::keeper::{next_waiting_id, Waiting};
use crate::storage::StorageEntry;
use crate::task::Task;
use crate::time::now_millis;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// A queued work item in a task's chain
pub(crate) enum Entry {
    /// Bare stage marker
    Call(Stage),
    /// External event with a payload
    Signal {
        stage: Stage,
        target: Box<dyn Any + Send>,
    },
    /// Shutdown broadcast from the conveyor
    Shutdown,
    /// Fired timer
    Timer(Arc<TimerEntry>),
    /// Built-in loop stage
    Loop(Arc<LoopEntry>),
    /// Storage with pending items
    Storage(Arc<dyn StorageEntry>),
    /// Thawed failure handling, processed out of band
    Crash,
}

/// What happens to an entry after its stage returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resume {
    /// Drop it; it may live on elsewhere (timer keeper, storage)
    Discard,
    /// Append it to the tail again
    Requeue,
}

impl Entry {
    pub(crate) fn stage(&self) -> Stage {
        match self {
            Entry::Call(stage) | Entry::Signal { stage, .. } => *stage,
            Entry::Shutdown => Stage::SHUTDOWN,
            Entry::Timer(timer) => timer.stage,
            Entry::Loop(looper) => looper.stage,
            Entry::Storage(storage) => storage.stage(),
            Entry::Crash => Stage::START,
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Entry::Call(_) => "Call",
            Entry::Signal { .. } => "Signal",
            Entry::Shutdown => "Shutdown",
            Entry::Timer(_) => "Timer",
            Entry::Loop(_) => "Loop",
            Entry::Storage(_) => "Storage",
            Entry::Crash => "Crash",
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(self, Entry::Shutdown)
    }

    /// Stop auto-repetition
    pub(crate) fn cancel(&self) {
        match self {
            Entry::Timer(timer) => timer.state.lock().cancelled = true,
            Entry::Loop(looper) => looper.idle(),
            _ => {}
        }
    }

    /// The entry leaves the chain without its resume policy running
    pub(crate) fn release(&self) {
        match self {
            Entry::Loop(looper) => looper.release(),
            Entry::Storage(storage) => storage.release(),
            _ => {}
        }
    }

    pub(crate) fn resume(&self, shared: &Arc<Shared>, now: u64) -> Resume {
        match self {
            Entry::Timer(timer) => timer.resume(shared, now),
            Entry::Loop(looper) => looper.resume(shared, now),
            Entry::Storage(storage) => storage.resume(),
            Entry::Call(_) | Entry::Signal { .. } | Entry::Shutdown | Entry::Crash => Resume::Discard,
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry {} {}", self.kind_name(), self.stage())
    }
}

/// Repeat policy of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Once, after a fixed offset
    Delay,
    /// Once, at an absolute instant
    Until,
    /// Every `range` after the previous firing was processed
    Interval,
    /// Every `range` after the previous wake; missed ticks are replayed
    Period,
    /// On the `range` grid; missed ticks are skipped, phase is kept
    Regular,
}

impl TimerKind {
    /// Does the timer fire more than once
    pub fn is_repeating(self) -> bool {
        matches!(self, TimerKind::Interval | TimerKind::Period | TimerKind::Regular)
    }

    /// First wake instant of a relative timer created at `now`
    pub fn first_instant(self, range: u64, now: u64) -> u64 {
        match self {
            TimerKind::Regular => now - now % range + range,
            _ => now + range,
        }
    }

    /// Next wake instant after the firing scheduled for `instant` was
    /// processed at `now`; `None` once the timer is spent
    ///
    /// A result that is not after `now` means the timer is already due again.
    pub fn next_instant(self, instant: u64, range: u64, now: u64) -> Option<u64> {
        match self {
            TimerKind::Delay | TimerKind::Until => None,
            TimerKind::Interval => Some(now + range),
            TimerKind::Period => Some(instant + range),
            TimerKind::Regular => Some(now - now % range + range),
        }
    }
}

pub(crate) struct TimerEntry {
    id: u64,
    owner: Weak<Task>,
    stage: Stage,
    kind: TimerKind,
    range: u64,
    state: Mutex<TimerState>,
}

struct TimerState {
    instant: u64,
    resident: bool,
    cancelled: bool,
    /// Deferred signal payload; the firing is delivered as a signal
    payload: Option<Box<dyn Any + Send>>,
}

impl TimerEntry {
    pub(crate) fn new(owner: Weak<Task>, stage: Stage, kind: TimerKind, range: u64, instant: u64) -> Self {
        Self {
            id: next_waiting_id(),
            owner,
            stage,
            kind,
            range,
            state: Mutex::new(TimerState {
                instant,
                resident: false,
                cancelled: false,
                payload: None,
            }),
        }
    }

    /// One-shot timer delivering `target` as a signal payload
    pub(crate) fn deferred(owner: Weak<Task>, stage: Stage, instant: u64, target: Box<dyn Any + Send>) -> Self {
        let entry = Self::new(owner, stage, TimerKind::Until, 0, instant);
        entry.state.lock().payload = Some(target);
        entry
    }

    /// Hand the timer to the keeper at its current instant
    pub(crate) fn arm(self: &Arc<Self>, shared: &Arc<Shared>) {
        let mut state = self.state.lock();
        if state.cancelled || state.resident {
            return;
        }
        state.resident = true;
        shared.keeper.push(shared, self.clone(), state.instant);
    }

    fn resume(self: &Arc<Self>, shared: &Arc<Shared>, now: u64) -> Resume {
        let mut state = self.state.lock();
        if state.cancelled {
            return Resume::Discard;
        }
        let Some(next) = self.kind.next_instant(state.instant, self.range, now) else {
            return Resume::Discard;
        };
        state.instant = next;
        if next <= now {
            return Resume::Requeue;
        }
        state.resident = true;
        shared.keeper.push(shared, self.clone(), next);
        Resume::Discard
    }
}

impl Waiting for TimerEntry {
    fn id(&self) -> u64 {
        self.id
    }

    fn wakeup(self: Arc<Self>, _shared: &Arc<Shared>, instant: u64) -> Option<Arc<Task>> {
        let payload = {
            let mut state = self.state.lock();
            if !state.resident || state.instant != instant {
                return None;
            }
            state.resident = false;
            if state.cancelled {
                return None;
            }
            state.payload.take()
        };
        let owner = self.owner.upgrade()?;
        let entry = match payload {
            Some(target) => Entry::Signal {
                stage: self.stage,
                target,
            },
            None => Entry::Timer(self),
        };
        owner.append_entry(entry).then_some(owner)
    }
}

/// Handle of a scheduled timer
#[derive(Clone)]
pub struct Timer {
    entry: Arc<TimerEntry>,
}

impl Timer {
    pub(crate) fn new(entry: Arc<TimerEntry>) -> Self {
        Self { entry }
    }

    /// Stop the timer
    ///
    /// Returns true if the timer was withdrawn from the keeper before it
    /// fired. A firing already on its way to the task may still be delivered
    /// once; it won't repeat afterwards.
    pub fn cancel(&self) -> bool {
        let mut state = self.entry.state.lock();
        state.cancelled = true;
        if !state.resident {
            return false;
        }
        let Some(owner) = self.entry.owner.upgrade() else {
            return false;
        };
        let shared = owner.shared();
        let removed = shared.keeper.take(shared, self.entry.id, state.instant);
        if removed {
            state.resident = false;
            state.payload = None;
        }
        removed
    }

    /// Repeat policy
    pub fn kind(&self) -> TimerKind {
        self.entry.kind
    }

    /// Stage the timer delivers
    pub fn stage(&self) -> Stage {
        self.entry.stage
    }

    /// Wake instant in epoch milliseconds while the timer waits in the keeper
    pub fn next_wakeup(&self) -> Option<u64> {
        let state = self.entry.state.lock();
        state.resident.then_some(state.instant)
    }

    /// Has the timer been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.entry.state.lock().cancelled
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("kind", &self.entry.kind)
            .field("stage", &self.entry.stage)
            .field("next_wakeup", &self.next_wakeup())
            .finish()
    }
}

/// Mode of a task's built-in loop stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Inert
    Idle,
    /// Every completion re-queues the loop stage
    Loop,
    /// Re-queue once the wake time arrives, then loop
    Sleep,
}

pub(crate) struct LoopEntry {
    id: u64,
    owner: Weak<Task>,
    stage: Stage,
    state: Mutex<LoopState>,
}

struct LoopState {
    mode: LoopMode,
    /// In the task chain or being processed
    queued: bool,
    /// Caller-set wake time while sleeping
    wakeup: u64,
    /// Instant the entry is filed under in the keeper, 0 when absent
    instant: u64,
}

impl LoopEntry {
    pub(crate) fn new(owner: Weak<Task>, stage: Stage) -> Self {
        Self {
            id: next_waiting_id(),
            owner,
            stage,
            state: Mutex::new(LoopState {
                mode: LoopMode::Idle,
                queued: false,
                wakeup: 0,
                instant: 0,
            }),
        }
    }

    pub(crate) fn mode(&self) -> LoopMode {
        self.state.lock().mode
    }

    pub(crate) fn start(self: &Arc<Self>, task: &Arc<Task>) {
        let mut state = self.state.lock();
        if state.mode == LoopMode::Loop {
            return;
        }
        state.mode = LoopMode::Loop;
        state.wakeup = 0;
        if state.instant != 0 {
            let shared = task.shared();
            shared.keeper.take(shared, self.id, state.instant);
            state.instant = 0;
        }
        if state.queued {
            return;
        }
        state.queued = true;
        drop(state);
        task.append_entry_and_push(Entry::Loop(self.clone()));
    }

    pub(crate) fn sleep(self: &Arc<Self>, task: &Arc<Task>, millis: u64) {
        let mut state = self.state.lock();
        state.wakeup = now_millis() + millis;
        state.mode = LoopMode::Sleep;
        if !state.queued {
            self.file(&mut state, task.shared());
        }
    }

    pub(crate) fn idle(&self) {
        self.state.lock().mode = LoopMode::Idle;
    }

    /// The entry was dropped from the chain; the loop goes idle and can be
    /// started again
    fn release(&self) {
        let mut state = self.state.lock();
        state.mode = LoopMode::Idle;
        state.queued = false;
    }

    /// Put the entry into the keeper at its wake time, moving it earlier if
    /// it is already there
    fn file(self: &Arc<Self>, state: &mut LoopState, shared: &Arc<Shared>) {
        if state.instant != 0 {
            if state.wakeup >= state.instant {
                return;
            }
            shared.keeper.take(shared, self.id, state.instant);
        }
        state.instant = state.wakeup;
        shared.keeper.push(shared, self.clone(), state.instant);
    }

    fn resume(self: &Arc<Self>, shared: &Arc<Shared>, now: u64) -> Resume {
        let mut state = self.state.lock();
        match state.mode {
            LoopMode::Idle => {
                state.queued = false;
                Resume::Discard
            }
            LoopMode::Loop => Resume::Requeue,
            LoopMode::Sleep if state.wakeup <= now => {
                state.mode = LoopMode::Loop;
                state.wakeup = 0;
                Resume::Requeue
            }
            LoopMode::Sleep => {
                state.queued = false;
                self.file(&mut state, shared);
                Resume::Discard
            }
        }
    }
}

impl Waiting for LoopEntry {
    fn id(&self) -> u64 {
        self.id
    }

    fn wakeup(self: Arc<Self>, shared: &Arc<Shared>, instant: u64) -> Option<Arc<Task>> {
        let mut state = self.state.lock();
        if state.instant != instant {
            return None;
        }
        state.instant = 0;
        if state.mode != LoopMode::Sleep {
            state.wakeup = 0;
            return None;
        }
        if instant < state.wakeup {
            // sleep was extended while waiting
            state.instant = state.wakeup;
            shared.keeper.push(shared, self.clone(), state.instant);
            return None;
        }
        state.wakeup = 0;
        state.mode = LoopMode::Loop;
        if state.queued {
            return None;
        }
        state.queued = true;
        drop(state);
        let owner = self.owner.upgrade()?;
        owner.append_entry(Entry::Loop(self)).then_some(owner)
    }
}
