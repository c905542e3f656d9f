//! Conveyor: ready admission over a bounded pool of lines
//!
//! Ready tasks are handed straight to an idle line when there is one and
//! queued otherwise. Busy lines occupy the front of the line array and idle
//! lines the back; `load_count` is the boundary. The last slot doubles as the
//! hybrid line lent to the timer keeper while the pool is not fully loaded.

use crate::config::{ConveyorConfig, PoolKind};
use crate::keeper::Keeper;
use crate::line::{Assignment, Line};
use crate::stats::ConveyorStats;
use crate::task::{Job, Task, TaskHandle, TaskId};
use crate::{ConveyorError, Result};
use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHasher;
use std::collections::VecDeque;
use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type TaskRegistry = DashMap<TaskId, Arc<Task>, BuildHasherDefault<FxHasher>>;

/// Every conveyor created in this process
static CONVEYORS: Lazy<Mutex<Vec<Weak<Shared>>>> = Lazy::new(|| Mutex::new(Vec::new()));

struct State {
    /// Ready tasks waiting for a line
    queue: VecDeque<Arc<Task>>,
    /// Busy lines first, idle lines after `load_count`
    lines: Vec<Option<Arc<Line>>>,
    load_count: usize,
    /// No line is busy
    idle: bool,
    /// Every line is busy
    load: bool,
    /// The last slot is lent to the keeper
    hybrid: bool,
    finished: bool,
    /// Line threads that have not exited
    live_lines: usize,
    next_line: usize,
}

/// State shared by a conveyor handle, its tasks and its lines
pub(crate) struct Shared {
    name: String,
    kind: PoolKind,
    capacity: usize,
    freeze_ms: u64,
    state: Mutex<State>,
    joined: Condvar,
    pub(crate) keeper: Keeper,
    tasks: TaskRegistry,
    shutdown: AtomicBool,
    queued: AtomicUsize,
    load: AtomicUsize,
    priority: AtomicCell<Option<i32>>,
}

impl Shared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn freeze_ms(&self) -> u64 {
        self.freeze_ms
    }

    pub(crate) fn priority(&self) -> Option<i32> {
        self.priority.load()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn register(self: &Arc<Self>, job: Box<dyn Job>) -> Result<Arc<Task>> {
        if self.is_shutdown() {
            return Err(ConveyorError::Shutdown(self.name.clone()));
        }
        let task = Task::new(self.clone(), job);
        self.tasks.insert(task.id(), task.clone());
        if self.is_shutdown() {
            self.retire(task.id());
            return Err(ConveyorError::Shutdown(self.name.clone()));
        }
        Ok(task)
    }

    /// Forget a finished task
    pub(crate) fn retire(self: &Arc<Self>, id: TaskId) {
        self.tasks.remove(&id);
        if self.is_shutdown() && self.tasks.is_empty() {
            self.finish();
        }
    }

    /// Admit a task whose queued flag the caller just raised
    pub(crate) fn push(self: &Arc<Self>, task: Arc<Task>) {
        let mut state = self.state.lock();
        self.admit(&mut state, task);
    }

    /// Admit a group of tasks under one lock
    pub(crate) fn push_all(self: &Arc<Self>, tasks: Vec<Arc<Task>>) {
        let mut state = self.state.lock();
        for task in tasks {
            self.admit(&mut state, task);
        }
    }

    fn admit(self: &Arc<Self>, state: &mut State, task: Arc<Task>) {
        if state.finished {
            warn!(conveyor = %self.name, task = %task, "conveyor finished, task dropped");
            return;
        }
        if !state.load {
            match self.wakeup(state, task.clone()) {
                Ok(()) => return,
                Err(e) => error!(conveyor = %self.name, task = %task, error = %e, "admission failed, task queued"),
            }
        }
        state.queue.push_back(task);
        self.queued.store(state.queue.len(), Ordering::Relaxed);
    }

    /// Hand `task` to the next free line
    fn wakeup(self: &Arc<Self>, state: &mut State, task: Arc<Task>) -> Result<()> {
        match self.kind {
            PoolKind::Solo => {
                state.idle = false;
                state.load = true;
                self.load.store(1, Ordering::Relaxed);
                self.assign(state, 0, task)
            }
            PoolKind::Multi => {
                let index = state.load_count;
                if index >= self.capacity {
                    error!(conveyor = %self.name, capacity = self.capacity, "can't wake line, all lines have load");
                    return Err(ConveyorError::Overload {
                        name: self.name.clone(),
                        capacity: self.capacity,
                    });
                }
                let was_idle = state.idle;
                state.load_count += 1;
                state.idle = false;
                state.load = state.load_count == self.capacity;
                if let Err(e) = self.assign(state, index, task) {
                    state.load_count -= 1;
                    state.idle = was_idle;
                    state.load = false;
                    return Err(e);
                }
                self.load.store(state.load_count, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn assign(self: &Arc<Self>, state: &mut State, index: usize, task: Arc<Task>) -> Result<()> {
        if index + 1 == self.capacity && state.hybrid {
            state.hybrid = false;
            if let Some(line) = self.keeper.revoke() {
                line.unpark(Assignment::Task(task));
                return Ok(());
            }
        }
        match &state.lines[index] {
            Some(line) => line.unpark(Assignment::Task(task)),
            None => {
                let line = self.launch(state, Assignment::Task(task))?;
                state.lines[index] = Some(line);
            }
        }
        Ok(())
    }

    fn launch(self: &Arc<Self>, state: &mut State, first: Assignment) -> Result<Arc<Line>> {
        let line = Line::new(state.next_line, &self.name);
        line.unpark(first);
        line.start(self.clone())?;
        state.next_line += 1;
        state.live_lines += 1;
        Ok(line)
    }

    /// Called by a line after a stage; returns its next assignment
    pub(crate) fn swap(self: &Arc<Self>, line: &Arc<Line>, again: Option<Arc<Task>>) -> Option<Assignment> {
        let now = crate::time::now_millis();
        if self.keeper.is_due(now) {
            self.keeper.apply(self, now);
        }

        let mut state = self.state.lock();
        if let Some(next) = state.queue.pop_front() {
            if let Some(again) = again {
                state.queue.push_back(again);
            }
            self.queued.store(state.queue.len(), Ordering::Relaxed);
            return Some(Assignment::Task(next));
        }
        if let Some(again) = again {
            return Some(Assignment::Task(again));
        }
        self.asleep(&mut state, line)
    }

    /// Move a line that ran out of work to the idle partition
    fn asleep(self: &Arc<Self>, state: &mut State, line: &Arc<Line>) -> Option<Assignment> {
        if state.finished {
            return Some(Assignment::Kill);
        }
        let was_load = match self.kind {
            PoolKind::Solo => {
                state.idle = true;
                std::mem::replace(&mut state.load, false)
            }
            PoolKind::Multi => {
                state.load_count = state.load_count.saturating_sub(1);
                let last = state.load_count;
                let position = state.lines[..=last]
                    .iter()
                    .position(|slot| slot.as_ref().map_or(false, |l| Arc::ptr_eq(l, line)));
                if let Some(index) = position {
                    state.lines.swap(index, last);
                }
                state.idle = last == 0;
                std::mem::replace(&mut state.load, false)
            }
        };
        self.load.store(state.load_count, Ordering::Relaxed);

        if was_load && !state.hybrid && self.keeper.has_timers() {
            state.hybrid = true;
            self.keeper.invoke(line.clone());
            return Some(Assignment::Keeper);
        }
        None
    }

    /// The keeper needs a line to sleep on
    pub(crate) fn switch_timer(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.finished || state.hybrid || state.load {
            return;
        }
        let index = self.capacity - 1;
        state.hybrid = true;
        match state.lines[index].clone() {
            Some(line) => {
                self.keeper.invoke(line.clone());
                line.unpark(Assignment::Keeper);
            }
            None => {
                let line = Line::new(state.next_line, &self.name);
                self.keeper.invoke(line.clone());
                line.unpark(Assignment::Keeper);
                match line.start(self.clone()) {
                    Ok(()) => {
                        state.next_line += 1;
                        state.live_lines += 1;
                        state.lines[index] = Some(line);
                    }
                    Err(e) => {
                        error!(conveyor = %self.name, error = %e, "failed to start keeper line");
                        self.keeper.revoke();
                        state.hybrid = false;
                    }
                }
            }
        }
    }

    /// A line lent to the keeper failed
    pub(crate) fn keeper_failed(&self, line: &Arc<Line>) {
        let mut state = self.state.lock();
        if self.keeper.detach(line) {
            state.hybrid = false;
        }
    }

    pub(crate) fn line_exited(&self) {
        let mut state = self.state.lock();
        state.live_lines = state.live_lines.saturating_sub(1);
        self.joined.notify_all();
    }

    fn shutdown(self: &Arc<Self>) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(conveyor = %self.name, tasks = self.tasks.len(), "conveyor shutdown");
        let tasks: Vec<Arc<Task>> = self.tasks.iter().map(|e| e.value().clone()).collect();
        for task in &tasks {
            task.deliver_shutdown();
        }
        if self.tasks.is_empty() {
            self.finish();
        }
    }

    /// Every task finished: stop the lines
    fn finish(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        if !state.queue.is_empty() {
            warn!(conveyor = %self.name, dropped = state.queue.len(), "ready queue not empty at finish");
            state.queue.clear();
            self.queued.store(0, Ordering::Relaxed);
        }
        if let Some(line) = self.keeper.release() {
            state.hybrid = false;
            line.unpark(Assignment::Kill);
        }
        let idle = match self.kind {
            PoolKind::Solo if state.idle => 0..1,
            PoolKind::Solo => 0..0,
            PoolKind::Multi => state.load_count..self.capacity,
        };
        for line in state.lines[idle].iter().flatten() {
            line.unpark(Assignment::Kill);
        }
        info!(conveyor = %self.name, "conveyor finished");
        self.joined.notify_all();
    }

    fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !(state.finished && state.live_lines == 0) {
            if self.joined.wait_until(&mut state, deadline).timed_out() {
                return state.finished && state.live_lines == 0;
            }
        }
        true
    }

    fn stats(&self) -> ConveyorStats {
        let (lines, finished) = {
            let state = self.state.lock();
            let lines = state.lines.iter().flatten().map(|line| line.state()).collect();
            (lines, state.finished)
        };
        ConveyorStats {
            name: self.name.clone(),
            capacity: self.capacity,
            load: self.load.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            timers: self.keeper.len(),
            tasks: self.tasks.len(),
            lines,
            shutdown: self.is_shutdown(),
            finished,
        }
    }
}

/// Handle of a scheduler
#[derive(Clone)]
pub struct Conveyor {
    shared: Arc<Shared>,
}

impl Conveyor {
    /// Conveyor with exactly one line
    pub fn solo(name: impl Into<String>) -> Self {
        Self::build(name.into(), PoolKind::Solo, 1, None, ConveyorConfig::default().freeze_ms)
    }

    /// Conveyor with up to `lines` lines, started on demand
    pub fn multi(name: impl Into<String>, lines: usize) -> Self {
        Self::build(name.into(), PoolKind::Multi, lines.max(1), None, ConveyorConfig::default().freeze_ms)
    }

    /// Conveyor described by a configuration
    pub fn from_config(config: &ConveyorConfig) -> Result<Self> {
        config.validate()?;
        let lines = match config.kind {
            PoolKind::Solo => 1,
            PoolKind::Multi => config.lines,
        };
        Ok(Self::build(config.name.clone(), config.kind, lines, config.priority, config.freeze_ms))
    }

    fn build(name: String, kind: PoolKind, capacity: usize, priority: Option<i32>, freeze_ms: u64) -> Self {
        let shared = Arc::new(Shared {
            name,
            kind,
            capacity,
            freeze_ms,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                lines: vec![None; capacity],
                load_count: 0,
                idle: true,
                load: false,
                hybrid: false,
                finished: false,
                live_lines: 0,
                next_line: 0,
            }),
            joined: Condvar::new(),
            keeper: Keeper::new(),
            tasks: TaskRegistry::default(),
            shutdown: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            load: AtomicUsize::new(0),
            priority: AtomicCell::new(priority),
        });
        let mut conveyors = CONVEYORS.lock();
        conveyors.retain(|c| c.strong_count() > 0);
        conveyors.push(Arc::downgrade(&shared));
        debug!(conveyor = %shared.name, ?kind, capacity, "conveyor created");
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Conveyor name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Scheduler variant
    pub fn kind(&self) -> PoolKind {
        self.shared.kind
    }

    /// Maximum number of lines
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Register an idle task; nothing runs until an entry arrives
    pub fn task<J: Job>(&self, job: J) -> Result<TaskHandle> {
        self.shared.register(Box::new(job))
    }

    /// Register a task and deliver its start stage
    pub fn spawn<J: Job>(&self, job: J) -> Result<TaskHandle> {
        let task = self.task(job)?;
        task.start();
        Ok(task)
    }

    /// Set OS niceness of every line, current and future
    pub fn set_priority(&self, nice: i32) -> Result<()> {
        self.shared.priority.store(Some(nice));
        let lines: Vec<Arc<Line>> = self.shared.state.lock().lines.iter().flatten().cloned().collect();
        for line in lines {
            line.apply_priority(nice).map_err(ConveyorError::Priority)?;
        }
        Ok(())
    }

    /// Broadcast shutdown to every live task
    ///
    /// Tasks answering the shutdown stage with `Unknown` or `Finish` stop at
    /// once; others keep running until they finish on their own. Lines stop
    /// after the last task finished.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Wait until every task finished and every line stopped
    pub fn join(&self, timeout: Duration) -> bool {
        self.shared.join(timeout)
    }

    /// Has shutdown been requested
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Have all tasks finished after shutdown
    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().finished
    }

    /// Number of tasks that have not finished
    pub fn live_tasks(&self) -> usize {
        self.shared.tasks.len()
    }

    /// Current counters
    pub fn stats(&self) -> ConveyorStats {
        self.shared.stats()
    }
}

impl fmt::Debug for Conveyor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conveyor")
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

fn live_conveyors() -> Vec<Arc<Shared>> {
    CONVEYORS.lock().iter().filter_map(Weak::upgrade).collect()
}

/// Shut down every conveyor of the process
pub fn shutdown_all() {
    for shared in live_conveyors() {
        shared.shutdown();
    }
}

/// Wait until every conveyor of the process finished; false on timeout
pub fn join_shutdown(timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    live_conveyors()
        .iter()
        .all(|shared| shared.join(deadline.saturating_duration_since(Instant::now())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Stage};
    use crate::task::Context;
    use std::sync::mpsc;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_conveyor_creation() {
        let conveyor = Conveyor::multi("create", 4);
        assert_eq!(conveyor.name(), "create");
        assert_eq!(conveyor.capacity(), 4);
        assert_eq!(conveyor.kind(), PoolKind::Multi);
        let stats = conveyor.stats();
        assert_eq!(stats.load, 0);
        assert!(stats.lines.is_empty());
    }

    #[test]
    fn test_zero_lines_clamped() {
        assert_eq!(Conveyor::multi("clamp", 0).capacity(), 1);
        assert_eq!(Conveyor::solo("solo").capacity(), 1);
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let mut config = ConveyorConfig::multi("bad", 0);
        assert!(matches!(Conveyor::from_config(&config), Err(ConveyorError::Config(_))));
        config.lines = 2;
        config.freeze_ms = 10;
        let conveyor = Conveyor::from_config(&config).unwrap();
        assert_eq!(conveyor.shared().freeze_ms(), 10);
    }

    #[test]
    fn test_overload_keeps_load_count() {
        let conveyor = Conveyor::multi("overload", 2);
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();

        for _ in 0..2 {
            let entered = entered_tx.clone();
            let gate = gate.clone();
            conveyor
                .spawn(move |_cx: &mut Context<'_>, stage: Stage| {
                    if stage == Stage::START {
                        entered.send(()).ok();
                        drop(gate.lock());
                        return Ok(Command::Finish);
                    }
                    Ok(Command::Unknown)
                })
                .unwrap();
        }
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let extra = conveyor
            .task(|_cx: &mut Context<'_>, _stage: Stage| Ok(Command::Finish))
            .unwrap();
        {
            let shared = conveyor.shared();
            let mut state = shared.state.lock();
            assert_eq!(state.load_count, 2);
            assert!(state.load);
            let err = shared.wakeup(&mut state, extra.clone()).unwrap_err();
            assert!(matches!(err, ConveyorError::Overload { capacity: 2, .. }));
            assert_eq!(state.load_count, 2);
        }

        drop(held);
        assert!(wait_for(|| conveyor.stats().load == 0));

        extra.start();
        assert!(wait_for(|| extra.is_finished()));
        conveyor.shutdown();
        assert!(conveyor.join(Duration::from_secs(5)));
    }

    #[test]
    fn test_busy_pool_queues_tasks() {
        let conveyor = Conveyor::multi("queueing", 1);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let (entered_tx, entered_rx) = mpsc::channel::<()>();

        let blocker_gate = gate.clone();
        conveyor
            .spawn(move |_cx: &mut Context<'_>, _stage: Stage| {
                entered_tx.send(()).ok();
                drop(blocker_gate.lock());
                Ok(Command::Finish)
            })
            .unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let waiting: Vec<_> = (0..3)
            .map(|_| conveyor.spawn(|_cx: &mut Context<'_>, _stage: Stage| Ok(Command::Finish)).unwrap())
            .collect();
        assert_eq!(conveyor.stats().queued, 3);

        drop(held);
        assert!(wait_for(|| waiting.iter().all(|t| t.is_finished())));
        assert_eq!(conveyor.stats().queued, 0);
    }

    #[test]
    fn test_shutdown_without_tasks_finishes() {
        let conveyor = Conveyor::multi("empty-shutdown", 2);
        conveyor.shutdown();
        assert!(conveyor.is_finished());
        assert!(conveyor.join(Duration::from_millis(100)));
        assert!(matches!(
            conveyor.task(|_cx: &mut Context<'_>, _stage: Stage| Ok(Command::Finish)),
            Err(ConveyorError::Shutdown(_))
        ));
    }

    #[test]
    fn test_join_times_out_while_running() {
        let conveyor = Conveyor::multi("join-timeout", 1);
        let _task = conveyor
            .spawn(|_cx: &mut Context<'_>, stage: Stage| {
                Ok(if stage == Stage::START { Command::Default } else { Command::Unknown })
            })
            .unwrap();
        assert!(!conveyor.join(Duration::from_millis(20)));
        conveyor.shutdown();
        assert!(conveyor.join(Duration::from_secs(5)));
    }
}
