//! Task: one schedulable stateful job
//!
//! A task owns an ordered chain of entries and a flag set. The queued flag
//! gates admission so that at most one line processes a task at a time:
//! whoever raises it hands the task to the conveyor, and only the line that
//! runs the task lowers it again. Each `process` call detaches the head
//! entry, runs the job's stage handler for it and applies the returned
//! command.

use crate::command::{Command, Stage};
use crate::conveyor::{Conveyor, Shared};
use crate::entry::{Entry, LoopEntry, LoopMode, Resume, Timer, TimerEntry, TimerKind};
use crate::extension::{close_all, Closeable, Extension, StageLock, WatchId};
use crate::keeper::{next_waiting_id, Waiting};
use crate::line::Line;
use crate::stats::LineState;
use crate::storage::Storage;
use crate::ticket::{Ticket, TicketStatus};
use crate::time::{now_millis, range_millis, to_millis};
use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{BitOr, Deref};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

/// Nested failures inside the error hook before the task freezes
pub(crate) const MAX_DEPTH: u32 = 3;
/// Consecutive failed stages before the task freezes
pub(crate) const MAX_LENGTH: u32 = 6;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Shared handle of a task
pub type TaskHandle = Arc<Task>;

/// Lifecycle notification delivered to [`Job::event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The task re-queued itself after a stage
    Shift,
    /// The task went idle after a stage
    Await,
    /// The task terminated
    Finish,
}

/// Set of subscribed events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Events(u8);

impl Events {
    /// No events
    pub const NONE: Events = Events(0);
    /// [`Event::Shift`]
    pub const SHIFT: Events = Events(1);
    /// [`Event::Await`]
    pub const AWAIT: Events = Events(1 << 1);
    /// [`Event::Finish`]
    pub const FINISH: Events = Events(1 << 2);
    /// Every event
    pub const ALL: Events = Events(0b111);

    /// Is `event` in the set
    pub fn contains(self, event: Event) -> bool {
        self.0 & Events::from(event).0 != 0
    }

    /// Is the set empty
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<Event> for Events {
    fn from(event: Event) -> Self {
        match event {
            Event::Shift => Events::SHIFT,
            Event::Await => Events::AWAIT,
            Event::Finish => Events::FINISH,
        }
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

/// Stage handlers of one task type
///
/// `work` is called once per entry with the stage the entry delivers.
/// Returning `Err` routes the failure to `error`; a panic is caught, logged
/// and counted as a failed stage.
pub trait Job: Send + 'static {
    /// Run one stage
    fn work(&mut self, cx: &mut Context<'_>, stage: Stage) -> anyhow::Result<Command>;

    /// Handle a failed stage; `nested` is set while recovering from a
    /// failure of this hook. `Unknown` means unhandled: the failure is logged
    /// and the stage counts as completed.
    fn error(&mut self, cx: &mut Context<'_>, error: &anyhow::Error, nested: bool) -> anyhow::Result<Command> {
        let _ = (cx, error, nested);
        Ok(Command::Unknown)
    }

    /// Lifecycle notification for subscribed events
    fn event(&mut self, cx: &mut Context<'_>, event: Event) -> anyhow::Result<()> {
        let _ = (cx, event);
        Ok(())
    }

    /// Name used in logs
    fn name(&self) -> Cow<'static, str> {
        let full = std::any::type_name::<Self>();
        Cow::Borrowed(full.rsplit("::").next().unwrap_or(full))
    }

    /// Human-readable name of a user stage
    fn stage_name(&self, stage: Stage) -> Option<Cow<'static, str>> {
        let _ = stage;
        None
    }
}

impl<F> Job for F
where
    F: FnMut(&mut Context<'_>, Stage) -> anyhow::Result<Command> + Send + 'static,
{
    fn work(&mut self, cx: &mut Context<'_>, stage: Stage) -> anyhow::Result<Command> {
        self(cx, stage)
    }

    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("task")
    }
}

/// What a stage handler sees of its task
///
/// Dereferences to the task handle, so every task operation is available
/// here too.
pub struct Context<'a> {
    task: &'a Arc<Task>,
    stage: Stage,
    entry: Option<&'a mut Entry>,
}

impl<'a> Context<'a> {
    fn new(task: &'a Arc<Task>, stage: Stage, entry: Option<&'a mut Entry>) -> Self {
        Self { task, stage, entry }
    }

    /// Stage being run
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Payload of the signal being delivered
    pub fn target<T: Any>(&self) -> Option<&T> {
        match self.entry.as_deref() {
            Some(Entry::Signal { target, .. }) => target.downcast_ref(),
            _ => None,
        }
    }

    /// Move the payload of the signal being delivered out of the entry
    pub fn take_target<T: Any>(&mut self) -> Option<T> {
        let Some(Entry::Signal { target, .. }) = self.entry.as_deref_mut() else {
            return None;
        };
        if !target.is::<T>() {
            return None;
        }
        let taken = std::mem::replace(target, Box::new(()) as Box<dyn Any + Send>);
        taken.downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// Take the task lock; holds left at the end of the stage are released
    pub fn lock(&mut self) {
        let lock = self.task.lock_handle();
        lock.acquire();
        self.task.with_extension(|ext| ext.locked());
    }

    /// Release one hold taken by this stage; false if it holds none
    pub fn unlock(&mut self) -> bool {
        let (held, lock) = self.task.with_extension(|ext| (ext.unlocked(), ext.lock.clone()));
        held && lock.release()
    }

    /// Watch a resource until the end of the stage or, if `durable`, until
    /// the task finishes
    pub fn watch<R: Closeable>(&mut self, resource: R, durable: bool) -> WatchId {
        self.task.with_extension(|ext| ext.watch(Box::new(resource), durable))
    }

    /// Watch a resource until the end of the stage
    pub fn watch_in<R: Closeable>(&mut self, resource: R) -> WatchId {
        self.watch(resource, false)
    }

    /// Watch a resource until the task finishes
    pub fn watch_ex<R: Closeable>(&mut self, resource: R) -> WatchId {
        self.watch(resource, true)
    }

    /// Close a watched resource now
    pub fn close(&mut self, id: WatchId) -> anyhow::Result<()> {
        let resource = self.task.with_extension(|ext| ext.detach(id));
        match resource {
            Some(resource) => resource.close(),
            None => Ok(()),
        }
    }
}

impl Deref for Context<'_> {
    type Target = Arc<Task>;

    fn deref(&self) -> &Arc<Task> {
        self.task
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreezeCause {
    /// The error hook kept failing
    Depth,
    /// Too many failed stages in a row
    Length,
}

#[derive(Default)]
struct CrashState {
    length: u32,
    cause: Option<FreezeCause>,
    error: Option<anyhow::Error>,
    stage: Option<Stage>,
}

#[derive(Default)]
struct Basket {
    /// Admitted to the conveyor or being processed
    queued: bool,
    finished: bool,
    /// The last stage failed
    crashed: bool,
    /// Waiting for the freeze timer; appends never queue
    frozen: bool,
    events: Events,
}

struct TaskInner {
    basket: Basket,
    chain: VecDeque<Entry>,
    crash: CrashState,
    extension: Option<Box<Extension>>,
}

/// Where the processed entry goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requeue {
    Front,
    Back,
}

#[derive(Debug, Default)]
struct Verdict {
    requeue: Option<Requeue>,
    call: Option<Stage>,
    stop: bool,
}

impl Verdict {
    fn stop() -> Self {
        Self {
            stop: true,
            ..Self::default()
        }
    }

    fn resume(resume: Resume, call: Option<Stage>) -> Self {
        Self {
            requeue: (resume == Resume::Requeue).then_some(Requeue::Back),
            call,
            stop: false,
        }
    }
}

/// One schedulable job bound to a conveyor
pub struct Task {
    id: TaskId,
    name: Cow<'static, str>,
    shared: Arc<Shared>,
    inner: Mutex<TaskInner>,
    job: Mutex<Box<dyn Job>>,
}

impl Task {
    pub(crate) fn new(shared: Arc<Shared>, job: Box<dyn Job>) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            name: job.name(),
            shared,
            inner: Mutex::new(TaskInner {
                basket: Basket::default(),
                chain: VecDeque::new(),
                crash: CrashState::default(),
                extension: None,
            }),
            job: Mutex::new(job),
        })
    }

    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Job name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Conveyor running this task
    pub fn conveyor(&self) -> Conveyor {
        Conveyor::from_shared(self.shared.clone())
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Deliver the start stage
    pub fn start(self: &Arc<Self>) {
        self.call(Stage::START);
    }

    /// Deliver a bare stage
    pub fn call(self: &Arc<Self>, stage: Stage) {
        self.append_entry_and_push(Entry::Call(stage));
    }

    /// Deliver a stage with a payload, read back through [`Context::target`]
    pub fn signal<T: Send + 'static>(self: &Arc<Self>, target: T, stage: Stage) {
        self.append_entry_and_push(Entry::Signal {
            stage,
            target: Box::new(target),
        });
    }

    /// Deliver `stage` once after `delay`
    pub fn delay(self: &Arc<Self>, delay: Duration, stage: Stage) -> Timer {
        self.relative_timer(TimerKind::Delay, delay, stage)
    }

    /// Deliver `stage` once at `instant`
    pub fn until(self: &Arc<Self>, instant: SystemTime, stage: Stage) -> Timer {
        self.arm_timer(TimerKind::Until, 0, to_millis(instant), stage)
    }

    /// Deliver `target` to `stage` once at `instant`, read back through
    /// [`Context::target`]
    pub fn until_with<T: Send + 'static>(self: &Arc<Self>, instant: SystemTime, stage: Stage, target: T) -> Timer {
        let instant = filed_instant(to_millis(instant));
        let entry = Arc::new(TimerEntry::deferred(Arc::downgrade(self), stage, instant, Box::new(target)));
        entry.arm(&self.shared);
        Timer::new(entry)
    }

    /// Deliver `stage` every `range`, counted from the end of each firing
    pub fn interval(self: &Arc<Self>, range: Duration, stage: Stage) -> Timer {
        self.relative_timer(TimerKind::Interval, range, stage)
    }

    /// Deliver `stage` every `range`, replaying missed ticks
    pub fn period(self: &Arc<Self>, range: Duration, stage: Stage) -> Timer {
        self.relative_timer(TimerKind::Period, range, stage)
    }

    /// Deliver `stage` on the wall-clock grid of `range`, skipping missed ticks
    pub fn regular(self: &Arc<Self>, range: Duration, stage: Stage) -> Timer {
        self.relative_timer(TimerKind::Regular, range, stage)
    }

    fn relative_timer(self: &Arc<Self>, kind: TimerKind, range: Duration, stage: Stage) -> Timer {
        let range = range_millis(range);
        self.arm_timer(kind, range, kind.first_instant(range, now_millis()), stage)
    }

    fn arm_timer(self: &Arc<Self>, kind: TimerKind, range: u64, instant: u64, stage: Stage) -> Timer {
        let entry = Arc::new(TimerEntry::new(Arc::downgrade(self), stage, kind, range, filed_instant(instant)));
        entry.arm(&self.shared);
        Timer::new(entry)
    }

    /// Deliver the ticket's outcome to `stage` once it completes
    ///
    /// The payload is the value on success and a
    /// [`TicketError`](crate::TicketError) on failure. Returns false without
    /// subscribing if the value is already there; read it with
    /// [`Ticket::take`].
    pub fn await_ticket<T: Clone + Send + 'static>(self: &Arc<Self>, ticket: &Ticket<T>, stage: Stage) -> bool {
        if ticket.status() == TicketStatus::Ready {
            return false;
        }
        self.await_ticket_ex(ticket, stage);
        true
    }

    /// Deliver the ticket's outcome to `stage`, at once if it already completed
    pub fn await_ticket_ex<T: Clone + Send + 'static>(self: &Arc<Self>, ticket: &Ticket<T>, stage: Stage) {
        let task = Arc::downgrade(self);
        ticket.sign(move |outcome| {
            let Some(task) = task.upgrade() else {
                return;
            };
            match outcome {
                Ok(value) => task.signal(value, stage),
                Err(error) => task.signal(error, stage),
            }
        });
    }

    /// Run the loop stage after every completion
    pub fn start_loop(self: &Arc<Self>) {
        self.looper().start(self);
    }

    /// Pause the loop stage for `duration`, then resume looping
    pub fn sleep(self: &Arc<Self>, duration: Duration) {
        self.looper().sleep(self, duration.as_millis() as u64);
    }

    /// Stop the loop stage
    pub fn idle(&self) {
        let looper = self.inner.lock().extension.as_ref().map(|ext| ext.looper.clone());
        if let Some(looper) = looper {
            looper.idle();
        }
    }

    /// Current mode of the loop stage
    pub fn loop_mode(&self) -> LoopMode {
        let inner = self.inner.lock();
        inner.extension.as_ref().map_or(LoopMode::Idle, |ext| ext.looper.mode())
    }

    fn looper(self: &Arc<Self>) -> Arc<LoopEntry> {
        self.with_extension(|ext| ext.looper.clone())
    }

    /// Create a backlog queue delivering to `stage`
    pub fn storage<T: Send + 'static>(self: &Arc<Self>, stage: Stage, enabled: bool) -> Storage<T> {
        Storage::new(Arc::downgrade(self), stage, enabled)
    }

    /// Choose which lifecycle events reach [`Job::event`]
    pub fn subscribe(&self, events: Events) {
        self.inner.lock().basket.events = events;
    }

    /// Lock that stages take through [`Context::lock`]; other threads use it
    /// to synchronize with the task
    pub fn lock_handle(self: &Arc<Self>) -> Arc<StageLock> {
        self.with_extension(|ext| ext.lock.clone())
    }

    /// Has the task terminated
    pub fn is_finished(&self) -> bool {
        self.inner.lock().basket.finished
    }

    /// Is the task suspended after repeated failures
    pub fn is_frozen(&self) -> bool {
        self.inner.lock().basket.frozen
    }

    /// Did the last stage fail
    pub fn is_crashed(&self) -> bool {
        self.inner.lock().basket.crashed
    }

    /// Is the task admitted to the conveyor or being processed
    pub fn is_queued(&self) -> bool {
        self.inner.lock().basket.queued
    }

    /// Has the conveyor been asked to shut down
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    pub(crate) fn with_extension<R>(self: &Arc<Self>, f: impl FnOnce(&mut Extension) -> R) -> R {
        let mut inner = self.inner.lock();
        let ext = inner.extension.get_or_insert_with(|| {
            Box::new(Extension::new(Arc::new(LoopEntry::new(Arc::downgrade(self), Stage::LOOP))))
        });
        f(ext)
    }

    /// Append an entry; true if the caller must hand the task to the conveyor
    pub(crate) fn append_entry(&self, entry: Entry) -> bool {
        let mut inner = self.inner.lock();
        if inner.basket.finished {
            return false;
        }
        inner.chain.push_back(entry);
        if inner.basket.queued || inner.basket.frozen {
            return false;
        }
        inner.basket.queued = true;
        true
    }

    pub(crate) fn append_entry_and_push(self: &Arc<Self>, entry: Entry) {
        if self.append_entry(entry) {
            self.shared.push(self.clone());
        }
    }

    pub(crate) fn deliver_shutdown(self: &Arc<Self>) {
        self.append_entry_and_push(Entry::Shutdown);
    }

    /// End of freeze; true if the caller must hand the task to the conveyor
    fn thaw(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.basket.finished || !inner.basket.frozen {
            return false;
        }
        inner.basket.frozen = false;
        inner.chain.push_front(Entry::Crash);
        info!(task = %self, "task thawed");
        if inner.basket.queued {
            return false;
        }
        inner.basket.queued = true;
        true
    }

    /// A line failed while processing the task; true if it must run again
    pub(crate) fn recover(&self) -> bool {
        let mut inner = self.inner.lock();
        let again = !inner.basket.finished && !inner.basket.frozen && !inner.chain.is_empty();
        inner.basket.queued = again;
        again
    }

    /// Run the head entry; returns the task if it must run again
    pub(crate) fn process(self: &Arc<Self>, line: &Arc<Line>) -> Option<Arc<Task>> {
        let mut entry = {
            let mut inner = self.inner.lock();
            match inner.chain.pop_front() {
                Some(entry) if !inner.basket.finished => entry,
                _ => {
                    inner.basket.queued = false;
                    return None;
                }
            }
        };

        let verdict = if let Entry::Crash = entry {
            let command = self.revive(line);
            self.clean_stage();
            self.identify_detached(command)
        } else {
            let command = self.run(line, &mut entry);
            self.clean_stage();
            self.identify(command, &entry)
        };

        let (again, event, resources) = self.settle(entry, verdict);
        if let Some(event) = event {
            self.notify(event);
        }
        if let Some(resources) = resources {
            close_all(&**self, resources);
            self.shared.retire(self.id);
        }
        again.then(|| self.clone())
    }

    fn run(self: &Arc<Self>, line: &Arc<Line>, entry: &mut Entry) -> Command {
        let stage = entry.stage();
        line.set_state(LineState::Load);
        let outcome = {
            let mut job = self.job.lock();
            let mut cx = Context::new(self, stage, Some(&mut *entry));
            panic::catch_unwind(AssertUnwindSafe(|| job.work(&mut cx, stage)))
        };
        let command = match outcome {
            Ok(Ok(command)) => {
                let mut inner = self.inner.lock();
                if inner.basket.crashed {
                    inner.basket.crashed = false;
                    inner.crash.length = 0;
                }
                command
            }
            Ok(Err(e)) => self.handle_error(Some(entry), stage, e, 0),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(task = %self, stage = %self.stage_label(stage), panic = %message, "critical failure");
                self.count_failure(stage, anyhow::anyhow!("stage panicked: {}", message));
                Command::Default
            }
        };
        line.set_state(LineState::Core);
        command
    }

    /// Route a stage failure through the error hook
    fn handle_error(
        self: &Arc<Self>,
        mut entry: Option<&mut Entry>,
        stage: Stage,
        error: anyhow::Error,
        mut depth: u32,
    ) -> Command {
        let mut error = error;
        let command = loop {
            let outcome = {
                let mut job = self.job.lock();
                let mut cx = Context::new(self, stage, entry.as_deref_mut());
                panic::catch_unwind(AssertUnwindSafe(|| job.error(&mut cx, &error, depth > 0)))
            };
            let failure = match outcome {
                Ok(Ok(Command::Unknown)) => {
                    let detail = format!("{:#}", error);
                    error!(task = %self, stage = %self.stage_label(stage), error = %detail, "unhandled error");
                    break Command::Default;
                }
                Ok(Ok(command)) => break command,
                Ok(Err(e)) => e,
                Err(payload) => anyhow::anyhow!("error hook panicked: {}", panic_message(payload.as_ref())),
            };
            depth += 1;
            error!(task = %self, stage = %self.stage_label(stage), depth, error = %failure, "error recursion");
            if depth < MAX_DEPTH {
                error = failure;
                continue;
            }
            self.freeze(FreezeCause::Depth, stage, failure);
            return Command::Repeat;
        };
        self.count_failure(stage, error);
        command
    }

    fn count_failure(self: &Arc<Self>, stage: Stage, error: anyhow::Error) {
        let length = {
            let mut inner = self.inner.lock();
            inner.basket.crashed = true;
            inner.crash.length += 1;
            inner.crash.length
        };
        if length >= MAX_LENGTH {
            warn!(task = %self, failures = length, "repeated failures");
            self.freeze(FreezeCause::Length, stage, error);
        }
    }

    fn freeze(self: &Arc<Self>, cause: FreezeCause, stage: Stage, error: anyhow::Error) {
        let freeze_ms = self.shared.freeze_ms();
        {
            let mut inner = self.inner.lock();
            if inner.basket.finished {
                return;
            }
            inner.basket.frozen = true;
            inner.basket.crashed = true;
            inner.crash.cause = Some(cause);
            inner.crash.error = Some(error);
            inner.crash.stage = Some(stage);
        }
        error!(task = %self, stage = %self.stage_label(stage), ?cause, freeze_ms, "task frozen");
        let thaw = Arc::new(Thaw {
            id: next_waiting_id(),
            owner: Arc::downgrade(self),
        });
        self.shared.keeper.push(&self.shared, thaw, now_millis() + freeze_ms);
    }

    /// Resume failure handling after a freeze
    fn revive(self: &Arc<Self>, line: &Arc<Line>) -> Command {
        let (cause, error, stage) = {
            let mut inner = self.inner.lock();
            let crash = &mut inner.crash;
            (crash.cause.take(), crash.error.take(), crash.stage.take())
        };
        match (cause, error) {
            (Some(FreezeCause::Depth), Some(error)) => {
                line.set_state(LineState::Load);
                let command = self.handle_error(None, stage.unwrap_or(Stage::START), error, 1);
                line.set_state(LineState::Core);
                command
            }
            _ => {
                self.inner.lock().crash.length = MAX_LENGTH - 1;
                Command::Default
            }
        }
    }

    /// Release whatever the stage left behind
    fn clean_stage(&self) {
        let (held, staged, lock) = {
            let mut inner = self.inner.lock();
            match inner.extension.as_mut() {
                Some(ext) if ext.is_dirty() => {
                    let (held, staged) = ext.take_stage();
                    (held, staged, ext.lock.clone())
                }
                _ => return,
            }
        };
        for _ in 0..held {
            lock.release();
        }
        close_all(self, staged);
    }

    fn identify(&self, command: Command, entry: &Entry) -> Verdict {
        match command {
            Command::Default => Verdict::resume(entry.resume(&self.shared, now_millis()), None),
            Command::Goto(stage) => Verdict::resume(entry.resume(&self.shared, now_millis()), Some(stage)),
            Command::Repeat => Verdict {
                requeue: Some(Requeue::Front),
                ..Verdict::default()
            },
            Command::Cancel => {
                entry.cancel();
                entry.release();
                Verdict::default()
            }
            Command::Unknown if entry.is_shutdown() => Verdict::stop(),
            Command::Unknown => {
                warn!(task = %self, entry = ?entry, stage = %self.stage_label(entry.stage()), "task doesn't know stage");
                entry.release();
                Verdict::default()
            }
            Command::Finish => Verdict::stop(),
            Command::Failed => {
                warn!(task = %self, stage = %self.stage_label(entry.stage()), "task failed");
                Verdict::stop()
            }
        }
    }

    /// Apply a command that no longer has its entry
    fn identify_detached(&self, command: Command) -> Verdict {
        match command {
            Command::Default | Command::Repeat => Verdict::default(),
            Command::Goto(stage) => Verdict {
                call: Some(stage),
                ..Verdict::default()
            },
            Command::Finish | Command::Failed => Verdict::stop(),
            Command::Unknown | Command::Cancel => {
                warn!(task = %self, ?command, "wrong command after failure recovery");
                Verdict::default()
            }
        }
    }

    /// Apply a verdict under the task lock
    ///
    /// Returns whether the task runs again, the event to notify and, once
    /// the task finished, the resources left to close.
    fn settle(&self, entry: Entry, verdict: Verdict) -> (bool, Option<Event>, Option<Vec<Box<dyn Closeable>>>) {
        let mut inner = self.inner.lock();
        let mut resources = None;
        if verdict.stop {
            entry.cancel();
            if !inner.basket.finished {
                inner.basket.finished = true;
                inner.basket.frozen = false;
                for pending in inner.chain.drain(..) {
                    pending.cancel();
                }
                let mut closing = Vec::new();
                if let Some(ext) = inner.extension.as_mut() {
                    ext.looper.idle();
                    closing = ext.take_all();
                }
                resources = Some(closing);
            }
        } else if !inner.basket.finished {
            if let Some(stage) = verdict.call {
                inner.chain.push_back(Entry::Call(stage));
            }
            match verdict.requeue {
                Some(Requeue::Front) => inner.chain.push_front(entry),
                Some(Requeue::Back) => inner.chain.push_back(entry),
                None => {}
            }
        }

        let basket = &inner.basket;
        let again = !basket.finished && !basket.frozen && !inner.chain.is_empty();
        let events = basket.events;
        let event = if basket.finished {
            (resources.is_some() && events.contains(Event::Finish)).then_some(Event::Finish)
        } else if again {
            events.contains(Event::Shift).then_some(Event::Shift)
        } else {
            events.contains(Event::Await).then_some(Event::Await)
        };
        inner.basket.queued = again;
        (again, event, resources)
    }

    fn notify(self: &Arc<Self>, event: Event) {
        let stage = Stage::START;
        let outcome = {
            let mut job = self.job.lock();
            let mut cx = Context::new(self, stage, None);
            panic::catch_unwind(AssertUnwindSafe(|| job.event(&mut cx, event)))
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let detail = format!("{:#}", e);
                error!(task = %self, ?event, error = %detail, "error in event handler")
            }
            Err(payload) => {
                error!(task = %self, ?event, panic = %panic_message(payload.as_ref()), "error in event handler")
            }
        }
    }

    fn stage_label(&self, stage: Stage) -> String {
        if stage.is_system() {
            return stage.to_string();
        }
        match self.job.try_lock().and_then(|job| job.stage_name(stage)) {
            Some(name) => format!("{} {}", stage, name),
            None => stage.to_string(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id.0)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("entries", &inner.chain.len())
            .field("queued", &inner.basket.queued)
            .field("finished", &inner.basket.finished)
            .field("frozen", &inner.basket.frozen)
            .finish()
    }
}

/// Freeze timer of a task
struct Thaw {
    id: u64,
    owner: Weak<Task>,
}

impl Waiting for Thaw {
    fn id(&self) -> u64 {
        self.id
    }

    fn wakeup(self: Arc<Self>, _shared: &Arc<Shared>, _instant: u64) -> Option<Arc<Task>> {
        let owner = self.owner.upgrade()?;
        owner.thaw().then_some(owner)
    }
}

/// The keeper reads instant 0 as "nothing waiting"
fn filed_instant(instant: u64) -> u64 {
    instant.max(1)
}

/// Text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
