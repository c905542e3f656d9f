//! Line: worker thread that advances tasks
//!
//! A line holds at most one assignment at a time. It runs a task stage by
//! stage, asks the conveyor for its next task, and parks when there is
//! nothing to do. A line lent to the timer keeper parks with a deadline
//! instead.

use crate::conveyor::Shared;
use crate::stats::LineState;
use crate::task::{panic_message, Task};
use crate::time;
use crossbeam::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, warn};

/// What a line has been told to do next
pub(crate) enum Assignment {
    /// Advance a task
    Task(Arc<Task>),
    /// Keep time for the conveyor
    Keeper,
    /// Stop the thread
    Kill,
}

struct Slot {
    assignment: Option<Assignment>,
    /// Keeper deadline changed while parked
    kicked: bool,
}

/// Worker thread of a conveyor
pub(crate) struct Line {
    id: usize,
    name: String,
    slot: Mutex<Slot>,
    signal: Condvar,
    state: AtomicCell<LineState>,
    /// Kernel thread id once running, 0 before
    native: AtomicI64,
}

impl Line {
    pub(crate) fn new(id: usize, conveyor: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: format!("{}-line-{}", conveyor, id),
            slot: Mutex::new(Slot {
                assignment: None,
                kicked: false,
            }),
            signal: Condvar::new(),
            state: AtomicCell::new(LineState::Idle),
            native: AtomicI64::new(0),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn state(&self) -> LineState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: LineState) {
        self.state.store(state);
    }

    /// Start the thread
    pub(crate) fn start(self: &Arc<Self>, shared: Arc<Shared>) -> io::Result<()> {
        let line = Arc::clone(self);
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || line.run(shared))?;
        Ok(())
    }

    /// Hand over the next assignment and wake the line
    pub(crate) fn unpark(&self, assignment: Assignment) {
        let mut slot = self.slot.lock();
        slot.assignment = Some(assignment);
        self.signal.notify_one();
    }

    /// Wake a line parked by the keeper so that it picks up a new deadline
    pub(crate) fn kick(&self) {
        let mut slot = self.slot.lock();
        slot.kicked = true;
        self.signal.notify_one();
    }

    pub(crate) fn take_assignment(&self) -> Option<Assignment> {
        let mut slot = self.slot.lock();
        slot.kicked = false;
        slot.assignment.take()
    }

    /// Park until an assignment arrives
    fn park(&self) -> Assignment {
        let mut slot = self.slot.lock();
        loop {
            if let Some(assignment) = slot.assignment.take() {
                slot.kicked = false;
                return assignment;
            }
            self.signal.wait(&mut slot);
        }
    }

    /// Park until `deadline` (epoch millis), a kick, or an assignment
    pub(crate) fn park_until(&self, deadline: Option<u64>) {
        let mut slot = self.slot.lock();
        loop {
            if slot.assignment.is_some() || std::mem::take(&mut slot.kicked) {
                return;
            }
            match deadline {
                None => self.signal.wait(&mut slot),
                Some(deadline) => match time::until(deadline) {
                    Some(left) => {
                        self.signal.wait_for(&mut slot, left);
                    }
                    None => return,
                },
            }
        }
    }

    /// Apply OS niceness to the running thread
    pub(crate) fn apply_priority(&self, nice: i32) -> io::Result<()> {
        match self.native.load(Ordering::Acquire) {
            0 => Ok(()),
            tid => set_thread_nice(tid, nice),
        }
    }

    fn run(self: Arc<Self>, shared: Arc<Shared>) {
        self.native.store(current_tid(), Ordering::Release);
        if let Some(nice) = shared.priority() {
            if let Err(e) = self.apply_priority(nice) {
                warn!(line = %self.name, nice, error = %e, "failed to set line priority");
            }
        }
        debug!(line = %self.name, id = self.id(), "line launched");

        let mut next: Option<Assignment> = None;
        loop {
            let assignment = match next.take() {
                Some(assignment) => assignment,
                None => {
                    self.set_state(LineState::Idle);
                    self.park()
                }
            };
            next = match assignment {
                Assignment::Kill => break,
                Assignment::Task(task) => {
                    self.set_state(LineState::Core);
                    self.serve(&shared, task)
                }
                Assignment::Keeper => self.keep(&shared),
            };
        }

        self.set_state(LineState::Idle);
        debug!(line = %self.name, "line stopped");
        shared.line_exited();
    }

    fn serve(self: &Arc<Self>, shared: &Arc<Shared>, task: Arc<Task>) -> Option<Assignment> {
        match panic::catch_unwind(AssertUnwindSafe(|| task.process(self))) {
            Ok(again) => shared.swap(self, again),
            Err(payload) => {
                error!(
                    line = %self.name,
                    task = %task,
                    panic = %panic_message(payload.as_ref()),
                    "line failure, task returned to conveyor"
                );
                let again = task.recover().then_some(task);
                shared.swap(self, again)
            }
        }
    }

    fn keep(self: &Arc<Self>, shared: &Arc<Shared>) -> Option<Assignment> {
        match panic::catch_unwind(AssertUnwindSafe(|| shared.keeper.process(shared, self))) {
            Ok(next) => next,
            Err(payload) => {
                error!(
                    line = %self.name,
                    panic = %panic_message(payload.as_ref()),
                    "line failure while keeping time"
                );
                shared.keeper_failed(self);
                None
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn current_tid() -> i64 {
    // SAFETY: gettid has no preconditions
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> i64 {
    0
}

#[cfg(target_os = "linux")]
fn set_thread_nice(tid: i64, nice: i32) -> io::Result<()> {
    // SAFETY: setpriority only reads its integer arguments
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_nice(_tid: i64, _nice: i32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_line_creation() {
        let line = Line::new(3, "unit");
        assert_eq!(line.id(), 3);
        assert_eq!(line.name, "unit-line-3");
        assert_eq!(line.state(), LineState::Idle);
        assert!(line.take_assignment().is_none());
    }

    #[test]
    fn test_unpark_before_park_is_not_lost() {
        let line = Line::new(0, "unit");
        line.unpark(Assignment::Kill);
        assert!(matches!(line.park(), Assignment::Kill));
    }

    #[test]
    fn test_park_until_deadline() {
        let line = Line::new(0, "unit");
        let start = Instant::now();
        line.park_until(Some(time::now_millis() + 30));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_kick_wakes_parked_line() {
        let line = Line::new(0, "unit");
        let kicker = line.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            kicker.kick();
        });
        let start = Instant::now();
        line.park_until(None);
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
        assert!(!line.slot.lock().kicked);
    }

    #[test]
    fn test_assignment_interrupts_keeper_sleep() {
        let line = Line::new(0, "unit");
        line.unpark(Assignment::Keeper);
        line.park_until(Some(time::now_millis() + 60_000));
        assert!(matches!(line.take_assignment(), Some(Assignment::Keeper)));
    }
}
