//! Snapshot of scheduler counters for monitoring

use std::fmt;

/// What a line is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineState {
    /// Parked, waiting for work
    Idle,
    /// Running scheduler code
    Core,
    /// Running a task's stage handler
    Load,
    /// Lent to the timer keeper
    Keeper,
}

impl LineState {
    /// Short label used in summaries
    pub fn label(self) -> char {
        match self {
            LineState::Idle => '.',
            LineState::Core => 'c',
            LineState::Load => 'L',
            LineState::Keeper => 'k',
        }
    }
}

/// Point-in-time view of a conveyor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConveyorStats {
    /// Conveyor name
    pub name: String,
    /// Configured number of lines
    pub capacity: usize,
    /// Lines admitted to tasks
    pub load: usize,
    /// Tasks waiting for a free line
    pub queued: usize,
    /// Entries waiting in the timer keeper
    pub timers: usize,
    /// Tasks that have not finished
    pub tasks: usize,
    /// State of every started line
    pub lines: Vec<LineState>,
    /// Shutdown has been requested
    pub shutdown: bool,
    /// Every task finished and lines are being stopped
    pub finished: bool,
}

impl ConveyorStats {
    /// Lines currently running a stage handler
    pub fn busy_lines(&self) -> usize {
        self.lines.iter().filter(|s| **s == LineState::Load).count()
    }

    /// Is a line lent to the timer keeper
    pub fn has_keeper(&self) -> bool {
        self.lines.contains(&LineState::Keeper)
    }
}

impl fmt::Display for ConveyorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} load {}/{} queue {} timers {} tasks {} [",
            self.name, self.load, self.capacity, self.queued, self.timers, self.tasks
        )?;
        for state in &self.lines {
            write!(f, "{}", state.label())?;
        }
        f.write_str("]")?;
        if self.finished {
            f.write_str(" finished")
        } else if self.shutdown {
            f.write_str(" shutdown")
        } else {
            Ok(())
        }
    }
}
