//! Stage identifiers and the commands a stage handler returns
//!
//! A stage is a named resumption point of a task. User stages are small
//! non-negative integers chosen by the task author; a handful of system
//! stages are predefined and delivered by the scheduler itself.
//!
//! A command tells the scheduler what to do with the entry that was just
//! processed. Commands have a compact 32-bit encoding: bits 31..29 select the
//! class, bit 28 marks an embedded stage and bits 27..0 carry that stage.

use std::fmt;

/// Bit that marks a predefined system stage
const SYSTEM_STAGE: u32 = 0x0800_0000;

/// Mask for the stage payload inside an encoded command
const STAGE_MASK: u32 = 0x0FFF_FFFF;

/// Bit that marks an embedded stage inside an encoded command
const HAS_STAGE: u32 = 0x1000_0000;

/// Shift of the command class inside an encoded command
const CLASS_SHIFT: u32 = 29;

/// A resumption point in a task's stage handler
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Stage(u32);

impl Stage {
    /// Largest user stage id
    pub const MAX_USER: u32 = SYSTEM_STAGE - 1;

    /// Delivered by [`Task::start`](crate::Task::start)
    pub const START: Stage = Stage(SYSTEM_STAGE | 1);
    /// Built-in loop stage driven by `start_loop`/`sleep`/`idle`
    pub const LOOP: Stage = Stage(SYSTEM_STAGE | 2);
    /// Default stage for signals without an explicit stage
    pub const SIGNAL: Stage = Stage(SYSTEM_STAGE | 3);
    /// Default stage for timers without an explicit stage
    pub const TIMER: Stage = Stage(SYSTEM_STAGE | 4);
    /// Delivered to every live task when its scheduler shuts down
    pub const SHUTDOWN: Stage = Stage(SYSTEM_STAGE | 5);

    /// Create a user stage
    ///
    /// Ids above [`Stage::MAX_USER`] are truncated into the user range.
    pub const fn new(id: u32) -> Self {
        Stage(id & Self::MAX_USER)
    }

    /// Raw stage id
    pub const fn id(self) -> u32 {
        self.0
    }

    /// Is this one of the predefined system stages
    pub const fn is_system(self) -> bool {
        self.0 & SYSTEM_STAGE != 0
    }

    /// Name of a predefined system stage
    pub fn system_name(self) -> Option<&'static str> {
        match self {
            Stage::START => Some("$Start"),
            Stage::LOOP => Some("$Loop"),
            Stage::SIGNAL => Some("$Signal"),
            Stage::TIMER => Some("$Timer"),
            Stage::SHUTDOWN => Some("$Shutdown"),
            _ => None,
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.system_name() {
            Some(name) => f.write_str(name),
            None if self.is_system() => write!(f, "$System#{}", self.0 & !SYSTEM_STAGE),
            None => write!(f, "#{}", self.0),
        }
    }
}

impl From<u32> for Stage {
    fn from(id: u32) -> Self {
        Stage::new(id)
    }
}

/// What to do with the entry that was just processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    /// Continue; the entry decides itself whether it repeats
    #[default]
    Default,
    /// Continue and append a call of the given stage
    Goto(Stage),
    /// Stage was not recognized
    Unknown,
    /// Process the same entry again before anything else
    Repeat,
    /// Stop further auto-repetition of a repeating entry
    Cancel,
    /// Terminate the task
    Finish,
    /// Terminate the task, reporting failure
    Failed,
}

impl Command {
    const CLASS_DEFAULT: u32 = 0;
    const CLASS_REPEAT: u32 = 1;
    const CLASS_CANCEL: u32 = 2;
    const CLASS_UNKNOWN: u32 = 3;
    const CLASS_FINISH: u32 = 4;
    const CLASS_FAILED: u32 = 5;

    /// Pack the command into its 32-bit encoding
    pub fn to_bits(self) -> u32 {
        let class = match self {
            Command::Default | Command::Goto(_) => Self::CLASS_DEFAULT,
            Command::Repeat => Self::CLASS_REPEAT,
            Command::Cancel => Self::CLASS_CANCEL,
            Command::Unknown => Self::CLASS_UNKNOWN,
            Command::Finish => Self::CLASS_FINISH,
            Command::Failed => Self::CLASS_FAILED,
        };
        let stage = match self {
            Command::Goto(stage) => HAS_STAGE | (stage.0 & STAGE_MASK),
            _ => 0,
        };
        (class << CLASS_SHIFT) | stage
    }

    /// Decode a packed command; unknown classes decode as [`Command::Unknown`]
    pub fn from_bits(bits: u32) -> Self {
        match bits >> CLASS_SHIFT {
            Self::CLASS_DEFAULT if bits & HAS_STAGE != 0 => Command::Goto(Stage(bits & STAGE_MASK)),
            Self::CLASS_DEFAULT => Command::Default,
            Self::CLASS_REPEAT => Command::Repeat,
            Self::CLASS_CANCEL => Command::Cancel,
            Self::CLASS_FINISH => Command::Finish,
            Self::CLASS_FAILED => Command::Failed,
            _ => Command::Unknown,
        }
    }

    /// Does this command terminate the task
    pub fn is_terminal(self) -> bool {
        matches!(self, Command::Finish | Command::Failed)
    }
}

impl From<Stage> for Command {
    fn from(stage: Stage) -> Self {
        Command::Goto(stage)
    }
}
