//! Conveyor: cooperative stage-based task scheduling
//!
//! This crate runs very large numbers of lightweight stateful tasks over a
//! small bounded pool of worker threads ("lines"). Each task advances through
//! explicit resumption points ("stages") instead of owning a thread:
//! - Task state machine with an ordered entry chain
//! - Entries: calls, signals, storages, timers, loops
//! - Scheduler (solo and multi-line variants) with cooperative shutdown
//! - Timer keeper that borrows one idle line to sleep until the next deadline
//! - Failure recovery with freeze and automatic retry
//! - Tickets: one-shot results delivered to subscribed tasks

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod command;
pub mod config;
pub mod conveyor;
pub mod entry;
pub mod extension;
mod keeper;
mod line;
pub mod solo;
pub mod stats;
pub mod storage;
pub mod task;
pub mod ticket;
pub mod time;

pub use command::{Command, Stage};
pub use config::{ConfigError, ConveyorConfig, PoolKind};
pub use conveyor::{join_shutdown, shutdown_all, Conveyor};
pub use entry::{LoopMode, Timer, TimerKind};
pub use extension::{Closeable, StageLock, StageLockGuard, WatchId};
pub use solo::SoloTask;
pub use stats::{ConveyorStats, LineState};
pub use storage::{Reader, Storage, Writer};
pub use task::{Context, Event, Events, Job, Task, TaskHandle, TaskId};
pub use ticket::{Ticket, TicketError, TicketStatus};

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    /// Admission requested with every line already loaded
    #[error("can't wake line, all {capacity} lines of conveyor `{name}` have load")]
    Overload {
        /// Conveyor name
        name: String,
        /// Configured number of lines
        capacity: usize,
    },

    /// The conveyor no longer accepts tasks
    #[error("conveyor `{0}` is shut down")]
    Shutdown(String),

    /// A line thread could not be started
    #[error("failed to spawn line thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Line niceness could not be applied
    #[error("failed to set line priority: {0}")]
    Priority(#[source] std::io::Error),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Scheduler result
pub type Result<T> = std::result::Result<T, ConveyorError>;
