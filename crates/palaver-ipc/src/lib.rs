//! `palaver-ipc`: routes asynchronous commands to IPC extensions and fires
//! configured schedules as commands.

pub mod engine;
pub mod router;
pub mod schedule;

pub use engine::{ScheduleEngine, ScheduledCommand};
pub use router::{IpcCommandRouter, IpcCommandRouterBuilder};
pub use schedule::compute_next_run;
