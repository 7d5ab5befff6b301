pub mod astronomy;
pub mod command;
pub mod config;
pub mod occupancy;
pub mod schedule;
pub mod scheduler;
pub mod time;
pub mod topics;
pub mod types;
pub mod uri;

#[cfg(test)]
mod test_support;

pub use astronomy::{AstronomyError, Fetch, FetchError, FetchResponse, RetryPolicy};
pub use command::ControlCommand;
pub use config::{EngineConfig, RuntimeConfig, SchedulerConfiguration, TaskConfig};
pub use schedule::{EdgeCallback, EventKind, Task};
pub use scheduler::{Host, SchedulerEngine};
pub use time::{format_iso, Clock, TimeSymbol};
pub use topics::*;
pub use types::{SchedulerStatus, SwitchState, TaskView};
