//! Task module - the in-memory task model and its state machine.
//!
//! - `task`: the `Task` record and its status
//! - `machine`: the pure transition function and the events that drive it
//!
//! Only the scheduler mutates tasks, and only through `Task::apply`.

mod machine;
pub mod task;

pub use machine::{transition, CompletionOutcome, TaskEvent, TransitionError};
pub use task::{Task, TaskStatus};
