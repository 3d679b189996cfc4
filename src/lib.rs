//! # foreman
//!
//! Controller that keeps a prioritized task table and a small pool of
//! autonomous coding-agent sessions in agreement.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐  fetch / update   ┌────────────────────────────┐
//!   │ Record store │ ◀───────────────▶ │         Scheduler          │
//!   │ memory/file/ │                   │ merge → dispatch → supervise│
//!   │    sqlite    │                   └──────┬──────────────┬──────┘
//!   └──────────────┘                          │              │
//!                                             ▼              ▼
//!                                  ┌────────────────┐ ┌────────────────┐
//!                                  │ Decision oracle│ │Session manager │
//!                                  │  (LlmBackend)  │ │  (Isolation)   │
//!                                  └────────────────┘ └────────────────┘
//! ```
//!
//! ## Cycle
//! 1. Fetch the task table (or reuse it when the change marker is unchanged)
//! 2. Merge external edits; external `Blocked` always wins
//! 3. Drop tasks that left the table, requeue incomplete ones
//! 4. Ask the oracle whether pending tasks need a plan, then start sessions
//! 5. Supervise running sessions: completion, timeout, stalls
//! 6. Write changed status back
//!
//! ## Modules
//! - `task`: task representation and the pure state machine
//! - `store`: record store trait and backends
//! - `session`: agent sessions over a pluggable isolation mechanism
//! - `llm`: model backends
//! - `oracle`: structured planning, completion and stall verdicts
//! - `scheduler`: the reconciliation loop

pub mod config;
pub mod llm;
pub mod oracle;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod task;
pub mod util;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use scheduler::{ControllerError, CycleReport, Scheduler};
