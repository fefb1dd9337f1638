//! Shared agent-loop abstractions for the OpFlex OVS rendering agent.
//!
//! - [`Orch`]: base trait for managers driven by the agent loop
//! - [`TaskQueue`] / [`StartupDelayGate`]: C8, the per-key debouncing task queue
//! - [`IdGenerator`]: C1, namespace-scoped persisted ID allocation
//! - [`SyncMap`]: a map that never auto-vivifies on read
//! - [`TaskStatus`] / [`TaskError`]: the error taxonomy result type
//! - [`RetryCache`]: dependency-constrained task retry (transient-object errors)
//!
//! # Architecture
//!
//! MODB listener callbacks enqueue per-key tasks on a [`TaskQueue`]; a
//! manager implementing [`Orch`] drains its queue in `do_task()`, computes
//! the desired flow/group set, diffs it against cached table state, and
//! submits the edits to the switch connection.

mod idgen;
mod orch;
mod retry;
mod sync_map;
mod task;
mod taskqueue;

pub use idgen::{IdGenError, IdGenResult, IdGenerator, EMPTY_STRING_ID, ID_EXHAUSTED};
pub use orch::{Orch, Orch2, OrchContext};
pub use retry::{Constraint, RetryCache};
pub use sync_map::SyncMap;
pub use task::{TaskError, TaskResult, TaskResultExt, TaskStatus};
pub use taskqueue::{StartupDelayGate, TaskQueue};
