//! Delegation subsystem.
//!
//! [`spawner::ChildSpawner`] runs one task in an isolated child process,
//! [`queue::TaskQueue`] accumulates tasks and dispatches them in priority
//! order, and [`recursion::RecursionContext`] bounds how deep the tree of
//! processes can grow. Shared vocabulary lives in [`types`].

pub mod queue;
pub mod recursion;
pub mod spawner;
pub mod types;

pub use queue::TaskQueue;
pub use recursion::RecursionContext;
pub use spawner::{ChildSpawner, SpawnerConfig};
pub use types::{ChildResult, QueueStatus, Task, TaskId, TaskSpec, TaskStatus};
