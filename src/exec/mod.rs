//! Child process execution with wall-clock limits.

pub mod process;

pub use process::{run_process, CaptureLimits, ExecResult};
