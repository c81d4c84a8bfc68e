//! Shared runtime utilities.

pub mod bootstrap;
pub mod retry;
pub mod task;

pub use task::{Shutdown, TaskHandle};
