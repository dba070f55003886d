//! Queues that hold jobs between submission and execution.

mod delay;
mod ready;

pub use delay::{DelayQueue, Promoter};
pub use ready::ReadyQueue;
