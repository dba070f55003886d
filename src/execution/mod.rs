//! Job execution.
//!
//! This module provides the worker pool that takes jobs from the ready
//! queue and runs their handlers.

mod worker;

pub use worker::{WorkerContext, WorkerPool};
