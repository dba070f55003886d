//! Core domain types: jobs, handlers, retry policies and schedules.

pub mod handler;
pub mod job;
pub mod pipeline;
pub mod retry;
pub mod schedule;
pub mod types;
