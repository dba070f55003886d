//! Multi-step handlers.
//!
//! A [`Pipeline`] runs an ordered list of steps inside a single job, so a
//! chain of work (fetch, resize, upload, ...) shares one retry budget and
//! one lifecycle instead of each step enqueuing the next.

use async_trait::async_trait;
use std::sync::Arc;

use super::handler::{HandlerError, JobContext, JobHandler};

/// An ordered list of named steps executed as one handler.
///
/// Steps run sequentially; the first error aborts the pipeline and is
/// returned with the step name prefixed. A retry re-runs the pipeline from
/// the first step, so steps should be idempotent.
#[derive(Default, Clone)]
pub struct Pipeline {
    steps: Vec<(String, Arc<dyn JobHandler>)>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: append a step.
    pub fn step(mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.steps.push((name.into(), handler));
        self
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        for (name, step) in &self.steps {
            tracing::debug!(job_id = %ctx.job_id, step = %name, "Running pipeline step");
            step.handle(ctx).await.map_err(|e| match e {
                HandlerError::Permanent(msg) => {
                    HandlerError::Permanent(format!("step '{}': {}", name, msg))
                }
                HandlerError::Failed(msg) => {
                    HandlerError::Failed(format!("step '{}': {}", name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}
