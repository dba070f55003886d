//! Job handlers and the registry that maps job types to them.
//!
//! The `JobHandler` trait is the engine's only view of the work a job
//! performs. Implement it (or pass a closure to
//! [`HandlerRegistry::register_fn`]) and register it under a job type.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

use super::retry::RetryPolicy;
use super::types::{JobId, JobType};

/// Errors returned by a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Execution failed; retried while attempts remain.
    #[error("execution failed: {0}")]
    Failed(String),

    /// Failure that no amount of retrying will fix.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The handler exceeded its configured timeout.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Shorthand for a retryable failure.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// Shorthand for a non-retryable failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Permanent(message.into())
    }

    /// Whether this error must never be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }
}

/// Everything a handler learns about the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: JobType,
    /// 1-indexed attempt number of this execution.
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: Value,
    pub correlation_id: Option<String>,
}

impl JobContext {
    /// Deserialize the payload into a typed value.
    ///
    /// A payload that does not match `T` is reported as a permanent failure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| HandlerError::permanent(format!("invalid payload: {}", e)))
    }

    /// Whether this is the last attempt the job will get.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// The work performed for one job type.
///
/// # Example
///
/// ```ignore
/// use hopper::{HandlerError, JobContext, JobHandler};
/// use async_trait::async_trait;
///
/// struct SendEmail;
///
/// #[async_trait]
/// impl JobHandler for SendEmail {
///     async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError> {
///         let to: String = ctx.payload_as()?;
///         // deliver...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job.
    ///
    /// # Returns
    /// * `Ok(())` - The job completed
    /// * `Err(HandlerError)` - The attempt failed
    async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        (self.f)(ctx.clone()).await
    }
}

/// Per-type execution settings.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Overrides the engine-wide retry policy.
    pub retry_policy: Option<RetryPolicy>,
    /// Default `max_attempts` for jobs of this type.
    pub max_attempts: Option<u32>,
    /// Abort an attempt that runs longer than this.
    pub timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Builder: set the default max attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Builder: set the attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Errors that can occur when registering handlers.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Job type names must not be empty.
    #[error("job type must not be empty")]
    EmptyJobType,

    /// `max_attempts` must be at least 1.
    #[error("max_attempts must be at least 1 for job type: {0}")]
    InvalidMaxAttempts(String),
}

/// A handler together with its options.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn JobHandler>,
    pub options: HandlerOptions,
}

/// Maps job types to handlers.
///
/// One registry is built per engine; there is no process-wide table.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<JobType, RegisteredHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler with default options.
    pub fn register(
        &self,
        job_type: impl Into<JobType>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        self.register_with(job_type, handler, HandlerOptions::default())
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(
        &self,
        job_type: impl Into<JobType>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler::new(f)))
    }

    /// Register a handler with explicit options.
    ///
    /// Registering the same type twice replaces the earlier handler.
    pub fn register_with(
        &self,
        job_type: impl Into<JobType>,
        handler: Arc<dyn JobHandler>,
        options: HandlerOptions,
    ) -> Result<(), RegistryError> {
        let job_type = job_type.into();
        if job_type.as_str().trim().is_empty() {
            return Err(RegistryError::EmptyJobType);
        }
        if options.max_attempts == Some(0) {
            return Err(RegistryError::InvalidMaxAttempts(job_type.to_string()));
        }

        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers
            .insert(job_type.clone(), RegisteredHandler { handler, options })
            .is_some()
        {
            tracing::warn!(job_type = %job_type, "Replacing previously registered handler");
        } else {
            tracing::debug!(job_type = %job_type, "Registered handler");
        }
        Ok(())
    }

    /// Look up the handler for a job type.
    pub fn get(&self, job_type: &JobType) -> Option<RegisteredHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    /// Whether a handler is registered for the type.
    pub fn contains(&self, job_type: &JobType) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
