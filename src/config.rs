//! Controller configuration
//!
//! Built from CLI flags in `main`; library code only sees this struct.

use std::time::Duration;

use crate::orchestrator::OrchestratorSettings;
use crate::resources::PipelineImages;
use crate::retry::RetryConfig;
use crate::Error;

/// Settings of the controller and its training runs
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Namespace to watch; None watches every namespace
    pub namespace: Option<String>,
    /// Number of requests reconciled concurrently
    pub workers: u16,
    /// Reconcile attempts per request for retryable errors
    pub max_attempts: u32,
    /// Reconcile attempts per request while a dependency is not visible yet
    pub not_ready_attempts: u32,
    /// Requeue delay after a failed reconcile, by attempt
    pub requeue: RetryConfig,
    /// Fallback poll schedule of the completion tracker
    pub poll: RetryConfig,
    /// Images of the split and update-model Jobs
    pub images: PipelineImages,
    /// Deadline for a Job to reach a terminal state
    pub job_timeout: Duration,
    /// Deadline for a deleted Job to leave the cache
    pub deletion_timeout: Duration,
    /// Deadline for a single cluster API call
    pub api_timeout: Duration,
    /// Deadline for the watch caches to load at startup
    pub sync_timeout: Duration,
    /// How long shutdown waits for training runs to observe cancellation
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 4,
            max_attempts: 3,
            not_ready_attempts: 10,
            requeue: RetryConfig::bounded(Duration::from_millis(5), Duration::from_secs(60)),
            poll: RetryConfig::bounded(Duration::from_millis(100), Duration::from_secs(5)),
            images: PipelineImages::default(),
            job_timeout: Duration::from_secs(3600),
            deletion_timeout: Duration::from_secs(120),
            api_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ControllerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::validation("workers must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(Error::validation("max attempts must be at least 1"));
        }
        if self.not_ready_attempts == 0 {
            return Err(Error::validation("not-ready attempts must be at least 1"));
        }
        if let Some(ns) = &self.namespace {
            if ns.is_empty() {
                return Err(Error::validation("namespace cannot be empty"));
            }
        }
        if self.images.split.trim().is_empty() || self.images.update.trim().is_empty() {
            return Err(Error::validation("split and update images must be set"));
        }
        for (name, value) in [
            ("job timeout", self.job_timeout),
            ("deletion timeout", self.deletion_timeout),
            ("api timeout", self.api_timeout),
            ("sync timeout", self.sync_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::validation(format!("{} must be positive", name)));
            }
        }
        if self.requeue.initial_delay > self.requeue.max_delay
            || self.poll.initial_delay > self.poll.max_delay
        {
            return Err(Error::validation(
                "backoff initial delay cannot exceed its maximum",
            ));
        }
        Ok(())
    }

    /// Settings handed to every training run
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            job_timeout: self.job_timeout,
            deletion_timeout: self.deletion_timeout,
            images: self.images.clone(),
        }
    }
}
