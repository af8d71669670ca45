//! trainkube - Kubernetes controller for distributed model training
//!
//! A `TrainingRequest` custom resource describes a training run. The
//! controller turns it into a ConfigMap and a build-model Job, then runs the
//! training pipeline as Jobs: one dataset split, followed by one cycle per
//! epoch and mini-batch of parallel train shards, a barrier, cleanup and a
//! gradient aggregation step.
//!
//! # Modules
//!
//! - [`crd`] - the TrainingRequest custom resource
//! - [`resources`] - Job and ConfigMap builders and the pipeline recipes
//! - [`cache`] - watch-backed object caches
//! - [`cluster`] - cluster write operations
//! - [`tracker`] - waiting for Jobs to finish or disappear
//! - [`orchestrator`] - the per-request training run
//! - [`controller`] - reconcile, error policy and run registry
//! - [`config`] - controller settings
//! - [`retry`] - backoff schedules
//! - [`error`] - error types

pub mod cache;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod orchestrator;
pub mod resources;
pub mod retry;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Field manager name for server-side apply and status patches
pub const FIELD_MANAGER: &str = "trainkube-controller";
