//! Reconciliation of TrainingRequests
//!
//! A kube-runtime [`Controller`](kube::runtime::Controller) drives
//! [`reconcile`] for every TrainingRequest: ConfigMap and build-model Job
//! creation, then the hand-off to the training orchestrator. [`error_policy`]
//! bounds retries per request, and the [`RunRegistry`] keeps at most one
//! training run per request.

mod registry;
mod runner;
mod training;

pub use registry::RunRegistry;
pub use runner::run;
pub use training::{error_policy, reconcile, Context};
