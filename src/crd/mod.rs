//! Custom Resource Definitions for trainkube
//!
//! This module contains the TrainingRequest CRD consumed by the controller.

mod training;
mod types;

pub use training::{
    TrainingRequest, TrainingRequestSpec, TrainingRequestStatus, DEFAULT_HOST_DATA_PATH,
    DEFAULT_SHARD_COUNT,
};
pub use types::{PullPolicy, TrainingPhase};

#[cfg(test)]
pub(crate) use training::{sample_request, sample_spec};
