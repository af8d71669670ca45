//! TrainingRequest Custom Resource Definition
//!
//! A TrainingRequest describes one distributed training run: the images that
//! build and train the model, the dataset geometry (samples, batch size,
//! shards, epochs), and where the data lives on the shared volume.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{PullPolicy, TrainingPhase};
use crate::Error;

/// Default fan-out width when `shardCount` is omitted
pub const DEFAULT_SHARD_COUNT: u32 = 6;

/// Default host directory backing the shared data volume
pub const DEFAULT_HOST_DATA_PATH: &str = "/data";

fn default_shard_count() -> u32 {
    DEFAULT_SHARD_COUNT
}

fn default_host_data_path() -> String {
    DEFAULT_HOST_DATA_PATH.to_string()
}

/// Specification for a TrainingRequest
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trainink8s.dev",
    version = "v1alpha1",
    kind = "TrainingRequest",
    plural = "trainingrequests",
    shortname = "tr",
    status = "TrainingRequestStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Epochs","type":"integer","jsonPath":".spec.epochs"}"#,
    printcolumn = r#"{"name":"Shards","type":"integer","jsonPath":".spec.shardCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRequestSpec {
    /// Image of the build-model Job that writes the initial model
    pub model_image: String,

    /// Pull policy for `model_image`
    #[serde(default)]
    pub model_image_pull_policy: PullPolicy,

    /// Image of the train-shard Jobs
    pub training_image: String,

    /// Pull policy for `training_image`
    #[serde(default)]
    pub training_image_pull_policy: PullPolicy,

    /// Number of passes over the dataset
    pub epochs: u32,

    /// Samples per mini-batch, across all shards
    pub batch_size: u32,

    /// Total number of samples in the preprocessed dataset
    pub number_of_samples: u32,

    /// Number of parallel train-shard Jobs per mini-batch
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// In-container path of the preprocessed dataset
    pub preprocessed_data_location: String,

    /// In-container path where the split Job writes shard files
    pub split_dataset_location: String,

    /// In-container path holding the model file
    pub models_location: String,

    /// Host directory mounted into every Job
    #[serde(default = "default_host_data_path")]
    pub host_data_path: String,
}

impl TrainingRequestSpec {
    /// Validate the request specification
    ///
    /// A zero batch size is left to the orchestrator, which reports it as
    /// [`Error::ZeroBatchSize`] before submitting any shard Job.
    pub fn validate(&self) -> Result<(), Error> {
        if self.model_image.trim().is_empty() {
            return Err(Error::validation("modelImage must not be empty"));
        }
        if self.training_image.trim().is_empty() {
            return Err(Error::validation("trainingImage must not be empty"));
        }
        if self.shard_count == 0 {
            return Err(Error::validation("shardCount must be at least 1"));
        }

        for (field, path) in [
            ("preprocessedDataLocation", &self.preprocessed_data_location),
            ("splitDatasetLocation", &self.split_dataset_location),
            ("modelsLocation", &self.models_location),
            ("hostDataPath", &self.host_data_path),
        ] {
            if !path.starts_with('/') {
                return Err(Error::validation(format!(
                    "{} must be an absolute path, got '{}'",
                    field, path
                )));
            }
        }

        Ok(())
    }
}

/// Status for a TrainingRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRequestStatus {
    /// Current phase of the training run
    #[serde(default)]
    pub phase: TrainingPhase,

    /// Jobs submitted by the current run
    #[serde(default)]
    pub job_count: u32,

    /// Jobs of the current run that reached Succeeded
    #[serde(default)]
    pub succeeded: u32,

    /// Epoch currently being trained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u32>,

    /// Mini-batch currently being trained within the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mini_batch: Option<u32>,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the run reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl TrainingRequestStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: TrainingPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }
}

#[cfg(test)]
pub(crate) fn sample_spec() -> TrainingRequestSpec {
    TrainingRequestSpec {
        model_image: "buildjob:latest".to_string(),
        model_image_pull_policy: PullPolicy::IfNotPresent,
        training_image: "trainjob:latest".to_string(),
        training_image_pull_policy: PullPolicy::IfNotPresent,
        epochs: 1,
        batch_size: 5,
        number_of_samples: 20,
        shard_count: 6,
        preprocessed_data_location: "/data/PreprocessedData".to_string(),
        split_dataset_location: "/data/Chunks".to_string(),
        models_location: "/data".to_string(),
        host_data_path: "/data".to_string(),
    }
}

/// Create a sample TrainingRequest with a namespace and uid, as the API server would return it
#[cfg(test)]
pub(crate) fn sample_request(name: &str) -> TrainingRequest {
    let mut request = TrainingRequest::new(name, sample_spec());
    request.metadata.namespace = Some("default".to_string());
    request.metadata.uid = Some(format!("uid-{}", name));
    request
}
