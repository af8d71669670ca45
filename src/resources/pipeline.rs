//! Recipes for the objects a training run produces
//!
//! Every object is named deterministically from the request name, carries a
//! controller owner reference back to its TrainingRequest, and (for Jobs)
//! mounts the shared host-path volume at [`DATA_MOUNT_PATH`]. Jobs receive
//! their parameters only through environment variables.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use super::config_map::{build_config_map, MAX_CONFIG_MAP_NAME_LEN};
use super::job::{build_job, host_path_volume, volume_mount, MAX_JOB_NAME_LEN};
use super::options::{validate_dns_subdomain, ConfigMapOption, JobOption};
use crate::crd::{PullPolicy, TrainingRequest, TrainingRequestSpec};
use crate::Error;

/// In-container path where the shared data volume is mounted
pub const DATA_MOUNT_PATH: &str = "/data";

/// Directory on the shared volume where train shards write gradients
pub const GRADIENTS_LOCATION: &str = "/data/Gradients";

/// File name of the model inside `modelsLocation`
pub const MODEL_FILE: &str = "model.h5";

/// Name of the shared volume in every pipeline Job
pub const DATA_VOLUME: &str = "training-data";

/// Label identifying objects created by this controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "trainkube";
/// Label carrying the owning request name
pub const REQUEST_LABEL: &str = "trainink8s.dev/request";
/// Label carrying the pipeline stage of a Job
pub const STAGE_LABEL: &str = "trainink8s.dev/stage";

// =============================================================================
// Names
// =============================================================================

/// Name of the ConfigMap generated for a request
pub fn config_map_name(request: &str) -> String {
    request.to_string()
}

/// Name of the Job that writes the initial model
pub fn build_model_job_name(request: &str) -> String {
    format!("{}buildmodel", request)
}

/// Name of the Job that splits the dataset into shard files
pub fn split_job_name(request: &str) -> String {
    format!("{}splitdata", request)
}

/// Name of the train Job for one shard
pub fn train_job_name(request: &str, shard: u32) -> String {
    format!("{}traimodel{}", request, shard)
}

/// Name of the Job that averages gradients into the model
pub fn update_job_name(request: &str) -> String {
    format!("{}updatemodel", request)
}

/// Build a controller owner reference pointing at the request
///
/// The API server only accepts owner references with a uid, so a request
/// that has never been persisted is a contract violation.
pub fn owner_reference(request: &TrainingRequest) -> Result<OwnerReference, Error> {
    request.controller_owner_ref(&()).ok_or_else(|| {
        Error::contract(format!(
            "TrainingRequest '{}' has no uid",
            request.name_any()
        ))
    })
}

// =============================================================================
// Pipeline
// =============================================================================

/// Stage of the pipeline a Job belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    BuildModel,
    Split,
    Train,
    UpdateModel,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::BuildModel => "build-model",
            Stage::Split => "split",
            Stage::Train => "train",
            Stage::UpdateModel => "update-model",
        }
    }
}

/// Images for the stages whose image is not part of the request
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineImages {
    /// Image of the split Job
    pub split: String,
    /// Image of the update-model Job
    pub update: String,
    /// Pull policy for `split` and `update`
    pub pull_policy: PullPolicy,
}

impl Default for PipelineImages {
    fn default() -> Self {
        Self {
            split: "splitjob:latest".to_string(),
            update: "modelupdatejob:latest".to_string(),
            pull_policy: PullPolicy::IfNotPresent,
        }
    }
}

/// Renders every object of one request's pipeline
#[derive(Clone, Debug)]
pub struct Pipeline {
    request: String,
    namespace: String,
    spec: TrainingRequestSpec,
    owner: OwnerReference,
    images: PipelineImages,
}

impl Pipeline {
    /// Prepare the recipes for a request
    ///
    /// Fails with a contract violation if the request lacks a namespace or uid.
    pub fn new(request: &TrainingRequest, images: &PipelineImages) -> Result<Self, Error> {
        let namespace = request.namespace().ok_or_else(|| {
            Error::contract(format!(
                "TrainingRequest '{}' has no namespace",
                request.name_any()
            ))
        })?;
        Ok(Self {
            request: request.name_any(),
            namespace,
            spec: request.spec.clone(),
            owner: owner_reference(request)?,
            images: images.clone(),
        })
    }

    /// Name of the request these recipes belong to
    pub fn request_name(&self) -> &str {
        &self.request
    }

    /// Namespace every object is created in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// uid of the request, as carried by every owner reference
    pub fn uid(&self) -> &str {
        &self.owner.uid
    }

    /// The request spec captured when the pipeline was prepared
    pub fn spec(&self) -> &TrainingRequestSpec {
        &self.spec
    }

    /// Check that every object name this request derives is acceptable
    ///
    /// Runs before anything is created, so a request whose longest Job name
    /// (the last train shard or the update Job) would not fit fails up front
    /// instead of partway through training.
    pub fn validate_names(&self) -> Result<(), Error> {
        let invalid = |e: Error| match e {
            Error::Builder(msg) => Error::validation(msg),
            other => other,
        };
        validate_dns_subdomain(
            "ConfigMap",
            &config_map_name(&self.request),
            MAX_CONFIG_MAP_NAME_LEN,
        )
        .map_err(invalid)?;

        let last_shard = self.spec.shard_count.saturating_sub(1);
        for name in [
            build_model_job_name(&self.request),
            split_job_name(&self.request),
            train_job_name(&self.request, last_shard),
            update_job_name(&self.request),
        ] {
            validate_dns_subdomain("Job", &name, MAX_JOB_NAME_LEN).map_err(invalid)?;
        }
        Ok(())
    }

    /// ConfigMap holding the request's numeric and path fields as strings
    pub fn config_map(&self) -> Result<ConfigMap, Error> {
        let spec = &self.spec;
        let data = BTreeMap::from([
            ("epochs".to_string(), spec.epochs.to_string()),
            ("batchSize".to_string(), spec.batch_size.to_string()),
            (
                "numberOfSamples".to_string(),
                spec.number_of_samples.to_string(),
            ),
            ("shardCount".to_string(), spec.shard_count.to_string()),
            (
                "preprocessedDatasetLocation".to_string(),
                spec.preprocessed_data_location.clone(),
            ),
            (
                "splitDatasetLocation".to_string(),
                spec.split_dataset_location.clone(),
            ),
            ("modelsLocation".to_string(), spec.models_location.clone()),
            ("hostDataPath".to_string(), spec.host_data_path.clone()),
        ]);

        build_config_map([
            ConfigMapOption::name(config_map_name(&self.request)),
            ConfigMapOption::namespace(&self.namespace),
            ConfigMapOption::Labels(self.labels(None)),
            ConfigMapOption::Data(data),
            ConfigMapOption::OwnerReference(self.owner.clone()),
        ])
    }

    /// Build-model Job, parameterized from the generated ConfigMap
    pub fn build_model_job(&self, config_map: &ConfigMap) -> Result<Job, Error> {
        let models_location = config_map
            .data
            .as_ref()
            .and_then(|d| d.get("modelsLocation"))
            .ok_or_else(|| {
                Error::contract(format!(
                    "ConfigMap {}/{} has no modelsLocation",
                    self.namespace,
                    config_map.name_any()
                ))
            })?;

        self.job(
            build_model_job_name(&self.request),
            Stage::BuildModel,
            &self.spec.model_image,
            self.spec.model_image_pull_policy,
            [("MODEL_STORAGE_LOCATION".to_string(), models_location.clone())],
        )
    }

    /// Split Job partitioning the dataset into one file pair per shard
    pub fn split_job(&self) -> Result<Job, Error> {
        self.job(
            split_job_name(&self.request),
            Stage::Split,
            &self.images.split,
            self.images.pull_policy,
            [
                ("DIVISIONS".to_string(), self.spec.shard_count.to_string()),
                (
                    "DATASET_LOCATION".to_string(),
                    self.spec.preprocessed_data_location.clone(),
                ),
                (
                    "SPLIT_LOCATION".to_string(),
                    self.spec.split_dataset_location.clone(),
                ),
            ],
        )
    }

    /// Train Job for one shard over the sample window `[start, end)`
    pub fn train_job(&self, shard: u32, start: u64, end: u64) -> Result<Job, Error> {
        let split = self.spec.split_dataset_location.trim_end_matches('/');
        self.job(
            train_job_name(&self.request, shard),
            Stage::Train,
            &self.spec.training_image,
            self.spec.training_image_pull_policy,
            [
                ("MODEL_LOCATION".to_string(), self.model_location()),
                (
                    "GRADIENT_LOCATION".to_string(),
                    GRADIENTS_LOCATION.to_string(),
                ),
                (
                    "FEATURES_LOCATION".to_string(),
                    format!("{}/x_train_{}.npy", split, shard),
                ),
                (
                    "LABELS_LOCATION".to_string(),
                    format!("{}/y_train_{}.npy", split, shard),
                ),
                ("STARTING_INDEX".to_string(), start.to_string()),
                ("ENDING_INDEX".to_string(), end.to_string()),
                ("JOB_INDEX".to_string(), shard.to_string()),
            ],
        )
    }

    /// Update Job averaging one gradient per shard into the model
    pub fn update_job(&self) -> Result<Job, Error> {
        self.job(
            update_job_name(&self.request),
            Stage::UpdateModel,
            &self.images.update,
            self.images.pull_policy,
            [
                ("MODEL_LOCATION".to_string(), self.model_location()),
                (
                    "GRADIENT_LOCATION".to_string(),
                    GRADIENTS_LOCATION.to_string(),
                ),
                (
                    "NUMBER_OF_GRADS".to_string(),
                    self.spec.shard_count.to_string(),
                ),
            ],
        )
    }

    fn model_location(&self) -> String {
        format!(
            "{}/{}",
            self.spec.models_location.trim_end_matches('/'),
            MODEL_FILE
        )
    }

    fn labels(&self, stage: Option<Stage>) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (REQUEST_LABEL.to_string(), self.request.clone()),
        ]);
        if let Some(stage) = stage {
            labels.insert(STAGE_LABEL.to_string(), stage.as_str().to_string());
        }
        labels
    }

    fn job<const N: usize>(
        &self,
        name: String,
        stage: Stage,
        image: &str,
        pull_policy: PullPolicy,
        env: [(String, String); N],
    ) -> Result<Job, Error> {
        build_job([
            JobOption::Name(name),
            JobOption::image(image),
            JobOption::PullPolicy(pull_policy),
            JobOption::namespace(&self.namespace),
            JobOption::Labels(self.labels(Some(stage))),
            JobOption::Volume(host_path_volume(DATA_VOLUME, &self.spec.host_data_path)),
            JobOption::VolumeMount(volume_mount(DATA_VOLUME, DATA_MOUNT_PATH)),
            JobOption::env(env),
            JobOption::OwnerReference(self.owner.clone()),
        ])
    }
}
