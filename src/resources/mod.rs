//! Object builder
//!
//! Pure construction of Jobs and ConfigMaps from ordered options, plus the
//! recipes for every object a training run creates. Nothing in this module
//! talks to the cluster.

mod config_map;
mod job;
mod options;
mod pipeline;

pub use config_map::build_config_map;
pub use job::{build_job, host_path_volume, job_outcome, volume_mount, JobOutcome};
pub use options::{ConfigMapOption, ConfigMapOptions, JobOption, JobOptions, DEFAULT_NAMESPACE};
pub use pipeline::{
    build_model_job_name, config_map_name, owner_reference, split_job_name, train_job_name,
    update_job_name, Pipeline, PipelineImages, Stage, DATA_MOUNT_PATH, DATA_VOLUME,
    GRADIENTS_LOCATION, MANAGED_BY_LABEL, MANAGED_BY_VALUE, MODEL_FILE, REQUEST_LABEL,
    STAGE_LABEL,
};
