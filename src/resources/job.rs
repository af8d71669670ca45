//! Job rendering and status inspection
//!
//! [`build_job`] folds a list of [`JobOption`]s into a `batch/v1` Job with a
//! single container. The cluster never retries these Jobs on its own
//! (`restartPolicy: Never`, `backoffLimit: 0`); retry and failure policy
//! belong to the training orchestrator.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::options::{validate_dns_subdomain, JobOption, JobOptions};
use crate::Error;

/// Job names become pod labels, so they follow the 63 character label limit
pub(crate) const MAX_JOB_NAME_LEN: usize = 63;

/// Render a Job from an ordered list of options
///
/// The result is a pure function of the option list. Errors:
/// - empty name, or one that is not a DNS-1123 subdomain of at most 63 characters
/// - empty image
/// - a volume mount that references a volume no option declared
pub fn build_job(options: impl IntoIterator<Item = JobOption>) -> Result<Job, Error> {
    let mut opts = JobOptions::default();
    for option in options {
        option.apply(&mut opts)?;
    }
    render_job(opts)
}

fn render_job(opts: JobOptions) -> Result<Job, Error> {
    validate_dns_subdomain("Job", &opts.name, MAX_JOB_NAME_LEN)?;
    if opts.image.trim().is_empty() {
        return Err(Error::builder(format!("job '{}' has no image", opts.name)));
    }
    if let Some(mount) = opts
        .volume_mounts
        .iter()
        .find(|m| !opts.volumes.iter().any(|v| v.name == m.name))
    {
        return Err(Error::builder(format!(
            "job '{}' mounts undeclared volume '{}'",
            opts.name, mount.name
        )));
    }

    let container = Container {
        name: opts.name.replace('.', "-"),
        image: Some(opts.image),
        image_pull_policy: Some(opts.pull_policy.as_str().to_string()),
        env: non_empty(opts.env),
        volume_mounts: non_empty(opts.volume_mounts),
        ..Default::default()
    };

    let labels = if opts.labels.is_empty() {
        None
    } else {
        Some(opts.labels)
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(opts.name),
            namespace: Some(opts.namespace),
            labels: labels.clone(),
            owner_references: non_empty(opts.owner_references),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels,
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: non_empty(opts.volumes),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Volume backed by a directory on the node
pub fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("DirectoryOrCreate".to_string()),
        }),
        ..Default::default()
    }
}

/// Read-write mount of the named volume
pub fn volume_mount(name: &str, mount_path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        ..Default::default()
    }
}

// =============================================================================
// Status inspection
// =============================================================================

/// Terminal state of a Job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed { message: String },
}

/// Terminal outcome of a Job, or None while it is still running
///
/// A Job counts as terminal once its pod counters report a success or a
/// failure, or once the Job controller sets a `Complete`/`Failed` condition.
pub fn job_outcome(job: &Job) -> Option<JobOutcome> {
    let status = job.status.as_ref()?;

    if let Some(message) = failed_condition_message(job) {
        return Some(JobOutcome::Failed { message });
    }
    if has_condition(job, "Complete") || status.succeeded.unwrap_or(0) >= 1 {
        return Some(JobOutcome::Succeeded);
    }
    if status.failed.unwrap_or(0) >= 1 {
        return Some(JobOutcome::Failed {
            message: "pod failed".to_string(),
        });
    }
    None
}

fn has_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
        .unwrap_or(false)
}

fn failed_condition_message(job: &Job) -> Option<String> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
                .map(|c| {
                    c.message
                        .clone()
                        .or_else(|| c.reason.clone())
                        .unwrap_or_else(|| "job failed".to_string())
                })
        })
}
