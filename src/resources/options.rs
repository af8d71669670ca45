//! Functional options for Job and ConfigMap construction
//!
//! An option is a value describing one mutation of an accumulator. Options
//! that set a scalar field (name, image, namespace) commute with each other;
//! options that append to a list (volumes, mounts, env vars, owner
//! references) keep the order in which they are applied.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::crd::PullPolicy;
use crate::Error;

/// Namespace used when no namespace option is applied
pub const DEFAULT_NAMESPACE: &str = "default";

// =============================================================================
// Job options
// =============================================================================

/// Accumulated Job configuration before rendering
#[derive(Clone, Debug, PartialEq)]
pub struct JobOptions {
    pub name: String,
    pub image: String,
    pub pull_policy: PullPolicy,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub volumes: Vec<Volume>,
    pub volume_mounts: Vec<VolumeMount>,
    pub env: Vec<EnvVar>,
    pub owner_references: Vec<OwnerReference>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: String::new(),
            pull_policy: PullPolicy::IfNotPresent,
            namespace: DEFAULT_NAMESPACE.to_string(),
            labels: BTreeMap::new(),
            volumes: Vec::new(),
            volume_mounts: Vec::new(),
            env: Vec::new(),
            owner_references: Vec::new(),
        }
    }
}

/// A single mutation of [`JobOptions`]
#[derive(Clone, Debug, PartialEq)]
pub enum JobOption {
    /// Set the Job name (also used as the container name)
    Name(String),
    /// Set the container image
    Image(String),
    /// Set the container image pull policy
    PullPolicy(PullPolicy),
    /// Set the namespace
    Namespace(String),
    /// Merge labels into the Job and pod template labels
    Labels(BTreeMap<String, String>),
    /// Append a pod volume
    Volume(Volume),
    /// Append a container volume mount
    VolumeMount(VolumeMount),
    /// Append environment variables in the given order
    Env(Vec<(String, String)>),
    /// Append an owner reference
    OwnerReference(OwnerReference),
}

impl JobOption {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    pub fn image(image: impl Into<String>) -> Self {
        Self::Image(image.into())
    }

    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self::Namespace(namespace.into())
    }

    /// Environment variables from an ordered name/value sequence
    pub fn env<I, N, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        Self::Env(
            vars.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }

    /// Apply this option to the accumulator
    pub fn apply(self, opts: &mut JobOptions) -> Result<(), Error> {
        match self {
            JobOption::Name(name) => opts.name = name,
            JobOption::Image(image) => opts.image = image,
            JobOption::PullPolicy(policy) => opts.pull_policy = policy,
            JobOption::Namespace(namespace) => opts.namespace = namespace,
            JobOption::Labels(labels) => opts.labels.extend(labels),
            JobOption::Volume(volume) => {
                if opts.volumes.iter().any(|v| v.name == volume.name) {
                    return Err(Error::builder(format!(
                        "duplicate volume '{}'",
                        volume.name
                    )));
                }
                opts.volumes.push(volume);
            }
            JobOption::VolumeMount(mount) => opts.volume_mounts.push(mount),
            JobOption::Env(vars) => {
                for (name, value) in vars {
                    validate_env_name(&name)?;
                    opts.env.push(EnvVar {
                        name,
                        value: Some(value),
                        ..Default::default()
                    });
                }
            }
            JobOption::OwnerReference(owner) => opts.owner_references.push(owner),
        }
        Ok(())
    }
}

// =============================================================================
// ConfigMap options
// =============================================================================

/// Accumulated ConfigMap configuration before rendering
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigMapOptions {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
}

impl Default for ConfigMapOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            labels: BTreeMap::new(),
            data: BTreeMap::new(),
            owner_references: Vec::new(),
        }
    }
}

/// A single mutation of [`ConfigMapOptions`]
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigMapOption {
    Name(String),
    Namespace(String),
    /// Merge key/value pairs into the data section
    Data(BTreeMap<String, String>),
    Labels(BTreeMap<String, String>),
    OwnerReference(OwnerReference),
}

impl ConfigMapOption {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self::Namespace(namespace.into())
    }

    /// Apply this option to the accumulator
    pub fn apply(self, opts: &mut ConfigMapOptions) -> Result<(), Error> {
        match self {
            ConfigMapOption::Name(name) => opts.name = name,
            ConfigMapOption::Namespace(namespace) => opts.namespace = namespace,
            ConfigMapOption::Data(data) => {
                if let Some(key) = data.keys().find(|k| !is_config_map_key(k)) {
                    return Err(Error::builder(format!("invalid ConfigMap key '{}'", key)));
                }
                opts.data.extend(data);
            }
            ConfigMapOption::Labels(labels) => opts.labels.extend(labels),
            ConfigMapOption::OwnerReference(owner) => opts.owner_references.push(owner),
        }
        Ok(())
    }
}

// =============================================================================
// Validation helpers
// =============================================================================

/// Check a name against the DNS-1123 subdomain rules, bounded by `max_len`
///
/// Dot-separated labels of lowercase alphanumerics and '-', each starting
/// and ending with an alphanumeric.
pub(crate) fn validate_dns_subdomain(kind: &str, name: &str, max_len: usize) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::builder(format!("{} name is empty", kind)));
    }
    if name.len() > max_len {
        return Err(Error::builder(format!(
            "{} name '{}' is longer than {} characters",
            kind, name, max_len
        )));
    }
    let valid = name.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && label.starts_with(|c: char| c.is_ascii_alphanumeric())
            && label.ends_with(|c: char| c.is_ascii_alphanumeric())
    });
    if !valid {
        return Err(Error::builder(format!(
            "{} name '{}' is not a valid DNS-1123 subdomain",
            kind, name
        )));
    }
    Ok(())
}

fn validate_env_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::builder(format!(
            "invalid environment variable name '{}'",
            name
        )))
    }
}

fn is_config_map_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 253
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}
