//! Shared CRD types

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a TrainingRequest
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TrainingPhase {
    /// Request observed, pipeline not started yet
    #[default]
    Pending,
    /// Waiting for the build-model Job
    BuildingModel,
    /// Split Job is partitioning the dataset into shards
    Splitting,
    /// Shard and update Jobs are running mini-batches
    Training,
    /// Every epoch completed
    Succeeded,
    /// The run aborted; a fresh trigger is needed to retry
    Failed,
}

impl TrainingPhase {
    /// Returns true once the run can no longer make progress on its own
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::BuildingModel => write!(f, "BuildingModel"),
            Self::Splitting => write!(f, "Splitting"),
            Self::Training => write!(f, "Training"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// PullPolicy
// =============================================================================

/// Container image pull policy
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PullPolicy {
    /// Always pull the image
    Always,
    /// Pull only when the image is missing on the node
    #[default]
    IfNotPresent,
    /// Never pull; the image must already be on the node
    Never,
}

impl PullPolicy {
    /// Kubernetes string form of the policy
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Always" => Ok(Self::Always),
            "IfNotPresent" => Ok(Self::IfNotPresent),
            "Never" => Ok(Self::Never),
            other => Err(format!(
                "unknown pull policy '{}', expected Always, IfNotPresent or Never",
                other
            )),
        }
    }
}
