//! Cluster API access
//!
//! [`ClusterApi`] is the narrow set of write and point-read calls the controller
//! and the orchestrator make. Everything else is read from the watch caches.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{TrainingRequest, TrainingRequestStatus};
use crate::{Error, FIELD_MANAGER};

/// Create/get/delete calls against the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a ConfigMap in its own namespace
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;

    /// Fetch a ConfigMap, None if it does not exist
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Create a Job in its own namespace
    async fn create_job(&self, job: &Job) -> Result<(), Error>;

    /// Delete a Job and its pods; a missing Job counts as deleted
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Merge-patch the status subresource of a TrainingRequest
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TrainingRequestStatus,
    ) -> Result<(), Error>;
}

/// [`ClusterApi`] backed by a kube client, with a deadline on every call
pub struct KubeClusterApi {
    client: Client,
    timeout: Duration,
}

impl KubeClusterApi {
    /// Wrap a kube client; each call fails with [`Error::Timeout`] after `timeout`
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn deadline<T, F>(&self, what: String, call: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout(what)),
        }
    }
}

fn namespace_of<K: Resource>(obj: &K, kind: &str) -> Result<String, Error> {
    obj.meta().namespace.clone().ok_or_else(|| {
        Error::contract(format!(
            "{} '{}' has no namespace",
            kind,
            obj.meta().name.as_deref().unwrap_or_default()
        ))
    })
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let namespace = namespace_of(config_map, "ConfigMap")?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        let what = format!("create ConfigMap {}/{}", namespace, config_map.name_any());
        self.deadline(what, api.create(&PostParams::default(), config_map))
            .await?;
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("get ConfigMap {}/{}", namespace, name);
        self.deadline(what, api.get_opt(name)).await
    }

    async fn create_job(&self, job: &Job) -> Result<(), Error> {
        let namespace = namespace_of(job, "Job")?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        let what = format!("create Job {}/{}", namespace, job.name_any());
        self.deadline(what, api.create(&PostParams::default(), job))
            .await?;
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("delete Job {}/{}", namespace, name);
        match self
            .deadline(what, api.delete(name, &DeleteParams::background()))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(namespace, job = name, "Job already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TrainingRequestStatus,
    ) -> Result<(), Error> {
        let api: Api<TrainingRequest> = Api::namespaced(self.client.clone(), namespace);

        let status_patch = status_patch(status)?;

        let what = format!("patch status of TrainingRequest {}/{}", namespace, name);
        self.deadline(
            what,
            api.patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            ),
        )
        .await?;
        Ok(())
    }
}

/// Fields a merge patch only clears when they are sent as explicit nulls
const CLEARABLE_STATUS_FIELDS: [&str; 4] = ["epoch", "miniBatch", "message", "completionTime"];

/// Merge patch body that replaces the whole status
///
/// Unset optional fields are sent as `null` so values from an earlier run
/// or phase do not survive the patch.
fn status_patch(status: &TrainingRequestStatus) -> Result<serde_json::Value, Error> {
    let mut body =
        serde_json::to_value(status).map_err(|e| Error::serialization(e.to_string()))?;
    let fields = body
        .as_object_mut()
        .ok_or_else(|| Error::serialization("TrainingRequestStatus is not a JSON object"))?;
    for field in CLEARABLE_STATUS_FIELDS {
        fields
            .entry(field)
            .or_insert(serde_json::Value::Null);
    }
    Ok(serde_json::json!({ "status": body }))
}
