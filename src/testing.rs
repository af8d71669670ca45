//! In-memory cluster for unit tests
//!
//! [`FakeCluster`] implements [`ClusterApi`] on top of two [`MemoryCache`]s,
//! so the code under test reads the same objects it writes. Jobs finish on
//! their own after a short delay with an outcome chosen per Job name, and
//! deletions land in the cache after a delay as well, like a real cluster.
//! Every call and cache transition is recorded for ordering assertions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;

use crate::cache::{MemoryCache, ObjectCache, ObjectKey};
use crate::cluster::ClusterApi;
use crate::crd::{TrainingPhase, TrainingRequestStatus};
use crate::error::api_error;
use crate::resources::JobOutcome;
use crate::Error;

/// Something that happened in the fake cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    CreateConfigMap(String),
    GetConfigMap(String),
    CreateJob(String),
    DeleteJob(String),
    /// A Job reached a terminal state
    Finished(String, bool),
    /// A deleted Job left the cache
    Removed(String),
    PatchStatus(TrainingPhase),
}

type OutcomePolicy = Box<dyn Fn(&str) -> Option<JobOutcome> + Send + Sync>;

pub(crate) struct FakeCluster {
    pub jobs: Arc<MemoryCache<Job>>,
    pub config_maps: Arc<MemoryCache<ConfigMap>>,
    history: Arc<Mutex<Vec<Call>>>,
    statuses: Mutex<Vec<TrainingRequestStatus>>,
    outcomes: OutcomePolicy,
    create_errors: Mutex<HashMap<String, u16>>,
    run_delay: Duration,
    delete_delay: Duration,
}

impl FakeCluster {
    /// Every Job succeeds
    pub fn new() -> Self {
        Self::with_outcomes(|_| Some(JobOutcome::Succeeded))
    }

    /// Job outcome decided per name; None keeps the Job running forever
    pub fn with_outcomes<F>(policy: F) -> Self
    where
        F: Fn(&str) -> Option<JobOutcome> + Send + Sync + 'static,
    {
        Self {
            jobs: Arc::new(MemoryCache::new()),
            config_maps: Arc::new(MemoryCache::new()),
            history: Arc::new(Mutex::new(Vec::new())),
            statuses: Mutex::new(Vec::new()),
            outcomes: Box::new(policy),
            create_errors: Mutex::new(HashMap::new()),
            run_delay: Duration::from_millis(10),
            delete_delay: Duration::from_millis(5),
        }
    }

    /// Make every create of the named object fail with an API error
    pub fn fail_creates_of(&self, name: &str, code: u16) {
        self.create_errors
            .lock()
            .unwrap()
            .insert(name.to_string(), code);
    }

    /// Put a Job in the cache without going through `create_job`
    pub fn seed_job(&self, job: Job) {
        self.jobs.apply(job).unwrap();
    }

    pub fn history(&self) -> Vec<Call> {
        self.history.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<TrainingRequestStatus> {
        self.statuses.lock().unwrap().clone()
    }

    /// Names of created Jobs, in creation order
    pub fn created_jobs(&self) -> Vec<String> {
        self.history()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateJob(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.history.lock().unwrap().push(call);
    }

    fn injected_error(&self, name: &str) -> Option<Error> {
        self.create_errors
            .lock()
            .unwrap()
            .get(name)
            .map(|code| api_error(*code, "Injected"))
    }
}

fn terminal_status(outcome: &JobOutcome) -> JobStatus {
    match outcome {
        JobOutcome::Succeeded => JobStatus {
            succeeded: Some(1),
            conditions: Some(vec![JobCondition {
                type_: "Complete".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        },
        JobOutcome::Failed { message } => JobStatus {
            failed: Some(1),
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                message: Some(message.clone()),
                ..Default::default()
            }]),
            ..Default::default()
        },
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let name = config_map.name_any();
        if let Some(e) = self.injected_error(&name) {
            return Err(e);
        }
        let key = ObjectKey::of(config_map).ok_or_else(|| Error::contract("unnamed ConfigMap"))?;
        if self.config_maps.get_by_key(&key).is_some() {
            return Err(api_error(409, "AlreadyExists"));
        }
        self.record(Call::CreateConfigMap(name));
        self.config_maps.apply(config_map.clone())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        self.record(Call::GetConfigMap(name.to_string()));
        Ok(self
            .config_maps
            .get_by_key(&ObjectKey::new(namespace, name))
            .map(|cm| cm.as_ref().clone()))
    }

    async fn create_job(&self, job: &Job) -> Result<(), Error> {
        let name = job.name_any();
        if let Some(e) = self.injected_error(&name) {
            return Err(e);
        }
        let key = ObjectKey::of(job).ok_or_else(|| Error::contract("unnamed Job"))?;
        if self.jobs.get_by_key(&key).is_some() {
            return Err(api_error(409, "AlreadyExists"));
        }
        self.record(Call::CreateJob(name.clone()));
        self.jobs.apply(job.clone())?;

        if let Some(outcome) = (self.outcomes)(&name) {
            let jobs = self.jobs.clone();
            let history = self.history.clone();
            let delay = self.run_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let status = terminal_status(&outcome);
                if jobs.update(&key, |job| job.status = Some(status)) {
                    history.lock().unwrap().push(Call::Finished(
                        name,
                        outcome == JobOutcome::Succeeded,
                    ));
                }
            });
        }
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.record(Call::DeleteJob(name.to_string()));
        let key = ObjectKey::new(namespace, name);
        let jobs = self.jobs.clone();
        let history = self.history.clone();
        let delay = self.delete_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if jobs.remove(&key).is_some() {
                history.lock().unwrap().push(Call::Removed(key.name));
            }
        });
        Ok(())
    }

    async fn patch_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &TrainingRequestStatus,
    ) -> Result<(), Error> {
        self.record(Call::PatchStatus(status.phase));
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }
}
