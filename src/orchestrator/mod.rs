//! Training orchestrator
//!
//! One run per TrainingRequest, started by the TrainingRequest reconciler and
//! executed as its own task. A run:
//!
//! 1. waits for the build-model Job the reconciler created
//! 2. runs the split Job
//! 3. for every epoch and mini-batch, fans out one train Job per shard,
//!    waits on all of them (failing fast), deletes them, then runs the
//!    update-model Job and deletes it
//!
//! Any creation error, Job failure or deletion error ends the run. Progress
//! lives only in memory; a restarted controller starts the run over.

mod barrier;
mod plan;

pub use barrier::await_all;
pub use plan::{SampleWindow, Step, TrainingPlan};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ObjectKey;
use crate::cluster::ClusterApi;
use crate::crd::{TrainingPhase, TrainingRequest, TrainingRequestStatus};
use crate::resources::{build_model_job_name, JobOutcome, Pipeline, PipelineImages};
use crate::tracker::CompletionTracker;
use crate::Error;

/// Knobs shared by every run
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    /// Deadline for a single Job to reach a terminal state
    pub job_timeout: Duration,
    /// Deadline for a deleted Job to leave the cache
    pub deletion_timeout: Duration,
    /// Images of the split and update stages
    pub images: PipelineImages,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(3600),
            deletion_timeout: Duration::from_secs(120),
            images: PipelineImages::default(),
        }
    }
}

/// Runs training pipelines against the cluster
#[derive(Clone)]
pub struct Orchestrator {
    cluster: Arc<dyn ClusterApi>,
    tracker: CompletionTracker,
    settings: OrchestratorSettings,
}

/// Memory-only state of one run
struct Run {
    key: ObjectKey,
    pipeline: Pipeline,
    status: TrainingRequestStatus,
}

impl Orchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        tracker: CompletionTracker,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            cluster,
            tracker,
            settings,
        }
    }

    /// Run the whole pipeline for a request and report the final status
    ///
    /// On failure the request status is set to `Failed` with the cause. A
    /// cancelled run leaves the status untouched so the next controller
    /// start picks it up again.
    pub async fn run(
        &self,
        request: Arc<TrainingRequest>,
        cancel: CancellationToken,
    ) -> Result<TrainingRequestStatus, Error> {
        let pipeline = match Pipeline::new(&request, &self.settings.images) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!(request = %request.name_any(), error = %e, "Cannot start training run");
                return Err(e);
            }
        };
        let mut run = Run {
            key: ObjectKey::new(pipeline.namespace(), request.name_any()),
            pipeline,
            status: TrainingRequestStatus::default(),
        };

        info!(request = %run.key, "Starting training run");

        match self.execute(&mut run, &cancel).await {
            Ok(()) => {
                run.status.phase = TrainingPhase::Succeeded;
                run.status.message = Some("training completed".to_string());
                run.status.completion_time = Some(Utc::now());
                self.report(&run).await;
                info!(
                    request = %run.key,
                    jobs = run.status.job_count,
                    "Training run succeeded"
                );
                Ok(run.status)
            }
            Err(Error::Cancelled(what)) => {
                info!(request = %run.key, waiting_for = %what, "Training run cancelled");
                Err(Error::Cancelled(what))
            }
            Err(e) => {
                error!(request = %run.key, error = %e, "Training run failed");
                run.status.phase = TrainingPhase::Failed;
                run.status.message = Some(e.to_string());
                run.status.completion_time = Some(Utc::now());
                self.report(&run).await;
                Err(e)
            }
        }
    }

    async fn execute(&self, run: &mut Run, cancel: &CancellationToken) -> Result<(), Error> {
        let plan = TrainingPlan::new(run.pipeline.spec())?;
        let namespace = run.pipeline.namespace().to_string();
        let request = run.pipeline.request_name().to_string();

        // Build model
        self.enter(run, TrainingPhase::BuildingModel).await;
        let build = ObjectKey::new(&namespace, build_model_job_name(&request));
        self.expect_success(&build, cancel).await?;
        run.status.succeeded += 1;

        // Split
        self.enter(run, TrainingPhase::Splitting).await;
        let split = run.pipeline.split_job()?;
        let split_key = self.submit(run, split, cancel).await?;
        self.expect_success(&split_key, cancel).await?;
        run.status.succeeded += 1;

        info!(
            request = %run.key,
            epochs = plan.epochs,
            mini_batches = plan.mini_batches,
            shards = plan.shards,
            window = plan.window_width,
            "Dataset split, starting training"
        );

        for step in plan.steps() {
            run.status.epoch = Some(step.epoch);
            run.status.mini_batch = Some(u32::try_from(step.mini_batch).unwrap_or(u32::MAX));
            self.enter(run, TrainingPhase::Training).await;
            self.train_step(run, &plan, step, cancel).await?;
        }

        Ok(())
    }

    async fn train_step(
        &self,
        run: &mut Run,
        plan: &TrainingPlan,
        step: Step,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        debug!(
            request = %run.key,
            epoch = step.epoch,
            mini_batch = step.mini_batch,
            start = step.window.start,
            end = step.window.end,
            "Fanning out shards"
        );

        // Fan out sequentially so names and logs stay in shard order
        let mut shards = Vec::with_capacity(plan.shards as usize);
        for shard in 0..plan.shards {
            let job = run
                .pipeline
                .train_job(shard, step.window.start, step.window.end)?;
            shards.push(self.submit(run, job, cancel).await?);
        }

        await_all(&self.tracker, &shards, self.settings.job_timeout, cancel).await?;
        run.status.succeeded += plan.shards;

        for key in &shards {
            self.cluster.delete_job(&key.namespace, &key.name).await?;
        }
        for key in &shards {
            self.tracker
                .await_absence(key, self.settings.deletion_timeout, cancel)
                .await?;
        }

        let update = run.pipeline.update_job()?;
        let update_key = self.submit(run, update, cancel).await?;
        self.expect_success(&update_key, cancel).await?;
        run.status.succeeded += 1;

        self.cluster
            .delete_job(&update_key.namespace, &update_key.name)
            .await?;
        self.tracker
            .await_absence(&update_key, self.settings.deletion_timeout, cancel)
            .await?;

        info!(
            request = %run.key,
            epoch = step.epoch,
            mini_batch = step.mini_batch,
            "Mini-batch complete"
        );
        Ok(())
    }

    /// Create a Job, first clearing any leftover Job with the same name
    async fn submit(
        &self,
        run: &mut Run,
        job: Job,
        cancel: &CancellationToken,
    ) -> Result<ObjectKey, Error> {
        let key = ObjectKey::of(&job)
            .ok_or_else(|| Error::contract("rendered Job has no name or namespace"))?;

        if self.tracker.contains(&key) {
            warn!(job = %key, "Deleting leftover job from a previous run");
            self.cluster.delete_job(&key.namespace, &key.name).await?;
            self.tracker
                .await_absence(&key, self.settings.deletion_timeout, cancel)
                .await?;
        }

        self.cluster.create_job(&job).await?;
        run.status.job_count += 1;
        debug!(job = %key, "Job submitted");
        Ok(key)
    }

    async fn expect_success(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        match self
            .tracker
            .await_terminal(key, self.settings.job_timeout, cancel)
            .await?
        {
            JobOutcome::Succeeded => {
                debug!(job = %key, "Job succeeded");
                Ok(())
            }
            JobOutcome::Failed { message } => Err(Error::job_failed(&key.name, message)),
        }
    }

    async fn enter(&self, run: &mut Run, phase: TrainingPhase) {
        if run.status.phase != phase {
            info!(request = %run.key, phase = %phase, "Training run entering phase");
        }
        run.status.phase = phase;
        run.status.message = None;
        self.report(run).await;
    }

    /// Write the run status onto the request; failures only get logged
    async fn report(&self, run: &Run) {
        if let Err(e) = self
            .cluster
            .patch_status(&run.key.namespace, &run.key.name, &run.status)
            .await
        {
            warn!(request = %run.key, error = %e, "Failed to update TrainingRequest status");
        }
    }
}
