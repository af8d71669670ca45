//! TrainingRequest reconciliation
//!
//! Each reconcile walks the request through three idempotent steps, reading
//! cached state first so a repeated reconcile creates nothing new:
//!
//! | Step            | Action                                   | Leads to        |
//! |-----------------|------------------------------------------|-----------------|
//! | RequestObserved | create the ConfigMap unless it exists    | ConfigMapReady  |
//! | ConfigMapReady  | create the build-model Job unless exists | BuildJobReady   |
//! | BuildJobReady   | hand the request to the orchestrator     | (none)          |
//!
//! Failures are classified by [`error_policy`], which keeps a per-request
//! attempt count and decides between a delayed requeue and giving up until
//! the request changes.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::RunRegistry;
use crate::cache::{ObjectCache, ObjectKey};
use crate::cluster::ClusterApi;
use crate::config::ControllerConfig;
use crate::crd::{TrainingPhase, TrainingRequest, TrainingRequestStatus};
use crate::orchestrator::Orchestrator;
use crate::resources::{config_map_name, Pipeline};
use crate::tracker::CompletionTracker;
use crate::Error;

/// Shared state of the TrainingRequest controller
pub struct Context {
    pub config: ControllerConfig,
    pub cluster: Arc<dyn ClusterApi>,
    pub config_maps: Arc<dyn ObjectCache<ConfigMap>>,
    pub jobs: Arc<dyn ObjectCache<Job>>,
    pub runs: RunRegistry,
    orchestrator: Orchestrator,
    /// Failed reconciles per request since its last success
    attempts: DashMap<ObjectRef<TrainingRequest>, u32>,
}

impl Context {
    /// Wire up the controller state; runs are cancelled with `shutdown`
    pub fn new(
        config: ControllerConfig,
        cluster: Arc<dyn ClusterApi>,
        config_maps: Arc<dyn ObjectCache<ConfigMap>>,
        jobs: Arc<dyn ObjectCache<Job>>,
        shutdown: &CancellationToken,
    ) -> Self {
        let tracker = CompletionTracker::new(jobs.clone(), config.poll.clone());
        let orchestrator =
            Orchestrator::new(cluster.clone(), tracker, config.orchestrator_settings());
        Self {
            runs: RunRegistry::new(shutdown.child_token()),
            config,
            cluster,
            config_maps,
            jobs,
            orchestrator,
            attempts: DashMap::new(),
        }
    }
}

/// Reconcile a TrainingRequest
///
/// A panic inside the reconcile is caught and reported as a contract
/// violation, so one bad request cannot take the controller down.
pub async fn reconcile(request: Arc<TrainingRequest>, ctx: Arc<Context>) -> Result<Action, Error> {
    let obj_ref = ObjectRef::from_obj(request.as_ref());
    match AssertUnwindSafe(reconcile_request(&request, &ctx))
        .catch_unwind()
        .await
    {
        Ok(Ok(action)) => {
            ctx.attempts.remove(&obj_ref);
            Ok(action)
        }
        Ok(Err(e)) => Err(e),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(request = %obj_ref, panic = %message, "Reconcile panicked");
            Err(Error::contract(format!("reconcile panicked: {}", message)))
        }
    }
}

/// Requeue or give up on a failed reconcile
///
/// - contract violations are dropped
/// - not-ready dependencies are retried up to `not_ready_attempts`
/// - other retryable errors are retried up to `max_attempts`
/// - everything else is dropped
///
/// A dropped request is reconciled again only when it changes.
pub fn error_policy(request: Arc<TrainingRequest>, error: &Error, ctx: Arc<Context>) -> Action {
    let obj_ref = ObjectRef::from_obj(request.as_ref());
    let attempts = {
        let mut count = ctx.attempts.entry(obj_ref.clone()).or_insert(0);
        *count += 1;
        *count
    };

    let budget = match error {
        Error::ContractViolation(_) => 0,
        Error::NotReady { .. } => ctx.config.not_ready_attempts,
        e if e.is_retryable() => ctx.config.max_attempts,
        _ => 0,
    };

    if attempts < budget {
        let delay = ctx.config.requeue.delay_for(attempts - 1);
        warn!(
            request = %obj_ref,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Reconcile failed, requeueing"
        );
        Action::requeue(delay)
    } else {
        ctx.attempts.remove(&obj_ref);
        error!(request = %obj_ref, attempts, error = %error, "Reconcile failed, giving up");
        Action::await_change()
    }
}

async fn reconcile_request(request: &TrainingRequest, ctx: &Context) -> Result<Action, Error> {
    if let Some(phase) = request
        .status
        .as_ref()
        .map(|s| s.phase)
        .filter(TrainingPhase::is_terminal)
    {
        debug!(request = %request.name_any(), %phase, "Training request already finished, skipping");
        return Ok(Action::await_change());
    }

    let pipeline = Pipeline::new(request, &ctx.config.images)?;
    let key = ObjectKey::new(pipeline.namespace(), pipeline.request_name());
    if ctx.runs.is_running(&key) || ctx.runs.has_finished(&key, pipeline.uid()) {
        debug!(request = %key, "Training run already started, nothing to do");
        return Ok(Action::await_change());
    }

    if let Err(e) = request
        .spec
        .validate()
        .and_then(|()| pipeline.validate_names())
    {
        warn!(request = %key, error = %e, "Invalid training request");
        mark_failed(ctx, &pipeline, &e).await;
        return Ok(Action::await_change());
    }

    let cm_key = fail_on_builder_error(ctx, &pipeline, ensure_config_map(ctx, &pipeline).await)
        .await?;
    fail_on_builder_error(ctx, &pipeline, ensure_build_job(ctx, &pipeline, &cm_key).await)
        .await?;

    start_training(ctx, request, &pipeline, key);
    Ok(Action::await_change())
}

/// Create the request's ConfigMap unless it already exists
async fn ensure_config_map(ctx: &Context, pipeline: &Pipeline) -> Result<ObjectKey, Error> {
    let key = ObjectKey::new(
        pipeline.namespace(),
        config_map_name(pipeline.request_name()),
    );
    if ctx.config_maps.get_by_key(&key).is_some() {
        debug!(config_map = %key, "ConfigMap already exists, skipping creation");
        return Ok(key);
    }

    let config_map = pipeline.config_map()?;
    match ctx.cluster.create_config_map(&config_map).await {
        Ok(()) => info!(config_map = %key, "Created ConfigMap"),
        Err(e) if e.is_conflict() => {
            info!(config_map = %key, "ConfigMap already exists, skipping creation")
        }
        Err(e) => return Err(e),
    }
    Ok(key)
}

/// Create the build-model Job from the ConfigMap unless it already exists
async fn ensure_build_job(
    ctx: &Context,
    pipeline: &Pipeline,
    cm_key: &ObjectKey,
) -> Result<ObjectKey, Error> {
    let config_map = match ctx.config_maps.get_by_key(cm_key) {
        Some(cm) => cm.as_ref().clone(),
        None => ctx
            .cluster
            .get_config_map(&cm_key.namespace, &cm_key.name)
            .await?
            .ok_or_else(|| Error::not_ready("ConfigMap", cm_key))?,
    };

    let job = pipeline.build_model_job(&config_map)?;
    let key = ObjectKey::of(&job)
        .ok_or_else(|| Error::contract("rendered Job has no name or namespace"))?;

    if ctx.jobs.get_by_key(&key).is_some() {
        debug!(job = %key, "Build-model Job already exists, skipping creation");
    } else {
        match ctx.cluster.create_job(&job).await {
            Ok(()) => info!(job = %key, "Created build-model Job"),
            Err(e) if e.is_conflict() => {
                info!(job = %key, "Build-model Job already exists, skipping creation")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(key)
}

fn start_training(ctx: &Context, request: &TrainingRequest, pipeline: &Pipeline, key: ObjectKey) {
    let orchestrator = ctx.orchestrator.clone();
    let request = Arc::new(request.clone());
    let run_key = key.clone();
    let launched = ctx
        .runs
        .launch(key.clone(), pipeline.uid(), move |cancel| async move {
            if let Err(e) = orchestrator.run(request, cancel).await {
                debug!(request = %run_key, error = %e, "Training run ended with error");
            }
        });

    if launched {
        info!(request = %key, "Handed request to the training orchestrator");
    }
}

/// Objects that cannot be rendered will never render; fail the request
async fn fail_on_builder_error<T>(
    ctx: &Context,
    pipeline: &Pipeline,
    result: Result<T, Error>,
) -> Result<T, Error> {
    if let Err(e @ Error::Builder(_)) = &result {
        warn!(request = %pipeline.request_name(), error = %e, "Cannot render pipeline object");
        mark_failed(ctx, pipeline, e).await;
    }
    result
}

async fn mark_failed(ctx: &Context, pipeline: &Pipeline, error: &Error) {
    let status =
        TrainingRequestStatus::with_phase(TrainingPhase::Failed).message(error.to_string());
    if let Err(e) = ctx
        .cluster
        .patch_status(pipeline.namespace(), pipeline.request_name(), &status)
        .await
    {
        warn!(
            request = %pipeline.request_name(),
            error = %e,
            "Failed to update TrainingRequest status"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::cluster::MockClusterApi;
    use crate::crd::sample_request;
    use crate::error::api_error;
    use crate::resources::{JobOutcome, PipelineImages};
    use crate::testing::{Call, FakeCluster};
    use std::time::Duration;

    pub(crate) fn config() -> ControllerConfig {
        ControllerConfig {
            workers: 2,
            not_ready_attempts: 5,
            sync_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn mock_context(mock: MockClusterApi) -> Arc<Context> {
        Arc::new(Context::new(
            config(),
            Arc::new(mock),
            Arc::new(MemoryCache::<ConfigMap>::new()),
            Arc::new(MemoryCache::<Job>::new()),
            &CancellationToken::new(),
        ))
    }

    pub(crate) fn fake_context(cluster: &Arc<FakeCluster>) -> Arc<Context> {
        Arc::new(Context::new(
            config(),
            cluster.clone(),
            cluster.config_maps.clone(),
            cluster.jobs.clone(),
            &CancellationToken::new(),
        ))
    }

    fn request(name: &str) -> Arc<TrainingRequest> {
        Arc::new(sample_request(name))
    }

    fn rendered_config_map(name: &str) -> ConfigMap {
        Pipeline::new(&sample_request(name), &PipelineImages::default())
            .unwrap()
            .config_map()
            .unwrap()
    }

    fn count(history: &[Call], call: &Call) -> usize {
        history.iter().filter(|c| *c == call).count()
    }

    /// Reconcile, feeding failures through the error policy like the controller does
    async fn reconcile_once(request: &Arc<TrainingRequest>, ctx: &Arc<Context>) -> Action {
        match reconcile(request.clone(), ctx.clone()).await {
            Ok(action) => action,
            Err(e) => error_policy(request.clone(), &e, ctx.clone()),
        }
    }

    async fn wait_for_phase(cluster: &FakeCluster, phase: TrainingPhase) {
        let reached = async {
            while !cluster.statuses().iter().any(|s| s.phase == phase) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(600), reached)
            .await
            .expect("training run did not reach the phase");
    }

    // ==========================================================================
    // Story Tests: idempotent reconcile
    // ==========================================================================

    /// Story: reconciling the same request twice creates nothing new
    #[tokio::test(start_paused = true)]
    async fn story_repeated_reconcile_is_idempotent() {
        let cluster = Arc::new(FakeCluster::with_outcomes(|_| None));
        let ctx = fake_context(&cluster);
        let mnist = request("mnist");

        for _ in 0..2 {
            let action = reconcile(mnist.clone(), ctx.clone()).await.unwrap();
            assert_eq!(action, Action::await_change());
        }

        let history = cluster.history();
        assert_eq!(count(&history, &Call::CreateConfigMap("mnist".into())), 1);
        assert_eq!(count(&history, &Call::CreateJob("mnistbuildmodel".into())), 1);
        assert_eq!(ctx.runs.len(), 1);
    }

    /// Story: objects left by an earlier controller are reused, not recreated
    #[tokio::test(start_paused = true)]
    async fn story_existing_objects_are_reused() {
        let cluster = Arc::new(FakeCluster::with_outcomes(|_| None));
        let pipeline = Pipeline::new(&sample_request("mnist"), &PipelineImages::default()).unwrap();
        let cm = pipeline.config_map().unwrap();
        cluster.config_maps.apply(cm.clone()).unwrap();
        cluster.seed_job(pipeline.build_model_job(&cm).unwrap());
        let ctx = fake_context(&cluster);

        reconcile(request("mnist"), ctx.clone()).await.unwrap();

        assert!(cluster.created_jobs().is_empty());
        assert!(!cluster
            .history()
            .iter()
            .any(|c| matches!(c, Call::CreateConfigMap(_) | Call::GetConfigMap(_))));
        assert!(ctx.runs.is_running(&ObjectKey::new("default", "mnist")));
    }

    /// Story: a create that races another writer counts as success
    #[tokio::test(start_paused = true)]
    async fn story_conflict_means_exists() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_config_map()
            .times(1)
            .returning(|_| Err(api_error(409, "AlreadyExists")));
        mock.expect_get_config_map()
            .times(1)
            .returning(|_, _| Ok(Some(rendered_config_map("mnist"))));
        mock.expect_create_job()
            .times(1)
            .returning(|_| Err(api_error(409, "AlreadyExists")));
        mock.expect_patch_status().returning(|_, _, _| Ok(()));
        let ctx = mock_context(mock);

        let action = reconcile(request("mnist"), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(ctx.runs.len(), 1);
    }

    /// Story: a request that already finished is left alone after a restart
    #[tokio::test(start_paused = true)]
    async fn story_finished_request_is_skipped() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_config_map().never();
        let ctx = mock_context(mock);

        let mut finished = sample_request("mnist");
        finished.status = Some(TrainingRequestStatus::with_phase(TrainingPhase::Succeeded));

        let action = reconcile(Arc::new(finished), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.runs.is_empty());
    }

    // ==========================================================================
    // Story Tests: request and name validation
    // ==========================================================================

    /// Story: an invalid request is marked Failed and not reconciled
    #[tokio::test(start_paused = true)]
    async fn story_invalid_request_is_marked_failed() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = fake_context(&cluster);
        let mut invalid = sample_request("mnist");
        invalid.spec.shard_count = 0;

        let action = reconcile(Arc::new(invalid), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(cluster.config_maps.keys().is_empty());
        let status = cluster.statuses().pop().unwrap();
        assert_eq!(status.phase, TrainingPhase::Failed);
        assert!(status.message.unwrap().contains("shardCount"));
    }

    /// Story: a name whose update Job would exceed 63 characters fails before any Job runs
    #[tokio::test(start_paused = true)]
    async fn story_long_request_name_fails_up_front() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = fake_context(&cluster);

        let action = reconcile(request(&"a".repeat(53)), ctx.clone())
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert!(cluster.created_jobs().is_empty());
        assert!(cluster.config_maps.keys().is_empty());
        assert!(ctx.runs.is_empty());
        let status = cluster.statuses().pop().unwrap();
        assert_eq!(status.phase, TrainingPhase::Failed);
        assert!(status.message.unwrap().contains("updatemodel"));
    }

    /// Story: a dotted request name is a valid object name and trains normally
    #[tokio::test(start_paused = true)]
    async fn story_dotted_request_name_trains() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = fake_context(&cluster);

        reconcile(request("mnist.v2"), ctx).await.unwrap();
        wait_for_phase(&cluster, TrainingPhase::Succeeded).await;

        let created = cluster.created_jobs();
        assert_eq!(created[0], "mnist.v2buildmodel");
        assert_eq!(created[1], "mnist.v2splitdata");
        assert!(created.contains(&"mnist.v2updatemodel".to_string()));
        assert!(!cluster
            .statuses()
            .iter()
            .any(|s| s.phase == TrainingPhase::Failed));
    }

    /// Story: an object that cannot be rendered fails the request
    #[tokio::test(start_paused = true)]
    async fn story_builder_error_marks_request_failed() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = fake_context(&cluster);
        let pipeline = Pipeline::new(&sample_request("mnist"), &PipelineImages::default()).unwrap();

        let result: Result<(), Error> =
            fail_on_builder_error(&ctx, &pipeline, Err(Error::builder("job 'x' has no image")))
                .await;
        assert!(matches!(result, Err(Error::Builder(_))));
        let status = cluster.statuses().pop().unwrap();
        assert_eq!(status.phase, TrainingPhase::Failed);
        assert!(status.message.unwrap().contains("has no image"));

        // Retryable failures leave the status alone
        let result: Result<(), Error> =
            fail_on_builder_error(&ctx, &pipeline, Err(api_error(500, "InternalError"))).await;
        assert!(result.is_err());
        assert_eq!(cluster.statuses().len(), 1);

        // Builder failures are never retried
        let action = error_policy(request("mnist"), &Error::builder("bad"), ctx);
        assert_eq!(action, Action::await_change());
    }

    // ==========================================================================
    // Story Tests: error policy
    // ==========================================================================

    /// Story: a transient API error is attempted 3 times, never a 4th
    #[tokio::test(start_paused = true)]
    async fn story_transient_errors_are_bounded() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_config_map()
            .times(3)
            .returning(|_| Err(api_error(500, "InternalError")));
        let ctx = mock_context(mock);
        let mnist = request("mnist");

        assert_eq!(
            reconcile_once(&mnist, &ctx).await,
            Action::requeue(Duration::from_millis(5))
        );
        assert_eq!(
            reconcile_once(&mnist, &ctx).await,
            Action::requeue(Duration::from_millis(10))
        );
        assert_eq!(reconcile_once(&mnist, &ctx).await, Action::await_change());
    }

    /// Story: a success clears the attempt count of the request
    #[tokio::test(start_paused = true)]
    async fn story_success_resets_attempts() {
        let mut mock = MockClusterApi::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_create_config_map()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(api_error(503, "ServiceUnavailable")));
        mock.expect_create_config_map()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_get_config_map()
            .returning(|_, _| Ok(Some(rendered_config_map("mnist"))));
        mock.expect_create_job().times(1).returning(|_| Ok(()));
        mock.expect_patch_status().returning(|_, _, _| Ok(()));
        let ctx = mock_context(mock);
        let mnist = request("mnist");

        reconcile_once(&mnist, &ctx).await;
        reconcile_once(&mnist, &ctx).await;
        assert_eq!(
            ctx.attempts.get(&ObjectRef::from_obj(mnist.as_ref())).map(|n| *n),
            Some(2)
        );

        assert_eq!(reconcile_once(&mnist, &ctx).await, Action::await_change());
        assert!(ctx.attempts.is_empty());
        assert_eq!(ctx.runs.len(), 1);
    }

    /// Story: a missing ConfigMap is waited for beyond the normal attempt budget
    #[tokio::test(start_paused = true)]
    async fn story_not_ready_outlasts_attempt_budget() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_config_map()
            .times(5)
            .returning(|_| Ok(()));
        mock.expect_get_config_map()
            .times(5)
            .returning(|_, _| Ok(None));
        let ctx = mock_context(mock);
        let mnist = request("mnist");

        for _ in 0..4 {
            let action = reconcile_once(&mnist, &ctx).await;
            assert_ne!(action, Action::await_change());
        }
        assert_eq!(reconcile_once(&mnist, &ctx).await, Action::await_change());
    }

    /// Story: a non-retryable API error is dropped on the first attempt
    #[tokio::test(start_paused = true)]
    async fn story_forbidden_is_not_retried() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_config_map()
            .times(1)
            .returning(|_| Err(api_error(403, "Forbidden")));
        let ctx = mock_context(mock);

        assert_eq!(
            reconcile_once(&request("mnist"), &ctx).await,
            Action::await_change()
        );
        assert!(ctx.attempts.is_empty());
    }

    /// Story: a request that was never persisted is dropped
    #[tokio::test(start_paused = true)]
    async fn story_contract_violation_is_dropped() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_config_map().never();
        let ctx = mock_context(mock);

        let mut unpersisted = sample_request("mnist");
        unpersisted.metadata.uid = None;
        let unpersisted = Arc::new(unpersisted);

        let err = reconcile(unpersisted.clone(), ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::ContractViolation(_)));
        assert_eq!(error_policy(unpersisted, &err, ctx), Action::await_change());
    }

    /// Cluster that panics when asked to create the ConfigMap named "boom"
    struct PanickingCluster(Arc<FakeCluster>);

    #[async_trait::async_trait]
    impl ClusterApi for PanickingCluster {
        async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
            if config_map.name_any() == "boom" {
                panic!("handler exploded");
            }
            self.0.create_config_map(config_map).await
        }

        async fn get_config_map(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<ConfigMap>, Error> {
            self.0.get_config_map(namespace, name).await
        }

        async fn create_job(&self, job: &Job) -> Result<(), Error> {
            self.0.create_job(job).await
        }

        async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
            self.0.delete_job(namespace, name).await
        }

        async fn patch_status(
            &self,
            namespace: &str,
            name: &str,
            status: &TrainingRequestStatus,
        ) -> Result<(), Error> {
            self.0.patch_status(namespace, name, status).await
        }
    }

    /// Story: a panicking reconcile is contained and other requests carry on
    #[tokio::test(start_paused = true)]
    async fn story_panic_is_contained() {
        let fake = Arc::new(FakeCluster::with_outcomes(|_| None));
        let ctx = Arc::new(Context::new(
            config(),
            Arc::new(PanickingCluster(fake.clone())),
            fake.config_maps.clone(),
            fake.jobs.clone(),
            &CancellationToken::new(),
        ));

        let boom = request("boom");
        let err = reconcile(boom.clone(), ctx.clone()).await.unwrap_err();
        assert!(err.to_string().contains("handler exploded"));
        assert_eq!(error_policy(boom, &err, ctx.clone()), Action::await_change());

        reconcile(request("mnist"), ctx.clone()).await.unwrap();
        assert_eq!(fake.created_jobs(), vec!["mnistbuildmodel".to_string()]);
    }

    // ==========================================================================
    // Story Tests: hand-off to the orchestrator
    // ==========================================================================

    /// Story: a new request is trained to completion and never started twice
    #[tokio::test(start_paused = true)]
    async fn story_end_to_end() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = fake_context(&cluster);
        let mnist = request("mnist");

        reconcile(mnist.clone(), ctx.clone()).await.unwrap();
        wait_for_phase(&cluster, TrainingPhase::Succeeded).await;
        assert!(ctx.runs.wait_idle(Duration::from_secs(5)).await);

        let created = cluster.created_jobs();
        assert_eq!(created[0], "mnistbuildmodel");
        assert_eq!(created[1], "mnistsplitdata");

        // A reconcile still holding the pre-completion object starts nothing
        reconcile(mnist, ctx.clone()).await.unwrap();
        assert_eq!(cluster.created_jobs(), created);
        assert!(ctx.runs.is_empty());
    }

    /// Story: status updates from a live run do not restart it
    #[tokio::test(start_paused = true)]
    async fn story_reconcile_during_run_is_a_no_op() {
        let cluster = Arc::new(FakeCluster::with_outcomes(|name| {
            if name.contains("traimodel") {
                None
            } else {
                Some(JobOutcome::Succeeded)
            }
        }));
        let ctx = fake_context(&cluster);

        reconcile(request("mnist"), ctx.clone()).await.unwrap();
        wait_for_phase(&cluster, TrainingPhase::Training).await;
        let before = cluster.history().len();

        let mut observed = sample_request("mnist");
        observed.status = cluster.statuses().pop();
        reconcile(Arc::new(observed), ctx.clone()).await.unwrap();

        assert_eq!(cluster.history().len(), before);
        assert_eq!(ctx.runs.len(), 1);
    }
}
