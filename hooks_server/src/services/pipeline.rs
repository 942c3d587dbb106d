//! Build pipeline — drives one push through filter, sync and provision.
//!
//! Each push runs as its own task. The task owns an [`EventHandle`] and a
//! duration ticker; the ticker is cancelled and joined before the stop time
//! is recorded, so no tick is published after a build has stopped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::models::build_event::{BuildEvent, BuildStatus};
use crate::models::push::{is_branch_ref, PushError, PushEvent, RepoSlug};
use crate::services::event_store::{EventHandle, EventStore, StoreError};
use crate::services::executor::{BuildExecutor, BuildJob};
use crate::services::notify_service::{Notifier, NotifyError};
use crate::services::snapshot::Snapshotter;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("build event {0} disappeared from the store")]
    Vanished(u64),
}

/// A validated push, ready to build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub slug: RepoSlug,
    pub git_ref: String,
    pub revision: String,
}

impl BuildRequest {
    pub fn from_push(push: &PushEvent) -> Result<Self, PushError> {
        Ok(Self {
            slug: push.slug()?,
            git_ref: push.git_ref.clone(),
            revision: push.after.clone(),
        })
    }

    fn targets(&self, branch: &str) -> bool {
        is_branch_ref(&self.git_ref, branch)
    }
}

pub struct BuildPipeline {
    store: Arc<EventStore>,
    executor: Arc<dyn BuildExecutor>,
    notifier: Arc<dyn Notifier>,
    snapshotter: Arc<Snapshotter>,
    target_branch: String,
    tick_interval: Duration,
    notify_timeout: Duration,
}

impl BuildPipeline {
    pub fn new(
        store: Arc<EventStore>,
        executor: Arc<dyn BuildExecutor>,
        notifier: Arc<dyn Notifier>,
        snapshotter: Arc<Snapshotter>,
        target_branch: impl Into<String>,
    ) -> Self {
        Self {
            store,
            executor,
            notifier,
            snapshotter,
            target_branch: target_branch.into(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Upper bound on each notifier call; a slower call is abandoned.
    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Run the pipeline in the background. Failures and panics are logged
    /// and stay inside the spawned task.
    pub fn spawn(self: &Arc<Self>, request: BuildRequest) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        let repo = request.slug.to_string();

        tokio::spawn(async move {
            let build = tokio::spawn(async move { pipeline.run(request).await });
            match build.await {
                Ok(Ok(event)) => tracing::info!(
                    event_id = event.id,
                    repo = %repo,
                    status = %event.status,
                    "Build finished"
                ),
                Ok(Err(e)) => tracing::error!(repo = %repo, "Build aborted: {e}"),
                Err(e) if e.is_panic() => tracing::error!(repo = %repo, "Build task panicked"),
                Err(e) => tracing::warn!(repo = %repo, "Build task cancelled: {e}"),
            }
        })
    }

    /// Run the whole pipeline for one push and return the final event.
    pub async fn run(&self, request: BuildRequest) -> Result<BuildEvent, PipelineError> {
        let handle = self.store.create(&request.slug.name);
        let id = handle.id();

        self.notify(id, "start", self.notifier.build_started(&request.slug.name))
            .await;

        let ticker = Ticker::start(Arc::clone(&self.store), id, self.tick_interval);
        let outcome = self.drive(&handle, &request).await;
        ticker.stop().await;
        let status = outcome?;

        handle.mark_stopped()?;
        let event = handle.get().ok_or(PipelineError::Vanished(id))?;
        tracing::info!(
            event_id = id,
            status = %status,
            duration_ms = event.duration().as_millis() as u64,
            "Build reached terminal status"
        );

        if let Err(e) = self.snapshotter.save(&self.store).await {
            crate::metrics::snapshot_failed();
            tracing::error!(event_id = id, "Snapshot failed: {e}");
        }
        self.notify(id, "finish", self.notifier.build_finished(&event))
            .await;

        Ok(event)
    }

    async fn notify(
        &self,
        event_id: u64,
        kind: &str,
        call: impl Future<Output = Result<(), NotifyError>>,
    ) {
        match tokio::time::timeout(self.notify_timeout, call).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(event_id, "{kind} notification failed: {e}"),
            Err(_) => tracing::warn!(
                event_id,
                timeout_ms = self.notify_timeout.as_millis() as u64,
                "{kind} notification timed out"
            ),
        }
    }

    async fn drive(
        &self,
        handle: &EventHandle,
        request: &BuildRequest,
    ) -> Result<BuildStatus, StoreError> {
        let id = handle.id();
        handle.set_status(BuildStatus::Filtering)?;

        if !request.targets(&self.target_branch) {
            tracing::info!(
                event_id = id,
                git_ref = %request.git_ref,
                branch = %self.target_branch,
                "Push is not for the watched branch, skipping"
            );
            handle.set_status(BuildStatus::Skipped)?;
            return Ok(BuildStatus::Skipped);
        }

        let job = BuildJob {
            slug: request.slug.clone(),
            revision: request.revision.clone(),
        };

        handle.set_status(BuildStatus::Syncing)?;
        handle.append_output(&format!("updating {}\n", job.slug))?;
        if let Err(e) = self.executor.sync(&job, handle).await {
            return fail(handle, "update", e);
        }

        handle.set_status(BuildStatus::Provisioning)?;
        if let Err(e) = self.executor.provision(&job, handle).await {
            return fail(handle, "provision", e);
        }

        handle.set_status(BuildStatus::Succeeded)?;
        Ok(BuildStatus::Succeeded)
    }
}

fn fail(
    handle: &EventHandle,
    step: &str,
    error: impl std::fmt::Display,
) -> Result<BuildStatus, StoreError> {
    tracing::warn!(event_id = handle.id(), step, "Build step failed: {error}");
    handle.append_output(&format!("failed to {step}: {error}\n"))?;
    handle.set_status(BuildStatus::Failed)?;
    Ok(BuildStatus::Failed)
}

/// Periodic `DurationTick` publisher bound to one event. Dropping it
/// (e.g. while unwinding) cancels the task as well.
struct Ticker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    _guard: DropGuard,
}

impl Ticker {
    fn start(store: Arc<EventStore>, event_id: u64, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticks.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => match store.duration_tick(event_id) {
                        Ok(true) => {}
                        Ok(false) | Err(_) => break,
                    },
                }
            }
        });

        Self {
            _guard: cancel.clone().drop_guard(),
            cancel,
            task,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Duration ticker ended abnormally: {e}");
        }
    }
}
