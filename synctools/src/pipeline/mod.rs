//! Staged processing of data streams.
//!
//! A [`Pipeline`] moves values from a producer through an ordered sequence of stages into a
//! consumer. Every stage processes up to its capacity of items concurrently, bounded by its own
//! [`Waypoint`], and the capacity can be adjusted while the pipeline runs with
//! [`Pipeline::resize`].
//!
//! All tasks of a run share one [`TaskGroup`]: the first error anywhere cancels the whole run and
//! is returned from [`Pipeline::run`]. Output order is not guaranteed to match input order, since
//! items within a stage complete concurrently.

mod stage;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use synctools_config::shared::PipelineConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bail;
use crate::concurrency::channel::{Inlet, Outlet, Value, handoff_channel};
use crate::concurrency::group::TaskGroup;
use crate::error::{ErrorKind, SyncResult};
use crate::metrics::{ERROR_KIND_LABEL, SYNCTOOLS_PIPELINE_ERRORS_TOTAL};
use crate::waypoint::{Waypoint, WaypointMetrics};

use stage::Stage;
pub use stage::{StageFn, StageFuture, typed};

/// Data source and sink of a [`Pipeline`].
///
/// Implementations are cloned into the tasks of a run.
pub trait PipelineIo: Clone + Send + Sync + 'static {
    /// Sends zero or more values into `outlet` and returns.
    ///
    /// The pipeline closes the channel once this method returns, implementations only need to
    /// drop their handle.
    fn feed(
        &self,
        token: CancellationToken,
        outlet: Outlet,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Receives values from `inlet` until it is closed.
    ///
    /// Values may arrive in a different order than they were fed.
    fn collect(
        &self,
        token: CancellationToken,
        inlet: Inlet,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}

type SideTask = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, SyncResult<()>> + Send>;

/// Lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    NotStarted,
    Started,
}

struct PipelineInner {
    state: PipelineState,
    stages: Vec<Stage>,
    by_name: HashMap<String, usize>,
    side_tasks: Vec<SideTask>,
}

/// An ordered sequence of concurrency-bounded stages between a producer and a consumer.
pub struct Pipeline<I> {
    io: I,
    config: PipelineConfig,
    inner: Mutex<PipelineInner>,
}

impl<I> Pipeline<I>
where
    I: PipelineIo,
{
    /// Creates an empty pipeline with the default configuration.
    pub fn new(io: I) -> Self {
        Self::from_parts(io, PipelineConfig::default())
    }

    /// Creates an empty pipeline using `config`.
    ///
    /// Fails with [`ErrorKind::ConfigError`] if the configuration is invalid.
    pub fn with_config(io: I, config: PipelineConfig) -> SyncResult<Self> {
        config.validate()?;

        Ok(Self::from_parts(io, config))
    }

    fn from_parts(io: I, config: PipelineConfig) -> Self {
        Self {
            io,
            config,
            inner: Mutex::new(PipelineInner {
                state: PipelineState::NotStarted,
                stages: Vec::new(),
                by_name: HashMap::new(),
                side_tasks: Vec::new(),
            }),
        }
    }

    /// Returns the configuration of this pipeline.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Registers a stage named `name` processing up to `capacity` items concurrently.
    ///
    /// Data flows through stages in registration order. Fails with
    /// [`ErrorKind::AlreadyStarted`] once [`Pipeline::run`] was called and with
    /// [`ErrorKind::StageNameConflict`] if `name` is already registered.
    pub fn add<F, Fut>(&self, name: &str, capacity: usize, func: F) -> SyncResult<()>
    where
        F: Fn(CancellationToken, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<Value>> + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.state == PipelineState::Started {
            bail!(
                ErrorKind::AlreadyStarted,
                "Stages cannot be added to a started pipeline",
                format!("stage `{name}`")
            );
        }
        if inner.by_name.contains_key(name) {
            bail!(
                ErrorKind::StageNameConflict,
                "Stage name is already registered",
                format!("stage `{name}`")
            );
        }

        let func: StageFn =
            Arc::new(move |token: CancellationToken, value: Value| func(token, value).boxed());
        let index = inner.stages.len();
        inner.stages.push(Stage::new(name, capacity, func));
        inner.by_name.insert(name.to_owned(), index);

        info!(stage = name, capacity, index, "stage registered");

        Ok(())
    }

    /// Registers a stage whose capacity comes from the stage entry called `name` in the
    /// pipeline configuration.
    ///
    /// Fails with [`ErrorKind::StageNameUnknown`] if the configuration has no such entry,
    /// otherwise behaves like [`Pipeline::add`].
    pub fn add_configured<F, Fut>(&self, name: &str, func: F) -> SyncResult<()>
    where
        F: Fn(CancellationToken, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<Value>> + Send + 'static,
    {
        let Some(stage_config) = self.config.stage(name) else {
            bail!(
                ErrorKind::StageNameUnknown,
                "Stage is not present in the pipeline configuration",
                format!("stage `{name}`")
            );
        };

        self.add(name, stage_config.capacity, func)
    }

    /// Registers a task that runs alongside the pipeline's own tasks.
    ///
    /// The task receives the run's token and its error fails the whole run, so only tasks whose
    /// failure should stop the pipeline belong here. Fails with [`ErrorKind::AlreadyStarted`]
    /// once [`Pipeline::run`] was called.
    pub fn add_side_task<F, Fut>(&self, task: F) -> SyncResult<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.state == PipelineState::Started {
            bail!(
                ErrorKind::AlreadyStarted,
                "Side tasks cannot be added to a started pipeline"
            );
        }

        inner
            .side_tasks
            .push(Box::new(move |token: CancellationToken| task(token).boxed()));

        Ok(())
    }

    /// Sets the capacity of the stage called `name` and returns its previous capacity.
    ///
    /// Fails with [`ErrorKind::StageNameUnknown`] for an unregistered name, with
    /// [`ErrorKind::NotStarted`] before the pipeline runs and with
    /// [`ErrorKind::WaypointClosed`] once the stage has finished.
    pub fn resize(&self, name: &str, capacity: usize) -> SyncResult<usize> {
        let inner = self.lock();
        let waypoint = Self::stage_waypoint(&inner, name)?;

        waypoint.resize(capacity)
    }

    /// Returns a metrics snapshot of the stage called `name`.
    ///
    /// Fails under the same conditions as [`Pipeline::resize`], except that finished stages
    /// still report their final counters.
    pub fn stage_metrics(&self, name: &str) -> SyncResult<WaypointMetrics> {
        let inner = self.lock();
        let waypoint = Self::stage_waypoint(&inner, name)?;

        Ok(waypoint.metrics())
    }

    /// Returns the names of all registered stages in registration order.
    pub fn stage_names(&self) -> Vec<String> {
        self.lock()
            .stages
            .iter()
            .map(|stage| stage.name().to_owned())
            .collect()
    }

    /// Runs the pipeline until every task finished or one of them failed.
    ///
    /// Spawns one task for the producer, one per stage, one for the consumer and one per side
    /// task, connected by handoff channels. Cancelling `token` cancels the run. Fails with
    /// [`ErrorKind::NoStages`] without spawning anything if no stage is registered and with
    /// [`ErrorKind::AlreadyStarted`] if the pipeline already ran; otherwise returns the first
    /// error reported by any task.
    pub async fn run(&self, token: &CancellationToken) -> SyncResult<()> {
        let group = self.start(token)?;

        let result = group.wait().await;
        match &result {
            Ok(()) => info!("pipeline finished"),
            Err(err) => {
                error!(error = %err, error_kind = err.kind().as_str(), "pipeline failed");
                counter!(
                    SYNCTOOLS_PIPELINE_ERRORS_TOTAL,
                    ERROR_KIND_LABEL => err.kind().as_str()
                )
                .increment(1);
            }
        }

        result
    }

    /// Wires the channels and spawns every task of a run.
    fn start(&self, token: &CancellationToken) -> SyncResult<TaskGroup> {
        let mut inner = self.lock();
        if inner.state == PipelineState::Started {
            bail!(ErrorKind::AlreadyStarted, "Pipeline was already started");
        }
        if inner.stages.is_empty() {
            bail!(ErrorKind::NoStages, "No pipeline stages registered");
        }

        inner.state = PipelineState::Started;
        info!(
            stages = inner.stages.len(),
            side_tasks = inner.side_tasks.len(),
            channel_capacity = self.config.channel_capacity,
            "starting pipeline"
        );

        let mut group = TaskGroup::new(token);

        for side_task in inner.side_tasks.drain(..) {
            group.spawn(side_task(group.token()));
        }

        let (feed_outlet, mut upstream) = handoff_channel(self.config.channel_capacity);
        let io = self.io.clone();
        let feed_token = group.token();
        group.spawn(async move { io.feed(feed_token, feed_outlet).await });

        for stage in inner.stages.iter_mut() {
            let (outlet, downstream) = handoff_channel(self.config.channel_capacity);
            let runner = stage.start();
            group.spawn(runner.run(group.token(), upstream, outlet));
            upstream = downstream;
        }

        let io = self.io.clone();
        let collect_token = group.token();
        group.spawn(async move { io.collect(collect_token, upstream).await });

        Ok(group)
    }

    fn stage_waypoint<'a>(inner: &'a PipelineInner, name: &str) -> SyncResult<&'a Waypoint> {
        let Some(&index) = inner.by_name.get(name) else {
            bail!(
                ErrorKind::StageNameUnknown,
                "Stage name is not registered",
                format!("stage `{name}`")
            );
        };

        let Some(stage) = inner.stages.get(index) else {
            bail!(
                ErrorKind::CorruptedState,
                "Stage index is out of range",
                format!("stage `{name}` maps to index {index} of {}", inner.stages.len())
            );
        };

        let Some(waypoint) = stage.waypoint() else {
            bail!(
                ErrorKind::NotStarted,
                "Stage has no waypoint before the pipeline is started",
                format!("stage `{name}`")
            );
        };

        Ok(waypoint)
    }

    fn lock(&self) -> MutexGuard<'_, PipelineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
