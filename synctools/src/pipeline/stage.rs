use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use crate::concurrency::channel::{Inlet, Outlet, Value, downcast, recv_value, send_value};
use crate::concurrency::group::TaskGroup;
use crate::error::SyncResult;
use crate::failpoints::{STAGE__BEFORE_FORWARD, sync_fail_point};
use crate::waypoint::Waypoint;

/// Future returned by a stage function.
pub type StageFuture = BoxFuture<'static, SyncResult<Value>>;

/// Type-erased processing function of a stage.
pub type StageFn = Arc<dyn Fn(CancellationToken, Value) -> StageFuture + Send + Sync>;

/// Adapts a function over concrete input and output types into a stage function.
///
/// The returned function downcasts every incoming [`Value`] to `In`, failing with
/// [`crate::error::ErrorKind::TypeMismatch`] if the upstream task sent something else, and boxes
/// the produced `Out`.
pub fn typed<In, Out, F, Fut>(
    func: F,
) -> impl Fn(CancellationToken, Value) -> StageFuture + Send + Sync + 'static
where
    In: Any + Send,
    Out: Any + Send,
    F: Fn(CancellationToken, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<Out>> + Send + 'static,
{
    move |token: CancellationToken, value: Value| -> StageFuture {
        match downcast::<In>(value) {
            Ok(input) => func(token, input)
                .map(|output| output.map(|output| Box::new(output) as Value))
                .boxed(),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }
}

/// A named pipeline step.
///
/// The waypoint bounding the stage's concurrency only exists once the stage was started.
pub(crate) struct Stage {
    name: Arc<str>,
    capacity: usize,
    func: StageFn,
    waypoint: Option<Waypoint>,
}

impl Stage {
    pub(crate) fn new(name: &str, capacity: usize, func: StageFn) -> Self {
        Self {
            name: Arc::from(name),
            capacity,
            func,
            waypoint: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn waypoint(&self) -> Option<&Waypoint> {
        self.waypoint.as_ref()
    }

    /// Creates the stage's waypoint and returns the runner that drives it.
    pub(crate) fn start(&mut self) -> StageRunner {
        let waypoint = Waypoint::with_label(self.name.as_ref(), self.capacity);
        self.waypoint = Some(waypoint.clone());

        StageRunner {
            name: self.name.clone(),
            func: self.func.clone(),
            waypoint,
        }
    }
}

/// Task driving one started stage.
pub(crate) struct StageRunner {
    name: Arc<str>,
    func: StageFn,
    waypoint: Waypoint,
}

impl StageRunner {
    /// Reads `inlet` until it is exhausted, processing every item in its own sub-task once the
    /// waypoint admits it, and forwards results to `outlet`.
    ///
    /// `outlet` is dropped only after every sub-task finished, which is what closes the
    /// downstream channel.
    pub(crate) async fn run(
        self,
        token: CancellationToken,
        inlet: Inlet,
        outlet: Outlet,
    ) -> SyncResult<()> {
        let span = info_span!("stage", stage = %self.name);
        self.process(token, inlet, outlet).instrument(span).await
    }

    async fn process(self, token: CancellationToken, mut inlet: Inlet, outlet: Outlet) -> SyncResult<()> {
        info!(capacity = self.waypoint.metrics().capacity, "stage started");

        let mut group = TaskGroup::new(&token);
        let mut items = 0u64;

        if let Err(err) = self.read(&mut group, &mut inlet, &outlet, &mut items).await {
            group.fail(err);
        }

        let result = group.wait().await;
        drop(outlet);

        self.waypoint.close().wait().await;

        match &result {
            Ok(()) => info!(items, "stage finished"),
            Err(err) => debug!(items, error_kind = ?err.kind(), "stage stopped"),
        }

        result
    }

    /// Admits every item read from `inlet` and spawns its processing into `group`.
    ///
    /// Blocks the reader, not the sub-tasks, while the stage is at capacity.
    async fn read(
        &self,
        group: &mut TaskGroup,
        inlet: &mut Inlet,
        outlet: &Outlet,
        items: &mut u64,
    ) -> SyncResult<()> {
        let token = group.token();

        while let Some(value) = recv_value(&token, inlet).await? {
            let worker = self.waypoint.wait(&token).await?;
            *items += 1;

            let func = self.func.clone();
            let outlet = outlet.clone();
            let token = token.clone();
            group.spawn(
                async move {
                    let output = func(token.clone(), value).await?;
                    sync_fail_point(STAGE__BEFORE_FORWARD)?;
                    send_value(&token, output, &outlet).await?;
                    worker.done();

                    Ok(())
                }
                .in_current_span(),
            );
        }

        Ok(())
    }
}
