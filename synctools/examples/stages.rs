/*
Stages Example

Runs a two-stage pipeline over a generated stream of integers. The first stage
squares every number after a simulated delay, the second renders it as text.
Metrics snapshots of both stages are logged periodically, and the first stage
can be resized while the pipeline runs.

Usage:
    cargo run --example stages -- \
        --items 200 \
        --square-capacity 2 \
        --render-capacity 4 \
        --delay-ms 10 \
        --resize-to 16

Stage capacities can also come from a configuration directory holding
`base.yaml` and `{APP_ENVIRONMENT}.yaml` (see `synctools/configuration`):
    cargo run --example stages -- --config-dir synctools/configuration
*/

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser};
use synctools::{Inlet, Outlet, Pipeline, PipelineIo, SyncResult, recv, send, typed};
use synctools_config::environment::Environment;
use synctools_config::load::load_config_from;
use synctools_config::shared::PipelineConfig;
use synctools_telemetry::tracing::init_tracing;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "stages", version, about)]
struct AppArgs {
    /// Number of integers fed into the pipeline
    #[arg(long, default_value = "100")]
    items: u64,

    #[clap(flatten)]
    stage_args: StageArgs,

    /// Interval between metrics snapshots (in milliseconds)
    #[arg(long, default_value = "250")]
    report_interval_ms: u64,

    /// Directory with pipeline configuration files; overrides the stage capacities
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct StageArgs {
    /// Initial concurrency of the squaring stage
    #[arg(long, default_value = "2")]
    square_capacity: usize,

    /// Concurrency of the rendering stage
    #[arg(long, default_value = "4")]
    render_capacity: usize,

    /// Simulated processing time of the squaring stage (in milliseconds)
    #[arg(long, default_value = "20")]
    delay_ms: u64,

    /// Capacity the squaring stage is resized to once a quarter of the items went through
    #[arg(long)]
    resize_to: Option<usize>,
}

/// Feeds `0..items` and logs every rendered line.
#[derive(Debug, Clone)]
struct CountingIo {
    items: u64,
}

impl PipelineIo for CountingIo {
    async fn feed(&self, token: CancellationToken, outlet: Outlet) -> SyncResult<()> {
        for item in 0..self.items {
            send(&token, item, &outlet).await?;
        }

        Ok(())
    }

    async fn collect(&self, token: CancellationToken, mut inlet: Inlet) -> SyncResult<()> {
        let mut collected = 0u64;
        while let Some(line) = recv::<String>(&token, &mut inlet).await? {
            collected += 1;
            tracing::debug!(%line, "collected");
        }

        info!(collected, "collector drained its input");

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    if let Err(e) = main_impl().await {
        error!("{e}");
        std::process::exit(1);
    }

    Ok(())
}

async fn main_impl() -> Result<(), Box<dyn Error>> {
    init_tracing("stages=info,synctools=info")?;

    let args = AppArgs::parse();
    let stage_args = args.stage_args;
    let delay = Duration::from_millis(stage_args.delay_ms);

    let io = CountingIo { items: args.items };
    let square = typed(move |_token, item: u64| async move {
        sleep(delay).await;
        Ok(item * item)
    });
    let render = typed(|_token, item: u64| async move { Ok(format!("square = {item}")) });

    let pipeline = match &args.config_dir {
        Some(config_dir) => {
            let config: PipelineConfig = load_config_from(config_dir, Environment::load()?)?;
            info!(?config, "loaded pipeline configuration");

            let pipeline = Pipeline::with_config(io, config)?;
            pipeline.add_configured("square", square)?;
            pipeline.add_configured("render", render)?;
            pipeline
        }
        None => {
            let pipeline = Pipeline::new(io);
            pipeline.add("square", stage_args.square_capacity, square)?;
            pipeline.add("render", stage_args.render_capacity, render)?;
            pipeline
        }
    };
    let pipeline = Arc::new(pipeline);

    let token = CancellationToken::new();
    let run = {
        let pipeline = pipeline.clone();
        let token = token.clone();
        tokio::spawn(async move { pipeline.run(&token).await })
    };

    let reporter = {
        let pipeline = pipeline.clone();
        let token = token.clone();
        let resize_after = args.items / 4;
        let mut resize_to = stage_args.resize_to;
        let period = Duration::from_millis(args.report_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticks = interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {}
                }

                for name in pipeline.stage_names() {
                    let Ok(metrics) = pipeline.stage_metrics(&name) else {
                        continue;
                    };
                    info!(
                        stage = %name,
                        capacity = metrics.capacity,
                        active = metrics.active,
                        waiting = metrics.waiting,
                        finished = metrics.finished,
                        active_time_ms = metrics.active_time.as_millis() as u64,
                        "stage metrics"
                    );

                    if name == "square" && metrics.finished >= resize_after {
                        if let Some(capacity) = resize_to.take() {
                            match pipeline.resize(&name, capacity) {
                                Ok(previous) => info!(previous, capacity, "resized square stage"),
                                Err(err) => error!(error = %err, "failed to resize square stage"),
                            }
                        }
                    }
                }
            }
        })
    };

    let result = run.await?;
    token.cancel();
    reporter.await?;

    result?;
    info!("pipeline completed");

    Ok(())
}
