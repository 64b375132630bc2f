use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use synctools::{ErrorKind, Pipeline, SyncResult, bail, typed};
use synctools_config::shared::{PipelineConfig, StageConfig};
use synctools_telemetry::tracing::init_test_tracing;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::common::{EndlessIo, TEST_TIMEOUT, VecIo};

/// Tracks how many stage invocations run at the same time.
#[derive(Clone, Default)]
struct Concurrency {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Concurrency {
    fn enter(&self) -> ConcurrencyGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        ConcurrencyGuard {
            current: self.current.clone(),
        }
    }

    fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ConcurrencyGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn every_input_reaches_the_collector_once() {
    init_test_tracing();

    let mut inputs: Vec<u64> = (1..=50).collect();
    inputs.shuffle(&mut rand::thread_rng());

    let io = VecIo::<u64, (u64, u64)>::new(inputs);
    let pipeline = Pipeline::new(io.clone());
    pipeline
        .add(
            "increment",
            50,
            typed(|_token, input: u64| async move {
                sleep(Duration::from_millis(25)).await;
                Ok((input, input + 1))
            }),
        )
        .unwrap();

    timeout(TEST_TIMEOUT, pipeline.run(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    let results: HashMap<u64, u64> = io.outputs().into_iter().collect();
    assert_eq!(results.len(), 50);
    for input in 1..=50 {
        assert_eq!(results[&input], input + 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_capacity_stage_processes_sequentially() {
    init_test_tracing();

    let io = VecIo::<u64, u64>::new((0..20).collect());
    let pipeline = Pipeline::new(io.clone());
    let concurrency = Concurrency::default();
    let starts = Arc::new(Mutex::new(Vec::new()));

    {
        let concurrency = concurrency.clone();
        let starts = starts.clone();
        pipeline
            .add(
                "sequential",
                1,
                typed(move |_token, input: u64| {
                    let concurrency = concurrency.clone();
                    let starts = starts.clone();
                    async move {
                        let _guard = concurrency.enter();
                        starts.lock().unwrap().push(Instant::now());
                        sleep(Duration::from_millis(2)).await;
                        Ok(input)
                    }
                }),
            )
            .unwrap();
    }

    timeout(TEST_TIMEOUT, pipeline.run(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(concurrency.peak(), 1);
    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 20);
    assert!(starts.windows(2).all(|pair| pair[0] <= pair[1]));

    // A single in-flight item forwards results in input order.
    assert_eq!(io.outputs(), (0..20).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_stage_does_not_preserve_order() {
    init_test_tracing();

    let io = VecIo::<u64, u64>::new((1..=10).collect());
    let pipeline = Pipeline::new(io.clone());
    pipeline
        .add(
            "reverse",
            10,
            typed(|_token, input: u64| async move {
                sleep(Duration::from_millis((11 - input) * 10)).await;
                Ok(input)
            }),
        )
        .unwrap();

    timeout(TEST_TIMEOUT, pipeline.run(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    let outputs = io.outputs();
    assert_ne!(outputs[0], 1);

    let mut sorted = outputs.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (1..=10).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn stages_run_in_registration_order() {
    init_test_tracing();

    let io = VecIo::<u64, String>::new((1..=30).collect());
    let pipeline = Pipeline::new(io.clone());
    pipeline
        .add(
            "double",
            4,
            typed(|_token, input: u64| async move { Ok(input * 2) }),
        )
        .unwrap();
    pipeline
        .add(
            "offset",
            2,
            typed(|_token, input: u64| async move { Ok(input + 1) }),
        )
        .unwrap();
    pipeline
        .add(
            "render",
            8,
            typed(|_token, input: u64| async move { Ok(format!("item-{input}")) }),
        )
        .unwrap();

    assert_eq!(pipeline.stage_names(), vec!["double", "offset", "render"]);

    timeout(TEST_TIMEOUT, pipeline.run(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    let mut outputs = io.outputs();
    outputs.sort_unstable();
    let mut expected: Vec<String> = (1..=30u64)
        .map(|input| format!("item-{}", input * 2 + 1))
        .collect();
    expected.sort_unstable();
    assert_eq!(outputs, expected);

    for name in ["double", "offset", "render"] {
        assert_eq!(pipeline.stage_metrics(name).unwrap().finished, 30);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_the_token_stops_the_run() {
    init_test_tracing();

    let pipeline = Arc::new(Pipeline::new(EndlessIo));
    let concurrency = Concurrency::default();

    {
        let concurrency = concurrency.clone();
        pipeline
            .add(
                "slow",
                4,
                typed(move |_token, input: u64| {
                    let concurrency = concurrency.clone();
                    async move {
                        let _guard = concurrency.enter();
                        sleep(Duration::from_millis(5)).await;
                        Ok(input)
                    }
                }),
            )
            .unwrap();
    }

    let token = CancellationToken::new();
    let run = {
        let pipeline = pipeline.clone();
        let token = token.clone();
        tokio::spawn(async move { pipeline.run(&token).await })
    };

    sleep(Duration::from_millis(50)).await;
    token.cancel();

    let err = timeout(TEST_TIMEOUT, run)
        .await
        .expect("run should return promptly after cancellation")
        .unwrap()
        .unwrap_err();
    assert!(err.is_cancelled());

    assert_eq!(concurrency.current(), 0);
    let metrics = pipeline.stage_metrics("slow").unwrap();
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.waiting, 0);
    assert!(metrics.finished > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn processing_error_fails_the_run() {
    init_test_tracing();

    let io = VecIo::<u64, u64>::new((1..=20).collect());
    let pipeline = Pipeline::new(io.clone());
    pipeline
        .add(
            "validate",
            3,
            typed(|_token, input: u64| async move {
                if input == 7 {
                    bail!(
                        ErrorKind::ProcessingFailed,
                        "Input could not be validated",
                        format!("input {input}")
                    );
                }
                Ok(input)
            }),
        )
        .unwrap();

    let err = timeout(TEST_TIMEOUT, pipeline.run(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProcessingFailed);
    assert_eq!(err.detail(), Some("input 7"));
    assert!(!io.outputs().contains(&7));
}

#[tokio::test(flavor = "multi_thread")]
async fn unexpected_output_type_is_reported() {
    init_test_tracing();

    let io = VecIo::<u64, u64>::new(vec![1, 2, 3]);
    let pipeline = Pipeline::new(io.clone());
    pipeline
        .add(
            "render",
            1,
            typed(|_token, input: u64| async move { Ok(input.to_string()) }),
        )
        .unwrap();

    let err = timeout(TEST_TIMEOUT, pipeline.run(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    assert!(io.outputs().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn stage_can_be_resized_while_running() {
    init_test_tracing();

    let io = VecIo::<u64, u64>::new((0..40).collect());
    let pipeline = Arc::new(Pipeline::new(io.clone()));
    let concurrency = Concurrency::default();

    {
        let concurrency = concurrency.clone();
        pipeline
            .add(
                "work",
                1,
                typed(move |_token, input: u64| {
                    let concurrency = concurrency.clone();
                    async move {
                        let _guard = concurrency.enter();
                        sleep(Duration::from_millis(10)).await;
                        Ok(input)
                    }
                }),
            )
            .unwrap();
    }

    let run = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(&CancellationToken::new()).await })
    };

    timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(metrics) = pipeline.stage_metrics("work") {
                if metrics.finished >= 2 {
                    break;
                }
            }
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(concurrency.peak(), 1);
    assert_eq!(pipeline.resize("work", 8).unwrap(), 1);
    assert_eq!(pipeline.resize("work", 6).unwrap(), 8);

    timeout(TEST_TIMEOUT, run).await.unwrap().unwrap().unwrap();

    assert!(concurrency.peak() > 1);
    assert!(concurrency.peak() <= 8);
    assert_eq!(io.outputs().len(), 40);

    let metrics = pipeline.stage_metrics("work").unwrap();
    assert_eq!(metrics.capacity, 6);
    assert_eq!(metrics.finished, 40);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_side_task_cancels_the_pipeline() {
    init_test_tracing();

    let pipeline = Pipeline::new(EndlessIo);
    pipeline
        .add(
            "pass",
            2,
            typed(|_token, input: u64| async move { Ok(input) }),
        )
        .unwrap();
    pipeline
        .add_side_task(|_token| async {
            sleep(Duration::from_millis(20)).await;
            bail!(ErrorKind::ProcessingFailed, "Watchdog gave up");
        })
        .unwrap();

    let err = timeout(TEST_TIMEOUT, pipeline.run(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessingFailed);
}

#[tokio::test(flavor = "multi_thread")]
async fn configured_pipeline_applies_stage_capacities() {
    init_test_tracing();

    let config = PipelineConfig {
        channel_capacity: 4,
        stages: vec![StageConfig::new("square", 3)],
    };
    let io = VecIo::<u64, u64>::new((1..=12).collect());
    let pipeline = Pipeline::with_config(io.clone(), config).unwrap();
    let concurrency = Concurrency::default();

    {
        let concurrency = concurrency.clone();
        pipeline
            .add_configured(
                "square",
                typed(move |_token, input: u64| {
                    let concurrency = concurrency.clone();
                    async move {
                        let _guard = concurrency.enter();
                        sleep(Duration::from_millis(5)).await;
                        SyncResult::Ok(input * input)
                    }
                }),
            )
            .unwrap();
    }

    timeout(TEST_TIMEOUT, pipeline.run(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    assert!(concurrency.peak() <= 3);
    let mut outputs = io.outputs();
    outputs.sort_unstable();
    assert_eq!(
        outputs,
        (1..=12u64).map(|input| input * input).collect::<Vec<_>>()
    );
}
