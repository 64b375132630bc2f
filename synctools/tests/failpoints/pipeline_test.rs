use fail::FailScenario;
use synctools::failpoints::STAGE__BEFORE_FORWARD;
use synctools::{ErrorKind, Pipeline, typed};
use synctools_telemetry::tracing::init_test_tracing;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::common::{TEST_TIMEOUT, VecIo};

/// Configures failpoints for the lifetime of a test and switches them off afterwards.
struct CustomFailScenario<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<String>,
}

impl<'a> CustomFailScenario<'a> {
    fn setup(failpoints: &[(&str, &str)]) -> CustomFailScenario<'a> {
        let scenario = FailScenario::setup();
        for (failpoint, action) in failpoints {
            fail::cfg(*failpoint, action).unwrap();
        }

        Self {
            _scenario: scenario,
            failpoints: failpoints
                .iter()
                .map(|(failpoint, _)| failpoint.to_string())
                .collect(),
        }
    }
}

impl Drop for CustomFailScenario<'_> {
    fn drop(&mut self) {
        for failpoint in &self.failpoints {
            fail::cfg(failpoint.as_str(), "off").unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_forward_fails_the_run() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(STAGE__BEFORE_FORWARD, "1*off->return(forward)")]);

    let io = VecIo::<u64, u64>::new((1..=10).collect());
    let pipeline = Pipeline::new(io.clone());
    pipeline
        .add(
            "forward",
            1,
            typed(|_token, input: u64| async move { Ok(input) }),
        )
        .unwrap();

    let err = timeout(TEST_TIMEOUT, pipeline.run(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProcessingFailed);
    assert!(err.detail().unwrap().contains("forward"));

    // Only the item processed before the failpoint triggered could have been forwarded.
    assert!(io.outputs().iter().all(|&output| output == 1));
}
