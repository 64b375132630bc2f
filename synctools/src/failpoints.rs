use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Evaluated by every stage sub-task after processing an item and before forwarding it.
pub const STAGE__BEFORE_FORWARD: &str = "stage.before_forward";

/// Evaluates the failpoint `name`, failing with [`ErrorKind::ProcessingFailed`] when it is
/// configured to return.
///
/// The optional return parameter is attached as error detail. Without the `failpoints` feature
/// this is a no-op.
pub fn sync_fail_point(name: &str) -> SyncResult<()> {
    fail_point!(name, |parameter| {
        let detail = match parameter {
            Some(parameter) => format!("The failpoint '{name}' returned an error: {parameter}"),
            None => format!("The failpoint '{name}' returned an error"),
        };

        bail!(
            ErrorKind::ProcessingFailed,
            "An error occurred in a fail point",
            detail
        );
    });

    Ok(())
}
