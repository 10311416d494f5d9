//! The role-leased processor loop.
//!
//! Every long-lived processor runs inside this loop. It blocks on the role
//! scheduler before processing, so at most one replica works a given role;
//! a clean process return releases the role immediately, handing it to
//! whichever replica is waiting.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::Result;
use crate::run::{Object, Status};
use crate::workflow::{ProcessState, Workflow};

/// Drive `process` under `role` until the workflow shuts down.
///
/// The loop never exits except via root-context cancellation. Lease loss and
/// leased-context cancellation are retry signals: the loop re-requests the
/// role, and the root check at the top of the loop handles true shutdown.
/// Any other process error is logged and retried after `err_back_off`,
/// bounded by the leased context.
pub(crate) async fn run_leased<T, S, F, Fut>(
    workflow: Workflow<T, S>,
    role: String,
    process_name: String,
    err_back_off: Duration,
    process: F,
) where
    T: Object,
    S: Status,
    F: Fn(Workflow<T, S>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    let root = workflow.inner.shutdown.clone();

    loop {
        workflow.update_state(&process_name, ProcessState::Idle);

        if root.is_cancelled() {
            break;
        }

        let lease = match workflow.inner.scheduler.acquire(&root, &role).await {
            Ok(lease) => lease,
            Err(err) if err.is_cancellation() => break,
            Err(err) => {
                error!(role = %role, error = %err, "error awaiting role");
                tokio::select! {
                    _ = root.cancelled() => break,
                    _ = tokio::time::sleep(err_back_off) => {}
                }
                continue;
            }
        };

        workflow.update_state(&process_name, ProcessState::Running);

        match process(workflow.clone(), lease.ctx().clone()).await {
            Ok(()) => {
                // Clean completion: release so another replica can take over.
                lease.release();
            }
            Err(err) if err.is_cancellation() => {
                debug!(role = %role, "process interrupted, re-requesting role");
                lease.release();
            }
            Err(err) => {
                error!(
                    role = %role,
                    process_name = %process_name,
                    error = %err,
                    "process error"
                );
                tokio::select! {
                    _ = lease.ctx().cancelled() => {}
                    _ = tokio::time::sleep(err_back_off) => {}
                }
                lease.release();
            }
        }
    }

    workflow.update_state(&process_name, ProcessState::Shutdown);
    debug!(role = %role, process_name = %process_name, "processor shut down");
}
