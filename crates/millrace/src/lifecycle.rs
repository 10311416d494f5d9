//! Run-state lifecycle: admin operations, paused-record retry, and data
//! deletion.
//!
//! Run state moves only forward over its lattice. Pausing quiesces a run
//! without losing its position in the graph; resuming republishes the
//! current-status event so the step consumer picks the run back up.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::RunState;
use crate::run::{Object, Status, marshal};
use crate::store::{ListFilter, Order};
use crate::workflow::Workflow;

const DELETE_BATCH_SIZE: usize = 10;

impl<T: Object, S: Status> Workflow<T, S> {
    /// Pause a running record. No handler observes it until it resumes.
    pub async fn pause(&self, run_id: &str) -> Result<()> {
        let record = self.inner.store.lookup(run_id).await?;
        self.set_run_state(&record, RunState::Paused).await?;
        Ok(())
    }

    /// Resume a paused record. Its current-status event republishes, so the
    /// step consumer re-delivers the run to its handler.
    pub async fn resume(&self, run_id: &str) -> Result<()> {
        let record = self.inner.store.lookup(run_id).await?;
        if record.run_state != RunState::Paused {
            return Err(Error::InvalidRunStateTransition {
                from: record.run_state,
                to: RunState::Running,
            });
        }
        self.set_run_state(&record, RunState::Running).await?;
        Ok(())
    }

    /// Cancel a record. Terminal; the run never progresses again.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let record = self.inner.store.lookup(run_id).await?;
        self.set_run_state(&record, RunState::Cancelled).await?;
        Ok(())
    }

    /// Ask for the record's payload to be scrubbed. The data-deletion
    /// processor performs the scrub and marks the record `DataDeleted`;
    /// the record itself stays queryable.
    pub async fn request_data_deletion(&self, run_id: &str) -> Result<()> {
        let record = self.inner.store.lookup(run_id).await?;
        self.set_run_state(&record, RunState::RequestedDataDeleted)
            .await?;
        Ok(())
    }
}

/// Periodically resume records that have been paused longer than the
/// configured delay, in small batches.
pub(crate) async fn paused_retry_process<T: Object, S: Status>(
    workflow: Workflow<T, S>,
    ctx: CancellationToken,
) -> Result<()> {
    let retry = workflow.inner.paused_retry.clone();
    let poll = workflow
        .inner
        .default_options
        .resolve(&Default::default())
        .polling_frequency;

    loop {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let cutoff = workflow.inner.clock.now() - retry.resume_after;
        let paused = workflow
            .inner
            .store
            .list(
                &workflow.inner.name,
                0,
                retry.batch_size,
                Order::Asc,
                ListFilter {
                    run_state: Some(RunState::Paused),
                    updated_before: Some(cutoff),
                },
            )
            .await?;

        for record in paused {
            info!(
                workflow = %workflow.inner.name,
                run_id = %record.run_id,
                "auto-resuming paused record"
            );
            workflow.set_run_state(&record, RunState::Running).await?;
        }

        tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Scrub records whose deletion has been requested, leaving them queryable
/// in the `DataDeleted` run state.
pub(crate) async fn data_deletion_process<T: Object, S: Status>(
    workflow: Workflow<T, S>,
    ctx: CancellationToken,
) -> Result<()> {
    let poll = workflow
        .inner
        .default_options
        .resolve(&Default::default())
        .polling_frequency;

    loop {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let requested = workflow
            .inner
            .store
            .list(
                &workflow.inner.name,
                0,
                DELETE_BATCH_SIZE,
                Order::Asc,
                ListFilter {
                    run_state: Some(RunState::RequestedDataDeleted),
                    updated_before: None,
                },
            )
            .await?;

        for record in requested {
            let scrubbed = match &workflow.inner.custom_delete {
                Some(delete) => delete(&record)?,
                None => marshal(&T::default())?,
            };

            let mut scrubbed_record = record.clone();
            scrubbed_record.object = scrubbed;
            workflow
                .set_run_state(&scrubbed_record, RunState::DataDeleted)
                .await?;

            debug!(
                workflow = %workflow.inner.name,
                run_id = %record.run_id,
                "record data deleted"
            );
        }

        tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
