//! The timeout subsystem: inserter and poller.
//!
//! The inserter consumes the same topic as the status's step consumer and
//! writes a timeout entry per configured timer the first time it sees each
//! record, keyed uniquely by `(run, status, timer index)` so redelivery is
//! harmless. The poller sweeps expired entries on an interval and fires the
//! associated timeout function, advancing the record exactly as a step
//! would. Firing is at-least-once; timeout functions must tolerate
//! duplicates.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::record::{RunState, topic};
use crate::run::{Object, Run, Status};
use crate::store::{TimeoutRecord, TimeoutStore};
use crate::stream::ConsumerOptions;
use crate::workflow::Workflow;

fn timeout_store<T: Object, S: Status>(
    workflow: &Workflow<T, S>,
) -> Result<Arc<dyn TimeoutStore>> {
    workflow
        .inner
        .timeout_store
        .clone()
        .ok_or_else(|| Error::backend(anyhow::anyhow!("timeout store not configured")))
}

/// Stream-driven creation of timeout entries for records entering a status.
pub(crate) async fn inserter_process<T: Object, S: Status>(
    workflow: Workflow<T, S>,
    ctx: CancellationToken,
    status_code: i32,
) -> Result<()> {
    let Some(config) = workflow.inner.timeouts.get(&status_code) else {
        return Err(Error::StatusNotConfigured {
            workflow: workflow.inner.name.clone(),
            status: status_code,
        });
    };
    let options = config.options.resolve(&workflow.inner.default_options);
    let store = timeout_store(&workflow)?;

    let topic = topic(&workflow.inner.name, status_code);
    let role = format!("{}-{}-timeout-consumer", workflow.inner.name, status_code);
    let mut consumer = workflow
        .inner
        .streamer
        .new_consumer(
            &topic,
            &role,
            ConsumerOptions {
                poll_frequency: options.polling_frequency,
                lag: std::time::Duration::ZERO,
            },
        )
        .await?;

    loop {
        if ctx.is_cancelled() {
            consumer.close().await?;
            return Err(Error::Cancelled);
        }

        let event = match consumer.recv(&ctx).await {
            Ok(event) => event,
            Err(err) => {
                consumer.close().await?;
                return Err(err);
            }
        };

        let Some(run_id) = event.run_id().map(str::to_owned) else {
            consumer.ack(&event).await?;
            continue;
        };

        let record = match workflow.inner.store.lookup(&run_id).await {
            Ok(record) => record,
            Err(Error::RecordNotFound) => {
                consumer.ack(&event).await?;
                continue;
            }
            Err(err) => {
                consumer.close().await.ok();
                return Err(err);
            }
        };

        if record.status != status_code || !record.run_state.is_processable() {
            consumer.ack(&event).await?;
            continue;
        }

        let run = match Run::<T, S>::from_wire(&record) {
            Ok(run) => run,
            Err(err) => {
                consumer.close().await.ok();
                return Err(err);
            }
        };

        let now = workflow.inner.clock.now();
        for (timer_index, transition) in config.transitions.iter().enumerate() {
            let expire_at = match (transition.timer)(&run, now).await {
                Ok(Some(at)) => at,
                Ok(None) => continue,
                Err(err) => {
                    consumer.close().await.ok();
                    return Err(err);
                }
            };

            store
                .create(TimeoutRecord {
                    id: 0,
                    workflow_name: workflow.inner.name.clone(),
                    run_id: run_id.clone(),
                    foreign_id: record.foreign_id.clone(),
                    status: status_code,
                    timer_index,
                    expire_at,
                    completed: false,
                    created_at: now,
                })
                .await?;
        }

        consumer.ack(&event).await?;
    }
}

/// Interval sweep of expired timeout entries.
pub(crate) async fn poller_process<T: Object, S: Status>(
    workflow: Workflow<T, S>,
    ctx: CancellationToken,
    status_code: i32,
) -> Result<()> {
    let Some(config) = workflow.inner.timeouts.get(&status_code) else {
        return Err(Error::StatusNotConfigured {
            workflow: workflow.inner.name.clone(),
            status: status_code,
        });
    };
    let options = config.options.resolve(&workflow.inner.default_options);
    let store = timeout_store(&workflow)?;
    let role = format!("{}-{}-timeout", workflow.inner.name, status_code);

    loop {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let now = workflow.inner.clock.now();
        let expired = store
            .list_expired(&workflow.inner.name, status_code, now)
            .await?;

        for entry in expired {
            fire_one(&workflow, &store, &role, status_code, &entry, options.pause_after_err_count)
                .await?;
        }

        tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(options.polling_frequency) => {}
        }
    }
}

async fn fire_one<T: Object, S: Status>(
    workflow: &Workflow<T, S>,
    store: &Arc<dyn TimeoutStore>,
    role: &str,
    status_code: i32,
    entry: &TimeoutRecord,
    pause_after_err_count: u32,
) -> Result<()> {
    let record = match workflow.inner.store.lookup(&entry.run_id).await {
        Ok(record) => record,
        Err(Error::RecordNotFound) => {
            return store.complete(entry.id).await;
        }
        Err(err) => return Err(err),
    };

    // Moved on or finished: the deadline no longer applies.
    if record.status != status_code || record.run_state.is_terminal() {
        return store.complete(entry.id).await;
    }
    // Paused records keep their deadlines; the entry fires after a resume.
    if record.run_state != RunState::Running {
        return Ok(());
    }

    let Some(config) = workflow.inner.timeouts.get(&status_code) else {
        return store.complete(entry.id).await;
    };
    let Some(transition) = config.transitions.get(entry.timer_index) else {
        // Configuration shrank since the entry was written.
        warn!(
            role = %role,
            run_id = %entry.run_id,
            timer_index = entry.timer_index,
            "timeout entry has no matching timer, completing"
        );
        return store.complete(entry.id).await;
    };

    let mut run = Run::from_wire(&record)?;
    let now = workflow.inner.clock.now();

    match (transition.f)(&mut run, now).await {
        Ok(Some(next)) => {
            workflow.advance(&run, next).await?;
            workflow.inner.error_counter.clear(role, &entry.run_id);
            store.complete(entry.id).await
        }
        Ok(None) => {
            debug!(role = %role, run_id = %entry.run_id, "timeout completed without transition");
            workflow.inner.error_counter.clear(role, &entry.run_id);
            store.complete(entry.id).await
        }
        Err(err) => {
            let count = workflow.inner.error_counter.add(role, &entry.run_id);
            if count >= pause_after_err_count {
                warn!(
                    role = %role,
                    run_id = %entry.run_id,
                    errors = count,
                    error = %err,
                    "pausing run after repeated timeout errors"
                );
                workflow.set_run_state(&record, RunState::Paused).await?;
                workflow.inner.error_counter.clear(role, &entry.run_id);
                return Ok(());
            }
            Err(err)
        }
    }
}
