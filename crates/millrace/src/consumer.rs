//! The step (consumer) processor.
//!
//! One per `(status, shard)`. Subscribes to the topic for the status it
//! consumes, materialises the record behind each event, invokes the user
//! step, and durably advances the record before acknowledging. Events whose
//! record has moved on, quiesced, or vanished are acknowledged and skipped;
//! that status comparison is what makes redelivery harmless.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::builder::ResolvedOptions;
use crate::error::{Error, Result};
use crate::record::{RunState, topic};
use crate::run::{Object, Run, Status};
use crate::stream::{ConsumerOptions, Event, EventConsumer};
use crate::workflow::Workflow;

/// Deterministic shard assignment for a run id.
pub(crate) fn shard_of(run_id: &str, total: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    run_id.hash(&mut hasher);
    (hasher.finish() % total as u64) as usize
}

pub(crate) fn owns_event(event: &Event, shard: usize, total: usize) -> bool {
    if total < 2 {
        return true;
    }
    match event.run_id() {
        Some(run_id) => shard_of(run_id, total) == shard - 1,
        None => shard == 1,
    }
}

pub(crate) async fn step_process<T: Object, S: Status>(
    workflow: Workflow<T, S>,
    ctx: CancellationToken,
    status_code: i32,
    shard: usize,
    total: usize,
) -> Result<()> {
    let Some(config) = workflow.inner.consumers.get(&status_code) else {
        return Err(Error::StatusNotConfigured {
            workflow: workflow.inner.name.clone(),
            status: status_code,
        });
    };
    let options = config.options.resolve(&workflow.inner.default_options);

    let topic = topic(&workflow.inner.name, status_code);
    let role = format!(
        "{}-{}-consumer-{}-of-{}",
        workflow.inner.name, status_code, shard, total
    );
    let mut consumer = workflow
        .inner
        .streamer
        .new_consumer(
            &topic,
            &role,
            ConsumerOptions {
                poll_frequency: options.polling_frequency,
                lag: options.lag,
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

        if !owns_event(&event, shard, total) {
            consumer.ack(&event).await?;
            continue;
        }

        alert_if_lagging(&workflow, &event, &options, &role);

        if let Err(err) =
            handle_event(&workflow, status_code, &event, &options, &role, consumer.as_mut()).await
        {
            consumer.close().await.ok();
            return Err(err);
        }
    }
}

fn alert_if_lagging<T: Object, S: Status>(
    workflow: &Workflow<T, S>,
    event: &Event,
    options: &ResolvedOptions,
    role: &str,
) {
    let age = workflow.inner.clock.now() - event.created_at;
    if age > options.lag_alert {
        warn!(
            role = %role,
            event_id = event.id,
            age_seconds = age.whole_seconds(),
            "consumer lagging behind the event stream"
        );
    }
}

async fn handle_event<T: Object, S: Status>(
    workflow: &Workflow<T, S>,
    status_code: i32,
    event: &Event,
    options: &ResolvedOptions,
    role: &str,
    consumer: &mut dyn EventConsumer,
) -> Result<()> {
    let Some(run_id) = event.run_id().map(str::to_owned) else {
        warn!(role = %role, event_id = event.id, "event missing run id header");
        return consumer.ack(event).await;
    };

    let record = match workflow.inner.store.lookup(&run_id).await {
        Ok(record) => record,
        Err(Error::RecordNotFound) => {
            debug!(role = %role, run_id = %run_id, "record absent, skipping event");
            return consumer.ack(event).await;
        }
        Err(err) => return Err(err),
    };

    // Paused, cancelled, completed, and deleted records are quiescent.
    if !record.run_state.is_processable() {
        return consumer.ack(event).await;
    }

    // Stale delivery: the record has already advanced past this status.
    if record.status != status_code {
        debug!(
            role = %role,
            run_id = %run_id,
            record_status = record.status,
            event_status = status_code,
            "stale event, skipping"
        );
        return consumer.ack(event).await;
    }

    let config = workflow
        .inner
        .consumers
        .get(&status_code)
        .ok_or_else(|| Error::StatusNotConfigured {
            workflow: workflow.inner.name.clone(),
            status: status_code,
        })?;

    let mut run = Run::from_wire(&record)?;

    match (config.f)(&mut run).await {
        Ok(Some(next)) => {
            workflow.advance(&run, next).await?;
            workflow.inner.error_counter.clear(role, &run_id);
            consumer.ack(event).await
        }
        Ok(None) => {
            // Handler chose not to advance; acknowledge and move on.
            workflow.inner.error_counter.clear(role, &run_id);
            consumer.ack(event).await
        }
        Err(err) => {
            let count = workflow.inner.error_counter.add(role, &run_id);
            if count >= options.pause_after_err_count {
                warn!(
                    role = %role,
                    run_id = %run_id,
                    errors = count,
                    error = %err,
                    "pausing run after repeated handler errors"
                );
                workflow
                    .set_run_state(&record, RunState::Paused)
                    .await?;
                workflow.inner.error_counter.clear(role, &run_id);
                return consumer.ack(event).await;
            }
            // Propagate so the role loop applies backoff; the unacked event
            // redelivers.
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use time::OffsetDateTime;

    use crate::record::Header;

    fn event_for(run_id: &str) -> Event {
        Event {
            id: 1,
            record_id: 1,
            status: 1,
            headers: HashMap::from([(Header::RunId, run_id.to_owned())]),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn sharding_is_deterministic() {
        for run_id in ["r-1", "r-2", "some-longer-run-id"] {
            assert_eq!(shard_of(run_id, 4), shard_of(run_id, 4));
        }
    }

    #[test]
    fn sharding_partitions_all_runs() {
        let total = 3;
        for i in 0..100 {
            let run_id = format!("run-{i}");
            let shard = shard_of(&run_id, total);
            assert!(shard < total);

            let event = event_for(&run_id);
            let owners: Vec<usize> = (1..=total)
                .filter(|&candidate| owns_event(&event, candidate, total))
                .collect();
            assert_eq!(owners.len(), 1, "exactly one shard owns {run_id}");
        }
    }

    #[test]
    fn single_shard_owns_everything() {
        let event = event_for("r-1");
        assert!(owns_event(&event, 1, 1));

        let mut headerless = event.clone();
        headerless.headers.clear();
        assert!(owns_event(&headerless, 1, 1));
    }

    #[test]
    fn headerless_events_land_on_first_shard() {
        let mut event = event_for("r-1");
        event.headers.clear();

        assert!(owns_event(&event, 1, 3));
        assert!(!owns_event(&event, 2, 3));
        assert!(!owns_event(&event, 3, 3));
    }
}
