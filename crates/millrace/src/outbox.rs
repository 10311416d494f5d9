//! The outbox publisher.
//!
//! Record writes buffer their events in the store's outbox; this processor
//! sweeps the buffer in order, publishes each event on its topic, and
//! deletes the row only after the send succeeds. Publishing is therefore
//! at-least-once and consumers must tolerate duplicates, which the step
//! processor's status check already guarantees.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};
use crate::record::OutboxEvent;
use crate::run::{Object, Status};
use crate::stream::EventProducer;
use crate::workflow::Workflow;

const BATCH_SIZE: usize = 100;

pub(crate) async fn publish_process<T: Object, S: Status>(
    workflow: Workflow<T, S>,
    ctx: CancellationToken,
) -> Result<()> {
    let config = workflow.inner.outbox.clone();
    let mut producers: HashMap<String, Box<dyn EventProducer>> = HashMap::new();

    let result = loop {
        if ctx.is_cancelled() {
            break Err(Error::Cancelled);
        }

        let rows = match workflow
            .inner
            .store
            .list_outbox_events(&workflow.inner.name, BATCH_SIZE)
            .await
        {
            Ok(rows) => rows,
            Err(err) => break Err(err),
        };

        if rows.is_empty() {
            tokio::select! {
                _ = ctx.cancelled() => break Err(Error::Cancelled),
                _ = tokio::time::sleep(config.polling_frequency) => {}
            }
            continue;
        }

        let mut failed = None;
        for row in rows {
            let event: OutboxEvent = match serde_json::from_slice(&row.data) {
                Ok(event) => event,
                Err(err) => {
                    failed = Some(Error::Serialization(err));
                    break;
                }
            };

            let age = workflow.inner.clock.now() - row.created_at;
            if age > config.lag_alert {
                warn!(
                    workflow = %workflow.inner.name,
                    outbox_id = row.id,
                    age_seconds = age.whole_seconds(),
                    "outbox event lagging behind"
                );
            }

            if !producers.contains_key(&event.topic) {
                match workflow.inner.streamer.new_producer(&event.topic).await {
                    Ok(producer) => {
                        producers.insert(event.topic.clone(), producer);
                    }
                    Err(err) => {
                        failed = Some(err);
                        break;
                    }
                }
            }
            let producer = &producers[&event.topic];

            if let Err(err) = producer.send(event.id, event.status, &event.headers).await {
                failed = Some(err);
                break;
            }
            if let Err(err) = workflow.inner.store.delete_outbox_event(row.id).await {
                failed = Some(err);
                break;
            }
        }

        if let Some(err) = failed {
            break Err(err);
        }
    };

    for (_, producer) in producers {
        producer.close().await.ok();
    }
    result
}
