//! Connectors: parallel input edges into the workflow.
//!
//! A *source connector* adapts an external event source the engine does not
//! store; its handler receives a cloned workflow handle and may consult the
//! store or trigger transitions in any workflow by foreign id. A *workflow
//! connector* consumes a `(workflow, status)` topic of another workflow to
//! drive this one. Both run under the role-leased loop and validate
//! transitions through the same graph as step processors.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::consumer::owns_event;
use crate::error::{Error, Result};
use crate::record::topic;
use crate::run::{Object, Status};
use crate::stream::ConsumerOptions;
use crate::workflow::Workflow;

/// An event yielded by an external source connector.
#[derive(Debug, Clone)]
pub struct ConnectorEvent {
    /// Source-assigned identifier, unique within the source.
    pub id: String,
    /// External correlation key, used to reach workflow runs.
    pub foreign_id: String,
    /// Source-specific event type.
    pub event_type: String,
    pub headers: HashMap<String, String>,
    pub created_at: OffsetDateTime,
}

/// Builds the connector's consumer once per leased process.
#[async_trait]
pub trait ConnectorConstructor: Send + Sync {
    async fn make(&self, ctx: &CancellationToken) -> Result<Box<dyn ConnectorConsumer>>;
}

/// A consumer of external connector events.
///
/// `recv` blocks until an event arrives or `ctx` is cancelled; `ack` marks
/// the event processed at the source.
#[async_trait]
pub trait ConnectorConsumer: Send {
    async fn recv(&mut self, ctx: &CancellationToken) -> Result<ConnectorEvent>;

    async fn ack(&mut self, event: &ConnectorEvent) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

fn connector_shard_of(foreign_id: &str, shard: usize, total: usize) -> bool {
    if total < 2 {
        return true;
    }
    crate::consumer::shard_of(foreign_id, total) == shard - 1
}

pub(crate) async fn connector_process<T: Object, S: Status>(
    workflow: Workflow<T, S>,
    ctx: CancellationToken,
    index: usize,
    shard: usize,
    total: usize,
) -> Result<()> {
    let Some(config) = workflow.inner.connectors.get(index) else {
        return Err(Error::backend(anyhow::anyhow!(
            "connector index {index} out of range"
        )));
    };

    let mut consumer = config.constructor.make(&ctx).await?;

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

        if !connector_shard_of(&event.foreign_id, shard, total) {
            consumer.ack(&event).await?;
            continue;
        }

        if let Err(err) = (config.f)(workflow.clone(), event.clone()).await {
            consumer.close().await.ok();
            return Err(err);
        }
        consumer.ack(&event).await?;
    }
}

pub(crate) async fn workflow_connector_process<T: Object, S: Status>(
    workflow: Workflow<T, S>,
    ctx: CancellationToken,
    index: usize,
    shard: usize,
    total: usize,
) -> Result<()> {
    let Some(config) = workflow.inner.workflow_connectors.get(index) else {
        return Err(Error::backend(anyhow::anyhow!(
            "workflow connector index {index} out of range"
        )));
    };
    let options = config.options.resolve(&workflow.inner.default_options);

    let source_topic = topic(&config.workflow_name, config.status);
    let role = format!(
        "{}-connector-{}-{}-{}-of-{}",
        workflow.inner.name, config.workflow_name, config.status, shard, total
    );
    let mut consumer = config
        .streamer
        .new_consumer(
            &source_topic,
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

        if let Err(err) = (config.f)(workflow.clone(), event.clone()).await {
            consumer.close().await.ok();
            return Err(err);
        }
        consumer.ack(&event).await?;
    }
}
