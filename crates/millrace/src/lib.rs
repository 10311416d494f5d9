//! Durable, event-driven workflow engine.
//!
//! A workflow is a directed graph whose nodes are *statuses* and whose edges
//! are transitions produced by user handlers. Each in-flight instance, a
//! *run*, is persisted as a record whose status advances monotonically
//! through the graph until it reaches an endpoint or a terminal run state.
//! For each run, handlers observe statuses in order, and the same handler is
//! never executed concurrently by more than one replica of the engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Workflow<T, S>                               │
//! │                                                                      │
//! │  trigger ──► record store ──► outbox ──► event stream (topic w-s)    │
//! │                    ▲                          │                      │
//! │                    │                          ▼                      │
//! │              advance(next)  ◄──  step / timeout / callback /         │
//! │                                  connector processors                │
//! │                                  (each inside the role-leased loop)  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation republishes on the topic for the record's new status,
//! which drives the next processor. Multiple replicas cooperate through the
//! role scheduler: a processor blocks until it holds its role, so each role
//! runs on exactly one replica at a time.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use millrace::{Builder, BuildOptions, BoxFuture, Result, Run};
//!
//! fn reserve(run: &mut Run<Order, OrderStatus>) -> BoxFuture<'_, Result<Option<OrderStatus>>> {
//!     Box::pin(async move {
//!         run.object.reserved = true;
//!         Ok(Some(OrderStatus::Reserved))
//!     })
//! }
//!
//! let workflow = Builder::new("orders")
//!     .add_step(OrderStatus::Created, reserve, &[OrderStatus::Reserved])
//!     .add_step(OrderStatus::Reserved, ship, &[OrderStatus::Shipped])
//!     .build(streamer, store, scheduler, BuildOptions::default());
//!
//! workflow.run();
//! let run_id = workflow.trigger("order-1234", OrderStatus::Created).await?;
//! workflow.await_status("order-1234", &run_id, OrderStatus::Shipped, Default::default()).await?;
//! workflow.stop().await;
//! ```
//!
//! # Delivery semantics
//!
//! Handler execution is at-least-once: events may redeliver and timeouts may
//! fire more than once. The engine enforces idempotent *advancement* by
//! rejecting status mismatches at the transition boundary, but handler side
//! effects outside the record must be idempotent against observing the same
//! `(run, status)` twice.

use std::future::Future;
use std::pin::Pin;

/// Boxed future alias used by stored handler callbacks (object-safe async).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

mod builder;
mod callback;
mod clock;
mod connector;
mod consumer;
mod error;
mod error_counter;
mod graph;
mod lifecycle;
mod outbox;
mod processor;
mod record;
mod run;
mod schedule;
pub mod scheduler;
pub mod store;
pub mod stream;
mod timeout;
mod workflow;

pub use builder::{
    BuildOptions, Builder, CallbackFn, ConnectorFn, CustomDeleteFn, HookFn, Options, OutboxConfig,
    PausedRetryConfig, StepFn, TimeoutFn, TimerFn, WorkflowConnectorFn, duration_timer,
    time_timer,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connector::{ConnectorConstructor, ConnectorConsumer, ConnectorEvent};
pub use error::{Error, Result};
pub use record::{Header, OutboxEvent, OutboxRecord, RunState, WireRecord, topic};
pub use run::{Object, Run, Status};
pub use scheduler::{MemoryRoleScheduler, RoleLease, RoleScheduler};
pub use store::{
    ListFilter, MemoryRecordStore, MemoryTimeoutStore, Order, OutboxEventMaker, RecordStore,
    TimeoutRecord, TimeoutStore,
};
pub use stream::{
    ConsumerOptions, Event, EventConsumer, EventProducer, EventStreamer, MemoryStreamer,
};
pub use workflow::{AwaitOptions, ProcessState, TriggerOptions, Workflow};
