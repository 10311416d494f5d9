//! Shared harness for engine integration tests: in-memory backends, a small
//! order-fulfilment workflow vocabulary, and polling helpers.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use millrace::{
    BoxFuture, BuildOptions, MemoryRecordStore, MemoryRoleScheduler, MemoryStreamer,
    MemoryTimeoutStore, Options, OutboxConfig, Run, Status,
};

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("millrace=debug")
        .try_init();
}

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// In-memory backends shared by a workflow under test.
pub struct TestHarness {
    pub streamer: Arc<MemoryStreamer>,
    pub store: Arc<MemoryRecordStore>,
    pub scheduler: Arc<MemoryRoleScheduler>,
    pub timeouts: Arc<MemoryTimeoutStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        init_test_tracing();
        Self {
            streamer: Arc::new(MemoryStreamer::new()),
            store: Arc::new(MemoryRecordStore::new()),
            scheduler: Arc::new(MemoryRoleScheduler::new()),
            timeouts: Arc::new(MemoryTimeoutStore::new()),
        }
    }
}

/// Tight polling intervals so scenarios finish in milliseconds.
pub fn fast_options() -> Options {
    Options::new()
        .polling_frequency(Duration::from_millis(10))
        .err_back_off(Duration::from_millis(25))
}

pub fn fast_build_options() -> BuildOptions<Order> {
    BuildOptions::new()
        .with_default_options(fast_options())
        .with_outbox_config(OutboxConfig {
            polling_frequency: Duration::from_millis(5),
            err_back_off: Duration::from_millis(25),
            lag_alert: Duration::from_secs(60),
        })
}

/// Poll until `check` returns true or the timeout expires.
pub async fn wait_until<F, Fut>(timeout: Duration, description: &str, check: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            return Err(anyhow!("timeout waiting for {description}"));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Created,
    Picked,
    Packed,
    Shipped,
}

impl Status for OrderStatus {
    fn code(self) -> i32 {
        match self {
            OrderStatus::Created => 1,
            OrderStatus::Picked => 2,
            OrderStatus::Packed => 3,
            OrderStatus::Shipped => 4,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(OrderStatus::Created),
            2 => Some(OrderStatus::Picked),
            3 => Some(OrderStatus::Packed),
            4 => Some(OrderStatus::Shipped),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Picked => "picked",
            OrderStatus::Packed => "packed",
            OrderStatus::Shipped => "shipped",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub sku: String,
    pub qty: u32,
    pub notes: Vec<String>,
}

/// Step: note the pick and advance to `Picked`.
pub fn pick(run: &mut Run<Order, OrderStatus>) -> BoxFuture<'_, millrace::Result<Option<OrderStatus>>> {
    Box::pin(async move {
        run.object.notes.push("picked".to_owned());
        Ok(Some(OrderStatus::Picked))
    })
}

/// Step: note the pack and advance to `Packed`.
pub fn pack(run: &mut Run<Order, OrderStatus>) -> BoxFuture<'_, millrace::Result<Option<OrderStatus>>> {
    Box::pin(async move {
        run.object.notes.push("packed".to_owned());
        Ok(Some(OrderStatus::Packed))
    })
}

/// Step: hold the record at its current status.
pub fn hold(_run: &mut Run<Order, OrderStatus>) -> BoxFuture<'_, millrace::Result<Option<OrderStatus>>> {
    Box::pin(async move { Ok(None) })
}

/// Box a step closure, deducing its lifetime-generic signature from the
/// bound.
pub fn step_fn<F>(f: F) -> millrace::StepFn<Order, OrderStatus>
where
    F: for<'a> Fn(
            &'a mut Run<Order, OrderStatus>,
        ) -> BoxFuture<'a, millrace::Result<Option<OrderStatus>>>
        + Send
        + Sync
        + 'static,
{
    Box::new(f)
}
