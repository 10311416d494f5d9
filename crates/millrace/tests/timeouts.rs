//! Timeout subsystem scenarios: deadline firing and stale-entry completion.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

use common::{DEFAULT_TEST_TIMEOUT, Order, OrderStatus, TestHarness, fast_build_options, wait_until};
use millrace::{AwaitOptions, BoxFuture, Builder, RecordStore, Run, RunState, duration_timer};

fn timeout_to_picked<'a>(
    run: &'a mut Run<Order, OrderStatus>,
    _now: time::OffsetDateTime,
) -> BoxFuture<'a, millrace::Result<Option<OrderStatus>>> {
    Box::pin(async move {
        run.object.notes.push("timed out".to_owned());
        Ok(Some(OrderStatus::Picked))
    })
}

#[tokio::test]
async fn timeout_fires_and_completes_entry() -> Result<()> {
    let harness = TestHarness::new();

    let workflow = Builder::new("orders")
        .add_timeout(
            OrderStatus::Created,
            duration_timer(Duration::from_millis(100)),
            timeout_to_picked,
            &[OrderStatus::Picked],
        )
        .build(
            harness.streamer.clone(),
            harness.store.clone(),
            harness.scheduler.clone(),
            fast_build_options().with_timeout_store(harness.timeouts.clone()),
        );

    workflow.run();
    let run_id = workflow.trigger("order-1", OrderStatus::Created).await?;

    // The inserter creates the entry once the trigger event arrives.
    wait_until(DEFAULT_TEST_TIMEOUT, "timeout entry created", || {
        let timeouts = harness.timeouts.clone();
        async move { timeouts.pending_count() == 1 }
    })
    .await?;

    // The poller fires the deadline and advances the record as a step would.
    let run = workflow
        .await_status(
            "order-1",
            &run_id,
            OrderStatus::Picked,
            AwaitOptions::new().timeout(DEFAULT_TEST_TIMEOUT),
        )
        .await?;
    assert_eq!(run.object.notes, vec!["timed out"]);
    assert_eq!(run.run_state, RunState::Completed);

    // The fired entry is marked completed.
    wait_until(DEFAULT_TEST_TIMEOUT, "timeout entry completed", || {
        let timeouts = harness.timeouts.clone();
        async move { timeouts.pending_count() == 0 }
    })
    .await?;

    workflow.stop().await;
    Ok(())
}

#[tokio::test]
async fn timeout_noops_when_record_already_advanced() -> Result<()> {
    let harness = TestHarness::new();
    let fired = Arc::new(AtomicBool::new(false));
    let fired_flag = Arc::clone(&fired);

    let workflow = Builder::new("orders")
        // The step advances immediately, well before the deadline.
        .add_step(OrderStatus::Created, common::pick, &[OrderStatus::Picked])
        .add_timeout(
            OrderStatus::Created,
            duration_timer(Duration::from_millis(150)),
            move |_run, _now| {
                let fired = Arc::clone(&fired_flag);
                Box::pin(async move {
                    fired.store(true, Ordering::SeqCst);
                    Ok(Some(OrderStatus::Picked))
                })
            },
            &[OrderStatus::Picked],
        )
        .build(
            harness.streamer.clone(),
            harness.store.clone(),
            harness.scheduler.clone(),
            fast_build_options().with_timeout_store(harness.timeouts.clone()),
        );

    workflow.run();
    let run_id = workflow.trigger("order-2", OrderStatus::Created).await?;
    workflow
        .await_status(
            "order-2",
            &run_id,
            OrderStatus::Picked,
            AwaitOptions::new().timeout(DEFAULT_TEST_TIMEOUT),
        )
        .await?;

    // Let the deadline pass and the poller sweep.
    tokio::time::sleep(Duration::from_millis(250)).await;

    wait_until(DEFAULT_TEST_TIMEOUT, "stale entries drained", || {
        let timeouts = harness.timeouts.clone();
        async move { timeouts.pending_count() == 0 }
    })
    .await?;

    assert!(
        !fired.load(Ordering::SeqCst),
        "timeout must not fire for a record that already advanced"
    );
    let record = harness.store.lookup(&run_id).await?;
    assert_eq!(record.run_state, RunState::Completed);

    workflow.stop().await;
    Ok(())
}

#[tokio::test]
async fn timeout_entry_is_unique_per_timer() -> Result<()> {
    let harness = TestHarness::new();

    let workflow = Builder::new("orders")
        .add_timeout(
            OrderStatus::Created,
            duration_timer(Duration::from_secs(60)),
            timeout_to_picked,
            &[OrderStatus::Picked],
        )
        .add_timeout(
            OrderStatus::Created,
            duration_timer(Duration::from_secs(120)),
            timeout_to_picked,
            &[OrderStatus::Picked],
        )
        .build(
            harness.streamer.clone(),
            harness.store.clone(),
            harness.scheduler.clone(),
            fast_build_options().with_timeout_store(harness.timeouts.clone()),
        );

    workflow.run();
    workflow.trigger("order-3", OrderStatus::Created).await?;

    // One entry per configured timer, even across event redelivery.
    wait_until(DEFAULT_TEST_TIMEOUT, "two timeout entries", || {
        let timeouts = harness.timeouts.clone();
        async move { timeouts.pending_count() == 2 }
    })
    .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.timeouts.pending_count(), 2);

    workflow.stop().await;
    Ok(())
}
