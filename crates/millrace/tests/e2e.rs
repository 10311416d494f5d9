//! End-to-end scenarios: linear completion, callbacks, stale events, and
//! trigger guards.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use millrace::Status;

use common::{
    DEFAULT_TEST_TIMEOUT, Order, OrderStatus, TestHarness, fast_build_options, pack, pick,
    wait_until,
};
use millrace::{
    AwaitOptions, BoxFuture, Builder, Error, EventProducer, EventStreamer, Header, RecordStore,
    Run, RunState, TriggerOptions, topic,
};

#[tokio::test]
async fn linear_run_completes() -> Result<()> {
    let harness = TestHarness::new();
    let completions = Arc::new(AtomicUsize::new(0));
    let hook_completions = Arc::clone(&completions);

    let workflow = Builder::new("orders")
        .add_step(OrderStatus::Created, pick, &[OrderStatus::Picked])
        .add_step(OrderStatus::Picked, pack, &[OrderStatus::Packed])
        .on_complete(move |_run| {
            let completions = Arc::clone(&hook_completions);
            Box::pin(async move {
                completions.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .build(
            harness.streamer.clone(),
            harness.store.clone(),
            harness.scheduler.clone(),
            fast_build_options(),
        );

    workflow.run();
    let run_id = workflow.trigger("order-1", OrderStatus::Created).await?;

    let run = workflow
        .await_status(
            "order-1",
            &run_id,
            OrderStatus::Packed,
            AwaitOptions::new()
                .poll_frequency(Duration::from_millis(10))
                .timeout(DEFAULT_TEST_TIMEOUT),
        )
        .await?;

    // Handlers observed statuses in order and staged their payload edits.
    assert_eq!(run.object.notes, vec!["picked", "packed"]);

    let record = wait_for_run_state(&harness, &run_id, RunState::Completed).await?;
    assert_eq!(record.status, OrderStatus::Packed.code());

    // Exactly one store write per transition: trigger, pick, pack.
    assert_eq!(harness.store.write_count(), 3);

    // One event per topic along the realised path.
    for status in [OrderStatus::Created, OrderStatus::Picked, OrderStatus::Packed] {
        let topic_name = topic("orders", status.code());
        wait_until(DEFAULT_TEST_TIMEOUT, &format!("event on {topic_name}"), || {
            let topic_name = topic_name.clone();
            let streamer = harness.streamer.clone();
            async move { streamer.published_count(&topic_name) == 1 }
        })
        .await?;
    }

    assert_eq!(completions.load(Ordering::SeqCst), 1);

    workflow.stop().await;
    Ok(())
}

#[tokio::test]
async fn callback_advances_record() -> Result<()> {
    let harness = TestHarness::new();

    let workflow = Builder::new("orders")
        .add_callback(OrderStatus::Created, note_payload, &[OrderStatus::Picked])
        .build(
            harness.streamer.clone(),
            harness.store.clone(),
            harness.scheduler.clone(),
            fast_build_options(),
        );

    workflow.run();
    let run_id = workflow.trigger("order-2", OrderStatus::Created).await?;

    workflow
        .callback("order-2", OrderStatus::Created, b"x")
        .await?;

    let record = harness.store.lookup(&run_id).await?;
    assert_eq!(record.status, OrderStatus::Picked.code());

    let run = workflow
        .await_status(
            "order-2",
            &run_id,
            OrderStatus::Picked,
            AwaitOptions::new().timeout(DEFAULT_TEST_TIMEOUT),
        )
        .await?;
    assert_eq!(run.object.notes, vec!["x"]);

    // A second callback for the same status now targets a stale status.
    let err = workflow
        .callback("order-2", OrderStatus::Created, b"y")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    workflow.stop().await;
    Ok(())
}

#[tokio::test]
async fn callback_rejects_inactive_record() -> Result<()> {
    let harness = TestHarness::new();

    let workflow = Builder::new("orders")
        .add_callback(OrderStatus::Created, note_payload, &[OrderStatus::Picked])
        .build(
            harness.streamer.clone(),
            harness.store.clone(),
            harness.scheduler.clone(),
            fast_build_options(),
        );
    workflow.run();

    let run_id = workflow.trigger("order-7", OrderStatus::Created).await?;
    workflow.pause(&run_id).await?;

    // The record sits at the right status but is quiescent.
    let err = workflow
        .callback("order-7", OrderStatus::Created, b"x")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::RunInactive {
            run_state: RunState::Paused
        }
    ));

    workflow.stop().await;
    Ok(())
}

#[tokio::test]
async fn stale_event_is_skipped() -> Result<()> {
    let harness = TestHarness::new();

    let workflow = Builder::new("orders")
        .add_step(OrderStatus::Created, pick, &[OrderStatus::Picked])
        .build(
            harness.streamer.clone(),
            harness.store.clone(),
            harness.scheduler.clone(),
            fast_build_options(),
        );

    workflow.run();
    let run_id = workflow.trigger("order-3", OrderStatus::Created).await?;
    workflow
        .await_status(
            "order-3",
            &run_id,
            OrderStatus::Picked,
            AwaitOptions::new().timeout(DEFAULT_TEST_TIMEOUT),
        )
        .await?;

    let writes_before = harness.store.write_count();
    let record_before = harness.store.lookup(&run_id).await?;

    // Redeliver the already-processed event for the starting status.
    let producer = harness.streamer.new_producer(&topic("orders", 1)).await?;
    let headers = std::collections::HashMap::from([
        (Header::RunId, run_id.clone()),
        (Header::ForeignId, "order-3".to_owned()),
        (Header::WorkflowName, "orders".to_owned()),
        (Header::Topic, topic("orders", 1)),
    ]);
    producer.send(1, OrderStatus::Created.code(), &headers).await?;

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Detected by the status mismatch and acknowledged without side effect.
    assert_eq!(harness.store.write_count(), writes_before);
    let record_after = harness.store.lookup(&run_id).await?;
    assert_eq!(record_after.status, record_before.status);
    assert_eq!(record_after.updated_at, record_before.updated_at);

    workflow.stop().await;
    Ok(())
}

#[tokio::test]
async fn trigger_guards() -> Result<()> {
    let harness = TestHarness::new();

    let workflow = Builder::new("orders")
        .add_step(OrderStatus::Created, common::hold, &[OrderStatus::Picked])
        .build(
            harness.streamer.clone(),
            harness.store.clone(),
            harness.scheduler.clone(),
            fast_build_options(),
        );

    // Background work has not started yet.
    let err = workflow.trigger("order-4", OrderStatus::Created).await.unwrap_err();
    assert!(matches!(err, Error::WorkflowNotRunning));

    workflow.run();

    // Shipped never entered the graph.
    let err = workflow.trigger("order-4", OrderStatus::Shipped).await.unwrap_err();
    assert!(matches!(err, Error::StatusNotConfigured { status: 4, .. }));

    // An in-flight run blocks a second trigger for the same foreign id.
    workflow.trigger("order-4", OrderStatus::Created).await?;
    let err = workflow.trigger("order-4", OrderStatus::Created).await.unwrap_err();
    assert!(matches!(err, Error::WorkflowInProgress));

    // A different foreign id is unaffected.
    workflow.trigger("order-5", OrderStatus::Created).await?;

    workflow.stop().await;
    Ok(())
}

#[tokio::test]
async fn trigger_carries_initial_value() -> Result<()> {
    let harness = TestHarness::new();

    let workflow = Builder::new("orders")
        .add_step(OrderStatus::Created, common::hold, &[OrderStatus::Picked])
        .build(
            harness.streamer.clone(),
            harness.store.clone(),
            harness.scheduler.clone(),
            fast_build_options(),
        );
    workflow.run();

    let seeded = Order {
        sku: "SKU-77".to_owned(),
        qty: 3,
        notes: vec![],
    };
    let run_id = workflow
        .trigger_with(
            "order-6",
            OrderStatus::Created,
            TriggerOptions::new().with_initial_value(seeded.clone()),
        )
        .await?;

    let run = workflow
        .await_status(
            "order-6",
            &run_id,
            OrderStatus::Created,
            AwaitOptions::new().timeout(DEFAULT_TEST_TIMEOUT),
        )
        .await?;
    assert_eq!(run.object, seeded);

    workflow.stop().await;
    Ok(())
}

#[tokio::test]
async fn await_times_out() -> Result<()> {
    let harness = TestHarness::new();

    let workflow = Builder::new("orders")
        .add_step(OrderStatus::Created, common::hold, &[OrderStatus::Picked])
        .build(
            harness.streamer.clone(),
            harness.store.clone(),
            harness.scheduler.clone(),
            fast_build_options(),
        );
    workflow.run();

    let err = workflow
        .await_status(
            "no-such-order",
            "no-such-run",
            OrderStatus::Picked,
            AwaitOptions::new()
                .poll_frequency(Duration::from_millis(10))
                .timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AwaitTimeout));

    // A real run awaited under the wrong foreign id is never returned.
    let run_id = workflow.trigger("order-8", OrderStatus::Created).await?;
    let err = workflow
        .await_status(
            "some-other-order",
            &run_id,
            OrderStatus::Created,
            AwaitOptions::new()
                .poll_frequency(Duration::from_millis(10))
                .timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AwaitTimeout));

    workflow.stop().await;
    Ok(())
}

fn note_payload<'a>(
    run: &'a mut Run<Order, OrderStatus>,
    payload: &'a [u8],
) -> BoxFuture<'a, millrace::Result<Option<OrderStatus>>> {
    Box::pin(async move {
        run.object
            .notes
            .push(String::from_utf8_lossy(payload).into_owned());
        Ok(Some(OrderStatus::Picked))
    })
}

async fn wait_for_run_state(
    harness: &TestHarness,
    run_id: &str,
    expected: RunState,
) -> Result<millrace::WireRecord> {
    wait_until(DEFAULT_TEST_TIMEOUT, &format!("run state {expected}"), || {
        let store = harness.store.clone();
        let run_id = run_id.to_owned();
        async move {
            matches!(store.lookup(&run_id).await, Ok(record) if record.run_state == expected)
        }
    })
    .await?;
    Ok(harness.store.lookup(run_id).await?)
}
