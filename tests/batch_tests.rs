//! Batch grouping, flush triggers and per-item outcomes through the façade

mod common;

use common::{add_label, build_layer, get_message, server_error, test_config, FakeTransport};
use gmail_access::{ensure_all_succeeded, GmailError, Mailbox, Operation};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_size_and_wait_triggers_split_large_submission() {
    let transport = FakeTransport::new();
    let layer = build_layer(transport.clone(), test_config()).await;

    let requests = (0..150)
        .map(|i| layer.request(add_label(&format!("m{}", i), "Label_Newsletters")))
        .collect();

    let started = tokio::time::Instant::now();
    let outcomes = layer.submit_batch(requests).await;

    assert_eq!(outcomes.len(), 150);
    assert!(outcomes.iter().all(|o| o.is_success()));
    assert_eq!(*transport.batch_sizes.lock().unwrap(), vec![100, 50]);
    // The trailing 50 only go out once the wait interval elapses
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(transport.call_count(), 0);

    let stats = layer.stats().await;
    assert_eq!(stats.batch.flushes, 2);
    assert_eq!(stats.batch.items_flushed, 150);
    assert_eq!(stats.quota.consumed, 750);
}

#[tokio::test(start_paused = true)]
async fn test_outcomes_follow_submission_order() {
    let transport = FakeTransport::new();
    let layer = build_layer(transport.clone(), test_config()).await;

    let operations = vec![
        add_label("m1", "A"),
        get_message("m2"),
        Operation::TrashMessage {
            id: "m3".to_string(),
        },
        add_label("m4", "A"),
        Operation::ListLabels,
    ];
    let requests: Vec<_> = operations.iter().cloned().map(|op| layer.request(op)).collect();
    let ids: Vec<_> = requests.iter().map(|r| r.id()).collect();

    let outcomes = layer.submit_batch(requests).await;

    assert_eq!(outcomes.len(), operations.len());
    for (outcome, id) in outcomes.iter().zip(ids) {
        assert_eq!(outcome.request.id(), id);
        assert!(outcome.is_success());
    }
    // Reads are never batched
    assert_eq!(transport.calls_for("messages.get"), 1);
    assert_eq!(transport.calls_for("labels.list"), 1);
    let mut sizes = transport.batch_sizes.lock().unwrap().clone();
    sizes.sort();
    assert_eq!(sizes, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_batched_write_invalidates_cached_read() {
    let transport = FakeTransport::new();
    let layer = Arc::new(build_layer(transport.clone(), test_config()).await);
    let mailbox = Mailbox::new(Arc::clone(&layer));

    layer.call(get_message("m1")).await.unwrap();
    assert!(layer.execute(layer.request(get_message("m1"))).await.served_from_cache);

    let ids = vec!["m1".to_string()];
    mailbox.relabel(&ids, &["Label_1".to_string()], &[]).await.unwrap();
    assert_eq!(transport.batch_call_count(), 1);

    let after = layer.execute(layer.request(get_message("m1"))).await;
    assert!(after.is_success());
    assert!(!after.served_from_cache);
    assert_eq!(transport.calls_for("messages.get"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_item_failure_is_resubmitted_alone() {
    let transport = FakeTransport::new();
    transport.push_batch(Ok(vec![
        Ok(json!({"id": "m0"})),
        Err(server_error()),
        Err(GmailError::NotFound("m2".to_string())),
    ]));

    let mut config = test_config();
    config.batch.max_size = 3;
    let layer = build_layer(transport.clone(), config).await;

    let requests = (0..3)
        .map(|i| layer.request(add_label(&format!("m{}", i), "A")))
        .collect();
    let outcomes = layer.submit_batch(requests).await;

    assert!(outcomes[0].is_success());
    assert!(outcomes[1].is_success());
    assert_eq!(outcomes[1].attempts, 2);
    assert!(matches!(outcomes[2].error(), Some(GmailError::NotFound(_))));

    // Only the transient item went out again, on its own
    assert_eq!(transport.batch_call_count(), 1);
    assert_eq!(transport.calls_for("messages.modify"), 1);

    let quota = layer.quota().stats().await;
    assert_eq!(quota.consumed, 10);
    assert_eq!(quota.reserved, 0);
}

#[tokio::test(start_paused = true)]
async fn test_whole_batch_refused_when_over_quota() {
    let transport = FakeTransport::new();
    let mut config = test_config();
    config.quota.daily_ceiling = 100;
    let layer = build_layer(transport.clone(), config).await;

    let requests = (0..30)
        .map(|i| layer.request(add_label(&format!("m{}", i), "A")))
        .collect();
    let outcomes = layer.submit_batch(requests).await;

    assert!(outcomes
        .iter()
        .all(|o| matches!(o.error(), Some(GmailError::QuotaExhausted(_)))));
    assert_eq!(transport.batch_call_count(), 0);
    assert_eq!(layer.quota().stats().await.consumed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_relabel_reports_partial_failure() {
    let transport = FakeTransport::new();
    transport.push_batch(Ok(vec![
        Ok(json!({"id": "a"})),
        Err(GmailError::Forbidden("not yours".to_string())),
        Ok(json!({"id": "c"})),
    ]));
    let layer = Arc::new(build_layer(transport.clone(), test_config()).await);
    let mailbox = Mailbox::new(Arc::clone(&layer));

    let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    match mailbox.relabel(&ids, &["Label_1".to_string()], &[]).await {
        Err(GmailError::BatchPartialFailure { failed, outcomes }) => {
            assert_eq!(failed, 1);
            assert_eq!(outcomes.len(), 3);
            assert!(outcomes[0].is_success());
            assert!(!outcomes[1].is_success());
            assert!(outcomes[2].is_success());
        }
        other => panic!("expected partial failure, got {:?}", other.map(|o| o.len())),
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_batch_failure_retries_group() {
    let transport = FakeTransport::new();
    transport.push_batch(Err(server_error()));
    let layer = build_layer(transport.clone(), test_config()).await;

    let requests = (0..4)
        .map(|i| {
            layer.request(Operation::DeleteMessage {
                id: format!("m{}", i),
            })
        })
        .collect();
    let outcomes = ensure_all_succeeded(layer.submit_batch(requests).await).unwrap();

    assert!(outcomes.iter().all(|o| o.attempts == 2));
    assert_eq!(*transport.batch_sizes.lock().unwrap(), vec![4, 4]);
    assert_eq!(layer.quota().stats().await.consumed, 40);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_pending_group() {
    let transport = FakeTransport::new();
    let mut config = test_config();
    config.batch.max_wait_ms = 60_000;
    let layer = build_layer(transport.clone(), config).await;

    let ticket = layer.submit(layer.request(add_label("m1", "A"))).await;
    layer.shutdown().await;

    assert!(ticket.wait().await.is_success());
    assert_eq!(transport.batch_call_count(), 1);

    let late = layer.submit(layer.request(add_label("m2", "A"))).await;
    assert!(matches!(
        late.wait().await.error(),
        Some(GmailError::OperationCancelled(_))
    ));
}
