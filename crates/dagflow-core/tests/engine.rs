//! End-to-end scenarios over the public engine API.

use std::sync::Arc;

use dagflow_core::{Cell, Engine};
use futures::future::FutureExt;

#[tokio::test]
async fn chained_multiply() {
    let engine = Engine::new();
    let a = engine.add_input(2i64).await.unwrap();
    let b = engine.add_function(a, |v| async move { Ok::<i64, anyhow::Error>(v * 3) }.boxed()).await.unwrap();
    let c = engine.add_function(b, |v| async move { Ok::<i64, anyhow::Error>(v * 5) }.boxed()).await.unwrap();

    assert_eq!(engine.get_result(c).await.unwrap(), 30);

    engine.update_input(a, 4i64).await.unwrap();
    assert_eq!(engine.get_result(c).await.unwrap(), 60);
}

#[tokio::test]
async fn incremental_recompute_chain_of_ten_matrix_products() {
    // 2x2 matrices represented as [f64; 4] in row-major order.
    type Mat = [i64; 4];

    fn mul(a: Mat, b: Mat) -> Mat {
        [
            a[0] * b[0] + a[1] * b[2],
            a[0] * b[1] + a[1] * b[3],
            a[2] * b[0] + a[3] * b[2],
            a[2] * b[1] + a[3] * b[3],
        ]
    }

    let engine = Engine::new();
    let identity: Mat = [1, 0, 0, 1];
    let base = engine.add_input(identity).await.unwrap();

    let factor: Mat = [2, 0, 0, 2];
    let mut cells: Vec<Cell<Mat>> = vec![base];
    for _ in 0..10 {
        let prev = *cells.last().unwrap();
        let next = engine
            .add_function(prev, move |m| async move { Ok::<Mat, anyhow::Error>(mul(m, factor)) }.boxed())
            .await
            .unwrap();
        cells.push(next);
    }

    let last = *cells.last().unwrap();
    let result = engine.get_result(last).await.unwrap();
    // 2*I multiplied ten times is 2^10 * I.
    assert_eq!(result, [1024, 0, 0, 1024]);

    // Updating the base invalidates the whole chain; only the final link's
    // downstream value actually needs rereading, exercising that each
    // intermediate memo recomputes without caller intervention.
    engine.update_input(base, [3, 0, 0, 3]).await.unwrap();
    let result = engine.get_result(last).await.unwrap();
    assert_eq!(result, [3 * 1024, 0, 0, 3 * 1024]);
}

#[tokio::test]
async fn no_op_update_skips_recompute_of_dependents() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_for_closure = calls.clone();
    let a = engine.add_input(5i64).await.unwrap();
    let doubled = engine
        .add_function(a, move |v| {
            let calls = calls_for_closure.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<i64, anyhow::Error>(v * 2)
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(engine.get_result(doubled).await.unwrap(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    engine.update_input(a, 5i64).await.unwrap();
    assert_eq!(engine.get_result(doubled).await.unwrap(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no-op update must not trigger recompute");
}

#[tokio::test]
async fn rewiring_a_dependency_onto_its_own_downstream_cell_is_rejected() {
    use dagflow_core::EngineError;

    let engine = Engine::new();
    let x = engine.add_input(1i64).await.unwrap();
    let y = engine.add_function(x, |v| async move { Ok::<i64, anyhow::Error>(v + 1) }.boxed()).await.unwrap();
    let z = engine.add_function(y, |v| async move { Ok::<i64, anyhow::Error>(v + 1) }.boxed()).await.unwrap();

    let before = engine.to_json().await.unwrap();
    let err = engine.connect_dependency(y.index(), z.index()).await.unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected(_)));

    // Rejected structural mutations leave the graph exactly as it was.
    let after = engine.to_json().await.unwrap();
    assert_eq!(before, after);
    assert!(!engine.is_cyclic(y.index(), z.index()).await);

    assert_eq!(engine.get_result(z).await.unwrap(), 3);
}

#[tokio::test]
async fn dependents_index_stays_consistent_after_removal() {
    let engine = Engine::new();
    let a = engine.add_input(1i64).await.unwrap();
    let b = engine.add_function(a, |v| async move { Ok::<i64, anyhow::Error>(v + 1) }.boxed()).await.unwrap();
    assert_eq!(engine.get_result(b).await.unwrap(), 2);

    engine.remove_node(b.index()).await.unwrap();
    assert_eq!(engine.node_count().await, 1);

    // The input can still be updated without touching the removed node.
    engine.update_input(a, 9i64).await.unwrap();
    assert_eq!(engine.get_result(a).await.unwrap(), 9);
}

#[tokio::test]
async fn disposed_engine_rejects_further_mutation() {
    let engine = Engine::new();
    let a = engine.add_input(1i64).await.unwrap();
    engine.dispose();
    assert!(engine.is_disposed());
    assert!(engine.update_input(a, 2i64).await.is_err());
    assert!(engine.add_input(3i64).await.is_err());
}

#[tokio::test]
async fn subscribe_observes_input_and_function_changes_until_dropped() {
    use std::sync::atomic::{AtomicI64, Ordering};

    let engine = Engine::new();
    let a = engine.add_input(1i64).await.unwrap();
    let doubled = engine.add_function(a, |v| async move { Ok::<i64, anyhow::Error>(v * 2) }.boxed()).await.unwrap();

    let last_seen = Arc::new(AtomicI64::new(0));
    let last_seen_for_closure = last_seen.clone();
    let subscription = engine.subscribe(doubled, move |v| last_seen_for_closure.store(v, Ordering::SeqCst)).await.unwrap();

    engine.update_input(a, 5i64).await.unwrap();
    engine.get_result(doubled).await.unwrap();
    assert_eq!(last_seen.load(Ordering::SeqCst), 10);

    drop(subscription);
    engine.update_input(a, 9i64).await.unwrap();
    engine.get_result(doubled).await.unwrap();
    assert_eq!(last_seen.load(Ordering::SeqCst), 10, "dropped subscription must not keep firing");
}

#[tokio::test]
async fn has_changed_tracks_the_input_before_the_most_recent_update() {
    let engine = Engine::new();
    let a = engine.add_input(1i64).await.unwrap();

    assert!(!engine.has_changed(a).await.unwrap());

    engine.update_input(a, 1i64).await.unwrap();
    assert!(!engine.has_changed(a).await.unwrap(), "no-op update must not count as a change");

    engine.update_input(a, 2i64).await.unwrap();
    assert!(engine.has_changed(a).await.unwrap());

    // A second read without an intervening update reports the same answer;
    // it must not keep resetting what counts as "previous".
    assert!(engine.has_changed(a).await.unwrap());
}

#[tokio::test]
async fn get_result_is_idempotent_without_recomputing() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_for_closure = calls.clone();
    let a = engine.add_input(1i64).await.unwrap();
    let counted = engine
        .add_function(a, move |v| {
            let calls = calls_for_closure.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<i64, anyhow::Error>(v + 1)
            }
            .boxed()
        })
        .await
        .unwrap();

    engine.get_result(counted).await.unwrap();
    engine.get_result(counted).await.unwrap();
    engine.get_result(counted).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
