use dagflow::GraphBuilder;
use futures::future::FutureExt;

#[tokio::test]
async fn combine_two_inputs() {
    let graph = GraphBuilder::new();
    let a = graph.add_input(2i64).await.unwrap();
    let b = graph.add_input(3i64).await.unwrap();
    let sum = graph.combine(a, b, |x, y| async move { Ok::<i64, anyhow::Error>(x + y) }.boxed()).await.unwrap();

    assert_eq!(graph.get_result(sum).await.unwrap(), 5);
    graph.update_input(a, 10i64).await.unwrap();
    assert_eq!(graph.get_result(sum).await.unwrap(), 13);
}

#[tokio::test]
async fn to_json_renders_every_node() {
    let graph = GraphBuilder::new();
    let a = graph.add_input(1i64).await.unwrap();
    let _b = graph.add_function(a, |v| async move { Ok::<i64, anyhow::Error>(v + 1) }.boxed()).await.unwrap();

    let json = graph.to_json().await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn remove_then_get_result_on_removed_cell_fails() {
    let graph = GraphBuilder::new();
    let a = graph.add_input(1i64).await.unwrap();
    graph.remove(a.index()).await.unwrap();
    assert!(graph.get_result(a).await.is_err());
}
