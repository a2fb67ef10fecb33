//! Fluent construction facade.

use std::sync::Arc;

use dagflow_core::{Cell, CellValue, DynValue, Engine, Result, Subscription};
use futures::future::{BoxFuture, FutureExt};

/// Builds and drives a reactive graph without touching `dagflow-core`
/// directly. Cloning a `GraphBuilder` is cheap and shares the underlying
/// engine, the same way cloning an `Engine` does.
#[derive(Clone, Default)]
pub struct GraphBuilder {
    engine: Engine,
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder { engine: Engine::new() }
    }

    /// Access the underlying engine directly, for callers that need an
    /// operation the facade doesn't expose (e.g. `connect_dependency`).
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn add_input<T: CellValue>(&self, value: T) -> Result<Cell<T>> {
        self.engine.add_input(value).await
    }

    pub async fn add_function<A, T, F>(&self, dep: Cell<A>, f: F) -> Result<Cell<T>>
    where
        A: CellValue,
        T: CellValue,
        F: Fn(A) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync + 'static,
    {
        self.engine.add_function(dep, f).await
    }

    /// Derive a cell from exactly two dependencies.
    pub async fn combine<A, B, T, F>(&self, a: Cell<A>, b: Cell<B>, f: F) -> Result<Cell<T>>
    where
        A: CellValue,
        B: CellValue,
        T: CellValue,
        F: Fn(A, B) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.engine
            .add_function_heterogeneous::<T, _>(&[a.erase(), b.erase()], move |values| {
                let f = f.clone();
                let a = downcast::<A>(&values[0]);
                let b = downcast::<B>(&values[1]);
                async move {
                    let out = f(a?, b?).await?;
                    Ok::<DynValue, anyhow::Error>(Arc::new(out))
                }
                .boxed()
            })
            .await
    }

    pub async fn update_input<T: CellValue>(&self, cell: Cell<T>, value: T) -> Result<()> {
        self.engine.update_input(cell, value).await
    }

    pub async fn get_result<T: CellValue>(&self, cell: Cell<T>) -> Result<T> {
        self.engine.get_result(cell).await
    }

    pub async fn stream<T: CellValue>(&self, cell: Cell<T>) -> Result<dagflow_core::CellStream<T>> {
        self.engine.stream(cell).await
    }

    /// Subscribe a callback to a cell's value-changed notifications.
    /// Distinct from `stream`: fires in-line with the change rather than
    /// being driven by polling.
    pub async fn subscribe<T, F>(&self, cell: Cell<T>, callback: F) -> Result<Subscription>
    where
        T: CellValue,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.engine.subscribe(cell, callback).await
    }

    /// Whether a cell's current value differs from the value it held
    /// before its most recent change.
    pub async fn has_changed<T: CellValue>(&self, cell: Cell<T>) -> Result<bool> {
        self.engine.has_changed(cell).await
    }

    pub async fn remove(&self, cell_index: usize) -> Result<()> {
        self.engine.remove_node(cell_index).await
    }

    /// Render the graph as a JSON string.
    pub async fn to_json(&self) -> Result<String> {
        let value = self.engine.to_json().await?;
        serde_json::to_string(&value).map_err(|e| dagflow_core::EngineError::Serialization(e.to_string()))
    }

    pub fn dispose(&self) {
        self.engine.dispose();
    }
}

fn downcast<T: CellValue>(value: &DynValue) -> anyhow::Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("type mismatch while combining cells"))
}
