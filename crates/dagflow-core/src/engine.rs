//! The engine: owns the node table, the reverse-dependency index, and the
//! propagation algorithm that keeps derived cells in sync with inputs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use petgraph::graphmap::DiGraphMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{debug, instrument, warn};

use crate::cell::{Cell, CellValue, DynValue, ErasedCell, Subscription};
use crate::error::{EngineError, Result};
use crate::node::{ComputeFn, Listener, Node, NodeKind};
use crate::stream::CellStream;

struct EngineInner {
    nodes: AsyncRwLock<FxHashMap<usize, Arc<Node>>>,
    /// node index -> set of nodes that depend on it. Internal propagation
    /// scheduling walks this index directly; it is distinct from each
    /// node's per-cell `subscribe` listener registry and from its `watch`
    /// channel, which are the two externally-facing notification fabrics.
    dependents_index: AsyncRwLock<FxHashMap<usize, FxHashSet<usize>>>,
    next_index: AtomicUsize,
    /// Serializes `propagate` runs so two concurrent input updates never
    /// interleave their BFS walks over the same subgraph.
    global_refresh_lock: AsyncMutex<()>,
    disposed: AtomicBool,
}

/// A handle to a reactive computation graph.
///
/// Cheap to clone: internally an `Arc`, so every clone observes the same
/// node table.
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine(Arc::new(EngineInner {
            nodes: AsyncRwLock::new(FxHashMap::default()),
            dependents_index: AsyncRwLock::new(FxHashMap::default()),
            next_index: AtomicUsize::new(0),
            global_refresh_lock: AsyncMutex::new(()),
            disposed: AtomicBool::new(false),
        }))
    }

    fn alloc_index(&self) -> usize {
        self.0.next_index.fetch_add(1, Ordering::SeqCst)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.0.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }
        Ok(())
    }

    /// Create a new input cell holding `value`.
    #[instrument(skip(self, value))]
    pub async fn add_input<T: CellValue>(&self, value: T) -> Result<Cell<T>> {
        self.check_disposed()?;
        let index = self.alloc_index();
        let node = Node::input(value);
        self.0.nodes.write().await.insert(index, Arc::new(node));
        self.0.dependents_index.write().await.insert(index, FxHashSet::default());
        debug!(index, "added input cell");
        Ok(Cell::new(index, NodeKind::Input))
    }

    /// Create a function cell from a single dependency.
    pub async fn add_function<A, T, F>(&self, dep: Cell<A>, f: F) -> Result<Cell<T>>
    where
        A: CellValue,
        T: CellValue,
        F: Fn(A) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.add_function_heterogeneous(&[dep.erase()], move |values| {
            let f = f.clone();
            let a = downcast::<A>(&values[0], 0);
            async move {
                let out = f(a?).await?;
                Ok::<DynValue, anyhow::Error>(Arc::new(out))
            }
            .boxed()
        })
        .await
    }

    /// Create a function cell from an arbitrary, type-erased list of
    /// dependencies. The compute closure receives each dependency's
    /// current value as a [`DynValue`] in the same order as `deps`.
    #[instrument(skip(self, deps, f))]
    pub async fn add_function_heterogeneous<T, F>(&self, deps: &[ErasedCell], f: F) -> Result<Cell<T>>
    where
        T: CellValue,
        F: Fn(Vec<DynValue>) -> BoxFuture<'static, anyhow::Result<DynValue>> + Send + Sync + 'static,
    {
        self.check_disposed()?;
        let dep_indices: Vec<usize> = deps.iter().map(|c| c.index).collect();
        {
            let nodes = self.0.nodes.read().await;
            for &d in &dep_indices {
                if !nodes.contains_key(&d) {
                    return Err(EngineError::UnknownDependency(d));
                }
            }
        }
        let compute_fn: ComputeFn = Box::new(f);
        let index = self.alloc_index();
        if dep_indices.contains(&index) {
            return Err(EngineError::SelfDependency(index));
        }
        let node = Node::function::<T>(dep_indices.clone(), compute_fn);
        self.0.nodes.write().await.insert(index, Arc::new(node));
        self.0.dependents_index.write().await.insert(index, FxHashSet::default());

        for &d in &dep_indices {
            self.0
                .dependents_index
                .write()
                .await
                .entry(d)
                .or_insert_with(FxHashSet::default)
                .insert(index);
        }

        // A freshly allocated index can never have been reachable from any
        // pre-existing dependency, so this can't actually trip — kept as a
        // defensive rollback matching the engine's general "reject and leave
        // the graph untouched" contract for structural errors.
        for &d in &dep_indices {
            if self.is_cyclic(d, index).await {
                warn!(index, dep = d, "rolling back: newly created node closed a cycle");
                self.0.nodes.write().await.remove(&index);
                self.0.dependents_index.write().await.remove(&index);
                for &d in &dep_indices {
                    if let Some(set) = self.0.dependents_index.write().await.get_mut(&d) {
                        set.remove(&index);
                    }
                }
                return Err(EngineError::CycleDetected(index));
            }
        }

        debug!(index, deps = ?dep_indices, "added function cell");
        Ok(Cell::new(index, NodeKind::Function))
    }

    /// Wire an additional dependency onto an existing function node after
    /// creation. Rejected if it would introduce a cycle.
    pub async fn connect_dependency(&self, node: usize, dep: usize) -> Result<()> {
        self.check_disposed()?;
        if node == dep {
            return Err(EngineError::SelfDependency(node));
        }
        self.assert_acyclic_with(node, dep).await?;
        {
            let nodes = self.0.nodes.read().await;
            let target = nodes.get(&node).ok_or(EngineError::NodeNotFound(node))?;
            target.dependencies.write().expect("lock poisoned").push(dep);
        }
        self.0
            .dependents_index
            .write()
            .await
            .entry(dep)
            .or_insert_with(FxHashSet::default)
            .insert(node);
        self.reset_and_propagate(node).await;
        Ok(())
    }

    /// Detach a dependency from a function node. Does not remove the node
    /// itself even if it is left with no dependencies.
    pub async fn remove_dependency(&self, node: usize, dep: usize) -> Result<()> {
        self.check_disposed()?;
        {
            let nodes = self.0.nodes.read().await;
            let target = nodes.get(&node).ok_or(EngineError::NodeNotFound(node))?;
            target.dependencies.write().expect("lock poisoned").retain(|&d| d != dep);
        }
        if let Some(set) = self.0.dependents_index.write().await.get_mut(&dep) {
            set.remove(&node);
        }
        self.reset_and_propagate(node).await;
        Ok(())
    }

    async fn dependency_graph(&self) -> DiGraphMap<usize, ()> {
        let nodes = self.0.nodes.read().await;
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        for (&idx, n) in nodes.iter() {
            graph.add_node(idx);
            for d in n.dependencies_snapshot() {
                graph.add_edge(idx, d, ());
            }
        }
        graph
    }

    /// Check whether adding the edge `node -> dep` would create a cycle,
    /// without committing it.
    async fn assert_acyclic_with(&self, node: usize, dep: usize) -> Result<()> {
        {
            let nodes = self.0.nodes.read().await;
            if !nodes.contains_key(&node) {
                return Err(EngineError::NodeNotFound(node));
            }
            if !nodes.contains_key(&dep) {
                return Err(EngineError::NodeNotFound(dep));
            }
        }
        let mut graph = self.dependency_graph().await;
        graph.add_node(node);
        graph.add_node(dep);
        graph.add_edge(node, dep, ());
        if petgraph::algo::has_path_connecting(&graph, dep, node, None) {
            warn!(node, dep, "rejected edge: would create a cycle");
            return Err(EngineError::CycleDetected(node));
        }
        Ok(())
    }

    /// Starting at `from`, walk its dependencies depth-first and report
    /// whether `to` is reachable. The primitive cycle-detection query: an
    /// edge `node -> dep` would close a cycle iff `dep`'s own dependency
    /// graph can already reach `node`.
    pub async fn is_cyclic(&self, from: usize, to: usize) -> bool {
        let graph = self.dependency_graph().await;
        if !graph.contains_node(from) || !graph.contains_node(to) {
            return false;
        }
        petgraph::algo::has_path_connecting(&graph, from, to, None)
    }

    async fn reset_and_propagate(&self, start: usize) {
        if let Some(node) = self.0.nodes.read().await.get(&start).cloned() {
            node.reset_computation().await;
        }
        self.propagate(start).await;
    }

    /// Replace an input cell's value and invalidate everything downstream.
    #[instrument(skip(self, value))]
    pub async fn update_input<T: CellValue>(&self, cell: Cell<T>, value: T) -> Result<()> {
        self.check_disposed()?;
        let node = {
            let nodes = self.0.nodes.read().await;
            nodes.get(&cell.index).cloned().ok_or(EngineError::NodeNotFound(cell.index))?
        };
        if node.kind != NodeKind::Input {
            return Err(EngineError::TypeMismatch {
                cell: cell.index,
                expected: "Input",
                found: "Function",
            });
        }
        if let Some(current) = node.current_input_value() {
            if let Some(current) = current.downcast_ref::<T>() {
                if *current == value {
                    debug!(index = cell.index, "update_input no-op, skipping propagation");
                    return Ok(());
                }
            }
        }
        node.set_input_value(Arc::new(value));
        // The input's own memo caches its resolved value too (see `force`'s
        // `NodeKind::Input` arm); `propagate` only resets and recomputes
        // nodes downstream of `start`, so the input's stale memo has to be
        // cleared here before anything else can observe the new value.
        node.reset_computation().await;
        self.propagate(cell.index).await;
        Ok(())
    }

    /// Breadth-first invalidation and recompute of everything reachable
    /// from `start`, serialized against other propagation runs so two
    /// concurrent updates never race over the same nodes.
    async fn propagate(&self, start: usize) {
        let _guard = self.0.global_refresh_lock.lock().await;
        let mut visited: FxHashSet<usize> = FxHashSet::default();
        let mut queue: VecDeque<usize> = VecDeque::new();
        visited.insert(start);
        queue.push_back(start);

        while let Some(index) = queue.pop_front() {
            if index != start {
                if let Some(node) = self.0.nodes.read().await.get(&index).cloned() {
                    node.reset_computation().await;
                    if let Err(err) = self.force(index, &node).await {
                        warn!(index, %err, "recompute failed during propagation");
                    }
                }
            }
            let dependents = self.0.dependents_index.read().await.get(&index).cloned().unwrap_or_default();
            for dependent in dependents {
                if visited.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }
        debug!(start, visited = visited.len(), "propagation complete");
    }

    /// Force (re)computation of a single node, populating its memo and
    /// firing its update event. Does not recurse into dependents — that
    /// is `propagate`'s job.
    async fn force(&self, index: usize, node: &Arc<Node>) -> Result<DynValue> {
        let (memo, freshly_built) = {
            let mut slot = node.memo.lock().await;
            if let Some(existing) = slot.as_ref() {
                (existing.clone(), false)
            } else {
                let fut = self.build_compute_future(index, node.clone());
                let shared = fut.shared();
                *slot = Some(shared.clone());
                (shared, true)
            }
        };
        let result = memo.await;
        // Only a freshly built memo represents an actual new computation;
        // an already-memoized hit must not re-swap `previous`, or two
        // `get_result` calls in a row on an unchanged cell would make
        // `has_changed` forget the real previous value.
        if freshly_built {
            if let Ok(value) = &result {
                // Input nodes already record their produced value and fire
                // both notification fabrics in `set_input_value`; only
                // function nodes need it recorded here, at the point their
                // compute completes.
                if node.kind == NodeKind::Function {
                    node.record_produced_value(value.clone());
                }
            }
        }
        result
    }

    fn build_compute_future(&self, index: usize, node: Arc<Node>) -> BoxFuture<'static, Result<DynValue>> {
        let engine = self.clone();
        async move {
            match node.kind {
                NodeKind::Input => node.current_input_value().ok_or(EngineError::NodeNotFound(index)),
                NodeKind::Function => {
                    node.try_enter(index)?;
                    let result = async {
                        let deps = node.dependencies_snapshot();
                        let mut values = Vec::with_capacity(deps.len());
                        for dep in deps {
                            values.push(engine.get_result_erased(dep).await?);
                        }
                        let compute_fn = node.compute_fn.as_ref().expect("function node missing compute_fn");
                        compute_fn(values).await.map_err(|e| EngineError::compute_failed(index, e))
                    }
                    .await;
                    node.leave();
                    result
                }
            }
        }
        .boxed()
    }

    /// Resolve a node's value without a static type, recursing through
    /// dependencies on demand.
    async fn get_result_erased(&self, index: usize) -> Result<DynValue> {
        let node = {
            let nodes = self.0.nodes.read().await;
            nodes.get(&index).cloned().ok_or(EngineError::NodeNotFound(index))?
        };
        if node.computing.load(Ordering::SeqCst) {
            return Err(EngineError::ReentrancyDetected(index));
        }
        self.force(index, &node).await
    }

    /// Resolve a cell's current value, computing it (and any stale
    /// dependencies) on demand.
    pub async fn get_result<T: CellValue>(&self, cell: Cell<T>) -> Result<T> {
        self.check_disposed()?;
        let value = self.get_result_erased(cell.index).await?;
        downcast::<T>(&value, cell.index)
    }

    /// Remove a node from the graph. Dependents are left in place; their
    /// next `get_result` will fail with `NodeNotFound` once they try to
    /// resolve the removed dependency, matching the "explicit removal
    /// only" contract — removal never cascades automatically.
    #[instrument(skip(self))]
    pub async fn remove_node(&self, index: usize) -> Result<()> {
        self.check_disposed()?;
        let node = self.0.nodes.write().await.remove(&index).ok_or(EngineError::NodeNotFound(index))?;
        let deps = node.dependencies_snapshot();
        let mut dependents_index = self.0.dependents_index.write().await;
        dependents_index.remove(&index);
        for dep in deps {
            if let Some(set) = dependents_index.get_mut(&dep) {
                set.remove(&index);
            }
        }
        debug!(index, "removed node");
        Ok(())
    }

    /// Whether the cell's current value differs from the value it held
    /// before its most recent change (an `update_input` or a function
    /// recompute). A cell that has never changed reports `false`, since its
    /// current and previous values are equal by construction.
    pub async fn has_changed<T: CellValue>(&self, cell: Cell<T>) -> Result<bool> {
        self.check_disposed()?;
        let node = {
            let nodes = self.0.nodes.read().await;
            nodes.get(&cell.index).cloned().ok_or(EngineError::NodeNotFound(cell.index))?
        };
        let current = self.get_result(cell).await?;
        match node.previous_snapshot() {
            Some(previous) => Ok(current != downcast::<T>(&previous, cell.index)?),
            None => Ok(false),
        }
    }

    /// Subscribe a callback to a cell's value-changed notifications.
    /// Distinct from [`Engine::stream`]: the callback fires synchronously,
    /// in-line with the change (an `update_input` call or a function
    /// recompute during `propagate`), rather than being driven by polling a
    /// `futures::Stream`. Dropping the returned [`Subscription`]
    /// unregisters the callback; there is no explicit unsubscribe method.
    pub async fn subscribe<T, F>(&self, cell: Cell<T>, callback: F) -> Result<Subscription>
    where
        T: CellValue,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.check_disposed()?;
        let node = {
            let nodes = self.0.nodes.read().await;
            nodes.get(&cell.index).cloned().ok_or(EngineError::NodeNotFound(cell.index))?
        };
        let index = cell.index;
        let listener: Listener = Arc::new(move |value: &DynValue| match value.downcast_ref::<T>() {
            Some(v) => callback(v.clone()),
            None => warn!(index, "subscriber callback type mismatch, dropping notification"),
        });
        let id = node.subscribe(listener);
        Ok(Subscription::new(node, id))
    }

    /// Subscribe to a stream of this cell's values, starting from its
    /// current value (forcing a computation if none exists yet) and
    /// yielding the latest value on every subsequent change. Capacity is
    /// one: if the consumer falls behind, only the most recent value
    /// survives.
    pub async fn stream<T: CellValue>(&self, cell: Cell<T>) -> Result<CellStream<T>> {
        self.check_disposed()?;
        let node = {
            let nodes = self.0.nodes.read().await;
            nodes.get(&cell.index).cloned().ok_or(EngineError::NodeNotFound(cell.index))?
        };
        self.force(cell.index, &node).await?;
        Ok(CellStream::new(node.update_tx.subscribe(), cell.index))
    }

    /// Number of nodes currently in the graph.
    pub async fn node_count(&self) -> usize {
        self.0.nodes.read().await.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.0.disposed.load(Ordering::SeqCst)
    }

    /// Mark the engine disposed. Further mutating calls return
    /// `EngineError::Disposed`; already-resolved cells remain readable
    /// through any `Cell<T>` tokens callers still hold is not supported —
    /// disposal is terminal.
    pub fn dispose(&self) {
        self.0.disposed.store(true, Ordering::SeqCst);
    }

    /// Render the graph as a JSON array of per-node records: index, kind,
    /// dependency indices, and the last computed value if one exists.
    pub async fn to_json(&self) -> Result<serde_json::Value> {
        let nodes = self.0.nodes.read().await;
        let mut entries: Vec<(usize, &Arc<Node>)> = nodes.iter().map(|(&i, n)| (i, n)).collect();
        entries.sort_by_key(|(i, _)| *i);
        let mut out = Vec::with_capacity(entries.len());
        for (index, node) in entries {
            out.push(json!({
                "index": index,
                "kind": match node.kind {
                    NodeKind::Input => "input",
                    NodeKind::Function => "function",
                },
                "type": node.type_name,
                "dependencies": node.dependencies_snapshot(),
                "value": node.value_json(),
            }));
        }
        Ok(serde_json::Value::Array(out))
    }
}

fn downcast<T: CellValue>(value: &DynValue, index: usize) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| EngineError::TypeMismatch {
            cell: index,
            expected: std::any::type_name::<T>(),
            found: "erased value",
        })
}
