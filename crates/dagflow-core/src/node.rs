//! The erased node table entry: inputs and functions share one
//! representation, with the value type recovered only at the
//! [`Cell<T>`](crate::cell::Cell) boundary.

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Mutex, RwLock};

use futures::future::{BoxFuture, Shared};
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::cell::{CellValue, DynValue};
use crate::error::{EngineError, Result};

/// Whether a node's value is supplied directly by callers, or derived
/// from other nodes by a pure function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Input,
    Function,
}

pub(crate) type ComputeFn =
    Box<dyn Fn(Vec<DynValue>) -> BoxFuture<'static, anyhow::Result<DynValue>> + Send + Sync>;

pub(crate) type Memo = Shared<BoxFuture<'static, Result<DynValue>>>;

/// Renders an erased value back to JSON for `Engine::to_json`, without the
/// node table needing to carry a static type parameter.
pub(crate) type SerializeFn = Box<dyn Fn(&DynValue) -> serde_json::Value + Send + Sync>;

fn serialize_fn_for<T: CellValue>() -> SerializeFn {
    Box::new(|value: &DynValue| {
        value
            .downcast_ref::<T>()
            .and_then(|v| serde_json::to_value(v).ok())
            .unwrap_or(serde_json::Value::Null)
    })
}

/// A callback registered against a node's value-changed notifier. Stored
/// as `Arc` rather than `Box` so `notify` can clone a snapshot of the
/// registry before invoking callbacks, instead of holding the registry's
/// lock across arbitrary user code.
pub(crate) type Listener = std::sync::Arc<dyn Fn(&DynValue) + Send + Sync>;

/// A single entry in the engine's node table.
///
/// Input nodes hold their value directly in `input_value`; function nodes
/// hold a `compute_fn` that is invoked, at most once per invalidation,
/// through the single-flight `memo` future.
pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) type_name: &'static str,
    pub(crate) dependencies: RwLock<Vec<usize>>,
    pub(crate) compute_fn: Option<ComputeFn>,
    pub(crate) input_value: RwLock<Option<DynValue>>,
    /// The value this cell held before its most recent change. Equal to
    /// `input_value`/the last produced value until the first change.
    previous_value: RwLock<Option<DynValue>>,
    pub(crate) memo: AsyncMutex<Option<Memo>>,
    pub(crate) computing: AtomicBool,
    pub(crate) update_tx: watch::Sender<Option<DynValue>>,
    /// Kept alive so `update_tx.send` never fails for lack of a receiver;
    /// external subscribers clone their own receiver from `update_tx`.
    pub(crate) _update_rx: watch::Receiver<Option<DynValue>>,
    serialize_fn: SerializeFn,
    /// Cell-level value-changed notifier, separate from `update_tx`:
    /// callbacks fire synchronously on every change, rather than through a
    /// pollable stream a consumer has to drive.
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
}

impl Node {
    pub(crate) fn input<T: CellValue>(value: T) -> Self {
        let erased: DynValue = std::sync::Arc::new(value);
        let (update_tx, _update_rx) = watch::channel(Some(erased.clone()));
        Node {
            kind: NodeKind::Input,
            type_name: std::any::type_name::<T>(),
            dependencies: RwLock::new(Vec::new()),
            compute_fn: None,
            input_value: RwLock::new(Some(erased.clone())),
            previous_value: RwLock::new(Some(erased)),
            memo: AsyncMutex::new(None),
            computing: AtomicBool::new(false),
            update_tx,
            _update_rx,
            serialize_fn: serialize_fn_for::<T>(),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn function<T: CellValue>(dependencies: Vec<usize>, compute_fn: ComputeFn) -> Self {
        let (update_tx, _update_rx) = watch::channel(None);
        Node {
            kind: NodeKind::Function,
            type_name: std::any::type_name::<T>(),
            dependencies: RwLock::new(dependencies),
            compute_fn: Some(compute_fn),
            input_value: RwLock::new(None),
            previous_value: RwLock::new(None),
            memo: AsyncMutex::new(None),
            computing: AtomicBool::new(false),
            update_tx,
            _update_rx,
            serialize_fn: serialize_fn_for::<T>(),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn dependencies_snapshot(&self) -> Vec<usize> {
        self.dependencies.read().expect("dependencies lock poisoned").clone()
    }

    /// Replace an input's current value, swapping the old value into
    /// `previous_value` and firing both notification fabrics. Callers are
    /// responsible for invalidating the memo and dependents afterward.
    pub(crate) fn set_input_value(&self, value: DynValue) {
        let old = self.input_value.write().expect("input_value lock poisoned").replace(value.clone());
        *self.previous_value.write().expect("previous_value lock poisoned") = old;
        let _ = self.update_tx.send(Some(value.clone()));
        self.notify(&value);
    }

    pub(crate) fn current_input_value(&self) -> Option<DynValue> {
        self.input_value.read().expect("input_value lock poisoned").clone()
    }

    /// Record a function node's freshly computed value, swapping the prior
    /// produced value into `previous_value` and firing both notification
    /// fabrics. Input nodes record this in `set_input_value` instead.
    pub(crate) fn record_produced_value(&self, value: DynValue) {
        let old = self.update_tx.borrow().clone();
        *self.previous_value.write().expect("previous_value lock poisoned") = old;
        let _ = self.update_tx.send(Some(value.clone()));
        self.notify(&value);
    }

    /// The value this cell held immediately before its current one, or
    /// `None` if it has never changed.
    pub(crate) fn previous_snapshot(&self) -> Option<DynValue> {
        self.previous_value.read().expect("previous_value lock poisoned").clone()
    }

    /// Register a value-changed callback, returning an id used to
    /// unregister it later.
    pub(crate) fn subscribe(&self, listener: Listener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.listeners.lock().expect("listeners lock poisoned").push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.listeners.lock().expect("listeners lock poisoned").retain(|(lid, _)| *lid != id);
    }

    /// Fire every registered callback with the new value. Snapshots the
    /// registry first so a callback that subscribes or unsubscribes
    /// doesn't deadlock on `listeners`.
    fn notify(&self, value: &DynValue) {
        let snapshot: Vec<Listener> =
            self.listeners.lock().expect("listeners lock poisoned").iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            listener(value);
        }
    }

    /// Drop the memoized future so the next `evaluate` recomputes.
    pub(crate) async fn reset_computation(&self) {
        *self.memo.lock().await = None;
    }

    pub(crate) fn try_enter(&self, index: usize) -> Result<()> {
        if self.computing.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(EngineError::ReentrancyDetected(index));
        }
        Ok(())
    }

    pub(crate) fn leave(&self) {
        self.computing.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Current snapshot value, if any has ever been produced, used for
    /// `to_json` rendering.
    pub(crate) fn last_value(&self) -> Option<DynValue> {
        match self.kind {
            NodeKind::Input => self.current_input_value(),
            NodeKind::Function => self.update_tx.borrow().clone(),
        }
    }

    /// JSON rendering of the last value, `null` if none has been produced
    /// yet (a function cell that has never been forced).
    pub(crate) fn value_json(&self) -> serde_json::Value {
        self.last_value().as_ref().map(|v| (self.serialize_fn)(v)).unwrap_or(serde_json::Value::Null)
    }
}
