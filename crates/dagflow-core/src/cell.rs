//! Typed handles into an [`Engine`](crate::engine::Engine)'s node table.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;

use crate::node::{Node, NodeKind};

/// A type-erased cell value, stored in the engine's node table regardless
/// of the concrete type a [`Cell<T>`] handle was created with.
pub type DynValue = Arc<dyn Any + Send + Sync>;

/// Values a cell may hold. Blanket-implemented for anything `Clone +
/// PartialEq + Send + Sync + Serialize + 'static` — which is to say,
/// almost any value type a caller would plausibly wire into a reactive
/// graph already satisfies this.
pub trait CellValue: Clone + PartialEq + Send + Sync + Serialize + 'static {}

impl<T> CellValue for T where T: Clone + PartialEq + Send + Sync + Serialize + 'static {}

/// A handle to a node in the engine, typed by the value it produces.
///
/// Cheap to copy, equal by the node index it refers to. Carries no
/// behavior of its own — every operation on a cell is a method on the
/// [`Engine`](crate::engine::Engine) that created it.
pub struct Cell<T> {
    pub(crate) index: usize,
    pub(crate) kind: NodeKind,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Cell<T> {
    pub(crate) fn new(index: usize, kind: NodeKind) -> Self {
        Cell { index, kind, _marker: PhantomData }
    }

    /// The node index this cell refers to, stable for the cell's lifetime.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Erase the value type, producing a token suitable for passing as a
    /// dependency to [`Engine::add_function`](crate::engine::Engine::add_function).
    pub fn erase(&self) -> ErasedCell {
        ErasedCell { index: self.index }
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Cell<T> {}

impl<T> PartialEq for Cell<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Cell<T> {}

impl<T> std::fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell").field("index", &self.index).field("kind", &self.kind).finish()
    }
}

/// A type-erased reference to a cell, used only to wire up dependency
/// edges. Carries no type information beyond the node index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErasedCell {
    pub(crate) index: usize,
}

impl<T> From<Cell<T>> for ErasedCell {
    fn from(cell: Cell<T>) -> Self {
        cell.erase()
    }
}

/// A cancellable handle returned by
/// [`Engine::subscribe`](crate::engine::Engine::subscribe). The callback it
/// guards stays registered until this handle is dropped; there is no
/// explicit `unsubscribe` method, matching the RAII-guard idiom used
/// elsewhere for scoped registration (a dropped subscription is the only
/// way to unregister).
pub struct Subscription {
    node: Arc<Node>,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(node: Arc<Node>, id: u64) -> Self {
        Subscription { node, id }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.node.unsubscribe(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
