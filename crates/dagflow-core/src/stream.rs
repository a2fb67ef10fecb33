//! Adapts a node's `watch` channel into a [`futures::Stream`] of typed
//! values.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::watch;

use crate::cell::{CellValue, DynValue};
use crate::error::EngineError;

/// A stream of a cell's values. Yields the current value immediately,
/// then the latest value on every subsequent change; if the consumer
/// falls behind, only the most recent value survives (the same
/// drop-oldest discipline as the underlying `watch` channel).
pub struct CellStream<T> {
    rx: watch::Receiver<Option<DynValue>>,
    index: usize,
    seen_initial: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CellStream<T> {
    pub(crate) fn new(rx: watch::Receiver<Option<DynValue>>, index: usize) -> Self {
        CellStream { rx, index, seen_initial: false, _marker: PhantomData }
    }
}

impl<T: CellValue> Stream for CellStream<T> {
    type Item = Result<T, EngineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if !this.seen_initial {
            this.seen_initial = true;
            let current = this.rx.borrow().clone();
            if let Some(value) = current {
                return Poll::Ready(Some(downcast(&value, this.index)));
            }
        }

        let fut = this.rx.changed();
        futures::pin_mut!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok(())) => {
                let current = this.rx.borrow_and_update().clone();
                match current {
                    Some(value) => Poll::Ready(Some(downcast(&value, this.index))),
                    None => {
                        // Function node hasn't produced a first value yet;
                        // come back around rather than stalling the waker.
                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn downcast<T: CellValue>(value: &DynValue, index: usize) -> Result<T, EngineError> {
    value.downcast_ref::<T>().cloned().ok_or_else(|| EngineError::TypeMismatch {
        cell: index,
        expected: std::any::type_name::<T>(),
        found: "erased value",
    })
}
