//! Core engine for the dagflow reactive computation graph.
//!
//! A graph of typed cells where some cells hold plain values (inputs) and
//! others derive their value from other cells via a pure function
//! (functions). Updating an input lazily invalidates every cell reachable
//! from it; results are recomputed on demand and memoized until the next
//! invalidation.
//!
//! ```rust,ignore
//! use dagflow_core::Engine;
//!
//! # async fn run() -> Result<(), dagflow_core::EngineError> {
//! let engine = Engine::new();
//! let a = engine.add_input(1i64).await;
//! let b = engine.add_input(2i64).await;
//! let sum = engine.add_function(&[a.erase(), b.erase()], |deps| {
//!     Box::pin(async move { Ok(deps[0].downcast::<i64>()? + deps[1].downcast::<i64>()?) })
//! }).await?;
//! assert_eq!(engine.get_result(sum).await?, 3);
//! # Ok(())
//! # }
//! ```

pub mod cell;
pub mod engine;
pub mod error;
pub mod node;
pub mod stream;

pub use cell::{Cell, CellValue, DynValue, Subscription};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use node::NodeKind;
pub use stream::CellStream;

pub mod prelude {
    //! Convenience re-export of the types most callers need.
    pub use crate::{Cell, CellValue, EngineError, Engine, NodeKind, Result, Subscription};
}
