//! dagflow: a fluent construction facade over the reactive graph engine in
//! `dagflow-core`.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use dagflow::GraphBuilder;
//!
//! # async fn run() -> Result<(), dagflow::EngineError> {
//! let graph = GraphBuilder::new();
//! let a = graph.add_input(2i64).await?;
//! let b = graph.add_input(3i64).await?;
//! let sum = graph.combine(a, b, |x, y| async move { Ok(x + y) }).await?;
//! assert_eq!(graph.get_result(sum).await?, 5);
//! # Ok(())
//! # }
//! ```

pub mod builder;

pub use builder::GraphBuilder;
pub use dagflow_core::{Cell, CellValue, EngineError, NodeKind, Result};

pub mod prelude {
    //! Common imports for building a graph with the facade.
    pub use crate::{Cell, EngineError, GraphBuilder, Result};
}
