//! Mock handlers, an in-memory event sink and workflow fixtures shared by
//! the Stepflow test suites.

pub mod fixtures;
pub mod handlers;
pub mod sink;

pub use fixtures::*;
pub use handlers::*;
pub use sink::CollectingSink;
