//! Typed SQL access to the data mart, across both supported dialects.
//!
//! Every other crate in the workspace that touches the database goes
//! through here rather than building its own queries, the same way the
//! teacher centralizes typed SQL in one crate instead of scattering it
//! behind each component.

pub mod dialect;
pub mod locks;
pub mod mart;
pub mod pool;
pub mod queue;
pub mod report;
pub mod schema;

pub use pool::{bool_to_i32, i32_to_bool, now_micros, Conn, DbPool, DbTx, Dialect, ENV_DB_URL};
pub use queue::QueueTask;
pub use schema::ensure_schema;
