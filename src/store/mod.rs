//! Persistence layer: libSQL-backed storage for boards, tasks, attempts and steps.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
