//! Persistence layer: libSQL-backed storage for conversations, sequences and jobs.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ClientUpsert, Database};
