//! Persistence layer: repository trait plus libSQL and in-memory backends.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlRepository;
pub use memory::InMemoryRepository;
pub use traits::Repository;
