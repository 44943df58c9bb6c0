//! Storage and locking backends for the job queue.
//!
//! - [`MemoryDriver`] keeps everything in process
//! - [`SurrealDriver`] persists jobs in SurrealDB (embedded or remote)

mod connection;
mod memory;
mod schema;
mod surreal;

pub use connection::{Database, DbConfig, DbError, connect};
pub use memory::MemoryDriver;
pub use schema::init_schema;
pub use surreal::SurrealDriver;
