//! Storage boundary for processable objects.
//!
//! The engine programs against [`ObjectStorage`]; each backing store provides
//! the atomic claim and the owner-guarded finalize once.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryObjectStorage;
pub use postgres::PostgresObjectStorage;
pub use r#trait::{ClaimRequest, Claimed, Finalization, ObjectStorage};
