//! Store implementations.

mod memory;
mod postgres;

pub use memory::{MemoryStore, MemoryTransaction};
pub use postgres::{
    CHANGE_CHANNEL, CHANGE_LOCK_KEY, ChangeFeed, PgBuildRequestStore, PgStoreTransaction,
};
