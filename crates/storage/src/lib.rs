// Storage layer for orchestrator entities
//
// - `Storage` trait: the contract the workflows and the HTTP boundary use
// - `PostgresStorage`: production implementation (sqlx, hand-written SQL)
// - `InMemoryStorage`: used by tests and single-process dev mode

mod memory;
mod models;
mod postgres;
mod store;

pub use memory::InMemoryStorage;
pub use postgres::PostgresStorage;
pub use store::{InboxFilter, Storage, StorageError};
