//! Metastore contract for the application encryption library
//!
//! The metastore is the durable key-record store: `load(id, created)`, `loadLatest(id)`,
//! and `store(id, created, value)` with create-only semantics (the `Metastore` trait in the
//! crate root). This module ships the in-memory reference implementation used for tests and
//! single-process deployments; concrete backends (SQL, DynamoDB, ...) implement the same
//! trait outside this crate.

mod memory;

pub use memory::InMemoryMetastore;
