// Integration test module organization

pub mod common;
pub mod memory;
pub mod multithreaded;

// Additional tests
mod cache_behavior_test;
mod metastore_interactions_test;
mod revoke_test;
