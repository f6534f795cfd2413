//! Persistence for feature state.

pub mod store;

pub use store::{GraphStore, JsonFileStore, MemoryStore};
