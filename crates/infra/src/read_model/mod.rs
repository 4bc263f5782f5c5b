//! Read model storage abstractions.

pub mod store;

pub use store::{InMemoryStore, ReadModelStore};
