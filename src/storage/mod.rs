pub mod datastore;

pub use datastore::{DataStore, MemoryStore, StoreError, UnitRouter};
