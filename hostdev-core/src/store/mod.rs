//! Declarative store contract.
//!
//! The cluster-side object store is an external collaborator; the
//! engines only ever talk to it through [`ObjectStore`]. Not-found is a
//! distinguishable condition, and writes carry an optimistic
//! resource-version check: a stale write comes back as a conflict and
//! the handler retries from the latest copy.
//!
//! [`MemoryStore`] is the in-process implementation backing the agent
//! binary and the test suite; a cluster-backed client drops in behind
//! the same trait.

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::StoredObject;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// A change notification from the store's watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    /// Object was created or updated.
    Changed(T),
    /// Object was deleted; carries the last stored copy.
    Removed(T),
}

#[async_trait]
pub trait ObjectStore<T: StoredObject>: Send + Sync {
    async fn get(&self, name: &str) -> Result<T>;

    /// List objects, optionally filtered to one node's.
    async fn list(&self, node_name: Option<&str>) -> Result<Vec<T>>;

    async fn create(&self, obj: T) -> Result<T>;

    /// Replace the object. Rejected with a conflict if the caller's
    /// resource version is stale.
    async fn update(&self, obj: T) -> Result<T>;

    /// Replace the object's status. Same concurrency contract as
    /// [`ObjectStore::update`].
    async fn update_status(&self, obj: T) -> Result<T>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Subscribe to change/remove events.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}
