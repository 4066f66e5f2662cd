//! In-process object store.

use super::WatchEvent;
use crate::error::{HostdevError, Result};
use crate::store::ObjectStore;
use crate::types::StoredObject;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// Number of watch events buffered per subscriber before it lags.
const WATCH_BUFFER_SIZE: usize = 256;

/// Lock-protected map of records with resource-version bookkeeping and
/// a broadcast watch channel.
pub struct MemoryStore<T: StoredObject> {
    objects: RwLock<HashMap<String, T>>,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T: StoredObject> MemoryStore<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self { objects: RwLock::new(HashMap::new()), events }
    }

    fn publish(&self, event: WatchEvent<T>) {
        // No subscribers is fine; events are best-effort notifications.
        let _ = self.events.send(event);
    }
}

impl<T: StoredObject> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: StoredObject> ObjectStore<T> for MemoryStore<T> {
    async fn get(&self, name: &str) -> Result<T> {
        self.objects
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| HostdevError::NotFound { kind: T::KIND, name: name.to_string() })
    }

    async fn list(&self, node_name: Option<&str>) -> Result<Vec<T>> {
        let objects = self.objects.read().await;
        Ok(objects
            .values()
            .filter(|obj| node_name.map_or(true, |node| obj.node_name() == node))
            .cloned()
            .collect())
    }

    async fn create(&self, mut obj: T) -> Result<T> {
        let mut objects = self.objects.write().await;
        let name = obj.name().to_string();
        if objects.contains_key(&name) {
            return Err(HostdevError::AlreadyExists { kind: T::KIND, name });
        }
        obj.metadata_mut().resource_version = 1;
        objects.insert(name, obj.clone());
        drop(objects);
        self.publish(WatchEvent::Changed(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, mut obj: T) -> Result<T> {
        let mut objects = self.objects.write().await;
        let name = obj.name().to_string();
        let stored = objects
            .get(&name)
            .ok_or_else(|| HostdevError::NotFound { kind: T::KIND, name: name.clone() })?;

        let expected = stored.metadata().resource_version;
        let actual = obj.metadata().resource_version;
        if expected != actual {
            return Err(HostdevError::Conflict { name, expected, actual });
        }

        obj.metadata_mut().resource_version = expected + 1;
        objects.insert(name, obj.clone());
        drop(objects);
        self.publish(WatchEvent::Changed(obj.clone()));
        Ok(obj)
    }

    async fn update_status(&self, obj: T) -> Result<T> {
        // The in-process store keeps spec and status on one object, so
        // a status write is an update with the same stale-write check.
        self.update(obj).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut objects = self.objects.write().await;
        let removed = objects
            .remove(name)
            .ok_or_else(|| HostdevError::NotFound { kind: T::KIND, name: name.to_string() })?;
        drop(objects);
        self.publish(WatchEvent::Removed(removed));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}
