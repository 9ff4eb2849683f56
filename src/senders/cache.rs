//! Per-adapter connection cache keyed by canonical target serialization.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::Result;
use crate::types::Target;

struct Entry<C> {
    generation: u64,
    connection: C,
}

type Entries<C> = Arc<Mutex<HashMap<String, Entry<C>>>>;

/// Lazily established broker connections.
///
/// A cached entry is assumed healthy until the connection's error or close
/// observer evicts it. Concurrent first connects for one key are not
/// serialized; the later insert wins.
pub struct ConnectionCache<C> {
    entries: Entries<C>,
    generations: AtomicU64,
}

/// Handle given to a connector so its error observers can drop the entry.
///
/// Only the entry created by the same connect is removed; a newer
/// connection stored under the same key is left alone.
pub struct CacheEvictor<C> {
    entries: Entries<C>,
    key: String,
    generation: u64,
}

impl<C> Clone for CacheEvictor<C> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            key: self.key.clone(),
            generation: self.generation,
        }
    }
}

impl<C> CacheEvictor<C> {
    /// Remove the entry this evictor was created for.
    pub fn evict(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            entries.remove(&self.key);
            debug!(generation = self.generation, "Evicted cached connection");
        }
    }
}

impl<C: Clone> ConnectionCache<C> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// Cached connection for the target, if any.
    pub fn get(&self, target: &Target) -> Result<Option<C>> {
        let key = target.canonical_key()?;
        Ok(self.lock().get(&key).map(|entry| entry.connection.clone()))
    }

    /// Return the cached connection or establish one with `connect`.
    pub async fn get_or_connect<F, Fut>(&self, target: &Target, connect: F) -> Result<C>
    where
        F: FnOnce(CacheEvictor<C>) -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let key = target.canonical_key()?;
        let cached = self.lock().get(&key).map(|entry| entry.connection.clone());
        if let Some(connection) = cached {
            return Ok(connection);
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let evictor = CacheEvictor {
            entries: Arc::clone(&self.entries),
            key: key.clone(),
            generation,
        };

        debug!(url = %target.url, "Opening new connection");
        let connection = connect(evictor).await?;

        self.lock().insert(
            key,
            Entry {
                generation,
                connection: connection.clone(),
            },
        );
        Ok(connection)
    }

    /// Swap the cached connection for the target, keeping its evictor valid.
    ///
    /// Returns `false` when nothing was cached for the target.
    pub fn refresh(&self, target: &Target, connection: C) -> Result<bool> {
        let key = target.canonical_key()?;
        Ok(match self.lock().get_mut(&key) {
            Some(entry) => {
                entry.connection = connection;
                true
            }
            None => false,
        })
    }

    /// Drop the entry for the target, returning it.
    pub fn remove(&self, target: &Target) -> Result<Option<C>> {
        let key = target.canonical_key()?;
        Ok(self.lock().remove(&key).map(|entry| entry.connection))
    }

    /// Number of cached connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no connection.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry<C>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<C: Clone> Default for ConnectionCache<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::error::SenderError;
    use crate::types::SecurityDescriptor;

    #[tokio::test]
    async fn test_same_target_connects_once() {
        let cache: ConnectionCache<usize> = ConnectionCache::new();
        let connects = AtomicUsize::new(0);
        let target = Target::new("amqp://localhost:5672").with_queue("q1");

        for _ in 0..3 {
            let id = cache
                .get_or_connect(&target, |_| async {
                    Ok(connects.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
            assert_eq!(id, 0);
        }
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_different_targets_get_different_connections() {
        let cache: ConnectionCache<String> = ConnectionCache::new();
        let plain = Target::new("amqp://localhost:5672").with_queue("q1");
        let secured = plain
            .clone()
            .with_security(SecurityDescriptor::credentials("u", "p"));

        let a = cache
            .get_or_connect(&plain, |_| async { Ok("a".to_string()) })
            .await
            .unwrap();
        let b = cache
            .get_or_connect(&secured, |_| async { Ok("b".to_string()) })
            .await
            .unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_evictor_removes_entry() {
        let cache: ConnectionCache<u8> = ConnectionCache::new();
        let target = Target::new("localhost:9092").with_topic("t");
        let mut captured = None;

        cache
            .get_or_connect(&target, |evictor| {
                captured = Some(evictor);
                async { Ok(1) }
            })
            .await
            .unwrap();
        assert_eq!(cache.get(&target).unwrap(), Some(1));

        captured.unwrap().evict();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_stale_evictor_keeps_newer_connection() {
        let cache: ConnectionCache<u8> = ConnectionCache::new();
        let target = Target::new("localhost:1883").with_topic("t");
        let mut stale = None;

        cache
            .get_or_connect(&target, |evictor| {
                stale = Some(evictor);
                async { Ok(1) }
            })
            .await
            .unwrap();
        cache.remove(&target).unwrap();
        cache
            .get_or_connect(&target, |_| async { Ok(2) })
            .await
            .unwrap();

        stale.unwrap().evict();
        assert_eq!(cache.get(&target).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let cache: ConnectionCache<u8> = ConnectionCache::new();
        let target = Target::new("localhost:1883");

        let result = cache
            .get_or_connect(&target, |_| async {
                Err(SenderError::ConnectionClosed("localhost:1883".into()))
            })
            .await;
        tokio_test::assert_err!(result);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_keeps_evictor_valid() {
        let cache: ConnectionCache<u8> = ConnectionCache::new();
        let target = Target::new("amqp://localhost:5672").with_queue("q1");
        let mut captured = None;

        cache
            .get_or_connect(&target, |evictor| {
                captured = Some(evictor);
                async { Ok(1) }
            })
            .await
            .unwrap();
        assert!(cache.refresh(&target, 2).unwrap());
        assert_eq!(cache.get(&target).unwrap(), Some(2));

        captured.unwrap().evict();
        assert!(cache.is_empty());
        assert!(!cache.refresh(&target, 3).unwrap());
        assert!(cache.is_empty());
    }
}
