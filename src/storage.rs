// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, SyncBoxFuture};
use async_std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// An opaque optimistic-concurrency token issued by a [StateStore]. Every
/// successful write produces a new one; a write presenting anything but the
/// current token is rejected.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ETag(pub String);

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Addresses one named piece of state belonging to one participant identity.
#[derive(Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub identity: String,
    pub state_name: String,
}

impl StateKey {
    pub fn new(identity: impl Into<String>, state_name: impl Into<String>) -> Self {
        StateKey {
            identity: identity.into(),
            state_name: state_name.into(),
        }
    }
}

impl std::fmt::Debug for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.identity, self.state_name))
    }
}

/// A `StateStore` is responsible for durable storage. Clients of the library
/// should provide an implementation over whatever key-value or document store
/// they have, and pass an instance in to the constructor of
/// [crate::TransactionalStateStorage].
///
/// Stores are presumed to model a map from [StateKey] to `(V, ETag)` with
/// compare-and-swap writes: `write` succeeds only if `expected` equals the
/// key's current ETag (`None` meaning the key is absent), and must fail with
/// [Error::StorageConflict] otherwise, leaving the stored value untouched.
pub trait StateStore<V>: Send + Sync + 'static {
    fn read(&self, key: &StateKey) -> SyncBoxFuture<Result<Option<(V, ETag)>, Error>>;
    fn write(&self, key: &StateKey, value: V, expected: Option<ETag>) -> SyncBoxFuture<Result<ETag, Error>>;
}

/// A [StateStore] held in memory. Clones share contents. ETags are drawn from
/// a counter shared by every key in the store.
pub struct MemoryStore<V> {
    map: Arc<Mutex<(u64, HashMap<StateKey, (V, ETag)>)>>,
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        MemoryStore {
            map: self.map.clone(),
        }
    }
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        MemoryStore {
            map: Arc::new(Mutex::new((0, HashMap::new()))),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> StateStore<V> for MemoryStore<V> {
    fn read(&self, key: &StateKey) -> SyncBoxFuture<Result<Option<(V, ETag)>, Error>> {
        let map = self.map.clone();
        let key = key.clone();
        Box::pin(async move {
            let guard = map.lock().await;
            Ok(guard.1.get(&key).cloned())
        })
    }

    fn write(&self, key: &StateKey, value: V, expected: Option<ETag>) -> SyncBoxFuture<Result<ETag, Error>> {
        let map = self.map.clone();
        let key = key.clone();
        Box::pin(async move {
            let mut guard = map.lock().await;
            let current = guard.1.get(&key).map(|(_, etag)| etag.clone());
            if current != expected {
                trace!("write to {:?} with stale etag {:?}, current {:?}", key, expected, current);
                return Err(Error::StorageConflict);
            }
            guard.0 += 1;
            let etag = ETag(guard.0.to_string());
            guard.1.insert(key, (value, etag.clone()));
            Ok(etag)
        })
    }
}

#[test]
fn test_memory_store_cas() {
    async_std::task::block_on(async {
        let store = MemoryStore::<u32>::new();
        let key = StateKey::new("actor-1", "balance");
        assert_eq!(store.read(&key).await, Ok(None));

        let e1 = store.write(&key, 5, None).await.unwrap();
        assert_eq!(store.write(&key, 6, None).await, Err(Error::StorageConflict));
        let e2 = store.write(&key, 7, Some(e1.clone())).await.unwrap();
        assert_ne!(e1, e2);
        assert_eq!(store.write(&key, 8, Some(e1)).await, Err(Error::StorageConflict));
        assert_eq!(store.read(&key).await, Ok(Some((7, e2))));
    });
}
