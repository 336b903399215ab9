//! In-process implementation of [`ClusterMap`].
//!
//! Shares one map between any number of gateway instances in the same
//! process via `Arc`. Tests and single-node development run against this;
//! the semantics (per-key versions, global epoch, advisory lock, bounded
//! watch buffer) match the rados-backed adapter.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify, RwLock};

use super::{
    ClusterMap, MapOp, Record, Snapshot, StateMapError, WatchEvent, WatchStream,
};

/// Watch buffer depth; a lagging subscriber past this gets a resync
/// marker instead of the dropped events.
const WATCH_BUFFER: usize = 256;

#[derive(Default)]
struct Inner {
    epoch: u64,
    records: BTreeMap<super::StateKey, Record>,
}

/// In-memory cluster map.
pub struct MemoryClusterMap {
    inner: RwLock<Inner>,
    tx: broadcast::Sender<WatchEvent>,
    lock_owner: Mutex<Option<String>>,
    lock_released: Notify,
}

impl Default for MemoryClusterMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClusterMap {
    /// Creates an empty map at epoch 0.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: RwLock::new(Inner::default()),
            tx,
            lock_owner: Mutex::new(None),
            lock_released: Notify::new(),
        }
    }

    /// Convenience: a shared handle for multi-gateway tests.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl std::fmt::Debug for MemoryClusterMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClusterMap").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ClusterMap for MemoryClusterMap {
    async fn snapshot(&self) -> Result<Snapshot, StateMapError> {
        let inner = self.inner.read().await;
        Ok(Snapshot {
            epoch: inner.epoch,
            records: inner.records.clone(),
        })
    }

    async fn apply(&self, writer: &str, ops: Vec<MapOp>) -> Result<u64, StateMapError> {
        if ops.is_empty() {
            let inner = self.inner.read().await;
            return Ok(inner.epoch);
        }
        let mut inner = self.inner.write().await;

        // Validate every expectation before touching anything.
        for op in &ops {
            let (key, expected) = match op {
                MapOp::Put { key, expected, .. } => (key, *expected),
                MapOp::Delete { key, expected } => (key, Some(*expected)),
            };
            let found = inner.records.get(key).map(|r| r.version);
            if found != expected {
                return Err(StateMapError::VersionConflict {
                    key: key.encode(),
                    expected,
                    found,
                });
            }
        }

        inner.epoch += 1;
        let epoch = inner.epoch;
        let mut changed = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                MapOp::Put {
                    key,
                    expected,
                    payload,
                } => {
                    let version = expected.unwrap_or(0) + 1;
                    inner.records.insert(
                        key.clone(),
                        Record {
                            version,
                            writer: writer.to_string(),
                            payload,
                        },
                    );
                    changed.push(key);
                }
                MapOp::Delete { key, .. } => {
                    inner.records.remove(&key);
                    changed.push(key);
                }
            }
        }
        drop(inner);

        // No subscribers is fine.
        let _ = self.tx.send(WatchEvent {
            epoch,
            writer: writer.to_string(),
            keys: changed,
            resync: false,
        });
        Ok(epoch)
    }

    async fn watch(&self) -> Result<WatchStream, StateMapError> {
        Ok(WatchStream::new(self.tx.subscribe()))
    }

    async fn lock(&self, owner: &str) -> Result<(), StateMapError> {
        loop {
            // Register interest before inspecting the owner, so a release
            // racing with the check cannot be missed.
            let released = self.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            {
                let mut guard = self.lock_owner.lock().await;
                match guard.as_deref() {
                    None => {
                        *guard = Some(owner.to_string());
                        return Ok(());
                    }
                    Some(current) if current == owner => return Ok(()),
                    Some(_) => {}
                }
            }
            released.await;
        }
    }

    async fn unlock(&self, owner: &str) -> Result<(), StateMapError> {
        let mut guard = self.lock_owner.lock().await;
        if guard.as_deref() == Some(owner) {
            *guard = None;
            drop(guard);
            self.lock_released.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{cas, delete, StateKey};
    use super::*;

    fn sub_key(nqn: &str) -> StateKey {
        StateKey::Subsystem {
            nqn: nqn.to_string(),
        }
    }

    #[tokio::test]
    async fn cas_creates_and_bumps_versions() {
        let map = MemoryClusterMap::new();
        let key = sub_key("nqn.2016-06.io.spdk:cnode1");

        let epoch = cas(&map, "gw-1", key.clone(), None, b"v1".to_vec())
            .await
            .unwrap();
        assert_eq!(epoch, 1);

        let snap = map.snapshot().await.unwrap();
        let record = snap.get(&key).unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.writer, "gw-1");

        let epoch = cas(&map, "gw-2", key.clone(), Some(1), b"v2".to_vec())
            .await
            .unwrap();
        assert_eq!(epoch, 2);
        let snap = map.snapshot().await.unwrap();
        assert_eq!(snap.get(&key).unwrap().version, 2);
        assert_eq!(snap.get(&key).unwrap().writer, "gw-2");
    }

    #[tokio::test]
    async fn stale_expectation_conflicts() {
        let map = MemoryClusterMap::new();
        let key = sub_key("nqn.2016-06.io.spdk:cnode1");
        cas(&map, "gw-1", key.clone(), None, b"v1".to_vec())
            .await
            .unwrap();

        let err = cas(&map, "gw-2", key.clone(), None, b"dup".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let err = cas(&map, "gw-2", key.clone(), Some(9), b"stale".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let map = MemoryClusterMap::new();
        let a = sub_key("nqn.2016-06.io.spdk:a");
        let b = sub_key("nqn.2016-06.io.spdk:b");
        cas(&map, "gw-1", a.clone(), None, b"a".to_vec())
            .await
            .unwrap();

        // Second op expects a version that doesn't exist; first op must
        // not be applied either.
        let err = map
            .apply(
                "gw-1",
                vec![
                    MapOp::Put {
                        key: b.clone(),
                        expected: None,
                        payload: b"b".to_vec(),
                    },
                    MapOp::Delete {
                        key: a.clone(),
                        expected: 7,
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let snap = map.snapshot().await.unwrap();
        assert!(snap.get(&b).is_none());
        assert!(snap.get(&a).is_some());
        assert_eq!(snap.epoch, 1);
    }

    #[tokio::test]
    async fn watch_sees_changes_in_order() {
        let map = MemoryClusterMap::new();
        let mut watch = map.watch().await.unwrap();

        let a = sub_key("nqn.2016-06.io.spdk:a");
        cas(&map, "gw-1", a.clone(), None, b"a".to_vec())
            .await
            .unwrap();
        delete(&map, "gw-1", a.clone(), 1).await.unwrap();

        let first = watch.recv().await.unwrap();
        assert_eq!(first.epoch, 1);
        assert_eq!(first.keys, vec![a.clone()]);
        assert!(!first.resync);

        let second = watch.recv().await.unwrap();
        assert_eq!(second.epoch, 2);
        assert_eq!(second.writer, "gw-1");
    }

    #[tokio::test]
    async fn lagged_watcher_gets_resync_marker() {
        let map = MemoryClusterMap::new();
        let mut watch = map.watch().await.unwrap();

        for i in 0..(WATCH_BUFFER + 16) {
            let key = sub_key(&format!("nqn.2016-06.io.spdk:c{i}"));
            cas(&map, "gw-1", key, None, b"x".to_vec()).await.unwrap();
        }

        let event = watch.recv().await.unwrap();
        assert!(event.resync);
    }

    #[tokio::test]
    async fn advisory_lock_excludes_other_owners() {
        let map = MemoryClusterMap::shared();
        map.lock("gw-1").await.unwrap();
        // Re-entry by the same owner is fine.
        map.lock("gw-1").await.unwrap();

        let contender = {
            let map = Arc::clone(&map);
            tokio::spawn(async move {
                map.lock("gw-2").await.unwrap();
                map.unlock("gw-2").await.unwrap();
            })
        };
        // Give the contender a chance to block.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        map.unlock("gw-1").await.unwrap();
        contender.await.unwrap();
    }
}
