//! Cluster state map: the authoritative configuration record.
//!
//! Every configuration entity lives as a versioned record under a typed
//! key on one well-known object shared by all gateways in the group. The
//! order of successful CAS writes defines the global linearization of
//! configuration; local target-engine state is a derived projection.
//!
//! # Key scheme
//!
//! ```text
//! sub/<nqn>                                subsystem
//! ns/<nqn>/<nsid>                          namespace
//! lst/<nqn>/<gw>/<af>/<addr>/<port>        listener
//! hst/<nqn>/<host-nqn>                     host grant
//! key/<nqn>/<host-nqn>/<kind>              sealed key payload
//! gw/<name>                                gateway registration
//! ana/<group>                              ANA group assignment
//! ```
//!
//! The reserved `epoch` key carries the global version; every mutation
//! bumps it, and watchers are keyed off it.

mod memory;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use memory::MemoryClusterMap;

use crate::keys::KeyKind;
use crate::model::AnaGroupId;

/// Reserved key carrying the global epoch.
pub const EPOCH_KEY: &str = "epoch";

/// Typed state-map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateKey {
    /// `sub/<nqn>`
    Subsystem {
        /// Subsystem NQN.
        nqn: String,
    },
    /// `ns/<nqn>/<nsid>`
    Namespace {
        /// Subsystem NQN.
        nqn: String,
        /// Namespace id.
        nsid: u32,
    },
    /// `lst/<nqn>/<gw>/<af>/<addr>/<port>`
    Listener {
        /// Subsystem NQN.
        nqn: String,
        /// Owning gateway.
        gateway: String,
        /// Address family spelling (`ipv4`/`ipv6`).
        adrfam: String,
        /// Transport address.
        traddr: String,
        /// Transport service id.
        trsvcid: u16,
    },
    /// `hst/<nqn>/<host-nqn>`
    Host {
        /// Subsystem NQN.
        nqn: String,
        /// Host NQN or `"*"`.
        host_nqn: String,
    },
    /// `key/<nqn>/<host-nqn>/<kind>`
    Key {
        /// Subsystem NQN.
        nqn: String,
        /// Host NQN or `"*"`.
        host_nqn: String,
        /// Key kind.
        kind: KeyKind,
    },
    /// `gw/<name>`
    Gateway {
        /// Gateway name.
        name: String,
    },
    /// `ana/<group>`
    AnaGroup {
        /// ANA group id.
        group: AnaGroupId,
    },
}

impl StateKey {
    /// Canonical string encoding.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Subsystem { nqn } => format!("sub/{nqn}"),
            Self::Namespace { nqn, nsid } => format!("ns/{nqn}/{nsid}"),
            Self::Listener {
                nqn,
                gateway,
                adrfam,
                traddr,
                trsvcid,
            } => format!("lst/{nqn}/{gateway}/{adrfam}/{traddr}/{trsvcid}"),
            Self::Host { nqn, host_nqn } => format!("hst/{nqn}/{host_nqn}"),
            Self::Key {
                nqn,
                host_nqn,
                kind,
            } => format!("key/{nqn}/{host_nqn}/{}", kind.as_str()),
            Self::Gateway { name } => format!("gw/{name}"),
            Self::AnaGroup { group } => format!("ana/{group}"),
        }
    }

    /// Parses the canonical encoding. Returns `None` for the reserved
    /// epoch key and anything malformed.
    #[must_use]
    pub fn parse(encoded: &str) -> Option<Self> {
        let (kind, rest) = encoded.split_once('/')?;
        match kind {
            "sub" => Some(Self::Subsystem {
                nqn: rest.to_string(),
            }),
            "ns" => {
                let (nqn, nsid) = rest.rsplit_once('/')?;
                Some(Self::Namespace {
                    nqn: nqn.to_string(),
                    nsid: nsid.parse().ok()?,
                })
            }
            "lst" => {
                let mut parts = rest.split('/');
                let nqn = parts.next()?;
                let gateway = parts.next()?;
                let adrfam = parts.next()?;
                let traddr = parts.next()?;
                let trsvcid = parts.next()?;
                if parts.next().is_some() {
                    return None;
                }
                Some(Self::Listener {
                    nqn: nqn.to_string(),
                    gateway: gateway.to_string(),
                    adrfam: adrfam.to_string(),
                    traddr: traddr.to_string(),
                    trsvcid: trsvcid.parse().ok()?,
                })
            }
            "hst" => {
                let (nqn, host_nqn) = rest.split_once('/')?;
                Some(Self::Host {
                    nqn: nqn.to_string(),
                    host_nqn: host_nqn.to_string(),
                })
            }
            "key" => {
                let mut parts = rest.split('/');
                let nqn = parts.next()?;
                let host_nqn = parts.next()?;
                let kind = KeyKind::parse(parts.next()?)?;
                if parts.next().is_some() {
                    return None;
                }
                Some(Self::Key {
                    nqn: nqn.to_string(),
                    host_nqn: host_nqn.to_string(),
                    kind,
                })
            }
            "gw" => Some(Self::Gateway {
                name: rest.to_string(),
            }),
            "ana" => Some(Self::AnaGroup {
                group: AnaGroupId(rest.parse().ok()?),
            }),
            _ => None,
        }
    }

    /// Subsystem NQN this key belongs to, when it is subsystem-scoped.
    #[must_use]
    pub fn subsystem_nqn(&self) -> Option<&str> {
        match self {
            Self::Subsystem { nqn }
            | Self::Namespace { nqn, .. }
            | Self::Listener { nqn, .. }
            | Self::Host { nqn, .. }
            | Self::Key { nqn, .. } => Some(nqn),
            Self::Gateway { .. } | Self::AnaGroup { .. } => None,
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Versioned record envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Per-key version; bumped on every write to the key.
    pub version: u64,
    /// Name of the gateway that authored the write.
    pub writer: String,
    /// Entity payload (JSON for entities, sealed bytes for keys).
    pub payload: Vec<u8>,
}

impl Record {
    /// Convenience constructor for a first version.
    #[must_use]
    pub fn initial(writer: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            version: 1,
            writer: writer.into(),
            payload,
        }
    }

    /// Deserializes the JSON payload into an entity.
    ///
    /// # Errors
    ///
    /// [`StateMapError::Corrupt`] when the payload does not parse.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, StateMapError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| StateMapError::Corrupt(format!("payload decode failed: {e}")))
    }
}

/// Point-in-time view of the map.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Epoch at the time of the snapshot.
    pub epoch: u64,
    /// All records, ordered by encoded key.
    pub records: BTreeMap<StateKey, Record>,
}

impl Snapshot {
    /// Record for a key.
    #[must_use]
    pub fn get(&self, key: &StateKey) -> Option<&Record> {
        self.records.get(key)
    }

    /// All keys scoped to one subsystem.
    pub fn subsystem_keys<'a>(
        &'a self,
        nqn: &'a str,
    ) -> impl Iterator<Item = (&'a StateKey, &'a Record)> + 'a {
        self.records
            .iter()
            .filter(move |(key, _)| key.subsystem_nqn() == Some(nqn))
    }
}

/// A single mutation in a batch.
#[derive(Debug, Clone)]
pub enum MapOp {
    /// Write `record.payload` under `key`; `expected` is the predecessor
    /// version (`None` = create-if-absent).
    Put {
        /// Target key.
        key: StateKey,
        /// Expected current version.
        expected: Option<u64>,
        /// New payload.
        payload: Vec<u8>,
    },
    /// Remove `key`; `expected` must match the current version.
    Delete {
        /// Target key.
        key: StateKey,
        /// Expected current version.
        expected: u64,
    },
}

/// Change notification: the epoch after the mutation and the keys it
/// touched. `resync` marks a gap (dropped events); consumers must
/// resnapshot instead of trusting `keys`.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Epoch after the change.
    pub epoch: u64,
    /// Gateway that authored the change.
    pub writer: String,
    /// Keys changed in this event; empty when `resync` is set.
    pub keys: Vec<StateKey>,
    /// Event gap: resnapshot required.
    pub resync: bool,
}

/// Ordered, at-least-once stream of [`WatchEvent`]s for one subscriber.
///
/// Backed by a bounded broadcast buffer; when the subscriber lags, older
/// events are dropped and the next `recv` yields a `resync` marker.
pub struct WatchStream {
    rx: broadcast::Receiver<WatchEvent>,
}

impl WatchStream {
    /// Wraps a broadcast receiver. Store implementations use this.
    #[must_use]
    pub fn new(rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Receives the next event; `None` once the store shuts down.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => Some(WatchEvent {
                epoch: 0,
                writer: String::new(),
                keys: Vec::new(),
                resync: true,
            }),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

impl fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchStream").finish_non_exhaustive()
    }
}

/// State-map access failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateMapError {
    /// CAS expectation not met.
    #[error("version conflict on {key}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        /// Encoded key.
        key: String,
        /// Version the caller expected.
        expected: Option<u64>,
        /// Version actually present (`None` = absent).
        found: Option<u64>,
    },
    /// A record failed to decode.
    #[error("corrupt state-map record: {0}")]
    Corrupt(String),
    /// The advisory lock is held by another owner.
    #[error("state-map lock held by {0}")]
    LockHeld(String),
    /// The backing store is unreachable.
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

impl StateMapError {
    /// True for CAS conflicts, which are retryable.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// The seam to the cluster store.
///
/// The in-process [`MemoryClusterMap`] implements the same semantics the
/// rados-backed adapter provides: per-key versions, a global epoch, an
/// advisory lock on the same object, and at-least-once change
/// notification.
#[async_trait::async_trait]
pub trait ClusterMap: Send + Sync {
    /// Current epoch and full contents.
    async fn snapshot(&self) -> Result<Snapshot, StateMapError>;

    /// Applies a batch of mutations atomically: either every operation's
    /// version expectation holds and all are applied under one epoch
    /// bump, or nothing changes.
    async fn apply(&self, writer: &str, ops: Vec<MapOp>) -> Result<u64, StateMapError>;

    /// Subscribes to change events.
    async fn watch(&self) -> Result<WatchStream, StateMapError>;

    /// Acquires the advisory cluster lock for a compound mutation.
    async fn lock(&self, owner: &str) -> Result<(), StateMapError>;

    /// Releases the advisory cluster lock. Releasing a lock that the
    /// owner does not hold is a no-op.
    async fn unlock(&self, owner: &str) -> Result<(), StateMapError>;
}

/// Single-key CAS on top of [`ClusterMap::apply`].
pub async fn cas(
    map: &dyn ClusterMap,
    writer: &str,
    key: StateKey,
    expected: Option<u64>,
    payload: Vec<u8>,
) -> Result<u64, StateMapError> {
    map.apply(
        writer,
        vec![MapOp::Put {
            key,
            expected,
            payload,
        }],
    )
    .await
}

/// Single-key delete on top of [`ClusterMap::apply`].
pub async fn delete(
    map: &dyn ClusterMap,
    writer: &str,
    key: StateKey,
    expected: u64,
) -> Result<u64, StateMapError> {
    map.apply(writer, vec![MapOp::Delete { key, expected }]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_roundtrip() {
        let keys = [
            StateKey::Subsystem {
                nqn: "nqn.2016-06.io.spdk:cnode1".into(),
            },
            StateKey::Namespace {
                nqn: "nqn.2016-06.io.spdk:cnode1".into(),
                nsid: 7,
            },
            StateKey::Listener {
                nqn: "nqn.2016-06.io.spdk:cnode1".into(),
                gateway: "gw-1".into(),
                adrfam: "ipv4".into(),
                traddr: "192.168.13.3".into(),
                trsvcid: 4420,
            },
            StateKey::Host {
                nqn: "nqn.2016-06.io.spdk:cnode1".into(),
                host_nqn: "*".into(),
            },
            StateKey::Key {
                nqn: "nqn.2016-06.io.spdk:cnode1".into(),
                host_nqn: "nqn.2016-06.io.spdk:host1".into(),
                kind: KeyKind::Psk,
            },
            StateKey::Gateway { name: "gw-1".into() },
            StateKey::AnaGroup {
                group: AnaGroupId(2),
            },
        ];
        for key in keys {
            let encoded = key.encode();
            assert_eq!(StateKey::parse(&encoded), Some(key), "{encoded}");
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(StateKey::parse("epoch"), None);
        assert_eq!(StateKey::parse("zzz/abc"), None);
        assert_eq!(StateKey::parse("ns/nqn-only"), None);
        assert_eq!(StateKey::parse("ns/nqn/notanum"), None);
        assert_eq!(StateKey::parse("lst/a/b/c"), None);
        assert_eq!(StateKey::parse("key/a/b/unknown-kind"), None);
    }

    #[test]
    fn subsystem_scope() {
        let key = StateKey::Namespace {
            nqn: "nqn.2016-06.io.spdk:cnode1".into(),
            nsid: 1,
        };
        assert_eq!(key.subsystem_nqn(), Some("nqn.2016-06.io.spdk:cnode1"));
        assert_eq!(StateKey::Gateway { name: "gw".into() }.subsystem_nqn(), None);
    }

    #[test]
    fn record_decode() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Demo {
            x: u32,
        }
        let record = Record::initial("gw-1", serde_json::to_vec(&Demo { x: 3 }).unwrap());
        assert_eq!(record.decode::<Demo>().unwrap(), Demo { x: 3 });
        let bad = Record::initial("gw-1", b"not json".to_vec());
        assert!(bad.decode::<Demo>().is_err());
    }
}
