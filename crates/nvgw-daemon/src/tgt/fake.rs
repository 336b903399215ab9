//! In-process target engine.
//!
//! Mirrors the engine's observable semantics (existence errors, nsid
//! assignment, keyring naming) without a socket. Integration tests run
//! whole gateways against this; fault injection lets them exercise the
//! reconciler's retry path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use nvgw_core::model::AnaState;
use serde_json::Value;

use super::{
    TgtApi, TgtConnection, TgtError, TgtResult, TgtHost, TgtListenAddress, TgtNamespace,
    TgtSubsystem,
};

/// A registered block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeBdev {
    /// Backing pool.
    pub pool: String,
    /// Backing image.
    pub image: String,
    /// Block size.
    pub block_size: u32,
    /// Size after the last resize, zero until then.
    pub size_bytes: u64,
}

/// Observable engine state; tests inspect this through the handle.
#[derive(Debug, Default)]
pub struct FakeState {
    /// Subsystems in engine order.
    pub subsystems: Vec<TgtSubsystem>,
    /// Block devices by name.
    pub bdevs: BTreeMap<String, FakeBdev>,
    /// Keyring entries: name → file path.
    pub keyring: BTreeMap<String, String>,
    /// Published ANA state per (nqn, group).
    pub ana_states: BTreeMap<(String, u32), AnaState>,
    /// Per-namespace visibility grants: (nqn, nsid) → hosts.
    pub ns_visibility: BTreeMap<(String, u32), BTreeSet<String>>,
    /// Connections the tests have staged, per subsystem.
    pub connections: BTreeMap<String, Vec<TgtConnection>>,
    /// Created transports.
    pub transports: Vec<String>,
    /// Engine log level.
    pub log_level: String,
    /// Error to inject into the next mutating call.
    pub fail_next: Option<TgtError>,
    /// Total mutating calls, for retry assertions.
    pub mutation_count: u64,
}

impl FakeState {
    fn subsystem(&mut self, nqn: &str) -> TgtResult<&mut TgtSubsystem> {
        self.subsystems
            .iter_mut()
            .find(|s| s.nqn == nqn)
            .ok_or_else(|| TgtError::engine(-2, format!("subsystem {nqn} does not exist")))
    }

    fn take_fault(&mut self) -> TgtResult<()> {
        self.mutation_count += 1;
        match self.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Handle to shared fake-engine state.
pub type FakeHandle = Arc<Mutex<FakeState>>;

/// In-process [`TgtApi`] implementation.
#[derive(Debug, Clone, Default)]
pub struct FakeTgt {
    state: FakeHandle,
}

impl FakeTgt {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the state handle for test inspection and fault injection.
    #[must_use]
    pub fn handle(&self) -> FakeHandle {
        Arc::clone(&self.state)
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake engine state poisoned")
    }
}

#[async_trait::async_trait]
impl TgtApi for FakeTgt {
    async fn create_subsystem(
        &mut self,
        nqn: &str,
        serial: &str,
        max_namespaces: u32,
    ) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        if state.subsystems.iter().any(|s| s.nqn == nqn) {
            return Err(TgtError::engine(-17, format!("subsystem {nqn} already exists")));
        }
        state.subsystems.push(TgtSubsystem {
            nqn: nqn.to_string(),
            serial_number: serial.to_string(),
            max_namespaces,
            allow_any_host: false,
            hosts: Vec::new(),
            listen_addresses: Vec::new(),
            namespaces: Vec::new(),
        });
        Ok(())
    }

    async fn delete_subsystem(&mut self, nqn: &str) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        let before = state.subsystems.len();
        state.subsystems.retain(|s| s.nqn != nqn);
        if state.subsystems.len() == before {
            return Err(TgtError::engine(-2, format!("subsystem {nqn} does not exist")));
        }
        state.ana_states.retain(|(n, _), _| n != nqn);
        state.connections.remove(nqn);
        Ok(())
    }

    async fn create_bdev(
        &mut self,
        name: &str,
        pool: &str,
        image: &str,
        block_size: u32,
    ) -> TgtResult<String> {
        let mut state = self.locked();
        state.take_fault()?;
        if state.bdevs.contains_key(name) {
            return Err(TgtError::engine(-17, format!("bdev {name} already exists")));
        }
        state.bdevs.insert(
            name.to_string(),
            FakeBdev {
                pool: pool.to_string(),
                image: image.to_string(),
                block_size,
                size_bytes: 0,
            },
        );
        Ok(name.to_string())
    }

    async fn delete_bdev(&mut self, name: &str) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        if state.bdevs.remove(name).is_none() {
            return Err(TgtError::engine(-2, format!("bdev {name} does not exist")));
        }
        Ok(())
    }

    async fn resize_bdev(&mut self, name: &str, new_size_bytes: u64) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        match state.bdevs.get_mut(name) {
            Some(bdev) => {
                bdev.size_bytes = new_size_bytes;
                Ok(())
            }
            None => Err(TgtError::engine(-2, format!("bdev {name} does not exist"))),
        }
    }

    async fn add_namespace(
        &mut self,
        nqn: &str,
        bdev_name: &str,
        nsid: u32,
        uuid: &str,
        anagrpid: u32,
    ) -> TgtResult<u32> {
        let mut state = self.locked();
        state.take_fault()?;
        if !state.bdevs.contains_key(bdev_name) {
            return Err(TgtError::engine(-2, format!("bdev {bdev_name} does not exist")));
        }
        let subsystem = state.subsystem(nqn)?;
        let assigned = if nsid == 0 {
            (1..).find(|candidate| subsystem.namespaces.iter().all(|n| n.nsid != *candidate))
                .expect("free nsid")
        } else {
            if subsystem.namespaces.iter().any(|n| n.nsid == nsid) {
                return Err(TgtError::engine(-17, format!("nsid {nsid} in use on {nqn}")));
            }
            nsid
        };
        if subsystem.namespaces.len() as u32 >= subsystem.max_namespaces {
            return Err(TgtError::engine(-28, format!("{nqn} namespace limit reached")));
        }
        subsystem.namespaces.push(TgtNamespace {
            nsid: assigned,
            bdev_name: bdev_name.to_string(),
            uuid: uuid.to_string(),
            anagrpid,
        });
        subsystem.namespaces.sort_by_key(|n| n.nsid);
        Ok(assigned)
    }

    async fn remove_namespace(&mut self, nqn: &str, nsid: u32) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        let subsystem = state.subsystem(nqn)?;
        let before = subsystem.namespaces.len();
        subsystem.namespaces.retain(|n| n.nsid != nsid);
        if subsystem.namespaces.len() == before {
            return Err(TgtError::engine(-2, format!("nsid {nsid} not found on {nqn}")));
        }
        state.ns_visibility.remove(&(nqn.to_string(), nsid));
        Ok(())
    }

    async fn set_namespace_ana_group(
        &mut self,
        nqn: &str,
        nsid: u32,
        anagrpid: u32,
    ) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        let subsystem = state.subsystem(nqn)?;
        let ns = subsystem
            .namespaces
            .iter_mut()
            .find(|n| n.nsid == nsid)
            .ok_or_else(|| TgtError::engine(-2, format!("nsid {nsid} not found on {nqn}")))?;
        ns.anagrpid = anagrpid;
        Ok(())
    }

    async fn set_namespace_visibility(
        &mut self,
        nqn: &str,
        nsid: u32,
        host_nqn: &str,
        visible: bool,
    ) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        state.subsystem(nqn)?;
        let entry = state
            .ns_visibility
            .entry((nqn.to_string(), nsid))
            .or_default();
        if visible {
            entry.insert(host_nqn.to_string());
        } else {
            entry.remove(host_nqn);
        }
        Ok(())
    }

    async fn add_listener(
        &mut self,
        nqn: &str,
        trtype: &str,
        adrfam: &str,
        traddr: &str,
        trsvcid: u16,
        secure: bool,
    ) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        let subsystem = state.subsystem(nqn)?;
        let exists = subsystem
            .listen_addresses
            .iter()
            .any(|l| l.traddr == traddr && l.trsvcid == trsvcid.to_string());
        if exists {
            return Err(TgtError::engine(
                -17,
                format!("listener {traddr}:{trsvcid} already exists on {nqn}"),
            ));
        }
        subsystem.listen_addresses.push(TgtListenAddress {
            trtype: trtype.to_string(),
            adrfam: adrfam.to_string(),
            traddr: traddr.to_string(),
            trsvcid: trsvcid.to_string(),
            secure,
        });
        Ok(())
    }

    async fn remove_listener(
        &mut self,
        nqn: &str,
        _trtype: &str,
        _adrfam: &str,
        traddr: &str,
        trsvcid: u16,
    ) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        let subsystem = state.subsystem(nqn)?;
        let service = trsvcid.to_string();
        let before = subsystem.listen_addresses.len();
        subsystem
            .listen_addresses
            .retain(|l| !(l.traddr == traddr && l.trsvcid == service));
        if subsystem.listen_addresses.len() == before {
            return Err(TgtError::engine(
                -2,
                format!("listener {traddr}:{trsvcid} not found on {nqn}"),
            ));
        }
        Ok(())
    }

    async fn set_ana_state(
        &mut self,
        nqn: &str,
        group: u32,
        state_value: AnaState,
    ) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        state.subsystem(nqn)?;
        state
            .ana_states
            .insert((nqn.to_string(), group), state_value);
        Ok(())
    }

    async fn add_host(
        &mut self,
        nqn: &str,
        host_nqn: &str,
        _psk_name: Option<&str>,
        _dhchap_name: Option<&str>,
        _dhchap_ctrlr_name: Option<&str>,
    ) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        let subsystem = state.subsystem(nqn)?;
        if subsystem.hosts.iter().any(|h| h.nqn == host_nqn) {
            return Err(TgtError::engine(
                -17,
                format!("host {host_nqn} already on {nqn}"),
            ));
        }
        subsystem.hosts.push(TgtHost {
            nqn: host_nqn.to_string(),
        });
        Ok(())
    }

    async fn remove_host(&mut self, nqn: &str, host_nqn: &str) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        let subsystem = state.subsystem(nqn)?;
        subsystem.hosts.retain(|h| h.nqn != host_nqn);
        Ok(())
    }

    async fn allow_any_host(&mut self, nqn: &str, allow: bool) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        let subsystem = state.subsystem(nqn)?;
        subsystem.allow_any_host = allow;
        Ok(())
    }

    async fn get_subsystems(&mut self) -> TgtResult<Vec<TgtSubsystem>> {
        Ok(self.locked().subsystems.clone())
    }

    async fn get_connections(&mut self, nqn: &str) -> TgtResult<Vec<TgtConnection>> {
        Ok(self
            .locked()
            .connections
            .get(nqn)
            .cloned()
            .unwrap_or_default())
    }

    async fn keyring_add(&mut self, name: &str, path: &str) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        if state.keyring.contains_key(name) {
            return Err(TgtError::engine(-17, format!("key {name} already exists")));
        }
        state.keyring.insert(name.to_string(), path.to_string());
        Ok(())
    }

    async fn keyring_remove(&mut self, name: &str) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        state.keyring.remove(name);
        Ok(())
    }

    async fn create_transport(
        &mut self,
        trtype: &str,
        _options: Option<&Value>,
    ) -> TgtResult<()> {
        let mut state = self.locked();
        state.take_fault()?;
        state.transports.push(trtype.to_string());
        Ok(())
    }

    async fn set_log_level(&mut self, level: &str) -> TgtResult<()> {
        self.locked().log_level = level.to_string();
        Ok(())
    }

    async fn version(&mut self) -> TgtResult<String> {
        Ok("fake-engine".to_string())
    }
}
