//! Credential and keyring lifecycle.
//!
//! Bridges [`nvgw_core::keys`] to the engine keyring: installing a key
//! writes the 0600 file and registers it with the engine under its
//! deterministic name; revoking does the reverse and prunes the
//! directory. Sealing wraps material for state-map payloads so peers can
//! materialize the same key locally.

use nvgw_core::error::{GwError, GwResult};
use nvgw_core::keys::{keyring_entry_name, KeyFiles, KeyKind, KeyMaterial, KeySealer, SealedKey};
use tracing::debug;

use crate::tgt::TgtApi;

/// Keyring manager for one gateway.
pub struct Keyring {
    files: KeyFiles,
    sealer: KeySealer,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring").finish_non_exhaustive()
    }
}

impl Keyring {
    /// Creates the manager over a file layout and the group sealer.
    #[must_use]
    pub fn new(files: KeyFiles, sealer: KeySealer) -> Self {
        Self { files, sealer }
    }

    /// Materializes a key locally and registers it with the engine.
    /// Returns the engine-keyring entry name. Re-installing an existing
    /// name replaces it.
    ///
    /// # Errors
    ///
    /// Filesystem failures and engine errors other than replace-on-exists.
    pub async fn install(
        &self,
        tgt: &mut dyn TgtApi,
        material: &KeyMaterial,
        subsystem_nqn: &str,
        host_nqn: &str,
    ) -> GwResult<String> {
        let path = self.files.write(material, subsystem_nqn, host_nqn)?;
        let name = keyring_entry_name(material.kind(), subsystem_nqn, host_nqn);
        let path_str = path
            .to_str()
            .ok_or_else(|| GwError::internal("key path is not UTF-8"))?;
        match tgt.keyring_add(&name, path_str).await {
            Ok(()) => {}
            Err(e) if e.code == Some(-17) => {
                // Same name, new material: replace the entry.
                tgt.keyring_remove(&name).await.map_err(GwError::from)?;
                tgt.keyring_add(&name, path_str).await.map_err(GwError::from)?;
            }
            Err(e) => return Err(e.into()),
        }
        debug!(entry = %name, "keyring entry installed");
        Ok(name)
    }

    /// Revokes the engine entry, unlinks the file, prunes the directory.
    ///
    /// # Errors
    ///
    /// Engine or filesystem failures; missing entries are a no-op.
    pub async fn revoke(
        &self,
        tgt: &mut dyn TgtApi,
        kind: KeyKind,
        subsystem_nqn: &str,
        host_nqn: &str,
    ) -> GwResult<()> {
        let name = keyring_entry_name(kind, subsystem_nqn, host_nqn);
        tgt.keyring_remove(&name).await.map_err(GwError::from)?;
        self.files.remove(kind, subsystem_nqn, host_nqn)?;
        debug!(entry = %name, "keyring entry revoked");
        Ok(())
    }

    /// Removes every key directory belonging to a deleted subsystem.
    ///
    /// # Errors
    ///
    /// Filesystem failures scanning the base directory.
    pub fn purge_subsystem_files(&self, subsystem_nqn: &str) -> GwResult<()> {
        self.files.remove_subsystem(subsystem_nqn)
    }

    /// Seals material into a state-map payload.
    ///
    /// # Errors
    ///
    /// Encryption or serialization failures.
    pub fn seal(&self, material: &KeyMaterial) -> GwResult<Vec<u8>> {
        let sealed = self.sealer.seal(material)?;
        serde_json::to_vec(&sealed)
            .map_err(|e| GwError::internal(format!("sealed key encode failed: {e}")))
    }

    /// Unseals a state-map payload back into material.
    ///
    /// # Errors
    ///
    /// Decryption failures (wrong group secret, corrupt record).
    pub fn unseal(&self, payload: &[u8]) -> GwResult<KeyMaterial> {
        let sealed: SealedKey = serde_json::from_slice(payload)
            .map_err(|e| GwError::internal(format!("sealed key decode failed: {e}")))?;
        self.sealer.unseal(&sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tgt::FakeTgt;

    const PSK: &str = "NVMeTLSkey-1:01:YzrPElk4OYy1uUqU8FXK64ybAg4HsCfzmOmldItqzT2pmiQp:";

    fn keyring(base: &std::path::Path) -> Keyring {
        Keyring::new(KeyFiles::new(base), KeySealer::new(b"group-secret"))
    }

    #[tokio::test]
    async fn install_and_revoke() {
        let dir = tempfile::tempdir().unwrap();
        let ring = keyring(dir.path());
        let mut tgt = FakeTgt::new();
        let handle = tgt.handle();
        let material = KeyMaterial::new(KeyKind::Psk, PSK.to_string()).unwrap();

        let name = ring
            .install(&mut tgt, &material, "nqn.2016-06.io.spdk:cnode1", "hostA")
            .await
            .unwrap();
        assert!(handle.lock().unwrap().keyring.contains_key(&name));

        ring.revoke(&mut tgt, KeyKind::Psk, "nqn.2016-06.io.spdk:cnode1", "hostA")
            .await
            .unwrap();
        assert!(handle.lock().unwrap().keyring.is_empty());
    }

    #[tokio::test]
    async fn reinstall_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ring = keyring(dir.path());
        let mut tgt = FakeTgt::new();
        let material = KeyMaterial::new(KeyKind::Psk, PSK.to_string()).unwrap();

        let first = ring
            .install(&mut tgt, &material, "nqn.2016-06.io.spdk:cnode1", "hostA")
            .await
            .unwrap();
        let second = ring
            .install(&mut tgt, &material, "nqn.2016-06.io.spdk:cnode1", "hostA")
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn seal_payload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ring = keyring(dir.path());
        let material = KeyMaterial::new(KeyKind::Psk, PSK.to_string()).unwrap();
        let payload = ring.seal(&material).unwrap();
        assert!(!payload.windows(PSK.len()).any(|w| w == PSK.as_bytes()));
        let unsealed = ring.unseal(&payload).unwrap();
        assert_eq!(unsealed.expose(), PSK);
    }
}
