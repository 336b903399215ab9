//! Key material handling: PSK and DH-HMAC-CHAP secrets.
//!
//! Key bytes live in [`secrecy`] containers and are zeroed on drop. They
//! are materialized on disk (mode 0600, one directory per key) for the
//! target engine, and sealed with AES-256-GCM under the gateway-group
//! secret before entering the state map. Nothing in this module ever
//! formats key bytes into an error or a log line.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{GwError, GwResult};

/// Default base directory for materialized key files.
pub const DEFAULT_KEYFILE_BASE: &str = "/var/tmp";

/// Name of the key file inside its per-key directory.
const KEYFILE_NAME: &str = "keyfile";

/// PSK interchange format prefix.
const PSK_PREFIX: &str = "NVMeTLSkey-1:";
/// DH-HMAC-CHAP interchange format prefix.
const DHCHAP_PREFIX: &str = "DHHC-1:";

/// Kind of key attached to a host grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// TLS pre-shared key.
    Psk,
    /// DH-HMAC-CHAP host key.
    Dhchap,
    /// DH-HMAC-CHAP controller key (bidirectional authentication).
    DhchapCtrlr,
}

impl KeyKind {
    /// Stable spelling used in state-map keys and file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Psk => "psk",
            Self::Dhchap => "dhchap",
            Self::DhchapCtrlr => "dhchap_ctrlr",
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "psk" => Some(Self::Psk),
            "dhchap" => Some(Self::Dhchap),
            "dhchap_ctrlr" => Some(Self::DhchapCtrlr),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated secret of a given kind.
pub struct KeyMaterial {
    kind: KeyKind,
    secret: SecretString,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret is intentionally absent.
        f.debug_struct("KeyMaterial")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Wraps and validates key text in the NVMe interchange format.
    ///
    /// PSKs look like `NVMeTLSkey-1:01:<base64>:`, DH-CHAP keys like
    /// `DHHC-1:00:<base64>:`. The error never echoes the offending value.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the text does not match the format expected
    /// for `kind`.
    pub fn new(kind: KeyKind, text: String) -> GwResult<Self> {
        let expected_prefix = match kind {
            KeyKind::Psk => PSK_PREFIX,
            KeyKind::Dhchap | KeyKind::DhchapCtrlr => DHCHAP_PREFIX,
        };
        let well_formed = text.starts_with(expected_prefix)
            && text.ends_with(':')
            && text.len() > expected_prefix.len() + 4
            && text.is_ascii();
        if !well_formed {
            return Err(GwError::invalid_argument(format!(
                "malformed {kind} key value"
            )));
        }
        Ok(Self {
            kind,
            secret: SecretString::from(text),
        })
    }

    /// Key kind.
    #[must_use]
    pub const fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Exposes the key text; callers must only hand it to the engine
    /// keyring, the key file writer, or the sealer.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }
}

/// Deterministic engine-keyring entry name for a key.
#[must_use]
pub fn keyring_entry_name(kind: KeyKind, subsystem_nqn: &str, host_nqn: &str) -> String {
    format!("{}_{}_{}", kind.as_str(), sanitize(subsystem_nqn), sanitize(host_nqn))
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Filesystem layout for materialized key files.
///
/// Each key owns `<base>/<kind>_<nqn>_<host>/keyfile`; the directory is
/// pruned when the key is removed.
#[derive(Debug, Clone)]
pub struct KeyFiles {
    base: PathBuf,
}

impl KeyFiles {
    /// Creates the layout rooted at `base`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Default layout under `/var/tmp`.
    #[must_use]
    pub fn default_base() -> Self {
        Self::new(DEFAULT_KEYFILE_BASE)
    }

    /// Directory holding the key file for `(kind, nqn, host)`.
    #[must_use]
    pub fn key_dir(&self, kind: KeyKind, subsystem_nqn: &str, host_nqn: &str) -> PathBuf {
        self.base
            .join(keyring_entry_name(kind, subsystem_nqn, host_nqn))
    }

    /// Path of the key file itself.
    #[must_use]
    pub fn key_path(&self, kind: KeyKind, subsystem_nqn: &str, host_nqn: &str) -> PathBuf {
        self.key_dir(kind, subsystem_nqn, host_nqn).join(KEYFILE_NAME)
    }

    /// Writes the key file with mode 0600, creating its directory (0700).
    ///
    /// # Errors
    ///
    /// `Internal` on any filesystem failure; the message names the path,
    /// never the contents.
    pub fn write(&self, material: &KeyMaterial, subsystem_nqn: &str, host_nqn: &str) -> GwResult<PathBuf> {
        let dir = self.key_dir(material.kind(), subsystem_nqn, host_nqn);
        fs::create_dir_all(&dir)
            .map_err(|e| GwError::internal(format!("mkdir {}: {e}", dir.display())))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| GwError::internal(format!("chmod {}: {e}", dir.display())))?;

        let path = dir.join(KEYFILE_NAME);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| GwError::internal(format!("open {}: {e}", path.display())))?;
        file.write_all(material.expose().as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .map_err(|e| GwError::internal(format!("write {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Removes the key file and prunes its directory if now empty.
    ///
    /// Missing files are fine; removal is idempotent.
    ///
    /// # Errors
    ///
    /// `Internal` on unexpected filesystem failures.
    pub fn remove(&self, kind: KeyKind, subsystem_nqn: &str, host_nqn: &str) -> GwResult<()> {
        let dir = self.key_dir(kind, subsystem_nqn, host_nqn);
        let path = dir.join(KEYFILE_NAME);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(GwError::internal(format!(
                    "unlink {}: {e}",
                    path.display()
                )))
            }
        }
        match fs::remove_dir(&dir) {
            Ok(()) => Ok(()),
            // Not empty or already gone: leave it.
            Err(_) => Ok(()),
        }
    }

    /// Removes every key directory belonging to `subsystem_nqn`.
    ///
    /// # Errors
    ///
    /// `Internal` when the base directory cannot be scanned.
    pub fn remove_subsystem(&self, subsystem_nqn: &str) -> GwResult<()> {
        let needle = format!("_{}_", sanitize(subsystem_nqn));
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(GwError::internal(format!(
                    "read_dir {}: {e}",
                    self.base.display()
                )))
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let kind_prefixed = name.starts_with("psk_")
                || name.starts_with("dhchap_");
            if kind_prefixed && name.contains(&needle) {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
        Ok(())
    }
}

/// Sealed key payload as stored in the state map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    /// Key kind.
    pub kind: KeyKind,
    /// 96-bit GCM nonce.
    pub nonce: [u8; 12],
    /// Ciphertext + tag.
    pub ciphertext: Vec<u8>,
}

/// Seals and unseals key material under the gateway-group secret.
///
/// Peers share the secret out of band (a file named by the configuration);
/// each peer unseals state-map payloads and re-materializes keys locally.
pub struct KeySealer {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for KeySealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySealer").finish_non_exhaustive()
    }
}

impl KeySealer {
    /// Derives the sealing key from the group secret bytes.
    #[must_use]
    pub fn new(group_secret: &[u8]) -> Self {
        let digest = Sha256::digest(group_secret);
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Reads the group secret from a file.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the file cannot be read.
    pub fn from_secret_file(path: impl AsRef<Path>) -> GwResult<Self> {
        let path = path.as_ref();
        let mut bytes = fs::read(path).map_err(|e| {
            GwError::invalid_argument(format!(
                "failed to read encryption key {}: {e}",
                path.display()
            ))
        })?;
        let sealer = Self::new(&bytes);
        bytes.zeroize();
        Ok(sealer)
    }

    /// Seals key material for the state map.
    ///
    /// # Errors
    ///
    /// `Internal` if encryption fails.
    pub fn seal(&self, material: &KeyMaterial) -> GwResult<SealedKey> {
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), material.expose().as_bytes())
            .map_err(|_| GwError::internal("key sealing failed"))?;
        Ok(SealedKey {
            kind: material.kind(),
            nonce,
            ciphertext,
        })
    }

    /// Unseals a state-map key payload back into validated material.
    ///
    /// # Errors
    ///
    /// `Internal` on authentication failure (wrong group secret or a
    /// corrupted record).
    pub fn unseal(&self, sealed: &SealedKey) -> GwResult<KeyMaterial> {
        let mut plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
            .map_err(|_| GwError::internal("key unsealing failed"))?;
        let text = String::from_utf8(plaintext.clone()).map_err(|_| {
            plaintext.zeroize();
            GwError::internal("unsealed key is not valid UTF-8")
        })?;
        plaintext.zeroize();
        KeyMaterial::new(sealed.kind, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PSK: &str = "NVMeTLSkey-1:01:YzrPElk4OYy1uUqU8FXK64ybAg4HsCfzmOmldItqzT2pmiQp:";
    const DHCHAP: &str = "DHHC-1:00:mWStgaqHdIJ9hBNu+natqRoAuRZTzJlgyHBzBCLEp7TZMBvA:";

    #[test]
    fn psk_format_enforced() {
        KeyMaterial::new(KeyKind::Psk, PSK.to_string()).unwrap();
        assert!(KeyMaterial::new(KeyKind::Psk, DHCHAP.to_string()).is_err());
        assert!(KeyMaterial::new(KeyKind::Psk, "NVMeTLSkey-1:01".to_string()).is_err());
    }

    #[test]
    fn dhchap_format_enforced() {
        KeyMaterial::new(KeyKind::Dhchap, DHCHAP.to_string()).unwrap();
        KeyMaterial::new(KeyKind::DhchapCtrlr, DHCHAP.to_string()).unwrap();
        assert!(KeyMaterial::new(KeyKind::Dhchap, PSK.to_string()).is_err());
    }

    #[test]
    fn error_never_echoes_key_text() {
        let err = KeyMaterial::new(KeyKind::Psk, "NVMeTLSkey-bogus".to_string()).unwrap_err();
        assert!(!err.message.contains("bogus"));
    }

    #[test]
    fn debug_omits_secret() {
        let material = KeyMaterial::new(KeyKind::Psk, PSK.to_string()).unwrap();
        let rendered = format!("{material:?}");
        assert!(!rendered.contains("NVMeTLSkey"));
    }

    #[test]
    fn keyring_names_are_deterministic() {
        let name = keyring_entry_name(KeyKind::Psk, "nqn.2016-06.io.spdk:cnode1", "*");
        assert_eq!(name, "psk_nqn.2016-06.io.spdk_cnode1__");
        let again = keyring_entry_name(KeyKind::Psk, "nqn.2016-06.io.spdk:cnode1", "*");
        assert_eq!(name, again);
    }

    #[test]
    fn keyfile_lifecycle() {
        let base = tempfile::tempdir().unwrap();
        let files = KeyFiles::new(base.path());
        let material = KeyMaterial::new(KeyKind::Psk, PSK.to_string()).unwrap();

        let path = files
            .write(&material, "nqn.2016-06.io.spdk:cnode1", "nqn.2016-06.io.spdk:host1")
            .unwrap();
        assert!(path.exists());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        files
            .remove(KeyKind::Psk, "nqn.2016-06.io.spdk:cnode1", "nqn.2016-06.io.spdk:host1")
            .unwrap();
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());

        // Idempotent on a second removal.
        files
            .remove(KeyKind::Psk, "nqn.2016-06.io.spdk:cnode1", "nqn.2016-06.io.spdk:host1")
            .unwrap();
    }

    #[test]
    fn subsystem_sweep_removes_all_kinds() {
        let base = tempfile::tempdir().unwrap();
        let files = KeyFiles::new(base.path());
        let psk = KeyMaterial::new(KeyKind::Psk, PSK.to_string()).unwrap();
        let dhchap = KeyMaterial::new(KeyKind::Dhchap, DHCHAP.to_string()).unwrap();

        files.write(&psk, "nqn.2016-06.io.spdk:cnode1", "hostA").unwrap();
        files.write(&dhchap, "nqn.2016-06.io.spdk:cnode1", "hostA").unwrap();
        files.write(&psk, "nqn.2016-06.io.spdk:cnode2", "hostB").unwrap();

        files.remove_subsystem("nqn.2016-06.io.spdk:cnode1").unwrap();

        assert!(!files
            .key_path(KeyKind::Psk, "nqn.2016-06.io.spdk:cnode1", "hostA")
            .exists());
        assert!(!files
            .key_path(KeyKind::Dhchap, "nqn.2016-06.io.spdk:cnode1", "hostA")
            .exists());
        assert!(files
            .key_path(KeyKind::Psk, "nqn.2016-06.io.spdk:cnode2", "hostB")
            .exists());
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let sealer = KeySealer::new(b"group-secret");
        let material = KeyMaterial::new(KeyKind::Psk, PSK.to_string()).unwrap();
        let sealed = sealer.seal(&material).unwrap();
        assert_ne!(sealed.ciphertext, PSK.as_bytes());
        let unsealed = sealer.unseal(&sealed).unwrap();
        assert_eq!(unsealed.expose(), PSK);
        assert_eq!(unsealed.kind(), KeyKind::Psk);
    }

    #[test]
    fn unseal_with_wrong_secret_fails() {
        let sealer = KeySealer::new(b"group-secret");
        let other = KeySealer::new(b"other-secret");
        let material = KeyMaterial::new(KeyKind::Psk, PSK.to_string()).unwrap();
        let sealed = sealer.seal(&material).unwrap();
        assert!(other.unseal(&sealed).is_err());
    }
}
