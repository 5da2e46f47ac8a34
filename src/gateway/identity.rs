use crate::core::errors::GatewayError;
use crate::core::kernel::{Ed25519Signer, Signer};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};
use zeroize::Zeroizing;

const KEY_FILE_VERSION: u32 = 1;

/// On-disk layout of the device key file
#[derive(Serialize, Deserialize)]
struct KeyFile {
    /// Absent in legacy files, which are treated as version 1
    #[serde(default = "legacy_version")]
    version: u32,
    #[serde(default)]
    device_id: String,
    private_key: String,
}

const fn legacy_version() -> u32 {
    KEY_FILE_VERSION
}

/// Long-lived Ed25519 keypair identifying this device to the gateway
pub struct DeviceIdentity {
    signer: Ed25519Signer,
    device_id: String,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    /// Load the keypair stored at `path`, or generate and persist a new one
    /// when the file is missing or unusable.
    ///
    /// Failing to persist a fresh key is logged and tolerated: the identity
    /// stays valid for this process, it just won't survive a restart.
    pub fn load_or_generate(path: &Path) -> Result<Self, GatewayError> {
        if path.exists() {
            match Self::load(path) {
                Ok(identity) => {
                    info!(
                        device_id = %identity.short_id(),
                        path = %path.display(),
                        "Loaded device keys"
                    );
                    return Ok(identity);
                }
                Err(e) => warn!(path = %path.display(), "Failed to load device keys: {}", e),
            }
        }

        info!("Generating new device keys");
        let identity = Self::generate();
        match identity.save(path) {
            Ok(()) => info!(
                device_id = %identity.short_id(),
                path = %path.display(),
                "Saved new device keys"
            ),
            Err(e) => warn!(path = %path.display(), "Failed to save device keys: {}", e),
        }
        Ok(identity)
    }

    /// Fresh keypair from the OS RNG
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seed.as_mut());
        Self::from_signer(Ed25519Signer::from_seed(&seed))
    }

    pub fn from_signer(signer: Ed25519Signer) -> Self {
        let device_id = fingerprint(&signer.public_key_bytes());
        Self { signer, device_id }
    }

    fn load(path: &Path) -> Result<Self, GatewayError> {
        let raw = Zeroizing::new(fs::read_to_string(path)?);
        let file: KeyFile = serde_json::from_str(&raw)?;
        if file.version != KEY_FILE_VERSION {
            return Err(GatewayError::IdentityError(format!(
                "unsupported key file version {}",
                file.version
            )));
        }

        let private_key = Zeroizing::new(file.private_key);
        let identity = Self::from_signer(Ed25519Signer::new(&private_key)?);
        if !file.device_id.is_empty() && file.device_id != identity.device_id {
            warn!(
                stored = %file.device_id,
                derived = %identity.device_id,
                "Stored device id does not match public key, using derived id"
            );
        }
        Ok(identity)
    }

    /// Write the key file atomically with owner-only permissions
    pub fn save(&self, path: &Path) -> Result<(), GatewayError> {
        let private_key = self.signer.private_key_base64();
        let file = KeyFile {
            version: KEY_FILE_VERSION,
            device_id: self.device_id.clone(),
            private_key: private_key.to_string(),
        };
        let json = Zeroizing::new(serde_json::to_string_pretty(&file)?);
        drop(Zeroizing::new(file.private_key));

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let mut out = open_private(&tmp_path)?;
        out.write_all(json.as_bytes())?;
        out.sync_all()?;
        drop(out);
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Lowercase hex SHA-256 of the raw public key
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn short_id(&self) -> &str {
        self.device_id.get(..8).unwrap_or(&self.device_id)
    }

    pub fn public_key_base64(&self) -> String {
        self.signer.public_key_base64()
    }

    /// Base64 Ed25519 signature over the UTF-8 bytes of `payload`
    pub fn sign(&self, payload: &str) -> String {
        self.signer.sign_payload(payload.as_bytes())
    }
}

/// Device fingerprint of a raw public key
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::verify_ed25519;

    #[test]
    fn test_reload_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let first = DeviceIdentity::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = DeviceIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.public_key_base64(), second.public_key_base64());
    }

    #[test]
    fn test_regenerates_after_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let first = DeviceIdentity::load_or_generate(&path).unwrap();
        fs::remove_file(&path).unwrap();
        let second = DeviceIdentity::load_or_generate(&path).unwrap();
        assert_ne!(first.device_id(), second.device_id());

        let signature = second.sign("hello");
        verify_ed25519(&second.public_key_base64(), b"hello", &signature).unwrap();
    }

    #[test]
    fn test_device_id_is_sha256_of_public_key() {
        let identity = DeviceIdentity::generate();
        assert_eq!(identity.device_id().len(), 64);
        assert!(identity
            .device_id()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(
            identity.device_id(),
            fingerprint(&identity.signer.public_key_bytes())
        );
    }

    #[test]
    fn test_legacy_file_without_version_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let identity = DeviceIdentity::generate();
        let legacy = serde_json::json!({
            "device_id": identity.device_id(),
            "private_key": identity.signer.private_key_base64().as_str(),
        });
        fs::write(&path, legacy.to_string()).unwrap();

        let loaded = DeviceIdentity::load_or_generate(&path).unwrap();
        assert_eq!(loaded.device_id(), identity.device_id());
    }

    #[test]
    fn test_mismatched_stored_id_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let identity = DeviceIdentity::generate();
        let file = serde_json::json!({
            "version": 1,
            "device_id": "not-the-fingerprint",
            "private_key": identity.signer.private_key_base64().as_str(),
        });
        fs::write(&path, file.to_string()).unwrap();

        let loaded = DeviceIdentity::load_or_generate(&path).unwrap();
        assert_eq!(loaded.device_id(), identity.device_id());
    }

    #[test]
    fn test_corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, "{ not json").unwrap();

        let identity = DeviceIdentity::load_or_generate(&path).unwrap();
        let reloaded = DeviceIdentity::load_or_generate(&path).unwrap();
        assert_eq!(identity.device_id(), reloaded.device_id());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        DeviceIdentity::load_or_generate(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
