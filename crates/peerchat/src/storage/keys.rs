//! Identity key persistence.
//!
//! The X25519 secret is stored base64-encoded in `<data_dir>/identity.key`,
//! readable only by the owner on unix.

use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use protocol::{KeyPair, KEY_LENGTH};

use super::{StorageError, StorageResult};

/// File name of the identity key inside the data directory.
pub const IDENTITY_KEY_FILE: &str = "identity.key";

/// Loads and saves the local key pair.
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Key store at `<data_dir>/identity.key`.
    pub fn in_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self::new(data_dir.as_ref().join(IDENTITY_KEY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the key pair, replacing any previous one.
    pub fn save_key_pair(&self, key_pair: &KeyPair) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let encoded = STANDARD.encode(key_pair.secret_bytes());
        let temp_path = self.path.with_extension("key.tmp");
        fs::write(&temp_path, encoded)?;
        restrict_permissions(&temp_path)?;
        fs::rename(&temp_path, &self.path)?;

        tracing::debug!(path = %self.path.display(), "saved identity key");
        Ok(())
    }

    /// Read the key pair. `None` if no key has been saved yet.
    pub fn load_key_pair(&self) -> StorageResult<Option<KeyPair>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let encoded = fs::read_to_string(&self.path)?;
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| StorageError::InvalidKey(e.to_string()))?;
        let secret: [u8; KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            StorageError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            ))
        })?;

        Ok(Some(KeyPair::from_secret_bytes(secret)))
    }

    /// Load the saved key pair, generating and saving one on first use.
    pub fn load_or_generate(&self) -> StorageResult<KeyPair> {
        if let Some(key_pair) = self.load_key_pair()? {
            return Ok(key_pair);
        }

        tracing::info!(path = %self.path.display(), "generating new identity key");
        let key_pair = KeyPair::generate();
        self.save_key_pair(&key_pair)?;
        Ok(key_pair)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> StorageResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> StorageResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_key() {
        let temp_dir = TempDir::new().unwrap();
        let store = KeyStore::in_data_dir(temp_dir.path());
        assert!(store.load_key_pair().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_key_pair() {
        let temp_dir = TempDir::new().unwrap();
        let store = KeyStore::in_data_dir(temp_dir.path());
        let key_pair = KeyPair::generate();
        store.save_key_pair(&key_pair).unwrap();

        let loaded = store.load_key_pair().unwrap().unwrap();
        assert_eq!(loaded.secret_bytes(), key_pair.secret_bytes());
        assert_eq!(loaded.public_jwk(), key_pair.public_jwk());
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let store = KeyStore::in_data_dir(temp_dir.path().join("data"));
        let first = store.load_or_generate().unwrap();
        let second = store.load_or_generate().unwrap();
        assert_eq!(first.secret_bytes(), second.secret_bytes());
    }

    #[test]
    fn test_corrupt_key_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = KeyStore::in_data_dir(temp_dir.path());
        fs::write(store.path(), STANDARD.encode([1u8; 7])).unwrap();
        assert!(matches!(
            store.load_key_pair(),
            Err(StorageError::InvalidKey(_))
        ));

        fs::write(store.path(), "not base64 !!!").unwrap();
        assert!(matches!(
            store.load_key_pair(),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = KeyStore::in_data_dir(temp_dir.path());
        store.save_key_pair(&KeyPair::generate()).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
