//! The durable configuration document — spec.md §2/§4.2/§6.
//!
//! `get` reads and parses the document, writing a freshly-generated default
//! on first run; `put` writes atomically (tmp file + rename), stamping a
//! monotonically increasing schema version on every write. There is no
//! in-memory cache beyond process boot: every `get` re-parses, matching
//! spec.md §4.2's explicit "no cache" requirement. Grounded on
//! `key_store.rs::save`'s tmp-then-rename pattern from the teacher.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::PrivateKeyMaterial;
use crate::error::Error;
use crate::key_store::EncryptedKey;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub identity_file_path: String,
    pub default_profile: Option<String>,
    pub wallet_backend: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDoc {
    pub schema_version: u32,
    pub admin_pubkeys: Vec<String>,
    pub admin_plane_relays: Vec<String>,
    pub user_plane_relays: Vec<String>,
    /// Hex-encoded bunker admin private key.
    pub bunker_admin_secret_hex: String,
    pub keys: std::collections::BTreeMap<String, EncryptedKey>,
    pub domains: std::collections::BTreeMap<String, DomainRecord>,
    pub public_base_url: Option<String>,
    pub notify_admins_on_boot: bool,
    pub seed_relays: Vec<String>,
    pub allow_new_keys: bool,
}

impl ConfigDoc {
    fn default_with_fresh_admin_key() -> Self {
        let admin_material = PrivateKeyMaterial::generate();
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            admin_pubkeys: Vec::new(),
            admin_plane_relays: vec!["wss://relay.damus.io".to_string()],
            user_plane_relays: vec!["wss://relay.damus.io".to_string()],
            bunker_admin_secret_hex: hex::encode(admin_material.secret_bytes()),
            keys: std::collections::BTreeMap::new(),
            domains: std::collections::BTreeMap::new(),
            public_base_url: None,
            notify_admins_on_boot: false,
            seed_relays: vec!["wss://relay.damus.io".to_string()],
            allow_new_keys: false,
        }
    }

    pub fn admin_signing_key(&self) -> Result<PrivateKeyMaterial, Error> {
        let bytes = hex::decode(&self.bunker_admin_secret_hex)
            .map_err(|e| Error::Internal(format!("corrupt admin key in config: {e}")))?;
        PrivateKeyMaterial::from_bytes(&bytes)
    }
}

/// Process-wide guard serializing read-modify-write sequences against the
/// config file, per spec.md §5's "writers must serialize" requirement.
static WRITE_LOCK: Mutex<()> = Mutex::new(());

/// Read and parse the config document. If absent, writes and returns a fresh
/// default document containing a freshly generated bunker admin key.
pub fn get(path: &Path) -> Result<ConfigDoc, Error> {
    let _guard = WRITE_LOCK.lock().expect("config write lock poisoned");
    if !path.exists() {
        info!(path = %path.display(), "no config file found, writing default");
        let doc = ConfigDoc::default_with_fresh_admin_key();
        write_atomic(path, &doc)?;
        return Ok(doc);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Internal(format!("failed to read config: {e}")))?;
    serde_json::from_str(&raw).map_err(|e| Error::Internal(format!("failed to parse config: {e}")))
}

/// Write the document atomically, stamping the current schema version. Per
/// spec.md §7, a write failure here is unrecoverable: the process exits
/// rather than returning an error an RPC caller could silently swallow.
pub fn put(path: &Path, mut doc: ConfigDoc) -> Result<(), Error> {
    let _guard = WRITE_LOCK.lock().expect("config write lock poisoned");
    doc.schema_version = CURRENT_SCHEMA_VERSION;
    if let Err(e) = write_atomic(path, &doc) {
        crate::key_store::exit_on_unrecoverable_write_failure("config write", &e);
    }
    Ok(())
}

fn write_atomic(path: &Path, doc: &ConfigDoc) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| Error::Internal(format!("failed to serialize config: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Internal(format!("failed to create config dir: {e}")))?;
    }

    let tmp: PathBuf = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())
        .map_err(|e| Error::Internal(format!("failed to write config: {e}")))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::Internal(format!("failed to rename config into place: {e}")))?;
    Ok(())
}

/// Default on-disk path, per spec.md §6.
pub fn default_path() -> PathBuf {
    PathBuf::from("config/nsecbunker.json")
}

/// Sibling file holding the admin connection string, per spec.md §6.
pub fn connection_string_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("connection.txt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_writes_default_when_absent_then_reads_it_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsecbunker.json");
        assert!(!path.exists());

        let doc = get(&path).unwrap();
        assert!(path.exists());
        assert_eq!(doc.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(!doc.bunker_admin_secret_hex.is_empty());

        let doc2 = get(&path).unwrap();
        assert_eq!(doc.bunker_admin_secret_hex, doc2.bunker_admin_secret_hex);
    }

    #[test]
    fn put_stamps_schema_version_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsecbunker.json");
        let mut doc = get(&path).unwrap();
        doc.admin_pubkeys.push("deadbeef".into());
        put(&path, doc).unwrap();

        let reloaded = get(&path).unwrap();
        assert_eq!(reloaded.admin_pubkeys, vec!["deadbeef".to_string()]);
    }
}
