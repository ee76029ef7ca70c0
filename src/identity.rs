//! Identity file writer — spec.md §6's `{names, relays, nip46}` discovery
//! document, served so NIP-46-aware clients can resolve a username to this
//! bunker's connection details. Atomic tmp-then-rename write, matching
//! `config_store`'s persistence style.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub names: BTreeMap<String, String>,
    pub relays: BTreeMap<String, Vec<String>>,
    pub nip46: BTreeMap<String, Vec<String>>,
}

#[async_trait]
pub trait IdentityFileWriter: Send + Sync {
    async fn write(&self, doc: &IdentityDocument) -> Result<(), Error>;
}

pub struct JsonFileWriter {
    path: PathBuf,
}

impl JsonFileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl IdentityFileWriter for JsonFileWriter {
    async fn write(&self, doc: &IdentityDocument) -> Result<(), Error> {
        let body = serde_json::to_string_pretty(doc)
            .map_err(|e| Error::Internal(format!("failed to encode identity document: {e}")))?;
        write_atomic(&self.path, &body)
    }
}

fn write_atomic(path: &Path, body: &str) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Internal(format!("failed to create identity directory: {e}")))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)
        .map_err(|e| Error::Internal(format!("failed to write identity file: {e}")))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::Internal(format!("failed to install identity file: {e}")))?;
    Ok(())
}
