//! Wallet/Identity provisioning backend — named as an interface in spec.md
//! §6 and left for operators to wire up. This crate ships one concrete
//! implementation that reports the backend as unconfigured, matching the
//! teacher's pattern of a trait seam with a no-op default (see
//! `packages/onsocial-relayer`'s provider abstractions).

use async_trait::async_trait;

use crate::error::Error;

#[async_trait]
pub trait WalletProvisioner: Send + Sync {
    /// Provision whatever off-bunker wallet state a newly created account
    /// needs (e.g. an on-chain address). Returns an opaque descriptor.
    async fn provision(&self, key_name: &str, pubkey: &str) -> Result<String, Error>;
}

pub struct UnconfiguredWallet;

#[async_trait]
impl WalletProvisioner for UnconfiguredWallet {
    async fn provision(&self, _key_name: &str, _pubkey: &str) -> Result<String, Error> {
        Err(Error::Internal("wallet backend not configured".into()))
    }
}
