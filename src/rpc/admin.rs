//! Admin RPC Plane — spec.md §4.6.
//!
//! Subscribes on the bunker's own admin pubkey. Every inbound request must
//! come from a configured admin pubkey, except `create_account` when
//! `allowNewKeys` is set. Also implements [`crate::auth::AdminFanout`] so the
//! Authorization Engine can route direct-admin approval requests through the
//! same relay subscription without owning any relay or signing state itself.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::acl;
use crate::auth::{AdminDecision, AdminFanout};
use crate::config_store::{self, ConfigDoc};
use crate::connection;
use crate::crypto::PrivateKeyMaterial;
use crate::error::Error;
use crate::identity::{IdentityDocument, IdentityFileWriter, JsonFileWriter};
use crate::key_store::KeyStore;
use crate::liveness::LivenessMonitor;
use crate::policy::{self, Policy, PolicyRule};
use crate::relay::RelayTransport;
use crate::rpc::{param_str, param_str_opt, parse_request, RpcResponse};
use crate::wallet::{UnconfiguredWallet, WalletProvisioner};

const FANOUT_TIMEOUT: std::time::Duration = crate::auth::ADMIN_RESPONSE_TIMEOUT;

/// Usernames `create_account` refuses to hand out, per spec.md §4.6.
const RESERVED_USERNAMES: [&str; 5] = ["admin", "root", "_", "administrator", "__"];

pub struct AdminPlane {
    pool: SqlitePool,
    key_store: Arc<KeyStore>,
    config_path: PathBuf,
    transport: Arc<dyn RelayTransport>,
    admin_signer: PrivateKeyMaterial,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<AdminDecision>>>,
    liveness: std::sync::Mutex<Option<Arc<LivenessMonitor>>>,
    wallet: std::sync::Mutex<Arc<dyn WalletProvisioner>>,
}

impl AdminPlane {
    pub fn new(
        pool: SqlitePool,
        key_store: Arc<KeyStore>,
        config_path: PathBuf,
        transport: Arc<dyn RelayTransport>,
        admin_signer: PrivateKeyMaterial,
    ) -> Self {
        Self {
            pool,
            key_store,
            config_path,
            transport,
            admin_signer,
            pending: AsyncMutex::new(HashMap::new()),
            liveness: std::sync::Mutex::new(None),
            wallet: std::sync::Mutex::new(Arc::new(UnconfiguredWallet)),
        }
    }

    pub fn admin_pubkey(&self) -> String {
        self.admin_signer.public_key_hex()
    }

    /// Lets `main.rs` hand the admin plane the same monitor it spawned, so
    /// the plane can reset the death timer on each self-ping round trip
    /// (spec.md §4.8).
    pub fn set_liveness_monitor(&self, monitor: Arc<LivenessMonitor>) {
        *self.liveness.lock().expect("liveness lock poisoned") = Some(monitor);
    }

    pub fn set_wallet_provisioner(&self, provisioner: Arc<dyn WalletProvisioner>) {
        *self.wallet.lock().expect("wallet lock poisoned") = provisioner;
    }

    fn load_config(&self) -> Result<ConfigDoc, Error> {
        config_store::get(&self.config_path)
    }

    /// spec.md §4.6: subscribe on the admin pubkey and dispatch forever.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        let pubkey = self.admin_pubkey();
        let mut inbound = self.transport.subscribe(&pubkey).await?;
        info!(pubkey = %pubkey, "admin plane listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("admin plane shutting down");
                    return Ok(());
                }
                msg = inbound.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_message(msg).await });
                }
            }
        }
    }

    async fn handle_message(&self, msg: crate::relay::InboundMessage) {
        if msg.plaintext == crate::liveness::PING_MESSAGE && msg.sender_pubkey == self.admin_pubkey() {
            if let Some(monitor) = self.liveness.lock().expect("liveness lock poisoned").as_ref() {
                monitor.mark_alive();
            }
            return;
        }

        let req = match parse_request(&msg.plaintext) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "malformed admin-plane request");
                return;
            }
        };

        if req.method == "acl_response" {
            self.resolve_pending(&msg.sender_pubkey, &req.id, &req.params)
                .await;
            return;
        }

        let cfg = match self.load_config() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to load config for admin dispatch");
                return;
            }
        };
        let is_admin = cfg.admin_pubkeys.iter().any(|p| p == &msg.sender_pubkey);
        if !is_admin && !(req.method == "create_account" && cfg.allow_new_keys) {
            let response = RpcResponse::err(&req.id, &Error::Unauthorized);
            let _ = self.reply(&msg.sender_pubkey, &response).await;
            return;
        }

        let result = self.dispatch(&msg.sender_pubkey, &req.method, &req.params, &cfg).await;
        let response = match result {
            Ok(value) => RpcResponse::ok(&req.id, value),
            Err(e) => RpcResponse::err(&req.id, &e),
        };
        let _ = self.reply(&msg.sender_pubkey, &response).await;
    }

    async fn reply(&self, to: &str, response: &RpcResponse) -> Result<(), Error> {
        let body = serde_json::to_string(response)
            .map_err(|e| Error::Internal(format!("failed to encode response: {e}")))?;
        self.transport.send(&self.admin_pubkey(), to, &body).await
    }

    async fn dispatch(
        &self,
        sender: &str,
        method: &str,
        params: &[Value],
        cfg: &ConfigDoc,
    ) -> Result<Value, Error> {
        match method {
            "ping" => Ok(json!("pong")),
            "get_keys" => Ok(json!(cfg.keys.keys().collect::<Vec<_>>())),
            "get_key_users" => {
                let key_name = param_str(params, 0)?;
                let users = acl::list_key_users(&self.pool, &key_name).await?;
                Ok(json!(users))
            }
            "get_key_tokens" => {
                let key_name = param_str(params, 0)?;
                let tokens = policy::list_tokens_for_key(&self.pool, &key_name).await?;
                Ok(json!(tokens))
            }
            "get_policies" => {
                let policies = policy::list_policies(&self.pool).await?;
                Ok(json!(policies))
            }
            "create_new_key" => self.create_new_key(params).await,
            "create_new_policy" => self.create_new_policy(params).await,
            "create_new_token" => self.create_new_token(params).await,
            "unlock_key" => self.unlock_key(params).await,
            "rename_key_user" => {
                let key_user_id: i64 = params
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::BadRequest("missing key_user_id".into()))?;
                let description = param_str(params, 1)?;
                acl::rename_key_user(&self.pool, key_user_id, &description).await?;
                Ok(json!(true))
            }
            "revoke_user" => {
                let key_user_id: i64 = params
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::BadRequest("missing key_user_id".into()))?;
                acl::revoke_user(&self.pool, key_user_id).await?;
                Ok(json!(true))
            }
            "create_account" => self.create_account(sender, params, cfg).await,
            other => Err(Error::BadRequest(format!("unknown admin method: {other}"))),
        }
    }

    async fn create_new_key(&self, params: &[Value]) -> Result<Value, Error> {
        let name = param_str(params, 0)?;
        let passphrase = param_str(params, 1)?;
        let mut cfg = self.load_config()?;
        if cfg.keys.contains_key(&name) {
            return Err(Error::Conflict(format!("key {name} already exists")));
        }

        let nsec = param_str_opt(params, 2).filter(|s| !s.is_empty());
        let material = match nsec {
            Some(nsec_hex) => {
                let bytes = hex::decode(&nsec_hex)
                    .map_err(|_| Error::BadRequest("nsec must be hex-encoded".into()))?;
                PrivateKeyMaterial::from_bytes(&bytes)?
            }
            None => {
                let fresh = PrivateKeyMaterial::generate();
                self.publish_skeleton_profile(&fresh, &cfg.seed_relays).await;
                fresh
            }
        };
        let pubkey = material.public_key_hex();
        let encrypted = crate::key_store::encrypt(&material.secret_bytes(), &passphrase)?;
        cfg.keys.insert(name.clone(), encrypted);
        config_store::put(&self.config_path, cfg)?;
        self.key_store.install(&name, material);
        Ok(json!({ "name": name, "pubkey": pubkey }))
    }

    /// spec.md §4.6: a freshly generated key (no `nsec` supplied) gets a
    /// skeleton profile announced to the configured seed relays. The avatar-
    /// from-email-hash and follow-list steps need a real Nostr kind:0/kind:3
    /// encoder, out of scope here (see crypto.rs). `RelayTransport` models
    /// addressed request/response rather than broadcast-publish, so this is
    /// sent self-addressed, the same stand-in shape as the liveness ping.
    async fn publish_skeleton_profile(&self, material: &PrivateKeyMaterial, seed_relays: &[String]) {
        if seed_relays.is_empty() {
            return;
        }
        let pubkey = material.public_key_hex();
        let profile = json!({ "name": pubkey, "about": "", "relays": seed_relays }).to_string();
        if let Err(e) = self.transport.send(&pubkey, &pubkey, &profile).await {
            warn!(pubkey, error = %e, "failed to publish skeleton profile to seed relays");
        }
    }

    async fn create_new_policy(&self, params: &[Value]) -> Result<Value, Error> {
        let name = param_str(params, 0)?;
        let rules: Vec<PolicyRule> = params
            .get(1)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::BadRequest(format!("invalid rules: {e}")))?
            .unwrap_or_default();
        let expires_at = param_str_opt(params, 2);
        let id = acl::create_policy(
            &self.pool,
            &Policy {
                id: None,
                name,
                expires_at,
                rules,
            },
        )
        .await?;
        Ok(json!({ "policy_id": id }))
    }

    async fn create_new_token(&self, params: &[Value]) -> Result<Value, Error> {
        let key_name = param_str(params, 0)?;
        let client_name = param_str(params, 1)?;
        let policy_id = params
            .get(2)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::BadRequest("missing policy_id".into()))?;
        let duration_hours = params.get(3).and_then(Value::as_i64);
        let token = policy::create_token(
            &self.pool,
            &key_name,
            &client_name,
            policy_id,
            &self.admin_pubkey(),
            duration_hours,
        )
        .await?;
        Ok(json!(token))
    }

    async fn unlock_key(&self, params: &[Value]) -> Result<Value, Error> {
        let name = param_str(params, 0)?;
        let passphrase = param_str(params, 1)?;
        let cfg = self.load_config()?;
        let entry = cfg
            .keys
            .get(&name)
            .ok_or_else(|| Error::NotFound(format!("key {name}")))?;
        let ok = self.key_store.unlock(&name, entry, &passphrase)?;
        Ok(json!({ "unlocked": ok }))
    }

    async fn create_account(
        &self,
        sender: &str,
        params: &[Value],
        cfg: &ConfigDoc,
    ) -> Result<Value, Error> {
        if !cfg.allow_new_keys {
            return Err(Error::Unauthorized);
        }

        let username = match param_str_opt(params, 0).filter(|s| !s.is_empty()) {
            Some(name) => name,
            None => format!("user-{}", &Uuid::new_v4().simple().to_string()[..8]),
        };
        if RESERVED_USERNAMES.contains(&username.as_str()) {
            return Err(Error::Conflict(format!("username {username} is reserved")));
        }
        if cfg.keys.contains_key(&username) {
            return Err(Error::Conflict(format!("username {username} already taken")));
        }

        let domain_param = param_str_opt(params, 1).filter(|s| !s.is_empty());
        let email = param_str_opt(params, 2).filter(|s| !s.is_empty());
        let (domain_name, domain_record) = match domain_param {
            Some(name) => {
                let record = cfg
                    .domains
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("domain {name} not configured")))?;
                (name, record)
            }
            None => cfg
                .domains
                .iter()
                .next()
                .map(|(name, record)| (name.clone(), record.clone()))
                .ok_or_else(|| Error::NotFound("no domain configured".into()))?,
        };

        let mut cfg = self.load_config()?;
        let material = PrivateKeyMaterial::generate();
        let pubkey = material.public_key_hex();
        // The bunker's own admin secret gates recovery of auto-provisioned
        // keys; an operator who wants a user-chosen passphrase uses
        // `create_new_key` instead.
        let passphrase = self.admin_signer.secret_bytes();
        let encrypted = crate::key_store::encrypt(&material.secret_bytes(), &hex::encode(passphrase))?;
        cfg.keys.insert(username.clone(), encrypted);
        let user_plane_relays = cfg.user_plane_relays.clone();
        config_store::put(&self.config_path, cfg)?;
        self.key_store.install(&username, material);

        self.append_to_identity_file(
            &domain_record.identity_file_path,
            &username,
            &pubkey,
            &user_plane_relays,
        )
        .await?;

        if let Some(backend) = &domain_record.wallet_backend {
            let provisioner = self.wallet.lock().expect("wallet lock poisoned").clone();
            match provisioner.provision(&username, &pubkey).await {
                Ok(descriptor) => info!(username, backend, descriptor, "wallet provisioned"),
                Err(e) => warn!(username, backend, error = %e, "wallet provisioning failed"),
            }
        }

        acl::grant(&self.pool, &username, sender, "connect", None, None).await?;
        acl::grant(&self.pool, &username, sender, "sign_event", None, Some(acl::SCOPE_ALL)).await?;
        acl::grant(&self.pool, &username, sender, "encrypt", None, None).await?;
        acl::grant(&self.pool, &username, sender, "decrypt", None, None).await?;

        info!(username, domain = %domain_name, email = ?email, "account created");
        Ok(json!({ "name": username, "pubkey": pubkey, "domain": domain_name }))
    }

    /// Appends `username -> pubkey` to the domain's identity document,
    /// merging with whatever is already there rather than overwriting it.
    async fn append_to_identity_file(
        &self,
        path: &str,
        username: &str,
        pubkey: &str,
        user_plane_relays: &[String],
    ) -> Result<(), Error> {
        let path = PathBuf::from(path);
        let mut doc = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::Internal(format!("failed to read identity file: {e}")))?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Internal(format!("failed to parse identity file: {e}")))?
        } else {
            IdentityDocument {
                names: Default::default(),
                relays: Default::default(),
                nip46: Default::default(),
            }
        };
        doc.names.insert(username.to_string(), pubkey.to_string());
        doc.nip46
            .insert(pubkey.to_string(), user_plane_relays.to_vec());
        JsonFileWriter::new(path).write(&doc).await
    }

    /// Entry point for the user plane's `create_account` delegation
    /// (spec.md §4.7): account creation always goes through the admin
    /// plane's key-store and config-store access, regardless of which plane
    /// the request arrived on.
    pub async fn dispatch_create_account(
        &self,
        sender: &str,
        params: &[Value],
    ) -> Result<Value, Error> {
        let cfg = self.load_config()?;
        self.create_account(sender, params, &cfg).await
    }

    async fn resolve_pending(&self, sender: &str, id: &str, params: &[Value]) {
        let decision = match params.first() {
            Some(Value::Array(arr)) if arr.first().and_then(Value::as_str) == Some("always") => {
                AdminDecision::Always {
                    description: arr.get(1).and_then(Value::as_str).map(str::to_string),
                    scope: arr.get(2).and_then(Value::as_str).map(str::to_string),
                }
            }
            Some(Value::Array(arr)) if arr.first().and_then(Value::as_str) == Some("never") => {
                AdminDecision::Never
            }
            Some(Value::Bool(b)) => AdminDecision::OneShot(*b),
            _ => AdminDecision::OneShot(true),
        };

        let tx = self.pending.lock().await.remove(id);
        if let Some(tx) = tx {
            let _ = tx.send(decision);
        } else {
            warn!(id, sender, "acl_response for unknown or already-resolved request");
        }
    }

    pub async fn announce_connection_string(&self) -> Result<(), Error> {
        let cfg = self.load_config()?;
        let url = connection::format_bunker_url(&self.admin_pubkey(), &cfg.admin_plane_relays);
        let path = config_store::connection_string_path(&self.config_path);
        std::fs::write(&path, &url)
            .map_err(|e| Error::Internal(format!("failed to write connection string: {e}")))?;
        info!(url = %url, "bunker connection string ready");

        if cfg.notify_admins_on_boot {
            for admin in &cfg.admin_pubkeys {
                let _ = self.transport.send(&self.admin_pubkey(), admin, &url).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AdminFanout for AdminPlane {
    async fn request_decision(
        &self,
        key_name: &str,
        remote_pubkey: &str,
        method: &str,
        params: &Value,
    ) -> Option<AdminDecision> {
        let cfg = self.load_config().ok()?;
        if cfg.admin_pubkeys.is_empty() {
            return None;
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let request = json!({
            "id": id,
            "method": "acl",
            "params": [key_name, remote_pubkey, method, params],
        });
        let body = request.to_string();
        for admin in &cfg.admin_pubkeys {
            if let Err(e) = self.transport.send(&self.admin_pubkey(), admin, &body).await {
                warn!(admin, error = %e, "failed to fan out acl request");
            }
        }

        let result = tokio::time::timeout(FANOUT_TIMEOUT, rx).await;
        self.pending.lock().await.remove(&id);
        match result {
            Ok(Ok(decision)) => Some(decision),
            _ => None,
        }
    }
}
