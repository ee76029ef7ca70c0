//! User RPC Plane — spec.md §4.7.
//!
//! One relay subscription per unlocked key, keyed by that key's own public
//! key. Every method but `ping` passes through the Authorization Engine
//! first. `sign_event`, `encrypt`, and `decrypt` touch the key material in
//! [`crate::key_store::KeyStore`] only after a grant.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{AuthEngine, AuthUrlNotifier, PermitOutcome};
use crate::crypto;
use crate::error::Error;
use crate::key_store::KeyStore;
use crate::relay::RelayTransport;
use crate::rpc::admin::AdminPlane;
use crate::rpc::{param_str, parse_request, RpcResponse};

pub struct UserPlane {
    key_name: String,
    key_store: Arc<KeyStore>,
    transport: Arc<dyn RelayTransport>,
    auth: Arc<AuthEngine>,
    admin: Arc<AdminPlane>,
}

impl UserPlane {
    pub fn new(
        key_name: String,
        key_store: Arc<KeyStore>,
        transport: Arc<dyn RelayTransport>,
        auth: Arc<AuthEngine>,
        admin: Arc<AdminPlane>,
    ) -> Self {
        Self {
            key_name,
            key_store,
            transport,
            auth,
            admin,
        }
    }

    fn pubkey(&self) -> Option<String> {
        self.key_store.public_key_hex(&self.key_name)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        let pubkey = self
            .pubkey()
            .ok_or_else(|| Error::KeyLocked(self.key_name.clone()))?;
        let mut inbound = self.transport.subscribe(&pubkey).await?;
        info!(key = %self.key_name, pubkey = %pubkey, "user plane listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(key = %self.key_name, "user plane shutting down");
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
        let req = match parse_request(&msg.plaintext) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "malformed user-plane request");
                return;
            }
        };
        let sender = msg.sender_pubkey.clone();

        let response = match self.dispatch(&sender, &req).await {
            Ok(Some(value)) => RpcResponse::ok(&req.id, value),
            Ok(None) => return, // web-approval path already replied out of band
            Err(e) => RpcResponse::err(&req.id, &e),
        };
        let _ = self.reply(&sender, &response).await;
    }

    async fn reply(&self, to: &str, response: &RpcResponse) -> Result<(), Error> {
        let Some(pubkey) = self.pubkey() else {
            return Err(Error::KeyLocked(self.key_name.clone()));
        };
        let body = serde_json::to_string(response)
            .map_err(|e| Error::Internal(format!("failed to encode response: {e}")))?;
        self.transport.send(&pubkey, to, &body).await
    }

    /// `Ok(None)` means the web-approval path already delivered an
    /// out-of-band `auth_url` response and the caller should not reply again.
    async fn dispatch(
        &self,
        sender: &str,
        req: &crate::rpc::RpcRequest,
    ) -> Result<Option<Value>, Error> {
        if req.method == "ping" {
            return Ok(Some(json!("pong")));
        }
        if req.method == "create_account" {
            let value = self
                .admin
                .dispatch_create_account(sender, &req.params)
                .await?;
            return Ok(Some(value));
        }

        let event_kind = if req.method == "sign_event" {
            req.params
                .first()
                .and_then(Value::as_object)
                .and_then(|o| o.get("kind"))
                .and_then(Value::as_i64)
        } else {
            None
        };

        let outcome = self
            .auth
            .permit(
                &self.key_name,
                sender,
                &req.method,
                &req.params,
                event_kind,
                &req.id,
                self.admin.as_ref(),
                self,
            )
            .await?;

        match outcome {
            PermitOutcome::Denied => Err(Error::Denied),
            PermitOutcome::TimedOut => Err(Error::TimedOut),
            PermitOutcome::AwaitingWebApproval => Ok(None),
            PermitOutcome::Approved(_) => self.execute(&req.method, &req.params).await.map(Some),
        }
    }

    async fn execute(&self, method: &str, params: &[Value]) -> Result<Value, Error> {
        match method {
            "connect" => Ok(json!("ack")),
            "sign_event" => self.sign_event(params).await,
            "encrypt" => self.pairwise_encrypt(params).await,
            "decrypt" => self.pairwise_decrypt(params).await,
            other => Err(Error::BadRequest(format!("unknown user method: {other}"))),
        }
    }

    async fn sign_event(&self, params: &[Value]) -> Result<Value, Error> {
        let mut event = params
            .first()
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| Error::BadRequest("sign_event requires an event object".into()))?;

        let canonical = serde_json::to_vec(&event)
            .map_err(|e| Error::Internal(format!("failed to canonicalize event: {e}")))?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        let id: [u8; 32] = hasher.finalize().into();

        let sig = self
            .key_store
            .with_key(&self.key_name, |k| k.sign_event_id(&id))
            .ok_or_else(|| Error::KeyLocked(self.key_name.clone()))??;

        event.insert("id".into(), json!(hex::encode(id)));
        event.insert("sig".into(), json!(sig));
        Ok(Value::Object(event))
    }

    async fn pairwise_encrypt(&self, params: &[Value]) -> Result<Value, Error> {
        let recipient = param_str(params, 0)?;
        let plaintext = param_str(params, 1)?;
        let key_name = self.key_name.clone();
        let ciphertext = self
            .key_store
            .with_key(&key_name, |k| {
                crypto::encrypt_pairwise(k, &recipient, plaintext.as_bytes())
            })
            .ok_or_else(|| Error::KeyLocked(self.key_name.clone()))??;
        Ok(json!(ciphertext))
    }

    async fn pairwise_decrypt(&self, params: &[Value]) -> Result<Value, Error> {
        let sender = param_str(params, 0)?;
        let payload = param_str(params, 1)?;
        let key_name = self.key_name.clone();
        let plaintext = self
            .key_store
            .with_key(&key_name, |k| crypto::decrypt_pairwise(k, &sender, &payload))
            .ok_or_else(|| Error::KeyLocked(self.key_name.clone()))??;
        let text = String::from_utf8(plaintext)
            .map_err(|_| Error::Internal("decrypted payload was not valid UTF-8".into()))?;
        Ok(json!(text))
    }
}

#[async_trait]
impl AuthUrlNotifier for UserPlane {
    async fn send_auth_url(
        &self,
        remote_pubkey: &str,
        request_id: &str,
        url: &str,
    ) -> Result<(), Error> {
        let response = RpcResponse::ok(request_id, json!({ "auth_url": url }));
        self.reply(remote_pubkey, &response).await
    }
}
