//! Authorization Engine — spec.md §4.5.
//!
//! `permit` is the single gate every user-plane RPC passes through before a
//! key is touched. It is deliberately decoupled from the admin plane's own
//! relay wiring: the admin plane implements [`AdminFanout`] and the web UI
//! settles ledger rows directly, so this module only knows about the ACL
//! store, the ledger, and the two abstract notification paths. Grounded on
//! the teacher's `rpc.rs` primary/fallback race (`tokio::select!` over two
//! futures, first one wins) generalized here to "whichever admin answers
//! first, or the web approval settles the row".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::acl::{self, LookupResult};
use crate::error::Error;
use crate::ledger::{self, WakeTable};

/// How long the direct-admin fanout waits for any admin to answer before the
/// request is treated as timed out, per spec.md §4.5 step 6.
pub const ADMIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum PermitOutcome {
    Approved(Option<Value>),
    Denied,
    TimedOut,
    /// An out-of-band `auth_url` has already been sent to the caller; the
    /// user plane should not emit its own response for this request.
    AwaitingWebApproval,
}

/// An admin's answer to a fanned-out `acl` request, per spec.md §4.5 step 5.
#[derive(Debug, Clone)]
pub enum AdminDecision {
    /// `["always", description?, scope?]` — persist the grant, then approve.
    Always {
        description: Option<String>,
        scope: Option<String>,
    },
    /// `["never"]` — persist a hard deny, then reject.
    Never,
    /// Any other response shape — approve or reject this one request only,
    /// with no ACL write.
    OneShot(bool),
}

/// The admin plane's side of the direct-admin approval path: fan a parallel
/// `acl` RPC out to every configured admin and return the first answer.
/// Implemented by the admin plane so the engine never has to own relay
/// transport, admin signing keys, or the admin pubkey list itself.
#[async_trait]
pub trait AdminFanout: Send + Sync {
    async fn request_decision(
        &self,
        key_name: &str,
        remote_pubkey: &str,
        method: &str,
        params: &Value,
    ) -> Option<AdminDecision>;
}

/// The user plane's side of the web-approval path: deliver the out-of-band
/// `auth_url` response for `request_id` back to `remote_pubkey`. Implemented
/// by the user plane so the engine never has to own relay transport or
/// signing keys either.
#[async_trait]
pub trait AuthUrlNotifier: Send + Sync {
    async fn send_auth_url(
        &self,
        remote_pubkey: &str,
        request_id: &str,
        url: &str,
    ) -> Result<(), Error>;
}

pub struct AuthEngine {
    pool: SqlitePool,
    wake_table: Arc<WakeTable>,
    base_url: Option<String>,
}

impl AuthEngine {
    pub fn new(pool: SqlitePool, wake_table: Arc<WakeTable>, base_url: Option<String>) -> Self {
        Self {
            pool,
            wake_table,
            base_url,
        }
    }

    /// spec.md §4.5: decide whether `remote_pubkey` may invoke `method` on
    /// `key_name` with `params`, consulting the ACL store first and falling
    /// back to interactive approval. `event_kind` is only meaningful for
    /// `sign_event`. `request_id` is the original RPC id, used to key the
    /// ledger row and, for the web path, the approval URL.
    #[allow(clippy::too_many_arguments)]
    pub async fn permit(
        &self,
        key_name: &str,
        remote_pubkey: &str,
        method: &str,
        params: &[Value],
        event_kind: Option<i64>,
        request_id: &str,
        fanout: &dyn AdminFanout,
        notifier: &dyn AuthUrlNotifier,
    ) -> Result<PermitOutcome, Error> {
        // Step 1: an existing ACL verdict resolves immediately, no ledger
        // row, no admin round trip.
        match acl::lookup(&self.pool, key_name, remote_pubkey, method, event_kind).await? {
            LookupResult::Allow => return Ok(PermitOutcome::Approved(None)),
            LookupResult::Deny => return Ok(PermitOutcome::Denied),
            LookupResult::Unknown => {}
        }

        // Step 2: params are always serialized as JSON for the approval
        // prompt and for the ledger row (SPEC_FULL.md §5.1).
        let params_json = Value::Array(params.to_vec());

        // Step 3: open a pending ledger row.
        let row = ledger::open(
            &self.pool,
            Some(key_name),
            request_id,
            remote_pubkey,
            method,
            params_json.clone(),
        )
        .await?;

        // Step 4: a configured base URL means interactive approval happens
        // on the web, not over the admin relay channel. Send the auth_url
        // and let the caller poll the ledger row directly instead of racing
        // the wake table — the settling actor is an HTTP handler in a
        // different task.
        if let Some(base_url) = &self.base_url {
            let url = format!("{}/requests/{}", base_url.trim_end_matches('/'), row.id);
            notifier.send_auth_url(remote_pubkey, request_id, &url).await?;
            info!(request_id = %row.id, "awaiting web approval");

            return match ledger::poll_until_settled(&self.pool, &row.id).await? {
                Some(settlement) if settlement.allowed => {
                    Ok(PermitOutcome::Approved(settlement.payload))
                }
                Some(_) => Ok(PermitOutcome::Denied),
                None => Ok(PermitOutcome::AwaitingWebApproval),
            };
        }

        // Step 5: fan the request out to every configured admin and race
        // for the first answer against the 10s timeout, settling the ledger
        // row as soon as one lands.
        let settle_on_decision = async {
            let decision = fanout
                .request_decision(key_name, remote_pubkey, method, &params_json)
                .await;
            let Some(decision) = decision else {
                return None;
            };
            let (allowed, acl_write): (bool, Option<AclWrite>) = match decision {
                AdminDecision::Always { description, scope } => (
                    true,
                    Some(AclWrite::Grant { description, scope }),
                ),
                AdminDecision::Never => (false, Some(AclWrite::Deny)),
                AdminDecision::OneShot(allowed) => (allowed, None),
            };

            if let Some(write) = acl_write {
                let result = match write {
                    AclWrite::Grant { description, scope } => {
                        let granted = acl::grant(
                            &self.pool,
                            key_name,
                            remote_pubkey,
                            method_for_write(method),
                            description.as_deref(),
                            scope.as_deref(),
                        )
                        .await;
                        // spec.md §8 scenario 5: a `connect` grant also
                        // installs `sign_event(all)` as a convenience.
                        if granted.is_ok() && method == "connect" {
                            acl::grant(
                                &self.pool,
                                key_name,
                                remote_pubkey,
                                "sign_event",
                                description.as_deref(),
                                Some(acl::SCOPE_ALL),
                            )
                            .await
                        } else {
                            granted
                        }
                    }
                    AclWrite::Deny => acl::deny(&self.pool, key_name, remote_pubkey).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "failed to persist admin ACL decision");
                }
            }

            if let Err(e) = ledger::settle(&self.pool, &self.wake_table, &row.id, allowed, None).await
            {
                warn!(error = %e, "failed to settle ledger row after admin decision");
            }
            Some(allowed)
        };

        // Step 6: wait for the admin decision or the 10s timeout.
        tokio::select! {
            allowed = settle_on_decision => {
                match allowed {
                    Some(true) => Ok(PermitOutcome::Approved(None)),
                    Some(false) => Ok(PermitOutcome::Denied),
                    None => Ok(PermitOutcome::TimedOut),
                }
            }
            _ = tokio::time::sleep(ADMIN_RESPONSE_TIMEOUT) => Ok(PermitOutcome::TimedOut),
        }
    }
}

enum AclWrite {
    Grant {
        description: Option<String>,
        scope: Option<String>,
    },
    Deny,
}

/// `connect`/`sign_event`/etc. all grant against their own method name; the
/// wildcard is reserved for explicit admin denies (spec.md §4.3 `deny`).
fn method_for_write(method: &str) -> &str {
    method
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    struct AlwaysApprove;
    #[async_trait]
    impl AdminFanout for AlwaysApprove {
        async fn request_decision(
            &self,
            _key_name: &str,
            _remote_pubkey: &str,
            _method: &str,
            _params: &Value,
        ) -> Option<AdminDecision> {
            Some(AdminDecision::Always {
                description: Some("my phone".into()),
                scope: None,
            })
        }
    }

    struct AlwaysDeny;
    #[async_trait]
    impl AdminFanout for AlwaysDeny {
        async fn request_decision(
            &self,
            _key_name: &str,
            _remote_pubkey: &str,
            _method: &str,
            _params: &Value,
        ) -> Option<AdminDecision> {
            Some(AdminDecision::Never)
        }
    }

    struct NeverResponds;
    #[async_trait]
    impl AdminFanout for NeverResponds {
        async fn request_decision(
            &self,
            _key_name: &str,
            _remote_pubkey: &str,
            _method: &str,
            _params: &Value,
        ) -> Option<AdminDecision> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct NoopNotifier;
    #[async_trait]
    impl AuthUrlNotifier for NoopNotifier {
        async fn send_auth_url(
            &self,
            _remote_pubkey: &str,
            _request_id: &str,
            _url: &str,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn allow_row_short_circuits_without_admin_roundtrip() {
        let pool = connect_in_memory().await;
        acl::grant(&pool, "alice", "remote1", "connect", None, None)
            .await
            .unwrap();
        let engine = AuthEngine::new(pool, Arc::new(WakeTable::new()), None);

        let outcome = engine
            .permit(
                "alice",
                "remote1",
                "connect",
                &[],
                None,
                "req1",
                &NeverResponds,
                &NoopNotifier,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PermitOutcome::Approved(_)));
    }

    #[tokio::test]
    async fn direct_admin_always_grants_and_persists_acl() {
        let pool = connect_in_memory().await;
        let engine = AuthEngine::new(pool.clone(), Arc::new(WakeTable::new()), None);

        let outcome = engine
            .permit(
                "alice",
                "remote1",
                "connect",
                &[],
                None,
                "req1",
                &AlwaysApprove,
                &NoopNotifier,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PermitOutcome::Approved(_)));

        let result = acl::lookup(&pool, "alice", "remote1", "connect", None)
            .await
            .unwrap();
        assert_eq!(result, LookupResult::Allow);
    }

    #[tokio::test]
    async fn direct_admin_never_denies_and_persists_acl() {
        let pool = connect_in_memory().await;
        let engine = AuthEngine::new(pool.clone(), Arc::new(WakeTable::new()), None);

        let outcome = engine
            .permit(
                "alice",
                "remote1",
                "connect",
                &[],
                None,
                "req1",
                &AlwaysDeny,
                &NoopNotifier,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PermitOutcome::Denied));

        let result = acl::lookup(&pool, "alice", "remote1", "connect", None)
            .await
            .unwrap();
        assert_eq!(result, LookupResult::Deny);
    }

    #[tokio::test]
    async fn no_admin_response_times_out() {
        let pool = connect_in_memory().await;
        let engine = AuthEngine::new(pool, Arc::new(WakeTable::new()), None);

        let outcome = tokio::time::timeout(
            Duration::from_millis(200),
            engine.permit(
                "alice",
                "remote1",
                "connect",
                &[],
                None,
                "req1",
                &NeverResponds,
                &NoopNotifier,
            ),
        )
        .await;
        // The engine itself waits out the full 10s timeout before returning
        // TimedOut; this test only proves it does not resolve early.
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn web_approval_path_sends_auth_url_and_polls_row() {
        let pool = connect_in_memory().await;
        let engine = AuthEngine::new(
            pool.clone(),
            Arc::new(WakeTable::new()),
            Some("https://bunker.example".into()),
        );

        let pool2 = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let row = sqlx::query_as::<_, (String,)>("SELECT id FROM requests LIMIT 1")
                .fetch_one(&pool2)
                .await
                .unwrap();
            ledger::settle(&pool2, &WakeTable::new(), &row.0, true, None)
                .await
                .unwrap();
        });

        let outcome = engine
            .permit(
                "alice",
                "remote1",
                "connect",
                &[],
                None,
                "req1",
                &NeverResponds,
                &NoopNotifier,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PermitOutcome::Approved(_)));
    }
}
