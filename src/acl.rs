//! ACL Store — spec.md §4.3.
//!
//! `KeyUser` rows bind a remote pubkey to a logical key name; `SigningCondition`
//! rows state whether a method (and, for `sign_event`, an event kind scope)
//! is permitted. Queried on every user-plane RPC. Backed by SQLite via
//! `sqlx`, using the runtime query API (see `db.rs`).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::Error;
use crate::policy::Policy;

pub const METHOD_WILDCARD: &str = "*";
pub const SCOPE_ALL: &str = "all";
pub const SCOPE_NONE: &str = "";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUser {
    pub id: i64,
    pub key_name: String,
    pub remote_pubkey: String,
    pub description: Option<String>,
    pub revoked_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningCondition {
    pub id: i64,
    pub key_user_id: i64,
    pub method: String,
    pub scope: String,
    pub allowed: bool,
    pub max_usage_count: Option<i64>,
    pub current_usage_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Allow,
    Deny,
    Unknown,
}

/// spec.md §4.3 step 1: find the `KeyUser` row by `(keyName, remotePubkey)`.
pub async fn find_key_user(
    pool: &SqlitePool,
    key_name: &str,
    remote_pubkey: &str,
) -> Result<Option<KeyUser>, Error> {
    let row = sqlx::query(
        "SELECT id, key_name, remote_pubkey, description, revoked_at \
         FROM key_users WHERE key_name = ?1 AND remote_pubkey = ?2",
    )
    .bind(key_name)
    .bind(remote_pubkey)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| KeyUser {
        id: r.get("id"),
        key_name: r.get("key_name"),
        remote_pubkey: r.get("remote_pubkey"),
        description: r.get("description"),
        revoked_at: r.get("revoked_at"),
    }))
}

async fn upsert_key_user(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key_name: &str,
    remote_pubkey: &str,
    description: Option<&str>,
) -> Result<i64, Error> {
    sqlx::query(
        "INSERT INTO key_users (key_name, remote_pubkey, description) VALUES (?1, ?2, ?3) \
         ON CONFLICT(key_name, remote_pubkey) DO UPDATE SET \
         description = COALESCE(excluded.description, key_users.description)",
    )
    .bind(key_name)
    .bind(remote_pubkey)
    .bind(description)
    .execute(&mut **tx)
    .await?;

    let row = sqlx::query("SELECT id FROM key_users WHERE key_name = ?1 AND remote_pubkey = ?2")
        .bind(key_name)
        .bind(remote_pubkey)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row.get("id"))
}

/// spec.md §4.3 `lookup`. `event_kind` is only meaningful for `sign_event`.
pub async fn lookup(
    pool: &SqlitePool,
    key_name: &str,
    remote_pubkey: &str,
    method: &str,
    event_kind: Option<i64>,
) -> Result<LookupResult, Error> {
    let key_user = match find_key_user(pool, key_name, remote_pubkey).await? {
        Some(ku) => ku,
        None => return Ok(LookupResult::Unknown),
    };

    // Step 2: an explicit `method='*', allowed=false` row is a hard deny
    // outranking any allow, checked before any method-specific scope match.
    let hard_deny: Option<i64> = sqlx::query(
        "SELECT id FROM signing_conditions WHERE key_user_id = ?1 AND method = ?2 AND allowed = 0",
    )
    .bind(key_user.id)
    .bind(METHOD_WILDCARD)
    .fetch_optional(pool)
    .await?
    .map(|r| r.get("id"));

    if hard_deny.is_some() {
        return Ok(LookupResult::Deny);
    }

    // Step 3: method-specific condition query.
    let row = if method == "sign_event" {
        let kind_text = event_kind
            .map(|k| k.to_string())
            .unwrap_or_default();
        sqlx::query(
            "SELECT id, allowed, max_usage_count, current_usage_count FROM signing_conditions \
             WHERE key_user_id = ?1 AND method = ?2 AND (scope = ?3 OR scope = ?4) \
             ORDER BY (scope = ?3) DESC LIMIT 1",
        )
        .bind(key_user.id)
        .bind(method)
        .bind(kind_text)
        .bind(SCOPE_ALL)
        .fetch_optional(pool)
        .await?
    } else {
        sqlx::query(
            "SELECT id, allowed, max_usage_count, current_usage_count FROM signing_conditions \
             WHERE key_user_id = ?1 AND method = ?2 LIMIT 1",
        )
        .bind(key_user.id)
        .bind(method)
        .fetch_optional(pool)
        .await?
    };

    let row = match row {
        Some(r) => r,
        None => return Ok(LookupResult::Unknown),
    };

    let allowed: i64 = row.get("allowed");
    let max_usage_count: Option<i64> = row.get("max_usage_count");
    let current_usage_count: i64 = row.get("current_usage_count");
    let condition_id: i64 = row.get("id");

    // spec.md §4.3 step 4: a revoked KeyUser is an unconditional deny,
    // checked before the counted-rule exhaustion fallthrough below — an
    // exhausted condition row must not reopen the approval path for a
    // revoked user.
    if key_user.revoked_at.is_some() {
        return Ok(LookupResult::Deny);
    }

    // Counted-rule enforcement (spec.md §9 open question, resolved in
    // SPEC_FULL.md §5.2): a row that has been used up to its cap no longer
    // governs the decision — fall through to `unknown`, re-triggering
    // approval.
    if let Some(max) = max_usage_count {
        if current_usage_count >= max {
            return Ok(LookupResult::Unknown);
        }
    }

    if allowed != 0 {
        if max_usage_count.is_some() {
            sqlx::query(
                "UPDATE signing_conditions SET current_usage_count = current_usage_count + 1 \
                 WHERE id = ?1",
            )
            .bind(condition_id)
            .execute(pool)
            .await?;
        }
        Ok(LookupResult::Allow)
    } else {
        Ok(LookupResult::Deny)
    }
}

/// spec.md §4.3 `grant`: upsert the KeyUser, then insert an allow condition.
pub async fn grant(
    pool: &SqlitePool,
    key_name: &str,
    remote_pubkey: &str,
    method: &str,
    description: Option<&str>,
    scope: Option<&str>,
) -> Result<(), Error> {
    let scope = scope.unwrap_or(SCOPE_NONE);
    let mut tx = pool.begin().await?;
    let key_user_id = upsert_key_user(&mut tx, key_name, remote_pubkey, description).await?;

    sqlx::query(
        "INSERT INTO signing_conditions (key_user_id, method, scope, allowed) \
         VALUES (?1, ?2, ?3, 1) \
         ON CONFLICT(key_user_id, method, scope) DO UPDATE SET allowed = 1",
    )
    .bind(key_user_id)
    .bind(method)
    .bind(scope)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// spec.md §4.3 `deny`: upsert KeyUser, insert a hard `method='*'` deny row.
pub async fn deny(pool: &SqlitePool, key_name: &str, remote_pubkey: &str) -> Result<(), Error> {
    let mut tx = pool.begin().await?;
    let key_user_id = upsert_key_user(&mut tx, key_name, remote_pubkey, None).await?;

    sqlx::query(
        "INSERT INTO signing_conditions (key_user_id, method, scope, allowed) \
         VALUES (?1, ?2, ?3, 0) \
         ON CONFLICT(key_user_id, method, scope) DO UPDATE SET allowed = 0",
    )
    .bind(key_user_id)
    .bind(METHOD_WILDCARD)
    .bind(SCOPE_NONE)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// spec.md §4.3 `applyToken`: validate, upsert the KeyUser, materialize the
/// policy's rules as SigningCondition rows, mark the token redeemed.
/// Transactional — either all rows land or none.
pub async fn apply_token(
    pool: &SqlitePool,
    remote_pubkey: &str,
    token: &str,
) -> Result<KeyUser, Error> {
    let mut tx = pool.begin().await?;

    let token_row = sqlx::query(
        "SELECT token, key_name, policy_id, expires_at, redeemed_at FROM tokens WHERE token = ?1",
    )
    .bind(token)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| Error::NotFound(format!("token {token}")))?;

    let redeemed_at: Option<String> = token_row.get("redeemed_at");
    if redeemed_at.is_some() {
        return Err(Error::AlreadyRedeemed);
    }

    let expires_at: Option<String> = token_row.get("expires_at");
    if let Some(exp) = &expires_at {
        let exp_dt: chrono::DateTime<Utc> = exp
            .parse()
            .map_err(|_| Error::Internal("corrupt token expiry".into()))?;
        if exp_dt < Utc::now() {
            return Err(Error::Expired);
        }
    }

    let key_name: String = token_row.get("key_name");
    let policy_id: i64 = token_row.get("policy_id");

    let key_user_id = upsert_key_user(&mut tx, &key_name, remote_pubkey, None).await?;

    // Baseline `connect` allow.
    sqlx::query(
        "INSERT INTO signing_conditions (key_user_id, method, scope, allowed) \
         VALUES (?1, 'connect', '', 1) \
         ON CONFLICT(key_user_id, method, scope) DO UPDATE SET allowed = 1",
    )
    .bind(key_user_id)
    .execute(&mut *tx)
    .await?;

    let rules = sqlx::query(
        "SELECT method, kind, max_usage_count FROM policy_rules WHERE policy_id = ?1",
    )
    .bind(policy_id)
    .fetch_all(&mut *tx)
    .await?;

    for rule in rules {
        let method: String = rule.get("method");
        let kind: Option<String> = rule.get("kind");
        let max_usage_count: Option<i64> = rule.get("max_usage_count");
        let scope = if method == "sign_event" {
            kind.unwrap_or_else(|| SCOPE_ALL.to_string())
        } else {
            SCOPE_NONE.to_string()
        };

        sqlx::query(
            "INSERT INTO signing_conditions \
             (key_user_id, method, scope, allowed, max_usage_count, current_usage_count) \
             VALUES (?1, ?2, ?3, 1, ?4, 0) \
             ON CONFLICT(key_user_id, method, scope) DO UPDATE SET \
             allowed = 1, max_usage_count = excluded.max_usage_count",
        )
        .bind(key_user_id)
        .bind(&method)
        .bind(&scope)
        .bind(max_usage_count)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "UPDATE tokens SET redeemed_at = ?1, redeemed_by_key_user_id = ?2 WHERE token = ?3",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(key_user_id)
    .bind(token)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    find_key_user(pool, &key_name, remote_pubkey)
        .await?
        .ok_or_else(|| Error::Internal("key_user vanished after apply_token".into()))
}

pub async fn rename_key_user(
    pool: &SqlitePool,
    key_user_id: i64,
    description: &str,
) -> Result<(), Error> {
    let result = sqlx::query("UPDATE key_users SET description = ?1 WHERE id = ?2")
        .bind(description)
        .bind(key_user_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("key_user {key_user_id}")));
    }
    Ok(())
}

pub async fn revoke_user(pool: &SqlitePool, key_user_id: i64) -> Result<(), Error> {
    let result = sqlx::query("UPDATE key_users SET revoked_at = ?1 WHERE id = ?2")
        .bind(Utc::now().to_rfc3339())
        .bind(key_user_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("key_user {key_user_id}")));
    }
    Ok(())
}

pub async fn list_key_users(pool: &SqlitePool, key_name: &str) -> Result<Vec<KeyUser>, Error> {
    let rows = sqlx::query(
        "SELECT id, key_name, remote_pubkey, description, revoked_at FROM key_users \
         WHERE key_name = ?1 ORDER BY id",
    )
    .bind(key_name)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| KeyUser {
            id: r.get("id"),
            key_name: r.get("key_name"),
            remote_pubkey: r.get("remote_pubkey"),
            description: r.get("description"),
            revoked_at: r.get("revoked_at"),
        })
        .collect())
}

pub async fn create_policy(pool: &SqlitePool, policy: &Policy) -> Result<i64, Error> {
    let result = sqlx::query("INSERT INTO policies (name, expires_at) VALUES (?1, ?2)")
        .bind(&policy.name)
        .bind(&policy.expires_at)
        .execute(pool)
        .await?;
    let policy_id = result.last_insert_rowid();

    for rule in &policy.rules {
        sqlx::query(
            "INSERT INTO policy_rules (policy_id, method, kind, max_usage_count) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(policy_id)
        .bind(&rule.method)
        .bind(&rule.kind)
        .bind(rule.max_usage_count)
        .execute(pool)
        .await?;
    }

    Ok(policy_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::policy::PolicyRule;

    #[tokio::test]
    async fn grant_then_lookup_allows_without_approval_path() {
        let pool = connect_in_memory().await;
        grant(&pool, "alice", "remote1", "sign_event", Some("app"), Some("1"))
            .await
            .unwrap();

        let result = lookup(&pool, "alice", "remote1", "sign_event", Some(1))
            .await
            .unwrap();
        assert_eq!(result, LookupResult::Allow);
    }

    #[tokio::test]
    async fn out_of_scope_kind_is_unknown() {
        let pool = connect_in_memory().await;
        grant(&pool, "alice", "remote1", "sign_event", None, Some("1"))
            .await
            .unwrap();

        let result = lookup(&pool, "alice", "remote1", "sign_event", Some(4))
            .await
            .unwrap();
        assert_eq!(result, LookupResult::Unknown);
    }

    #[tokio::test]
    async fn explicit_wildcard_deny_outranks_allow() {
        let pool = connect_in_memory().await;
        grant(&pool, "alice", "remote1", "sign_event", None, Some("all"))
            .await
            .unwrap();
        deny(&pool, "alice", "remote1").await.unwrap();

        let result = lookup(&pool, "alice", "remote1", "sign_event", Some(1))
            .await
            .unwrap();
        assert_eq!(result, LookupResult::Deny);
    }

    #[tokio::test]
    async fn revoked_key_user_denies_even_with_allow_row() {
        let pool = connect_in_memory().await;
        grant(&pool, "alice", "remote1", "connect", None, None)
            .await
            .unwrap();
        let ku = find_key_user(&pool, "alice", "remote1").await.unwrap().unwrap();
        revoke_user(&pool, ku.id).await.unwrap();

        let result = lookup(&pool, "alice", "remote1", "connect", None)
            .await
            .unwrap();
        assert_eq!(result, LookupResult::Deny);
    }

    #[tokio::test]
    async fn apply_token_materializes_policy_rules_and_is_one_shot() {
        let pool = connect_in_memory().await;
        let policy = Policy {
            id: None,
            name: "starter".into(),
            expires_at: None,
            rules: vec![
                PolicyRule {
                    method: "sign_event".into(),
                    kind: Some("1".into()),
                    max_usage_count: Some(10),
                },
                PolicyRule {
                    method: "encrypt".into(),
                    kind: None,
                    max_usage_count: None,
                },
            ],
        };
        let policy_id = create_policy(&pool, &policy).await.unwrap();

        sqlx::query(
            "INSERT INTO tokens (token, key_name, client_name, policy_id, created_by, created_at) \
             VALUES ('tok1', 'alice', 'app', ?1, 'admin', ?2)",
        )
        .bind(policy_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        let key_user = apply_token(&pool, "remote1", "tok1").await.unwrap();
        assert_eq!(key_user.remote_pubkey, "remote1");

        assert_eq!(
            lookup(&pool, "alice", "remote1", "connect", None).await.unwrap(),
            LookupResult::Allow
        );
        assert_eq!(
            lookup(&pool, "alice", "remote1", "sign_event", Some(1))
                .await
                .unwrap(),
            LookupResult::Allow
        );
        assert_eq!(
            lookup(&pool, "alice", "remote1", "encrypt", None).await.unwrap(),
            LookupResult::Allow
        );

        let err = apply_token(&pool, "remote1", "tok1").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRedeemed));
    }

    #[tokio::test]
    async fn revoked_user_denies_even_once_counted_rule_is_exhausted() {
        let pool = connect_in_memory().await;
        let policy = Policy {
            id: None,
            name: "limited".into(),
            expires_at: None,
            rules: vec![PolicyRule {
                method: "sign_event".into(),
                kind: Some("1".into()),
                max_usage_count: Some(1),
            }],
        };
        let policy_id = create_policy(&pool, &policy).await.unwrap();
        sqlx::query(
            "INSERT INTO tokens (token, key_name, client_name, policy_id, created_by, created_at) \
             VALUES ('tok1', 'alice', 'app', ?1, 'admin', ?2)",
        )
        .bind(policy_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();
        let key_user = apply_token(&pool, "remote1", "tok1").await.unwrap();

        // Exhaust the counted rule, then revoke the user.
        lookup(&pool, "alice", "remote1", "sign_event", Some(1)).await.unwrap();
        revoke_user(&pool, key_user.id).await.unwrap();

        assert_eq!(
            lookup(&pool, "alice", "remote1", "sign_event", Some(1)).await.unwrap(),
            LookupResult::Deny
        );
    }

    #[tokio::test]
    async fn counted_rule_falls_through_to_unknown_once_exhausted() {
        let pool = connect_in_memory().await;
        let policy = Policy {
            id: None,
            name: "limited".into(),
            expires_at: None,
            rules: vec![PolicyRule {
                method: "sign_event".into(),
                kind: Some("1".into()),
                max_usage_count: Some(1),
            }],
        };
        let policy_id = create_policy(&pool, &policy).await.unwrap();
        sqlx::query(
            "INSERT INTO tokens (token, key_name, client_name, policy_id, created_by, created_at) \
             VALUES ('tok1', 'alice', 'app', ?1, 'admin', ?2)",
        )
        .bind(policy_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();
        apply_token(&pool, "remote1", "tok1").await.unwrap();

        assert_eq!(
            lookup(&pool, "alice", "remote1", "sign_event", Some(1)).await.unwrap(),
            LookupResult::Allow
        );
        // Usage count now at cap; next lookup falls through to unknown.
        assert_eq!(
            lookup(&pool, "alice", "remote1", "sign_event", Some(1)).await.unwrap(),
            LookupResult::Unknown
        );
    }
}
