//! Policies and tokens — spec.md §3's `Policy`/`PolicyRule`/`Token`.
//!
//! A policy is a named, optionally-expiring bundle of rules; a token is a
//! one-shot credential redeemed via `acl::apply_token` to materialize a
//! policy's rules onto a `KeyUser`.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub method: String,
    pub kind: Option<String>,
    pub max_usage_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: Option<i64>,
    pub name: String,
    pub expires_at: Option<String>,
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
    pub key_name: String,
    pub client_name: String,
    pub policy_id: i64,
    pub created_by: String,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub redeemed_at: Option<String>,
    pub redeemed_by_key_user_id: Option<i64>,
}

pub async fn list_policies(pool: &SqlitePool) -> Result<Vec<Policy>, Error> {
    let policy_rows = sqlx::query("SELECT id, name, expires_at FROM policies ORDER BY id")
        .fetch_all(pool)
        .await?;

    let mut policies = Vec::with_capacity(policy_rows.len());
    for row in policy_rows {
        let id: i64 = row.get("id");
        let rule_rows = sqlx::query(
            "SELECT method, kind, max_usage_count FROM policy_rules WHERE policy_id = ?1",
        )
        .bind(id)
        .fetch_all(pool)
        .await?;
        let rules = rule_rows
            .into_iter()
            .map(|r| PolicyRule {
                method: r.get("method"),
                kind: r.get("kind"),
                max_usage_count: r.get("max_usage_count"),
            })
            .collect();

        policies.push(Policy {
            id: Some(id),
            name: row.get("name"),
            expires_at: row.get("expires_at"),
            rules,
        });
    }
    Ok(policies)
}

/// Generate a fresh opaque token string.
fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub async fn create_token(
    pool: &SqlitePool,
    key_name: &str,
    client_name: &str,
    policy_id: i64,
    created_by: &str,
    duration_hours: Option<i64>,
) -> Result<Token, Error> {
    let exists: Option<i64> = sqlx::query("SELECT id FROM policies WHERE id = ?1")
        .bind(policy_id)
        .fetch_optional(pool)
        .await?
        .map(|r| r.get("id"));
    if exists.is_none() {
        return Err(Error::NotFound(format!("policy {policy_id}")));
    }

    let token = generate_token();
    let created_at = Utc::now();
    let expires_at: Option<DateTime<Utc>> =
        duration_hours.map(|h| created_at + Duration::hours(h));

    sqlx::query(
        "INSERT INTO tokens (token, key_name, client_name, policy_id, created_by, created_at, expires_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&token)
    .bind(key_name)
    .bind(client_name)
    .bind(policy_id)
    .bind(created_by)
    .bind(created_at.to_rfc3339())
    .bind(expires_at.map(|e| e.to_rfc3339()))
    .execute(pool)
    .await?;

    Ok(Token {
        token,
        key_name: key_name.to_string(),
        client_name: client_name.to_string(),
        policy_id,
        created_by: created_by.to_string(),
        created_at: created_at.to_rfc3339(),
        expires_at: expires_at.map(|e| e.to_rfc3339()),
        redeemed_at: None,
        redeemed_by_key_user_id: None,
    })
}

pub async fn list_tokens_for_key(pool: &SqlitePool, key_name: &str) -> Result<Vec<Token>, Error> {
    let rows = sqlx::query(
        "SELECT token, key_name, client_name, policy_id, created_by, created_at, expires_at, \
         redeemed_at, redeemed_by_key_user_id FROM tokens WHERE key_name = ?1 ORDER BY created_at",
    )
    .bind(key_name)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| Token {
            token: r.get("token"),
            key_name: r.get("key_name"),
            client_name: r.get("client_name"),
            policy_id: r.get("policy_id"),
            created_by: r.get("created_by"),
            created_at: r.get("created_at"),
            expires_at: r.get("expires_at"),
            redeemed_at: r.get("redeemed_at"),
            redeemed_by_key_user_id: r.get("redeemed_by_key_user_id"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::create_policy;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn create_token_then_list_for_key() {
        let pool = connect_in_memory().await;
        let policy_id = create_policy(
            &pool,
            &Policy {
                id: None,
                name: "p1".into(),
                expires_at: None,
                rules: vec![],
            },
        )
        .await
        .unwrap();

        create_token(&pool, "alice", "app", policy_id, "admin", Some(24))
            .await
            .unwrap();

        let tokens = list_tokens_for_key(&pool, "alice").await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].expires_at.is_some());
        assert!(tokens[0].redeemed_at.is_none());
    }

    #[tokio::test]
    async fn create_token_for_unknown_policy_fails() {
        let pool = connect_in_memory().await;
        let err = create_token(&pool, "alice", "app", 999, "admin", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
