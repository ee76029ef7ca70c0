//! Request Ledger — spec.md §4.4.
//!
//! Short-lived records of pending approvals, joined to their outcome. Rows
//! self-expire 60 seconds after creation regardless of state. A
//! `tokio::sync::oneshot` per pending row lets the direct-admin path wake up
//! immediately on settlement instead of busy-polling; the web-approval path
//! polls the row directly since the settling actor (an HTTP handler) is in a
//! different task than the one awaiting it. Grounded on the teacher's
//! background-task shape in `onsocial-relayer`'s `run_autoscaler`
//! (`tokio::spawn` loop driven by a `CancellationToken`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Error;

pub const ROW_TTL: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRow {
    pub id: String,
    pub key_name: Option<String>,
    pub request_id: String,
    pub remote_pubkey: String,
    pub method: String,
    pub params: serde_json::Value,
    pub allowed: Option<bool>,
    pub payload: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Settlement {
    pub allowed: bool,
    pub payload: Option<serde_json::Value>,
}

/// In-process wake-up handles for pending rows, keyed by row id. Purely an
/// optimization: `find`/`poll_until_settled` always fall back to the row
/// itself as the source of truth.
#[derive(Default)]
pub struct WakeTable {
    senders: Mutex<HashMap<String, oneshot::Sender<Settlement>>>,
}

impl WakeTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: &str) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        self.senders
            .lock()
            .expect("wake table lock poisoned")
            .insert(id.to_string(), tx);
        rx
    }

    fn wake(&self, id: &str, settlement: Settlement) {
        if let Some(tx) = self
            .senders
            .lock()
            .expect("wake table lock poisoned")
            .remove(id)
        {
            let _ = tx.send(settlement);
        }
    }

    fn drop_wait(&self, id: &str) {
        self.senders
            .lock()
            .expect("wake table lock poisoned")
            .remove(id);
    }
}

/// spec.md §4.4 `open`: generate an internal row id, insert a pending row.
pub async fn open(
    pool: &SqlitePool,
    key_name: Option<&str>,
    request_id: &str,
    remote_pubkey: &str,
    method: &str,
    params: serde_json::Value,
) -> Result<RequestRow, Error> {
    let id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();
    let params_text = serde_json::to_string(&params)
        .map_err(|e| Error::Internal(format!("failed to serialize params: {e}")))?;

    sqlx::query(
        "INSERT INTO requests (id, key_name, request_id, remote_pubkey, method, params, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&id)
    .bind(key_name)
    .bind(request_id)
    .bind(remote_pubkey)
    .bind(method)
    .bind(&params_text)
    .bind(&created_at)
    .execute(pool)
    .await?;

    Ok(RequestRow {
        id,
        key_name: key_name.map(str::to_string),
        request_id: request_id.to_string(),
        remote_pubkey: remote_pubkey.to_string(),
        method: method.to_string(),
        params,
        allowed: None,
        payload: None,
        created_at,
    })
}

/// spec.md §4.4 `settle`: transition a pending row to terminal.
pub async fn settle(
    pool: &SqlitePool,
    wake_table: &WakeTable,
    id: &str,
    allowed: bool,
    payload: Option<serde_json::Value>,
) -> Result<(), Error> {
    let payload_text = payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Internal(format!("failed to serialize payload: {e}")))?;

    let result = sqlx::query(
        "UPDATE requests SET allowed = ?1, payload = ?2 WHERE id = ?3 AND allowed IS NULL",
    )
    .bind(allowed as i64)
    .bind(&payload_text)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("pending request {id}")));
    }

    wake_table.wake(
        id,
        Settlement {
            allowed,
            payload,
        },
    );
    Ok(())
}

pub async fn find(pool: &SqlitePool, id: &str) -> Result<Option<RequestRow>, Error> {
    let row = sqlx::query(
        "SELECT id, key_name, request_id, remote_pubkey, method, params, allowed, payload, created_at \
         FROM requests WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        None => None,
        Some(r) => Some(row_to_request(r)?),
    })
}

fn row_to_request(row: sqlx::sqlite::SqliteRow) -> Result<RequestRow, Error> {
    let params_text: String = row.get("params");
    let payload_text: Option<String> = row.get("payload");
    let allowed: Option<i64> = row.get("allowed");

    Ok(RequestRow {
        id: row.get("id"),
        key_name: row.get("key_name"),
        request_id: row.get("request_id"),
        remote_pubkey: row.get("remote_pubkey"),
        method: row.get("method"),
        params: serde_json::from_str(&params_text)
            .map_err(|e| Error::Internal(format!("corrupt ledger params: {e}")))?,
        allowed: allowed.map(|a| a != 0),
        payload: payload_text
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(|e| Error::Internal(format!("corrupt ledger payload: {e}")))?,
        created_at: row.get("created_at"),
    })
}

/// Wait for `id` to settle, checking the row every `POLL_INTERVAL` — used by
/// the web-approval path (spec.md §4.5 step 4), where the settling actor is
/// a separate HTTP handler. Returns `None` if the row is deleted (expired)
/// before settling.
pub async fn poll_until_settled(
    pool: &SqlitePool,
    id: &str,
) -> Result<Option<Settlement>, Error> {
    loop {
        match find(pool, id).await? {
            None => return Ok(None),
            Some(row) => {
                if let Some(allowed) = row.allowed {
                    return Ok(Some(Settlement {
                        allowed,
                        payload: row.payload,
                    }));
                }
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait for either the wake-table notification or the 10s admin timeout,
/// re-checking the ACL after either fires per spec.md §9's guidance on
/// races between a duplicate request's resume and a concurrent `always`
/// grant commit.
pub async fn wait_for_settlement(
    wake_table: &WakeTable,
    id: &str,
    timeout: Duration,
) -> Option<Settlement> {
    let rx = wake_table.register(id);
    let result = tokio::time::timeout(timeout, rx).await;
    match result {
        Ok(Ok(settlement)) => Some(settlement),
        Ok(Err(_)) | Err(_) => {
            wake_table.drop_wait(id);
            None
        }
    }
}

/// Background sweeper: deletes rows older than [`ROW_TTL`] regardless of
/// state, per spec.md §3's "Rows expire 60 seconds after creation" and §5's
/// "Ledger rows time out independently at 60s" invariant.
pub async fn run_expiry_sweeper(pool: SqlitePool, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("ledger expiry sweeper shutting down");
                return;
            }
            _ = interval.tick() => {
                let cutoff = (Utc::now() - chrono::Duration::from_std(ROW_TTL).unwrap()).to_rfc3339();
                match sqlx::query("DELETE FROM requests WHERE created_at < ?1")
                    .bind(&cutoff)
                    .execute(&pool)
                    .await
                {
                    Ok(result) if result.rows_affected() > 0 => {
                        info!(expired = result.rows_affected(), "expired pending ledger rows");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "ledger sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn open_then_settle_then_find() {
        let pool = connect_in_memory().await;
        let wake = WakeTable::new();
        let row = open(
            &pool,
            Some("alice"),
            "req1",
            "remote1",
            "sign_event",
            serde_json::json!({"kind": 1}),
        )
        .await
        .unwrap();
        assert!(row.allowed.is_none());

        settle(&pool, &wake, &row.id, true, Some(serde_json::json!({"sig": "abc"})))
            .await
            .unwrap();

        let reloaded = find(&pool, &row.id).await.unwrap().unwrap();
        assert_eq!(reloaded.allowed, Some(true));
    }

    #[tokio::test]
    async fn settle_twice_fails_second_time() {
        let pool = connect_in_memory().await;
        let wake = WakeTable::new();
        let row = open(&pool, None, "req1", "remote1", "ping", serde_json::json!(null))
            .await
            .unwrap();
        settle(&pool, &wake, &row.id, true, None).await.unwrap();
        let err = settle(&pool, &wake, &row.id, false, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn wait_for_settlement_resolves_on_settle() {
        let pool = connect_in_memory().await;
        let wake = std::sync::Arc::new(WakeTable::new());
        let row = open(&pool, None, "req1", "remote1", "ping", serde_json::json!(null))
            .await
            .unwrap();

        let pool2 = pool.clone();
        let wake2 = wake.clone();
        let id = row.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            settle(&pool2, &wake2, &id, true, Some(serde_json::json!({"ok": true})))
                .await
                .unwrap();
        });

        let settlement = wait_for_settlement(&wake, &row.id, Duration::from_millis(500))
            .await
            .expect("settlement should arrive before timeout");
        assert!(settlement.allowed);
    }

    #[tokio::test]
    async fn wait_for_settlement_times_out_without_settle() {
        let pool = connect_in_memory().await;
        let wake = WakeTable::new();
        let row = open(&pool, None, "req1", "remote1", "ping", serde_json::json!(null))
            .await
            .unwrap();
        let settlement = wait_for_settlement(&wake, &row.id, Duration::from_millis(20)).await;
        assert!(settlement.is_none());
    }
}
