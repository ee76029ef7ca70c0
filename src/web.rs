//! Approval Web UI — the web-approval path's counterpart to spec.md §4.5
//! step 4, not itself named by spec.md but required to make that path
//! reachable end to end. Reuses the teacher's axum router/handler/
//! `AppState` idiom wholesale; the actual HTML is out of scope, stood in by
//! [`ApprovalPageRenderer`] so a real templating engine can be dropped in
//! without touching routing or settlement logic.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::acl;
use crate::error::Error;
use crate::ledger::{self, RequestRow, WakeTable};

/// Renders the human-facing approval page for a pending request. The real
/// product's markup/branding lives outside this crate's scope; this trait
/// is the seam a caller substitutes it through.
pub trait ApprovalPageRenderer: Send + Sync {
    fn render(&self, row: &RequestRow) -> String;
    fn render_settled(&self, row: &RequestRow) -> String;
}

pub struct PlainRenderer;

impl ApprovalPageRenderer for PlainRenderer {
    fn render(&self, row: &RequestRow) -> String {
        format!(
            "<html><body><h1>Approve {method} for {remote}?</h1>\
             <form method=\"post\" action=\"/requests/{id}/approve\">\
             <label><input type=\"checkbox\" name=\"always\" value=\"true\"> always</label>\
             <button type=\"submit\">Approve</button></form>\
             <form method=\"post\" action=\"/requests/{id}/deny\">\
             <button type=\"submit\">Deny</button></form></body></html>",
            method = row.method,
            remote = row.remote_pubkey,
            id = row.id,
        )
    }

    fn render_settled(&self, row: &RequestRow) -> String {
        format!(
            "<html><body><p>Request {} already settled (allowed: {:?}).</p></body></html>",
            row.id, row.allowed
        )
    }
}

pub struct AppState {
    pub pool: SqlitePool,
    pub wake_table: Arc<WakeTable>,
    pub renderer: Arc<dyn ApprovalPageRenderer>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/requests/:id", get(show_request))
        .route("/requests/:id/approve", post(approve))
        .route("/requests/:id/deny", post(deny))
        .with_state(state)
}

async fn show_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Html<String>, AppError> {
    let row = ledger::find(&state.pool, &id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("request {id}")))?;

    let body = if row.allowed.is_some() {
        state.renderer.render_settled(&row)
    } else {
        state.renderer.render(&row)
    };
    Ok(Html(body))
}

#[derive(Debug, Deserialize)]
pub struct ApproveForm {
    #[serde(default)]
    pub always: bool,
    #[serde(default)]
    pub scope: Option<String>,
}

async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Form(form): Form<ApproveForm>,
) -> Result<Json<serde_json::Value>, AppError> {
    let row = ledger::find(&state.pool, &id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("request {id}")))?;

    if form.always {
        if let Some(key_name) = &row.key_name {
            acl::grant(
                &state.pool,
                key_name,
                &row.remote_pubkey,
                &row.method,
                None,
                form.scope.as_deref(),
            )
            .await?;
            // spec.md §8 scenario 5: a `connect` grant also installs
            // `sign_event(all)` as a convenience.
            if row.method == "connect" {
                acl::grant(
                    &state.pool,
                    key_name,
                    &row.remote_pubkey,
                    "sign_event",
                    None,
                    Some(acl::SCOPE_ALL),
                )
                .await?;
            }
        }
    }

    ledger::settle(&state.pool, &state.wake_table, &id, true, None).await?;
    info!(request_id = %id, always = form.always, "web approval granted");
    Ok(Json(serde_json::json!({ "settled": true, "allowed": true })))
}

async fn deny(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let row = ledger::find(&state.pool, &id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("request {id}")))?;

    if let Some(key_name) = &row.key_name {
        acl::deny(&state.pool, key_name, &row.remote_pubkey).await?;
    }

    ledger::settle(&state.pool, &state.wake_table, &id, false, None).await?;
    info!(request_id = %id, "web approval denied");
    Ok(Json(serde_json::json!({ "settled": true, "allowed": false })))
}

/// Thin newtype so `Error` can implement `IntoResponse` for the subset of
/// variants the web UI actually surfaces without constraining `error.rs`'s
/// own impl to axum's traits for the whole crate.
struct AppError(Error);

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        self.0.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn state_with_row() -> (Arc<AppState>, String) {
        let pool = connect_in_memory().await;
        let row = ledger::open(
            &pool,
            Some("alice"),
            "req1",
            "remote1",
            "connect",
            serde_json::json!([]),
        )
        .await
        .unwrap();
        let state = Arc::new(AppState {
            pool,
            wake_table: Arc::new(WakeTable::new()),
            renderer: Arc::new(PlainRenderer),
        });
        (state, row.id)
    }

    #[tokio::test]
    async fn get_pending_request_renders_page() {
        let (state, id) = state_with_row().await;
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/requests/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn approve_settles_row_to_allowed() {
        let (state, id) = state_with_row().await;
        let pool = state.pool.clone();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/requests/{id}/approve"))
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("always=false"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let row = ledger::find(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.allowed, Some(true));
    }

    #[tokio::test]
    async fn deny_settles_row_and_persists_hard_deny() {
        let (state, id) = state_with_row().await;
        let pool = state.pool.clone();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/requests/{id}/deny"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let row = ledger::find(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.allowed, Some(false));

        let result = acl::lookup(&pool, "alice", "remote1", "connect", None)
            .await
            .unwrap();
        assert_eq!(result, acl::LookupResult::Deny);
    }
}
