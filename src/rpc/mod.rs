//! JSON-RPC-over-relay wire types shared by both planes, per spec.md §6:
//! `{id, method, params[]}` requests, `{id, result, error?}` responses.
//! Admin plane and user plane stay separated by which pubkey a caller
//! addresses, not by a distinct wire "kind" — [`crate::relay::RelayTransport`]
//! already partitions inbound traffic per subscribed pubkey.

pub mod admin;
pub mod user;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: &str, result: Value) -> Self {
        Self {
            id: id.to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: &str, error: &Error) -> Self {
        Self {
            id: id.to_string(),
            result: None,
            error: Some(error.kind().to_string()),
        }
    }
}

pub fn parse_request(plaintext: &str) -> Result<RpcRequest, Error> {
    serde_json::from_str(plaintext)
        .map_err(|e| Error::BadRequest(format!("malformed RPC request: {e}")))
}

pub fn param_str(params: &[Value], idx: usize) -> Result<String, Error> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::BadRequest(format!("missing or non-string param[{idx}]")))
}

pub fn param_str_opt(params: &[Value], idx: usize) -> Option<String> {
    params.get(idx).and_then(Value::as_str).map(str::to_string)
}
