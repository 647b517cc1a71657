//! Stratum v1 wire messages.
//!
//! Stratum is line-delimited JSON-RPC with fixed quirks: every reply
//! carries `id`, `result`, and `error` fields even when null, and
//! notifications go out with a null `id`. Inbound requests are parsed
//! leniently because real miner firmware omits or mistypes fields.

use serde::Serialize;
use serde_json::{json, Value};

/// A single outbound message, serialized as one line.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Response {
        id: Value,
        result: Value,
        error: Value,
    },
    Notification {
        id: Value,
        method: String,
        params: Value,
    },
}

impl JsonRpcMessage {
    pub fn response(id: Value, result: Value, error: Value) -> Self {
        JsonRpcMessage::Response { id, result, error }
    }

    /// A successful reply: `error` is null.
    pub fn ok(id: Value, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result,
            error: Value::Null,
        }
    }

    /// A failed reply: `result` is null.
    pub fn fail(id: Value, error: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Value::Null,
            error,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Notification {
            id: Value::Null,
            method: method.into(),
            params,
        }
    }
}

/// An inbound request pulled apart into its JSON-RPC fields. A missing
/// `id` becomes null and missing `params` an empty array.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

/// Extracts a request from a parsed line. Returns `None` when there is
/// no string `method` to dispatch on.
pub fn parse_request(message: &Value) -> Option<IncomingRequest> {
    let method = message.get("method")?.as_str()?.to_owned();
    Some(IncomingRequest {
        id: message.get("id").cloned().unwrap_or(Value::Null),
        method,
        params: message.get("params").cloned().unwrap_or_else(|| json!([])),
    })
}

/// `mining.submit` positional params. Absent or non-string positions
/// come back as empty strings, which the share validators then reject
/// as size errors. `ntime` and `nonce` are lowercased.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub version_bits: Option<String>,
}

impl SubmitParams {
    pub fn from_params(params: &Value) -> Self {
        let field = |index: usize| {
            params
                .get(index)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned()
        };
        SubmitParams {
            worker: field(0),
            job_id: field(1),
            extranonce2: field(2),
            ntime: field(3).to_lowercase(),
            nonce: field(4).to_lowercase(),
            version_bits: params
                .get(5)
                .and_then(Value::as_str)
                .map(str::to_lowercase),
        }
    }
}

/// `mining.authorize` positional params.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizeParams {
    pub worker: String,
    pub password: String,
}

impl AuthorizeParams {
    pub fn from_params(params: &Value) -> Self {
        let field = |index: usize| {
            params
                .get(index)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned()
        };
        AuthorizeParams {
            worker: field(0),
            password: field(1),
        }
    }
}

/// `mining.configure` params: a list of requested extensions followed
/// by an object of extension options.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureParams {
    pub extensions: Vec<String>,
    pub options: Value,
}

impl ConfigureParams {
    pub fn from_params(params: &Value) -> Self {
        let extensions = params
            .get(0)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        ConfigureParams {
            extensions,
            options: params.get(1).cloned().unwrap_or_else(|| json!({})),
        }
    }
}
