//! Gateway envelope and response helpers shared by every handler.

use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::{Error, Result};

/// Inbound event as delivered by the HTTP gateway.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayEvent {
    pub http_method: Option<String>,
    pub body: Option<String>,
    pub query_string_parameters: Option<HashMap<String, String>>,
    pub headers: Option<HashMap<String, String>>,
}

impl GatewayEvent {
    /// HTTP method, `GET` when the gateway omits it.
    pub fn method(&self) -> &str {
        self.http_method.as_deref().unwrap_or("GET")
    }

    /// Exact `OPTIONS`, compared the same way as every other method.
    pub fn is_preflight(&self) -> bool {
        self.method() == "OPTIONS"
    }

    /// Query-string parameter by exact name.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_string_parameters
            .as_ref()
            .and_then(|params| params.get(key))
            .map(String::as_str)
    }

    /// Non-empty query-string parameter.
    pub fn query_non_empty(&self, key: &str) -> Option<&str> {
        self.query(key).filter(|v| !v.is_empty())
    }

    /// Header value, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        })
    }

    /// Parse the body as JSON. A missing or blank body reads as `{}`.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = match self.body.as_deref().map(str::trim) {
            Some(body) if !body.is_empty() => body,
            _ => "{}",
        };
        serde_json::from_str(raw).map_err(|e| Error::Validation(format!("Invalid request body: {}", e)))
    }
}

/// Outbound envelope returned to the gateway.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub is_base64_encoded: bool,
}

impl GatewayResponse {
    /// Decode the body back into JSON; handy in tests.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

/// CORS policy of one handler.
#[derive(Debug, Clone, Copy)]
pub struct Cors {
    pub allow_methods: &'static str,
    pub allow_headers: &'static str,
}

/// Custom header carrying the opaque session token.
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
/// Custom header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "X-User-Id";

const MAX_AGE: &str = "86400";

impl Cors {
    pub const AUTH: Cors = Cors {
        allow_methods: "GET, POST, OPTIONS",
        allow_headers: "Content-Type, X-Auth-Token",
    };

    pub const CRUD: Cors = Cors {
        allow_methods: "GET, POST, PUT, DELETE, OPTIONS",
        allow_headers: "Content-Type, X-Auth-Token, X-User-Id",
    };

    pub const READ_ONLY: Cors = Cors {
        allow_methods: "GET, POST, OPTIONS",
        allow_headers: "Content-Type, X-Auth-Token, X-User-Id",
    };

    /// Answer to an `OPTIONS` request.
    pub fn preflight(&self) -> GatewayResponse {
        let headers = [
            ("Access-Control-Allow-Origin", "*"),
            ("Access-Control-Allow-Methods", self.allow_methods),
            ("Access-Control-Allow-Headers", self.allow_headers),
            ("Access-Control-Max-Age", MAX_AGE),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        GatewayResponse {
            status_code: 200,
            headers,
            body: String::new(),
            is_base64_encoded: false,
        }
    }

    /// Create a JSON response with the given status code and data.
    pub fn json<T: Serialize>(&self, status: u16, data: &T) -> Result<GatewayResponse> {
        Ok(self.raw(status, serde_json::to_string(data)?))
    }

    /// Create an `{"error": ...}` response.
    pub fn error(&self, status: u16, message: impl Into<String>) -> GatewayResponse {
        self.raw(status, json!({ "error": message.into() }).to_string())
    }

    /// Turn a handler outcome into an envelope.
    ///
    /// Errors with an explicit status keep it; everything else is logged and
    /// reported as a uniform 500.
    pub fn finish(&self, result: Result<GatewayResponse>) -> GatewayResponse {
        match result {
            Ok(response) => response,
            Err(err) => {
                let status = err.status_code();
                if status >= 500 {
                    error!(error = %err, "Unhandled failure");
                }
                self.error(status, err.public_message())
            }
        }
    }

    fn raw(&self, status: u16, body: String) -> GatewayResponse {
        let headers = [
            ("Content-Type", "application/json"),
            ("Access-Control-Allow-Origin", "*"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        GatewayResponse {
            status_code: status,
            headers,
            body,
            is_base64_encoded: false,
        }
    }
}
