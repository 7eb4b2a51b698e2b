// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet-level RPC surface.
//!
//! Requests are `{id, src?, method, params}` envelopes; replies are
//! `{id, result}` or `{id, error: {code, message}}`. The same
//! [`RpcServer`] backs both the HTTP endpoint (`POST /rpc`) and the MQTT
//! topic `<server_id>/rpc`.
//!
//! Methods live in five namespaces: `device.*`, `group.*`, `switch.*`,
//! `temperature.*` and `room.*`. A method taking an identifier accepts
//! either one device (id, name, host or MAC), answered with a single
//! result, or a glob, answered with a map from device id to
//! `{result}` / `{error}`.

mod handlers;
mod http;
mod mqtt;

pub use http::{router, serve_http};
pub use mqtt::serve_mqtt;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::registry::Registry;

/// Default budget for one server request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen id echoed in the response.
    #[serde(default)]
    pub id: Value,
    /// Reply address for the MQTT surface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Value::Null,
            src: None,
            method: method.into(),
            params,
        }
    }
}

/// Error member of a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        let message = match err {
            Error::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            code: err.code(),
            message,
        }
    }
}

/// Outbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn from_result(id: Value, result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self {
                id,
                result: Some(value),
                error: None,
            },
            Err(err) => Self {
                id,
                result: None,
                error: Some(ErrorBody::from(&err)),
            },
        }
    }

    /// Returns the error, if the call failed.
    #[must_use]
    pub fn error(&self) -> Option<&ErrorBody> {
        self.error.as_ref()
    }
}

/// Handles fleet-level requests against a [`Registry`].
#[derive(Debug, Clone)]
pub struct RpcServer {
    registry: Arc<Registry>,
    request_timeout: Duration,
}

impl RpcServer {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the per-request budget.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handles one request under a child of `ctx` bounded by the request
    /// timeout. Never fails: errors travel inside the envelope.
    pub async fn handle(&self, ctx: &Context, request: Request) -> Response {
        let ctx = ctx.child().with_timeout(self.request_timeout);
        let Request {
            id, method, params, ..
        } = request;

        tracing::debug!(method = %method, "Server request");
        let result = handlers::dispatch(self, &ctx, &method, params).await;
        if let Err(e) = &result {
            tracing::debug!(method = %method, error = %e, "Server request failed");
        }
        Response::from_result(id, result)
    }

    /// Parses a raw envelope and handles it. Malformed JSON is answered
    /// with a `BadRequest` envelope carrying a null id.
    pub async fn handle_bytes(&self, ctx: &Context, payload: &[u8]) -> (Option<String>, Response) {
        match serde_json::from_slice::<Request>(payload) {
            Ok(request) => {
                let src = request.src.clone();
                (src, self.handle(ctx, request).await)
            }
            Err(e) => (
                None,
                Response::from_result(
                    Value::Null,
                    Err(Error::BadRequest(format!("malformed envelope: {e}"))),
                ),
            ),
        }
    }
}

/// Decodes params, treating `null` as `{}`.
fn decode<T: DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| Error::BadRequest(format!("{method}: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults() {
        let request: Request = serde_json::from_str(r#"{"method":"device.match"}"#).unwrap();
        assert_eq!(request.id, Value::Null);
        assert!(request.src.is_none());
        assert!(request.params.is_null());
    }

    #[test]
    fn response_carries_either_result_or_error() {
        let ok = Response::from_result(Value::from(7), Ok(Value::from(true)));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"id": 7, "result": true})
        );

        let err = Response::from_result(Value::from(8), Err(Error::NotFound("lamp".into())));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({"id": 8, "error": {"code": 404, "message": "not found: lamp"}})
        );
    }

    #[test]
    fn remote_error_keeps_device_code_and_message() {
        let body = ErrorBody::from(&Error::Remote {
            code: -103,
            message: "Invalid argument".to_string(),
        });
        assert_eq!(body.code, -103);
        assert_eq!(body.message, "Invalid argument");
    }

    #[test]
    fn decode_null_as_empty_object() {
        #[derive(Deserialize)]
        struct P {
            #[serde(default)]
            pattern: Option<String>,
        }
        let p: P = decode("x", Value::Null).unwrap();
        assert!(p.pattern.is_none());
        assert!(matches!(
            decode::<P>("x", serde_json::json!({"pattern": 3})),
            Err(Error::BadRequest(_))
        ));
    }
}
