// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `myhome` control plane.
//!
//! Every failure a caller can observe maps onto one [`ErrorKind`]. Lower
//! layers (HTTP, MQTT) report a [`ProtocolError`], which the dispatcher
//! surfaces as [`Error::Transport`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// No descriptor is registered under this method name.
    #[error("unknown method: {0}")]
    MethodUnknown(String),

    /// Parameters failed to decode or validate.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An identifier or pattern matched nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// No transport is currently viable for the device.
    #[error("device {0} is unreachable")]
    Unreachable(String),

    /// HTTP failed after retries, or the MQTT connection went away.
    #[error("transport error: {0}")]
    Transport(#[from] ProtocolError),

    /// The deadline elapsed before a response arrived.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// The caller's context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The device answered with an error envelope.
    #[error("device error {code}: {message}")]
    Remote {
        /// Error code reported by the device.
        code: i64,
        /// Error message reported by the device.
        message: String,
    },

    /// The persistent store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An invariant of the dispatcher itself was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Fieldless classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::MethodUnknown`].
    MethodUnknown,
    /// See [`Error::BadRequest`].
    BadRequest,
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::Unreachable`].
    Unreachable,
    /// See [`Error::Transport`].
    Transport,
    /// See [`Error::Timeout`].
    Timeout,
    /// See [`Error::Cancelled`].
    Cancelled,
    /// See [`Error::Remote`].
    Remote,
    /// See [`Error::Storage`] and [`Error::Config`] and [`Error::Internal`].
    Internal,
}

impl ErrorKind {
    /// Returns the numeric code used in RPC error envelopes.
    ///
    /// JSON-RPC reserved codes are used where one fits, HTTP-like codes
    /// otherwise.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::MethodUnknown => -32601,
            Self::BadRequest => -32602,
            Self::Internal => -32603,
            Self::NotFound => 404,
            Self::Cancelled => 499,
            Self::Transport => 502,
            Self::Unreachable => 503,
            Self::Timeout => 504,
            Self::Remote => -32000,
        }
    }
}

impl Error {
    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MethodUnknown(_) => ErrorKind::MethodUnknown,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unreachable(_) => ErrorKind::Unreachable,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Storage(_) | Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the code to put in an error envelope.
    ///
    /// Remote errors keep the device's own code.
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::Remote { code, .. } => *code,
            other => other.kind().code(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Errors related to transport communication (HTTP/MQTT).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The device answered with a non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The response body, possibly truncated.
        body: String,
    },

    /// MQTT client request failed.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Connection to the broker or device failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid URL or address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Internal channel was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
