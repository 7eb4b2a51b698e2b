// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Direct HTTP RPC to Shelly devices.
//!
//! Requests go to `http://<host>/rpc/<Method>`. Methods with a
//! [`Verb::Get`] hint send their params as query parameters, each value
//! JSON-encoded; all others POST a JSON body.

use std::net::Ipv6Addr;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::context::Context;
use crate::device::Device;
use crate::error::{Error, ProtocolError, Result};
use crate::method::{Descriptor, ResultSlot, Verb};

/// Exponential backoff for retryable HTTP failures.
///
/// # Examples
///
/// ```
/// use myhome::protocol::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.backoff(0), Duration::from_millis(200));
/// assert_eq!(policy.backoff(1), Duration::from_millis(400));
/// assert_eq!(policy.backoff(10), Duration::from_secs(3));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    initial_backoff: Duration,
    max_backoff: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Self::DEFAULT_INITIAL_BACKOFF,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Default delay before the first retry.
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);
    /// Default cap on any single backoff delay.
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(3);
    /// Default number of attempts, the first one included.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Sets the cap on any single backoff delay. A `Retry-After` sent by
    /// the device is honored as given and bounded only by the call deadline.
    #[must_use]
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Sets the total number of attempts. At least one is always made.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Returns the total number of attempts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay after the given zero-based failed attempt.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Configuration for the HTTP channel.
///
/// # Examples
///
/// ```
/// use myhome::protocol::{HttpConfig, RetryPolicy};
/// use std::time::Duration;
///
/// let config = HttpConfig::new()
///     .with_timeout(Duration::from_secs(5))
///     .with_retry(RetryPolicy::default().with_max_attempts(2));
/// assert_eq!(config.timeout(), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    timeout: Option<Duration>,
    retry: RetryPolicy,
}

impl HttpConfig {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(Self::DEFAULT_TIMEOUT)
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }
}

/// Error body Shelly returns with 4xx/5xx statuses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    message: String,
}

enum Attempt {
    Done(Value),
    Retry {
        error: ProtocolError,
        after: Option<Duration>,
    },
    Fail(Error),
}

/// HTTP transport to Shelly devices.
#[derive(Debug, Clone)]
pub struct HttpChannel {
    client: Client,
    retry: RetryPolicy,
}

impl HttpChannel {
    /// Creates a channel from its configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn new(config: &HttpConfig) -> std::result::Result<Self, ProtocolError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(ProtocolError::Http)?;
        Ok(Self {
            client,
            retry: config.retry(),
        })
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Builds `http://<host>/rpc/<method>`, bracketing IPv6 literals.
    ///
    /// # Examples
    ///
    /// ```
    /// use myhome::protocol::HttpChannel;
    ///
    /// assert_eq!(
    ///     HttpChannel::rpc_url("192.0.2.10", "Switch.Toggle"),
    ///     "http://192.0.2.10/rpc/Switch.Toggle"
    /// );
    /// assert_eq!(
    ///     HttpChannel::rpc_url("fe80::1", "Shelly.GetStatus"),
    ///     "http://[fe80::1]/rpc/Shelly.GetStatus"
    /// );
    /// ```
    #[must_use]
    pub fn rpc_url(host: &str, method: &str) -> String {
        if host.parse::<Ipv6Addr>().is_ok() {
            format!("http://[{host}]/rpc/{method}")
        } else {
            format!("http://{host}/rpc/{method}")
        }
    }

    /// Encodes params as a query string: each top-level field becomes one
    /// parameter whose value is the field's JSON encoding.
    ///
    /// # Examples
    ///
    /// ```
    /// use myhome::protocol::HttpChannel;
    ///
    /// let query = HttpChannel::query_string(&serde_json::json!({"id": 0, "key": "room"}));
    /// assert_eq!(query, "id=0&key=%22room%22");
    /// ```
    #[must_use]
    pub fn query_string(params: &Value) -> String {
        let Value::Object(fields) = params else {
            return String::new();
        };
        fields
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(&value.to_string())
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Calls `descriptor` on `device` and decodes the answer into a fresh
    /// container.
    ///
    /// Transport errors, 5xx and 429 are retried per the [`RetryPolicy`].
    /// When every attempt failed the device's host is cleared so that the
    /// next call falls back to MQTT.
    ///
    /// # Errors
    ///
    /// - [`Error::Unreachable`] if the device has no host
    /// - [`Error::Transport`] once retries are exhausted
    /// - [`Error::Remote`] for a 4xx other than 429
    /// - [`Error::Timeout`] / [`Error::Cancelled`] from `ctx`
    pub async fn call(
        &self,
        ctx: &Context,
        device: &Device,
        descriptor: &Descriptor,
        params: &Value,
    ) -> Result<Box<dyn ResultSlot>> {
        let host = device.host();
        if host.is_empty() {
            return Err(Error::Unreachable(device.id()));
        }
        let url = Self::rpc_url(&host, descriptor.name());

        let attempts = self.call_with_retry(ctx, &url, descriptor, params);
        let outcome = match ctx.deadline() {
            Some(deadline) => {
                let budget = deadline.saturating_duration_since(tokio::time::Instant::now());
                tokio::time::timeout_at(deadline, attempts)
                    .await
                    .map_err(|_| Error::Timeout(u64::try_from(budget.as_millis()).unwrap_or(u64::MAX)))?
            }
            None => attempts.await,
        };

        match outcome {
            Ok(value) => descriptor.decode(value),
            Err(Error::Transport(e)) => {
                tracing::warn!(
                    device = %device.id(),
                    host = %host,
                    method = descriptor.name(),
                    error = %e,
                    "HTTP retries exhausted, clearing host"
                );
                device.clear_host();
                Err(Error::Transport(e))
            }
            Err(e) => Err(e),
        }
    }

    async fn call_with_retry(
        &self,
        ctx: &Context,
        url: &str,
        descriptor: &Descriptor,
        params: &Value,
    ) -> Result<Value> {
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            let outcome = tokio::select! {
                () = ctx.cancelled() => return Err(Error::Cancelled),
                outcome = self.attempt(url, descriptor.verb(), params) => outcome,
            };

            match outcome {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fail(e) => return Err(e),
                Attempt::Retry { error, after } => {
                    let delay = after.unwrap_or_else(|| self.retry.backoff(attempt));
                    tracing::debug!(
                        url = %url,
                        attempt = attempt + 1,
                        error = %error,
                        delay_ms = delay.as_millis(),
                        "HTTP attempt failed"
                    );
                    last_error = Some(error);
                    if attempt + 1 < self.retry.max_attempts {
                        ctx.sleep(delay).await?;
                    }
                }
            }
        }

        Err(Error::Transport(last_error.unwrap_or_else(|| {
            ProtocolError::ConnectionFailed(format!("no attempt made for {url}"))
        })))
    }

    async fn attempt(&self, url: &str, verb: Verb, params: &Value) -> Attempt {
        let request = match verb {
            Verb::Get => {
                let query = Self::query_string(params);
                if query.is_empty() {
                    self.client.get(url)
                } else {
                    self.client.get(format!("{url}?{query}"))
                }
            }
            Verb::Post => self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(params.to_string()),
        };

        tracing::debug!(url = %url, ?verb, "Sending HTTP RPC");
        match request.send().await {
            Ok(response) => Self::classify(response).await,
            Err(e) => Attempt::Retry {
                error: ProtocolError::Http(e),
                after: None,
            },
        }
    }

    async fn classify(response: Response) -> Attempt {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Attempt::Retry {
                    error: ProtocolError::Http(e),
                    after: None,
                };
            }
        };

        if status.is_success() {
            if body.trim().is_empty() {
                return Attempt::Done(Value::Null);
            }
            return match serde_json::from_str(&body) {
                Ok(value) => Attempt::Done(value),
                Err(e) => Attempt::Fail(Error::Internal(format!("malformed RPC response: {e}"))),
            };
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Attempt::Retry {
                error: ProtocolError::Status {
                    status: status.as_u16(),
                    body,
                },
                after: retry_after,
            };
        }

        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => Attempt::Fail(Error::Remote {
                code: err.code,
                message: err.message,
            }),
            Err(_) => Attempt::Fail(Error::Remote {
                code: i64::from(status.as_u16()),
                message: if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            }),
        }
    }
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP-date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(40), Duration::from_secs(3));
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts(), 1);
    }

    #[test]
    fn rpc_url_with_port() {
        assert_eq!(
            HttpChannel::rpc_url("127.0.0.1:8080", "Shelly.GetDeviceInfo"),
            "http://127.0.0.1:8080/rpc/Shelly.GetDeviceInfo"
        );
    }

    #[test]
    fn query_string_of_non_object_is_empty() {
        assert_eq!(HttpChannel::query_string(&Value::Null), "");
        assert_eq!(HttpChannel::query_string(&serde_json::json!({})), "");
    }

    #[test]
    fn query_string_encodes_nested_values() {
        let query = HttpChannel::query_string(&serde_json::json!({"include": ["status"]}));
        assert_eq!(query, "include=%5B%22status%22%5D");
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_http_date_in_past() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn retry_after_garbage() {
        assert_eq!(parse_retry_after("soon"), None);
    }
}
