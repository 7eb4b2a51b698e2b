// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TOML configuration.
//!
//! Every field is optional; a missing file or section means defaults.
//! Durations are given in milliseconds.
//!
//! ```toml
//! database = "/var/lib/myhome/myhome.db"
//!
//! [mqtt]
//! url = "mqtt://broker.lan:1883"
//! call_timeout_ms = 5000
//!
//! [limiter]
//! min_interval_ms = 250
//!
//! [server]
//! listen = "0.0.0.0:8080"
//! server_id = "myhome"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::discovery::DiscoveryOptions;
use crate::error::{Error, Result};
use crate::protocol::{
    HttpConfig, MqttBroker, MqttChannelConfig, RateLimiter, RetryPolicy,
};

const fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Top-level configuration file schema
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite database path
    pub database: Option<PathBuf>,
    pub mqtt: MqttSection,
    pub http: HttpSection,
    pub limiter: LimiterSection,
    pub discovery: DiscoverySection,
    pub server: ServerSection,
}

/// `[mqtt]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSection {
    /// Broker URL; resolved via the `mqtt` hostname or mDNS when absent
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id_prefix: String,
    pub keep_alive_ms: u64,
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
    /// Time in-flight calls get to finish on shutdown
    pub grace_period_ms: u64,
    pub mdns_timeout_ms: u64,
    /// Set to false to run without a broker
    pub enabled: bool,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            client_id_prefix: "myhome".to_string(),
            keep_alive_ms: 30_000,
            connect_timeout_ms: 10_000,
            call_timeout_ms: 10_000,
            grace_period_ms: 2_000,
            mdns_timeout_ms: 5_000,
            enabled: true,
        }
    }
}

/// `[http]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSection {
    pub timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
}

impl Default for HttpSection {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            timeout_ms: 10_000,
            initial_backoff_ms: 200,
            max_backoff_ms: 3_000,
            max_attempts: retry.max_attempts(),
        }
    }
}

/// `[limiter]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterSection {
    /// Minimum start-to-start spacing per device; 0 disables
    pub min_interval_ms: u64,
}

impl Default for LimiterSection {
    fn default() -> Self {
        Self {
            min_interval_ms: 250,
        }
    }
}

/// `[discovery]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySection {
    /// Length of one mDNS browse window
    pub browse_ms: u64,
    /// Pause between browse windows in `serve`; 0 disables rediscovery
    pub interval_ms: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            browse_ms: 5_000,
            interval_ms: 300_000,
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub listen: String,
    /// MQTT requests are read from `<server_id>/rpc`
    pub server_id: String,
    pub request_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            server_id: "myhome".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

impl Config {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid TOML or unknown keys.
    pub fn parse(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config = Self::parse(&source)?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Database path, defaulting to `myhome.db` in the working directory.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| PathBuf::from("myhome.db"))
    }

    #[must_use]
    pub fn http_config(&self) -> HttpConfig {
        let retry = RetryPolicy::default()
            .with_initial_backoff(ms(self.http.initial_backoff_ms))
            .with_max_backoff(ms(self.http.max_backoff_ms))
            .with_max_attempts(self.http.max_attempts);
        HttpConfig::new()
            .with_timeout(ms(self.http.timeout_ms))
            .with_retry(retry)
    }

    #[must_use]
    pub fn mqtt_channel_config(&self) -> MqttChannelConfig {
        MqttChannelConfig::default().with_call_timeout(ms(self.mqtt.call_timeout_ms))
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        ms(self.mqtt.grace_period_ms)
    }

    /// Builds the (not yet connected) broker connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] for an invalid broker URL.
    pub fn mqtt_broker(&self) -> Result<MqttBroker> {
        let mut builder = MqttBroker::builder()
            .maybe_url(self.mqtt.url.clone())
            .keep_alive(ms(self.mqtt.keep_alive_ms))
            .connection_timeout(ms(self.mqtt.connect_timeout_ms))
            .mdns_timeout(ms(self.mqtt.mdns_timeout_ms))
            .client_id_prefix(&self.mqtt.client_id_prefix);
        if let Some(username) = &self.mqtt.username {
            builder = builder.credentials(username, self.mqtt.password.clone().unwrap_or_default());
        }
        Ok(builder.build()?)
    }

    #[must_use]
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(ms(self.limiter.min_interval_ms))
    }

    #[must_use]
    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions::new().with_timeout(ms(self.discovery.browse_ms))
    }

    /// Pause between rediscovery rounds, `None` when disabled.
    #[must_use]
    pub fn rediscovery_interval(&self) -> Option<Duration> {
        (self.discovery.interval_ms > 0).then(|| ms(self.discovery.interval_ms))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        ms(self.server.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.limiter.min_interval_ms, 250);
        assert_eq!(config.mqtt.call_timeout_ms, 10_000);
        assert_eq!(config.server.server_id, "myhome");
        assert!(config.mqtt.enabled);
        assert_eq!(config.database_path(), PathBuf::from("myhome.db"));
        assert_eq!(config.http_config().retry().max_attempts(), 4);
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::parse(
            r#"
            database = "/tmp/fleet.db"

            [mqtt]
            url = "mqtt://broker.lan:1884"
            username = "fleet"
            password = "secret"
            call_timeout_ms = 500

            [limiter]
            min_interval_ms = 0

            [discovery]
            interval_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/fleet.db"));
        assert_eq!(config.mqtt_channel_config().call_timeout(), Duration::from_millis(500));
        assert_eq!(config.rate_limiter().min_interval(), Duration::ZERO);
        assert!(config.rediscovery_interval().is_none());

        let broker = config.mqtt_broker().unwrap();
        assert!(broker.has_credentials());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::parse("[mqtt]\nbroker = \"x\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
