// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! mDNS discovery of Shelly devices and MQTT brokers.
//!
//! # Discovery Mechanism
//!
//! Two browsers run in parallel for one browse window:
//!
//! - `_shelly._tcp.local.` - Gen2+ devices. The hostname
//!   `<model>-<serial>.local.` gives the device id; TXT records `gen`,
//!   `app` and `ver` give generation, application and firmware.
//! - `_mqtt._tcp.local.` - MQTT brokers on the LAN.
//!
//! Announcements are deduplicated by IPv4 address within one window.
//! Discovery is advisory: it feeds [`Registry::observe`], which only ever
//! adds devices or updates their host and last-seen time.
//!
//! # Examples
//!
//! ```no_run
//! use futures::StreamExt;
//! use myhome::Context;
//! use myhome::discovery::{DiscoveryOptions, discover};
//! use std::time::Duration;
//!
//! # async fn example() -> myhome::Result<()> {
//! let options = DiscoveryOptions::new().with_timeout(Duration::from_secs(3));
//! let mut candidates = discover(&Context::new(), &options)?;
//! while let Some(candidate) = candidates.next().await {
//!     println!("{} at {}", candidate.id, candidate.host);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`Registry::observe`]: crate::registry::Registry::observe

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::Context;
use crate::error::{Error, ProtocolError, Result};

/// Service type Shelly Gen2+ devices announce.
pub const SHELLY_SERVICE: &str = "_shelly._tcp.local.";

/// Service type MQTT brokers announce.
pub const MQTT_SERVICE: &str = "_mqtt._tcp.local.";

/// Default browse window.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for one discovery run.
///
/// # Examples
///
/// ```
/// use myhome::discovery::DiscoveryOptions;
/// use std::time::Duration;
///
/// let options = DiscoveryOptions::new()
///     .with_timeout(Duration::from_secs(10))
///     .without_brokers();
/// assert_eq!(options.timeout(), Duration::from_secs(10));
/// assert!(!options.include_brokers());
/// ```
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    timeout: Option<Duration>,
    include_brokers: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            include_brokers: true,
        }
    }
}

impl DiscoveryOptions {
    /// Creates options with a 5 second window, browsing both services.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the browse window.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Only browse for Shelly devices.
    #[must_use]
    pub fn without_brokers(mut self) -> Self {
        self.include_brokers = false;
        self
    }

    /// Returns the browse window.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_DISCOVERY_TIMEOUT)
    }

    /// Returns whether MQTT brokers are browsed too.
    #[must_use]
    pub fn include_brokers(&self) -> bool {
        self.include_brokers
    }
}

/// Which announcement produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// A Shelly device.
    Shelly,
    /// An MQTT broker.
    Mqtt,
}

/// Something seen on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCandidate {
    /// Announcement kind.
    pub kind: ServiceKind,
    /// Device id derived from the hostname, e.g. `shellyplus1-a8032ab12345`.
    pub id: String,
    /// Model part of the hostname.
    pub model: String,
    /// Serial (MAC) part of the hostname.
    pub serial: String,
    /// IPv4 address.
    pub host: Ipv4Addr,
    /// Announced port.
    pub port: u16,
    /// TXT `gen`.
    pub generation: Option<u32>,
    /// TXT `app`.
    pub app: Option<String>,
    /// TXT `ver`.
    pub version: Option<String>,
    /// When the announcement was resolved.
    pub seen_at: DateTime<Utc>,
}

/// Splits `<model>-<serial>.local.` into model and serial.
///
/// # Examples
///
/// ```
/// use myhome::discovery::parse_hostname;
///
/// assert_eq!(
///     parse_hostname("ShellyPlus1-A8032AB12345.local."),
///     Some(("shellyplus1".to_string(), "a8032ab12345".to_string()))
/// );
/// assert_eq!(parse_hostname("router.local."), None);
/// ```
#[must_use]
pub fn parse_hostname(hostname: &str) -> Option<(String, String)> {
    let stem = hostname
        .trim_end_matches('.')
        .trim_end_matches(".local")
        .to_lowercase();
    let (model, serial) = stem.rsplit_once('-')?;
    if model.is_empty() || serial.is_empty() {
        return None;
    }
    Some((model.to_string(), serial.to_string()))
}

impl DeviceCandidate {
    fn from_service(kind: ServiceKind, info: &ServiceInfo) -> Option<Self> {
        let host = info.get_addresses().iter().find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })?;
        let hostname = info.get_hostname();
        let (model, serial) = match (kind, parse_hostname(hostname)) {
            (_, Some(parts)) => parts,
            (ServiceKind::Mqtt, None) => (
                hostname.trim_end_matches('.').to_string(),
                String::new(),
            ),
            (ServiceKind::Shelly, None) => {
                tracing::debug!(hostname = %hostname, "Shelly announcement without <model>-<serial> hostname");
                return None;
            }
        };
        let id = if serial.is_empty() {
            model.clone()
        } else {
            format!("{model}-{serial}")
        };

        Some(Self {
            kind,
            id,
            model,
            serial,
            host,
            port: info.get_port(),
            generation: info
                .get_property_val_str("gen")
                .and_then(|g| g.parse().ok()),
            app: info.get_property_val_str("app").map(str::to_string),
            version: info.get_property_val_str("ver").map(str::to_string),
            seen_at: Utc::now(),
        })
    }
}

fn mdns_error(e: &mdns_sd::Error) -> Error {
    ProtocolError::ConnectionFailed(format!("mDNS: {e}")).into()
}

/// Browses the LAN for one window and streams what it finds.
///
/// The stream ends when the window closes or `ctx` is cancelled.
///
/// # Errors
///
/// Returns [`Error::Transport`] if the mDNS daemon cannot start.
pub fn discover(
    ctx: &Context,
    options: &DiscoveryOptions,
) -> Result<impl Stream<Item = DeviceCandidate> + Send + 'static> {
    let daemon = ServiceDaemon::new().map_err(|e| mdns_error(&e))?;
    let shelly = daemon.browse(SHELLY_SERVICE).map_err(|e| mdns_error(&e))?;
    let brokers = if options.include_brokers() {
        Some(daemon.browse(MQTT_SERVICE).map_err(|e| mdns_error(&e))?)
    } else {
        None
    };

    let (tx, mut rx) = mpsc::channel(64);
    let window = options.timeout();
    let ctx = ctx.child();
    let seen: Arc<Mutex<HashSet<(ServiceKind, Ipv4Addr)>>> = Arc::default();

    tokio::spawn(async move {
        tracing::debug!(window_ms = window.as_millis(), "mDNS browse started");

        let forward = |kind: ServiceKind, event: ServiceEvent| {
            let ServiceEvent::ServiceResolved(info) = event else {
                return None;
            };
            let candidate = DeviceCandidate::from_service(kind, &info)?;
            if !seen.lock().insert((kind, candidate.host)) {
                return None;
            }
            tracing::debug!(
                kind = ?kind,
                id = %candidate.id,
                host = %candidate.host,
                "Discovered"
            );
            Some(candidate)
        };

        let browse_shelly = async {
            while let Ok(event) = shelly.recv_async().await {
                if let Some(candidate) = forward(ServiceKind::Shelly, event)
                    && tx.send(candidate).await.is_err()
                {
                    break;
                }
            }
        };
        let browse_brokers = async {
            let Some(brokers) = brokers.as_ref() else {
                return;
            };
            while let Ok(event) = brokers.recv_async().await {
                if let Some(candidate) = forward(ServiceKind::Mqtt, event)
                    && tx.send(candidate).await.is_err()
                {
                    break;
                }
            }
        };

        tokio::select! {
            () = ctx.cancelled() => {}
            () = tokio::time::sleep(window) => {}
            _ = futures::future::join(browse_shelly, browse_brokers) => {}
        }

        if let Err(e) = daemon.shutdown() {
            tracing::debug!(error = %e, "mDNS daemon shutdown failed");
        }
        tracing::debug!(found = seen.lock().len(), "mDNS browse finished");
    });

    Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
}

/// Runs [`discover`] to completion and returns everything found.
///
/// # Errors
///
/// See [`discover`].
pub async fn discover_all(ctx: &Context, options: &DiscoveryOptions) -> Result<Vec<DeviceCandidate>> {
    use futures::StreamExt;

    Ok(discover(ctx, options)?.collect().await)
}

/// Looks for an MQTT broker over mDNS and returns its address.
pub async fn resolve_broker_via_mdns(timeout: Duration) -> Option<(String, u16)> {
    use futures::StreamExt;

    let ctx = Context::new();
    let options = DiscoveryOptions::new().with_timeout(timeout);
    let stream = match discover(&ctx, &options) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(error = %e, "mDNS broker lookup unavailable");
            return None;
        }
    };
    let broker = stream
        .filter(|c| futures::future::ready(c.kind == ServiceKind::Mqtt))
        .boxed()
        .next()
        .await;
    ctx.cancel();

    broker.map(|c| {
        tracing::info!(broker = %c.host, port = c.port, "Found MQTT broker over mDNS");
        (c.host.to_string(), c.port)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn service(ty: &str, instance: &str, hostname: &str, ip: &str, txt: &[(&str, &str)]) -> ServiceInfo {
        let properties: HashMap<String, String> = txt
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServiceInfo::new(ty, instance, hostname, ip, 80, properties).unwrap()
    }

    #[test]
    fn options_default() {
        let options = DiscoveryOptions::default();
        assert_eq!(options.timeout(), Duration::from_secs(5));
        assert!(options.include_brokers());
    }

    #[test]
    fn hostname_without_serial() {
        assert_eq!(parse_hostname("shellyplus1-.local."), None);
        assert_eq!(parse_hostname("-abc.local."), None);
    }

    #[test]
    fn candidate_from_shelly_announcement() {
        let info = service(
            SHELLY_SERVICE,
            "shellyplus1-a8032ab12345",
            "ShellyPlus1-A8032AB12345.local.",
            "192.0.2.10",
            &[("gen", "2"), ("app", "Plus1"), ("ver", "1.4.2")],
        );
        let candidate = DeviceCandidate::from_service(ServiceKind::Shelly, &info).unwrap();
        assert_eq!(candidate.id, "shellyplus1-a8032ab12345");
        assert_eq!(candidate.host, Ipv4Addr::new(192, 0, 2, 10));
        assert_eq!(candidate.generation, Some(2));
        assert_eq!(candidate.app.as_deref(), Some("Plus1"));
        assert_eq!(candidate.version.as_deref(), Some("1.4.2"));
    }

    #[test]
    fn shelly_announcement_with_odd_hostname_is_skipped() {
        let info = service(SHELLY_SERVICE, "thing", "thing.local.", "192.0.2.11", &[]);
        assert!(DeviceCandidate::from_service(ServiceKind::Shelly, &info).is_none());
    }

    #[test]
    fn broker_announcement_keeps_plain_hostname() {
        let info = service(MQTT_SERVICE, "mosquitto", "nas.local.", "192.0.2.2", &[]);
        let candidate = DeviceCandidate::from_service(ServiceKind::Mqtt, &info).unwrap();
        assert_eq!(candidate.kind, ServiceKind::Mqtt);
        assert_eq!(candidate.id, "nas.local");
        assert_eq!(candidate.port, 80);
    }
}
