// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `myhome` - a control plane for Shelly Gen2 devices.
//!
//! The crate discovers devices on the LAN, keeps a persistent registry of
//! them and dispatches typed RPC calls over whichever transport reaches
//! each device: direct HTTP, or the shared MQTT broker.
//!
//! # Building blocks
//!
//! - [`method`]: typed descriptors for every supported device RPC, sealed
//!   into a [`MethodRegistry`](method::MethodRegistry) at startup
//! - [`protocol`]: the HTTP channel, the MQTT correlator and the
//!   per-device rate limiter
//! - [`device`]: a [`Device`] and the [`Dispatcher`] that routes its calls
//! - [`discovery`]: mDNS browsing for devices and brokers
//! - [`registry`]: the [`Registry`] of known devices, with glob matching
//!   and fan-out
//! - [`server`]: the fleet-level RPC surface over HTTP and MQTT
//!
//! Every operation takes a [`Context`] carrying cancellation and an
//! optional deadline.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use myhome::method::{MethodRegistry, switch};
//! use myhome::protocol::{HttpChannel, HttpConfig, RateLimiter};
//! use myhome::{Channel, Context, DeviceRecord, Dispatcher, Registry};
//!
//! #[tokio::main]
//! async fn main() -> myhome::Result<()> {
//!     let dispatcher = Arc::new(Dispatcher::new(
//!         Arc::new(MethodRegistry::standard()?),
//!         HttpChannel::new(&HttpConfig::new())?,
//!         None,
//!         RateLimiter::new(Duration::from_millis(250)),
//!     ));
//!     let registry = Registry::new(myhome::store::init("myhome.db")?, dispatcher);
//!     registry.load()?;
//!
//!     let device = registry.upsert(
//!         DeviceRecord::new("shellyplus1-a8032ab12345").with_host("192.168.1.50"),
//!     )?;
//!
//!     let ctx = Context::new().with_timeout(Duration::from_secs(5));
//!     let toggled = device
//!         .call::<switch::Toggle>(&ctx, Channel::Default, &switch::SwitchId { id: 0 })
//!         .await?;
//!     println!("was on: {}", toggled.was_on);
//!     Ok(())
//! }
//! ```

pub mod config;
mod context;
pub mod device;
pub mod discovery;
mod error;
pub mod method;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;

pub use config::Config;
pub use context::Context;
pub use device::{Channel, Device, DeviceRecord, Dispatcher};
pub use error::{Error, ErrorKind, ProtocolError, Result};
pub use registry::Registry;
pub use server::RpcServer;
