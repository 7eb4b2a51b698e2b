// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use myhome::discovery::{self, DiscoveryOptions};
use myhome::method::MethodRegistry;
use myhome::protocol::{HttpChannel, MqttChannel, MqttTransport};
use myhome::server::{serve_http, serve_mqtt};
use myhome::{Config, Context, DeviceRecord, Dispatcher, Registry, RpcServer};

/// myhome - control plane for Shelly devices
#[derive(Parser)]
#[command(name = "myhome", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "MYHOME_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, env = "MYHOME_DB")]
    db: Option<PathBuf>,

    /// MQTT broker URL
    #[arg(long, env = "MYHOME_MQTT_URL")]
    mqtt_url: Option<String>,

    /// MQTT username
    #[arg(long, env = "MYHOME_MQTT_USER")]
    mqtt_user: Option<String>,

    /// MQTT password
    #[arg(long, env = "MYHOME_MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    /// Run without an MQTT broker
    #[arg(long)]
    no_mqtt: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the fleet RPC API over HTTP and MQTT
    Serve {
        /// Address for the HTTP API
        #[arg(long, env = "MYHOME_HTTP_LISTEN")]
        listen: Option<String>,

        /// MQTT server id; requests are read from `<id>/rpc`
        #[arg(long, env = "MYHOME_SERVER_ID")]
        server_id: Option<String>,
    },
    /// Browse the LAN once and print what answers
    Discover {
        /// Browse window in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,

        /// Store discovered devices in the registry
        #[arg(long)]
        save: bool,
    },
    /// Import devices from a JSON array of records
    Import {
        /// JSON file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,myhome=info",
        1 => "info,myhome=debug",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(db) = &cli.db {
        config.database = Some(db.clone());
    }
    if let Some(url) = &cli.mqtt_url {
        config.mqtt.url = Some(url.clone());
    }
    if let Some(user) = &cli.mqtt_user {
        config.mqtt.username = Some(user.clone());
    }
    if let Some(password) = &cli.mqtt_password {
        config.mqtt.password = Some(password.clone());
    }
    if cli.no_mqtt {
        config.mqtt.enabled = false;
    }
    if let Command::Serve { listen, server_id } = &cli.command {
        if let Some(listen) = listen {
            config.server.listen.clone_from(listen);
        }
        if let Some(server_id) = server_id {
            config.server.server_id.clone_from(server_id);
        }
    }
    Ok(config)
}

/// Process-wide resources.
struct Runtime {
    registry: Arc<Registry>,
    broker: Option<Arc<dyn MqttTransport>>,
}

fn build(config: &Config) -> anyhow::Result<Runtime> {
    let pool = myhome::store::init(config.database_path())
        .with_context(|| format!("opening {}", config.database_path().display()))?;
    let methods = Arc::new(MethodRegistry::standard()?);
    let http = HttpChannel::new(&config.http_config())?;

    let broker: Option<Arc<dyn MqttTransport>> = if config.mqtt.enabled {
        Some(Arc::new(config.mqtt_broker()?) as Arc<dyn MqttTransport>)
    } else {
        None
    };
    let mqtt = broker
        .as_ref()
        .map(|b| MqttChannel::new(Arc::clone(b), config.mqtt_channel_config()));

    let dispatcher = Arc::new(Dispatcher::new(methods, http, mqtt, config.rate_limiter()));
    let registry = Arc::new(Registry::new(pool, dispatcher));
    registry.load()?;
    Ok(Runtime { registry, broker })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Serve { .. } => serve(&config).await,
        Command::Discover { timeout, save } => discover(&config, timeout, save).await,
        Command::Import { path } => import(&config, &path),
    }
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    let runtime = build(config)?;
    let ctx = Context::new();

    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
        }
        shutdown.cancel();
    });

    let server = RpcServer::new(Arc::clone(&runtime.registry))
        .with_request_timeout(config.request_timeout());

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    let http = tokio::spawn(serve_http(listener, server.clone(), ctx.clone()));

    if let Some(broker) = &runtime.broker {
        let broker = Arc::clone(broker);
        let server = server.clone();
        let server_id = config.server.server_id.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_mqtt(broker, server, &server_id, ctx).await {
                tracing::warn!(error = %e, "MQTT server unavailable");
            }
        });
    }

    if let Some(interval) = config.rediscovery_interval() {
        let registry = Arc::clone(&runtime.registry);
        let options = config.discovery_options();
        let ctx = ctx.clone();
        tokio::spawn(rediscover(registry, options, interval, ctx));
    }

    tracing::info!(
        devices = runtime.registry.len(),
        listen = %config.server.listen,
        "myhome ready"
    );
    ctx.cancelled().await;

    if let Some(mqtt) = runtime.registry.dispatcher().mqtt() {
        mqtt.close(config.grace_period()).await?;
    }
    http.await??;
    Ok(())
}

/// Re-runs discovery so devices whose address changed become reachable
/// over HTTP again.
async fn rediscover(
    registry: Arc<Registry>,
    options: DiscoveryOptions,
    interval: Duration,
    ctx: Context,
) {
    loop {
        match discovery::discover(&ctx, &options) {
            Ok(mut candidates) => {
                let mut seen = 0_usize;
                while let Some(candidate) = candidates.next().await {
                    match registry.observe(&candidate) {
                        Ok(Some(_)) => seen += 1,
                        Ok(None) => {}
                        Err(e) => tracing::warn!(device = %candidate.id, error = %e, "Failed to record device"),
                    }
                }
                tracing::debug!(devices = seen, "Rediscovery round finished");
            }
            Err(e) => tracing::warn!(error = %e, "Rediscovery failed"),
        }
        if ctx.sleep(interval).await.is_err() {
            return;
        }
    }
}

async fn discover(config: &Config, timeout: u64, save: bool) -> anyhow::Result<()> {
    let options = config
        .discovery_options()
        .with_timeout(Duration::from_secs(timeout));
    let candidates = discovery::discover_all(&Context::new(), &options).await?;

    let registry = if save {
        Some(build(config)?.registry)
    } else {
        None
    };
    for candidate in &candidates {
        println!("{}", serde_json::to_string(candidate)?);
        if let Some(registry) = &registry {
            registry.observe(candidate)?;
        }
    }
    tracing::info!(found = candidates.len(), "Discovery finished");
    Ok(())
}

fn import(config: &Config, path: &std::path::Path) -> anyhow::Result<()> {
    let source =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let records: Vec<DeviceRecord> =
        serde_json::from_str(&source).with_context(|| format!("parsing {}", path.display()))?;
    let runtime = build(config)?;
    let ids = runtime.registry.import(records)?;
    for id in ids {
        println!("{id}");
    }
    Ok(())
}
