// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT surface: requests on `<server_id>/rpc`, replies on `<src>/rpc`.

use std::sync::Arc;

use super::RpcServer;
use crate::context::Context;
use crate::error::{ProtocolError, Result};
use crate::protocol::MqttTransport;

/// Serves requests published on `<server_id>/rpc` until `ctx` is
/// cancelled or the subscription ends.
///
/// Each request is handled in its own task. Requests without `src` are
/// handled but not answered.
///
/// # Errors
///
/// Returns [`Error::Transport`](crate::Error::Transport) if connecting or
/// subscribing fails, or when the subscription is lost.
pub async fn serve_mqtt(
    transport: Arc<dyn MqttTransport>,
    server: RpcServer,
    server_id: &str,
    ctx: Context,
) -> Result<()> {
    let topic = format!("{server_id}/rpc");
    transport.connect().await?;
    let mut requests = transport.subscribe(&topic).await?;
    tracing::info!(topic = %topic, "MQTT server listening");

    loop {
        let message = tokio::select! {
            () = ctx.cancelled() => break,
            message = requests.recv() => match message {
                Some(message) => message,
                None => {
                    tracing::warn!(topic = %topic, "MQTT server subscription ended");
                    return Err(ProtocolError::ChannelClosed(topic).into());
                }
            },
        };

        let transport = Arc::clone(&transport);
        let server = server.clone();
        let ctx = ctx.child();
        tokio::spawn(async move {
            let (src, response) = server.handle_bytes(&ctx, &message.payload).await;
            let Some(src) = src.filter(|s| !s.is_empty()) else {
                tracing::debug!("Dropping reply to request without src");
                return;
            };
            let payload = match serde_json::to_vec(&response) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode MQTT reply");
                    return;
                }
            };
            if let Err(e) = transport.publish(&format!("{src}/rpc"), payload).await {
                tracing::warn!(src = %src, error = %e, "Failed to publish MQTT reply");
            }
        });
    }

    tracing::info!(topic = %topic, "MQTT server stopped");
    Ok(())
}
