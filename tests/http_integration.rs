// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP integration tests using wiremock as a stand-in Shelly device.

use std::sync::Arc;
use std::time::{Duration, Instant};

use myhome::method::{MethodRegistry, switch};
use myhome::protocol::{
    HttpChannel, HttpConfig, MemoryBroker, MqttChannel, MqttChannelConfig, MqttTransport,
    RateLimiter, RetryPolicy,
};
use myhome::server::{Request, Response};
use myhome::{Channel, Context, DeviceRecord, Dispatcher, Error, Registry, RpcServer};
use serde_json::{Value, json};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_http() -> HttpChannel {
    let retry = RetryPolicy::default()
        .with_initial_backoff(Duration::from_millis(10))
        .with_max_backoff(Duration::from_millis(20));
    HttpChannel::new(&HttpConfig::new().with_timeout(Duration::from_secs(2)).with_retry(retry))
        .unwrap()
}

fn registry(mqtt: Option<MqttChannel>) -> Arc<Registry> {
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(MethodRegistry::standard().unwrap()),
        fast_http(),
        mqtt,
        RateLimiter::new(Duration::ZERO),
    ));
    Arc::new(Registry::new(myhome::store::init_memory().unwrap(), dispatcher))
}

/// `host:port` of a mock server, the way a device host is stored.
fn host_of(server: &MockServer) -> String {
    server.uri().replace("http://", "")
}

/// A port nothing listens on.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn call(server: &RpcServer, method: &str, params: Value) -> Response {
    server
        .handle(&Context::new(), Request::new(method, params))
        .await
}

// ============================================================================
// HTTP Channel Tests
// ============================================================================

mod http_channel {
    use super::*;

    #[tokio::test]
    async fn toggle_posts_json_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .and(body_json(json!({"id": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"was_on": false})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        registry
            .upsert(DeviceRecord::new("shellyplus1-a8032ab12345").with_host(host_of(&mock_server)))
            .unwrap();
        let server = RpcServer::new(registry);

        let response = call(
            &server,
            "switch.toggle",
            json!({"identifier": "shellyplus1-a8032ab12345"}),
        )
        .await;
        assert!(response.error().is_none(), "{response:?}");
        assert_eq!(response.result, Some(json!({"was_on": false})));
    }

    #[tokio::test]
    async fn get_status_uses_query_string() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rpc/Switch.GetStatus"))
            .and(query_param("id", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 1,
                "source": "WS_in",
                "output": true,
                "apower": 8.9,
                "temperature": {"tC": 41.2}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        let device = registry
            .upsert(DeviceRecord::new("shellypro2-0cb815fcaff4").with_host(host_of(&mock_server)))
            .unwrap();

        let status = device
            .call::<switch::GetStatus>(&Context::new(), Channel::Http, &switch::SwitchId { id: 1 })
            .await
            .unwrap();
        assert_eq!(status.id, 1);
        assert!(status.output);
        assert_eq!(status.apower, Some(8.9));
        assert!(status.extra.contains_key("temperature"));
    }

    #[tokio::test]
    async fn server_error_is_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"was_on": true})))
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        let device = registry
            .upsert(DeviceRecord::new("d1").with_host(host_of(&mock_server)))
            .unwrap();

        let toggled = device
            .call::<switch::Toggle>(&Context::new(), Channel::Default, &switch::SwitchId { id: 0 })
            .await
            .unwrap();
        assert!(toggled.was_on);
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retry_after_is_honored_past_the_backoff_cap() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"was_on": false})))
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        let device = registry
            .upsert(DeviceRecord::new("d1").with_host(host_of(&mock_server)))
            .unwrap();

        let started = Instant::now();
        let toggled = device
            .call::<switch::Toggle>(&Context::new(), Channel::Http, &switch::SwitchId { id: 0 })
            .await
            .unwrap();
        assert!(!toggled.was_on);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retry_after_beyond_deadline_times_out() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "60"))
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        let device = registry
            .upsert(DeviceRecord::new("d1").with_host(host_of(&mock_server)))
            .unwrap();

        let started = Instant::now();
        let ctx = Context::new().with_timeout(Duration::from_millis(500));
        let err = device
            .call::<switch::Toggle>(&ctx, Channel::Http, &switch::SwitchId { id: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
        assert_eq!(device.host(), host_of(&mock_server));
    }

    #[tokio::test]
    async fn client_error_is_remote_and_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Set"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": -103,
                "message": "Invalid argument 'id': no such component"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        let device = registry
            .upsert(DeviceRecord::new("d1").with_host(host_of(&mock_server)))
            .unwrap();

        let params = switch::SetParams {
            id: 7,
            on: true,
            toggle_after: None,
        };
        let err = device
            .call::<switch::Set>(&Context::new(), Channel::Http, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { code: -103, .. }));
        assert_eq!(device.host(), host_of(&mock_server));
    }

    #[tokio::test]
    async fn exhausted_retries_clear_host() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4)
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        let device = registry
            .upsert(DeviceRecord::new("d1").with_host(host_of(&mock_server)))
            .unwrap();

        let err = device
            .call::<switch::Toggle>(&Context::new(), Channel::Http, &switch::SwitchId { id: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(device.host().is_empty());
        assert!(!device.http_ready());
    }

    #[tokio::test]
    async fn deadline_bounds_slow_device() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"was_on": false}))
                    .set_delay(Duration::from_secs(1)),
            )
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        let device = registry
            .upsert(DeviceRecord::new("d1").with_host(host_of(&mock_server)))
            .unwrap();

        let ctx = Context::new().with_timeout(Duration::from_millis(100));
        let err = device
            .call::<switch::Toggle>(&ctx, Channel::Http, &switch::SwitchId { id: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(device.host(), host_of(&mock_server));
    }
}

// ============================================================================
// Fallback Tests
// ============================================================================

mod fallback {
    use super::*;

    /// Answers `Switch.Toggle` on `<device_id>/rpc` like a real device.
    async fn spawn_device(broker: &MemoryBroker, device_id: &str) {
        let client = broker.client(device_id);
        client.connect().await.unwrap();
        let mut requests = client.subscribe(&format!("{device_id}/rpc")).await.unwrap();
        tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                let request: Value = serde_json::from_slice(&message.payload).unwrap();
                let reply = json!({
                    "id": request["id"],
                    "src": client.client_id(),
                    "result": {"was_on": false}
                });
                let topic = format!("{}/rpc", request["src"].as_str().unwrap());
                client.publish(&topic, reply.to_string().into_bytes()).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn dead_host_falls_back_to_mqtt() {
        let broker = MemoryBroker::new();
        spawn_device(&broker, "shellyplus1-a8032ab12345").await;
        let mqtt = MqttChannel::new(
            Arc::new(broker.client("myhome_test")),
            MqttChannelConfig::default(),
        );
        let registry = registry(Some(mqtt));
        let device = registry
            .upsert(
                DeviceRecord::new("shellyplus1-a8032ab12345")
                    .with_host(format!("127.0.0.1:{}", closed_port())),
            )
            .unwrap();
        let params = switch::SwitchId { id: 0 };

        let err = device
            .call::<switch::Toggle>(&Context::new(), Channel::Default, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(device.host().is_empty());
        assert!(broker.publish_times("shellyplus1-a8032ab12345/rpc").is_empty());

        let toggled = device
            .call::<switch::Toggle>(&Context::new(), Channel::Default, &params)
            .await
            .unwrap();
        assert!(!toggled.was_on);

        let requests: Vec<Value> = broker
            .published()
            .into_iter()
            .filter(|(_, m)| m.topic == "shellyplus1-a8032ab12345/rpc")
            .map(|(_, m)| serde_json::from_slice(&m.payload).unwrap())
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["method"], "Switch.Toggle");
        assert_eq!(requests[0]["params"], json!({"id": 0}));
    }

    #[tokio::test]
    async fn rediscovered_host_restores_http() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"was_on": true})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        let device = registry.upsert(DeviceRecord::new("d1")).unwrap();
        assert!(!device.http_ready());

        registry
            .upsert(DeviceRecord::new("d1").with_host(host_of(&mock_server)))
            .unwrap();
        assert!(device.http_ready());

        let toggled = device
            .call::<switch::Toggle>(&Context::new(), Channel::Default, &switch::SwitchId { id: 0 })
            .await
            .unwrap();
        assert!(toggled.was_on);
    }
}

// ============================================================================
// Fan-out Tests
// ============================================================================

mod fan_out {
    use super::*;

    #[tokio::test]
    async fn glob_reports_each_device() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"was_on": true})))
            .expect(2)
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        let host = host_of(&mock_server);
        registry
            .upsert(DeviceRecord::new("shelly1minig3-d1").with_host(host.clone()))
            .unwrap();
        registry.upsert(DeviceRecord::new("shelly1minig3-d2")).unwrap();
        registry
            .upsert(DeviceRecord::new("shelly1minig3-d3").with_host(host))
            .unwrap();
        registry
            .upsert(DeviceRecord::new("shellyplus1-other"))
            .unwrap();
        let server = RpcServer::new(registry);

        let response = call(
            &server,
            "switch.toggle",
            json!({"identifier": "shelly1minig3-*"}),
        )
        .await;
        let result = response.result.unwrap();
        let map = result.as_object().unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["shelly1minig3-d1"]["result"], json!({"was_on": true}));
        assert_eq!(map["shelly1minig3-d3"]["result"], json!({"was_on": true}));
        assert_eq!(map["shelly1minig3-d2"]["error"]["code"], 503);
    }

    #[tokio::test]
    async fn glob_without_match_is_not_found() {
        let server = RpcServer::new(registry(None));
        let response = call(&server, "switch.toggle", json!({"identifier": "nothing-*"})).await;
        assert_eq!(response.error().unwrap().code, 404);
    }
}

// ============================================================================
// HTTP Server Tests
// ============================================================================

mod http_server {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_device_count() {
        let registry = registry(None);
        registry.upsert(DeviceRecord::new("d1")).unwrap();
        let app = myhome::server::router(RpcServer::new(registry), Context::new());

        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["devices"], 1);
    }

    #[tokio::test]
    async fn rpc_envelope_over_http() {
        let registry = registry(None);
        registry
            .upsert(DeviceRecord::new("shellyplus1-a8032ab12345").with_name("porch"))
            .unwrap();
        let app = myhome::server::router(RpcServer::new(registry), Context::new());

        let request = HttpRequest::post("/rpc")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"id": 7, "method": "device.show", "params": {"identifier": "porch"}})
                    .to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let envelope: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(envelope["id"], 7);
        assert_eq!(envelope["result"]["id"], "shellyplus1-a8032ab12345");
    }

    #[tokio::test]
    async fn errors_still_answer_200() {
        let app = myhome::server::router(RpcServer::new(registry(None)), Context::new());

        let request = HttpRequest::post("/rpc")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let envelope: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(envelope["id"], Value::Null);
        assert_eq!(envelope["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_rpc() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/Switch.Toggle"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"was_on": false}))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&mock_server)
            .await;

        let registry = registry(None);
        registry
            .upsert(DeviceRecord::new("d1").with_host(host_of(&mock_server)))
            .unwrap();
        let root = Context::new();
        let app = myhome::server::router(RpcServer::new(registry), root.clone());

        let request = HttpRequest::post("/rpc")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"id": 3, "method": "switch.toggle", "params": {"identifier": "d1"}})
                    .to_string(),
            ))
            .unwrap();
        let in_flight = tokio::spawn(app.oneshot(request));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        root.cancel();

        let response = in_flight.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(started.elapsed() < Duration::from_secs(5));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let envelope: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(envelope["id"], 3);
        assert_eq!(envelope["error"]["code"], 499);
    }
}
