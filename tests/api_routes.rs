//! HTTP API 集成测试：在真实监听端口上走完整请求链
#![cfg(unix)]

mod common;

use std::sync::Arc;

use common::Harness;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use vea::api;
use vea::domain::ComponentKind;

struct Server {
    base: String,
    client: reqwest::Client,
    stop: CancellationToken,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

async fn start_api(h: &Harness) -> Server {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = CancellationToken::new();
    let router = api::router(Arc::clone(&h.facade));
    let shutdown = stop.clone();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });
    Server {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        stop,
    }
}

#[tokio::test]
async fn health_and_default_data() {
    let h = Harness::new().await;
    let s = start_api(&h).await;

    let resp = s.client.get(s.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let frouters: Value = s
        .client
        .get(s.url("/frouters"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(frouters.as_array().unwrap().len(), 1);
    assert_eq!(frouters[0]["name"], "默认路由");

    let components: Value = s
        .client
        .get(s.url("/components"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(components.as_array().unwrap().len(), 3);
    s.stop.cancel();
}

#[tokio::test]
async fn node_crud_and_error_shape() {
    let h = Harness::new().await;
    let s = start_api(&h).await;

    let resp = s
        .client
        .post(s.url("/nodes"))
        .json(&json!({
            "id": "",
            "name": "sg-1",
            "address": "sg.example.com",
            "port": 443,
            "protocol": "trojan",
            "security": {"password": "secret"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());

    let fetched: Value = s
        .client
        .get(s.url(&format!("/nodes/{}", id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["address"], "sg.example.com");

    let resp = s
        .client
        .delete(s.url(&format!("/nodes/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = s
        .client
        .get(s.url(&format!("/nodes/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "NOT_FOUND");
    assert!(err["error"].as_str().unwrap().contains(&id));

    let resp = s
        .client
        .post(s.url("/nodes"))
        .json(&json!({"id": "", "name": "", "address": "x", "port": 1, "protocol": "trojan"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    s.stop.cancel();
}

#[tokio::test]
async fn proxy_config_rejects_unknown_frouter() {
    let h = Harness::new().await;
    let s = start_api(&h).await;

    let resp = s
        .client
        .put(s.url("/proxy/config"))
        .json(&json!({"inboundMode": "mixed", "inboundPort": 1080, "frouterId": "missing"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = s
        .client
        .post(s.url("/proxy/start"))
        .header("content-type", "application/json")
        .body("{broken")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "INVALID_INPUT");
    s.stop.cancel();
}

#[tokio::test]
async fn start_with_saved_config_then_stop() {
    let h = Harness::new().await;
    h.install(ComponentKind::Xray, &h.healthy_dir).await;
    let s = start_api(&h).await;

    let mut cfg: Value = s
        .client
        .get(s.url("/proxy/config"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    cfg["preferredEngine"] = json!("xray");
    cfg["inboundPort"] = json!(18090);
    let resp = s
        .client
        .put(s.url("/proxy/config"))
        .json(&cfg)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // 空请求体：使用已保存的配置
    let resp = s.client.post(s.url("/proxy/start")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["running"], true);
    assert_eq!(status["engine"], "xray");
    assert_eq!(status["inboundPort"], 18090);

    let logs: Value = s
        .client
        .get(s.url("/proxy/logs?since=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs["session"], 1);
    assert_eq!(logs["engine"], "xray");

    let resp = s.client.post(s.url("/proxy/stop")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["running"], false);
    assert_eq!(status["userStopped"], true);
    s.stop.cancel();
}

#[tokio::test]
async fn system_proxy_needs_running_kernel() {
    let h = Harness::new().await;
    let s = start_api(&h).await;

    let resp = s
        .client
        .put(s.url("/settings/system-proxy"))
        .json(&json!({"enabled": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = s
        .client
        .put(s.url("/settings/system-proxy"))
        .json(&json!({"enabled": false, "ignoreHosts": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["settings"]["enabled"], false);
    assert!(!body["settings"]["ignoreHosts"].as_array().unwrap().is_empty());
    s.stop.cancel();
}
