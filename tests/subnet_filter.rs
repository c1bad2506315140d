#[path = "common/mod.rs"]
mod common;

use common::{memory_state, spawn_app, state_with};
use reqwest::Client;

fn update_body() -> serde_json::Value {
    serde_json::json!({"id": "req", "type": "counter", "delta": 1})
}

#[tokio::test]
async fn no_subnet_configured_admits_everyone() {
    let (addr, _h) = spawn_app(memory_state()).await;
    let resp = Client::new()
        .post(format!("{addr}/update"))
        .json(&update_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn address_inside_subnet_is_admitted() {
    let (addr, _h) = spawn_app(state_with(None, None, Some("10.0.0.0/8".into()))).await;
    let resp = Client::new()
        .post(format!("{addr}/update"))
        .header("X-Real-IP", "10.1.2.3")
        .json(&update_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn address_outside_subnet_is_rejected() {
    let (addr, _h) = spawn_app(state_with(None, None, Some("10.0.0.0/8".into()))).await;
    let resp = Client::new()
        .post(format!("{addr}/update"))
        .header("X-Real-IP", "192.168.1.1")
        .json(&update_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn missing_or_garbled_real_ip_is_rejected() {
    let (addr, _h) = spawn_app(state_with(None, None, Some("10.0.0.0/8".into()))).await;
    let client = Client::new();

    let resp = client
        .post(format!("{addr}/update"))
        .json(&update_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .post(format!("{addr}/update"))
        .header("X-Real-IP", "not-an-address")
        .json(&update_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn ipv6_subnets_work() {
    let (addr, _h) = spawn_app(state_with(None, None, Some("2001:db8::/32".into()))).await;
    let client = Client::new();

    let resp = client
        .post(format!("{addr}/update"))
        .header("X-Real-IP", "2001:db8::1")
        .json(&update_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{addr}/update"))
        .header("X-Real-IP", "2001:db9::1")
        .json(&update_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn malformed_subnet_configuration_is_a_server_error() {
    let (addr, _h) = spawn_app(state_with(None, None, Some("not-a-cidr".into()))).await;
    let resp = Client::new()
        .post(format!("{addr}/update"))
        .header("X-Real-IP", "10.1.2.3")
        .json(&update_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
}
