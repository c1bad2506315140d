#[path = "common/mod.rs"]
mod common;

use common::{memory_state, spawn_app, state_with};
use metrix::codec;
use reqwest::Client;

#[tokio::test]
async fn batch_counter_updates_accumulate() {
    let (addr, _h) = spawn_app(memory_state()).await;
    let body = serde_json::json!([
        {"id": "req", "type": "counter", "delta": 2},
        {"id": "req", "type": "counter", "delta": 3}
    ]);
    let resp = Client::new()
        .post(format!("{addr}/updates"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = Client::new()
        .get(format!("{addr}/value/counter/req"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "5");
}

#[tokio::test]
async fn gauge_updates_keep_the_latest_value() {
    let (addr, _h) = spawn_app(memory_state()).await;
    let client = Client::new();
    for value in [0.9, 0.1] {
        let resp = client
            .post(format!("{addr}/update"))
            .json(&serde_json::json!({"id": "cpu", "type": "gauge", "value": value}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let resp = client
        .get(format!("{addr}/value/gauge/cpu"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "0.1");
}

#[tokio::test]
async fn same_id_different_kind_is_a_miss() {
    let (addr, _h) = spawn_app(memory_state()).await;
    let client = Client::new();
    let resp = client
        .post(format!("{addr}/update"))
        .json(&serde_json::json!({"id": "x", "type": "gauge", "value": 1.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{addr}/value/counter/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn path_update_increments_counters() {
    let (addr, _h) = spawn_app(memory_state()).await;
    let client = Client::new();
    for delta in [5, 7] {
        let resp = client
            .post(format!("{addr}/update/counter/hits/{delta}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }
    let last: serde_json::Value = client
        .post(format!("{addr}/update/counter/hits/0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(last["delta"], 12);

    let resp = client
        .get(format!("{addr}/value/counter/hits"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "12");
}

#[tokio::test]
async fn update_responds_with_stored_form_and_digest() {
    let (addr, _h) = spawn_app(state_with(Some("topsecret".into()), None, None)).await;
    let resp = Client::new()
        .post(format!("{addr}/update"))
        .json(&serde_json::json!({"id": "cpu", "type": "gauge", "value": 1.5}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let digest = resp
        .headers()
        .get("HashSHA256")
        .expect("response digest present")
        .to_str()
        .unwrap()
        .to_string();
    let body = resp.bytes().await.unwrap();
    assert!(codec::verify(&body, "topsecret", &digest));

    let stored: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stored["id"], "cpu");
    assert_eq!(stored["type"], "gauge");
    assert_eq!(stored["value"], 1.5);
}

#[tokio::test]
async fn value_by_body_returns_full_metric() {
    let (addr, _h) = spawn_app(memory_state()).await;
    let client = Client::new();
    client
        .post(format!("{addr}/update"))
        .json(&serde_json::json!({"id": "req", "type": "counter", "delta": 9}))
        .send()
        .await
        .unwrap();

    let resp = client
        .post(format!("{addr}/value"))
        .json(&serde_json::json!({"id": "req", "type": "counter"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let metric: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(metric["delta"], 9);

    let resp = client
        .post(format!("{addr}/value"))
        .json(&serde_json::json!({"id": "missing", "type": "counter"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn invalid_input_is_rejected() {
    let (addr, _h) = spawn_app(memory_state()).await;
    let client = Client::new();

    // Unknown kind in the path.
    let resp = client
        .post(format!("{addr}/update/histogram/x/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unparseable counter value in the path.
    let resp = client
        .post(format!("{addr}/update/counter/x/1.5"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Counter body without a delta.
    let resp = client
        .post(format!("{addr}/update"))
        .json(&serde_json::json!({"id": "x", "type": "counter"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown kind in the body.
    let resp = client
        .post(format!("{addr}/update"))
        .json(&serde_json::json!({"id": "x", "type": "histogram", "value": 1.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn batch_aborts_on_first_invalid_entry() {
    let (addr, _h) = spawn_app(memory_state()).await;
    let client = Client::new();
    let body = serde_json::json!([
        {"id": "good", "type": "counter", "delta": 1},
        {"id": "bad", "type": "gauge"}
    ]);
    let resp = client
        .post(format!("{addr}/updates"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Validation runs before any write, so the valid entry was not stored.
    let resp = client
        .get(format!("{addr}/value/counter/good"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn health_endpoints_respond() {
    let (addr, _h) = spawn_app(memory_state()).await;
    let client = Client::new();

    let resp = client.get(format!("{addr}/ping")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "pong");

    let resp = client.get(format!("{addr}/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn index_renders_metric_table() {
    let (addr, _h) = spawn_app(memory_state()).await;
    let client = Client::new();
    client
        .post(format!("{addr}/update"))
        .json(&serde_json::json!({"id": "HeapInuse", "type": "gauge", "value": 42.5}))
        .send()
        .await
        .unwrap();

    let resp = client.get(format!("{addr}/")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let html = resp.text().await.unwrap();
    assert!(html.contains("HeapInuse"));
    assert!(html.contains("42.5"));
}
