use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use kvflood::api::{self, paths};
use kvflood::node::KvNode;
use kvflood::settings::{AreaSettings, Settings};
use kvflood::transport::ChannelNetwork;

async fn app(areas: &[AreaSettings]) -> Router {
    let mut settings = Settings::new("node1");
    settings.areas = areas.to_vec();
    let network = ChannelNetwork::new();
    let node = KvNode::start(&settings, Arc::new(network.transport()))
        .await
        .unwrap();
    api::api(node).await.unwrap()
}

async fn default_app() -> Router {
    app(&[AreaSettings::new("0")]).await
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health_and_about() {
    let app = default_app().await;
    let response = app
        .clone()
        .oneshot(request(Method::GET, paths::base::HEALTH, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, about) = send(&app, request(Method::GET, paths::base::ABOUT, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(about["name"], "kvflood");
}

#[tokio::test]
async fn test_set_local_then_get() {
    let app = default_app().await;
    let uri = paths::local_key_path("0", "adj:node1");
    let (status, _) = send(
        &app,
        request(Method::PUT, &uri, Some(json!({ "value": "hello" }))),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let uri = format!("{}?keys=adj:node1,missing", paths::keys_path("0"));
    let (status, body) = send(&app, request(Method::GET, &uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["area"], "0");
    let record = &body["key_vals"]["adj:node1"];
    assert_eq!(record["version"], 1);
    assert_eq!(record["originator_id"], "node1");
    assert!(body["key_vals"].get("missing").is_none());

    let (status, body) = send(
        &app,
        request(Method::DELETE, &paths::local_key_path("0", "adj:node1"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["was_local"], true);
}

#[tokio::test]
async fn test_set_key_vals_reports_merge_outcomes() {
    let app = default_app().await;
    let batch = json!({
        "key_vals": {
            "prefix:node2": {
                "version": 3,
                "originator_id": "node2",
                "value": [1, 2, 3],
                "ttl": 60000
            }
        }
    });
    let (status, body) = send(
        &app,
        request(Method::POST, &paths::keys_path("0"), Some(batch.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], 1);

    let (_, body) = send(&app, request(Method::POST, &paths::keys_path("0"), Some(batch))).await;
    assert_eq!(body["accepted"], 0);
    assert_eq!(body["no_op"], 1);
}

#[tokio::test]
async fn test_filtered_dump_and_hashes() {
    let app = default_app().await;
    for key in ["adj:node1", "prefix:node1"] {
        send(
            &app,
            request(
                Method::PUT,
                &paths::local_key_path("0", key),
                Some(json!({ "value": "v" })),
            ),
        )
        .await;
    }

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &paths::keys_filtered_path("0"),
            Some(json!({ "keys": ["adj:"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let keys = body["key_vals"].as_object().unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys.contains_key("adj:node1"));

    let (status, body) = send(
        &app,
        request(Method::POST, &paths::hashes_filtered_path("0"), Some(json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let keys = body["key_vals"].as_object().unwrap();
    assert_eq!(keys.len(), 2);
    for record in keys.values() {
        assert!(record.get("value").is_none());
        assert!(record["hash"].is_i64());
    }
}

#[tokio::test]
async fn test_invalid_filter_is_bad_request() {
    let app = default_app().await;
    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &paths::keys_filtered_path("0"),
            Some(json!({ "keys": ["("] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_area_is_bad_request() {
    let app = default_app().await;
    let (status, _) = send(&app, request(Method::GET, &paths::keys_path("nope"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_summary_lists_requested_areas() {
    let app = app(&[AreaSettings::new("0"), AreaSettings::new("spine")]).await;
    let (status, body) = send(&app, request(Method::GET, paths::kvstore::SUMMARY, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let uri = format!("{}?areas=spine,missing", paths::kvstore::SUMMARY);
    let (_, body) = send(&app, request(Method::GET, &uri, None)).await;
    let summaries = body.as_array().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["area"], "spine");
}

#[tokio::test]
async fn test_peer_lifecycle() {
    let app = default_app().await;
    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &paths::peers_path("0"),
            Some(json!({ "name": "node2", "addr": "node2" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, request(Method::GET, &paths::peers_path("0"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let peers = body.as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["name"], "node2");

    let (status, body) = send(
        &app,
        request(Method::DELETE, &paths::peer_path("0", "node2"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], true);

    let (_, body) = send(&app, request(Method::GET, &paths::peers_path("0"), None)).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_adding_self_as_peer_is_rejected() {
    let app = default_app().await;
    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &paths::peers_path("0"),
            Some(json!({ "name": "node1", "addr": "node1" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_spanning_tree_info() {
    let mut spine = AreaSettings::new("spine");
    spine.enable_flood_optimization = true;
    spine.flood_root_priority = Some(0);
    let app = app(&[AreaSettings::new("0"), spine]).await;

    let (status, body) = send(
        &app,
        request(Method::GET, &paths::spanning_tree_path("spine"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["flood_root_id"], "node1");
    assert_eq!(body["infos"]["node1"]["cost"], 0);

    let (status, _) = send(
        &app,
        request(Method::GET, &paths::spanning_tree_path("0"), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_subscribe_starts_with_snapshot_event() {
    let app = default_app().await;
    send(
        &app,
        request(
            Method::PUT,
            &paths::local_key_path("0", "adj:node1"),
            Some(json!({ "value": "v" })),
        ),
    )
    .await;

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            paths::kvstore::SUBSCRIBE,
            Some(json!({ "filter": { "keys": ["adj:"] } })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let mut body = response.into_body().into_data_stream();
    let first = futures::StreamExt::next(&mut body).await.unwrap().unwrap();
    let text = String::from_utf8(first.to_vec()).unwrap();
    assert!(text.contains("event: snapshot"));
    assert!(text.contains("adj:node1"));
}
