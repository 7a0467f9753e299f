use super::*;
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct DeviceState {
    motion_posts: Arc<Mutex<Vec<(String, Value)>>>,
}

async fn motion_post(
    State(state): State<DeviceState>,
    Path(axis): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state
        .motion_posts
        .lock()
        .expect("state lock")
        .push((axis.clone(), body.clone()));
    if axis == "tilt" {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "error",
                "error": "servo_communication_failed",
                "message": "no reply from servo",
                "axis": axis
            })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "angle": body["angle"], "axis": axis})),
    )
}

async fn stream_status(Path(protocol): Path<String>) -> Json<Value> {
    Json(json!({"on": protocol == "hls", "url": "http://camera/hls/stream.m3u8"}))
}

async fn spawn_device() -> Result<(String, DeviceState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = DeviceState::default();
    let api = Router::new()
        .route("/motion/:axis", post(motion_post))
        .route("/stream/:protocol", get(stream_status))
        .route("/power/system", post(|| async { StatusCode::OK }))
        .route("/system/ip", get(|| async { "not json" }))
        .with_state(state.clone());
    let app = Router::new().nest("/api", api);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api"), state))
}

fn gateway(base_url: &str) -> HttpDeviceGateway {
    HttpDeviceGateway::new(base_url, Duration::from_secs(2)).expect("gateway")
}

#[tokio::test]
async fn posts_json_and_decodes_the_reply() {
    let (base_url, state) = spawn_device().await.expect("spawn device");
    let gateway = gateway(&base_url);

    let request = DeviceRequest::post(
        Endpoint::Motion(Axis::Pan),
        &shared::protocol::MotionCommand { angle: 12.5 },
    )
    .expect("request");
    let reply = gateway.call(request).await.expect("reply");

    assert_eq!(reply, json!({"status": "ok", "angle": 12.5, "axis": "pan"}));
    let posts = state.motion_posts.lock().expect("state lock").clone();
    assert_eq!(posts, vec![("pan".to_string(), json!({"angle": 12.5}))]);
}

#[tokio::test]
async fn base_path_is_kept_when_joining_endpoints() {
    let (base_url, _state) = spawn_device().await.expect("spawn device");
    let gateway = gateway(&base_url);
    assert!(gateway.base_url().as_str().ends_with("/api/"));

    let status: shared::protocol::StreamStatus = call_json(
        &gateway,
        DeviceRequest::get(Endpoint::Stream(StreamProtocol::Hls)),
    )
    .await
    .expect("status");

    assert!(status.on);
}

#[tokio::test]
async fn error_status_keeps_the_json_body() {
    let (base_url, _state) = spawn_device().await.expect("spawn device");
    let gateway = gateway(&base_url);

    let request = DeviceRequest::post(
        Endpoint::Motion(Axis::Tilt),
        &shared::protocol::MotionCommand { angle: 3.0 },
    )
    .expect("request");
    let err = gateway.call(request).await.expect_err("servo failure");

    match err {
        GatewayError::Status {
            status,
            body: Some(body),
        } => {
            assert_eq!(status, 500);
            assert_eq!(body["axis"], "tilt");
            assert_eq!(body["error"], "servo_communication_failed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn empty_body_decodes_as_null() {
    let (base_url, _state) = spawn_device().await.expect("spawn device");
    let gateway = gateway(&base_url);

    let reply = gateway
        .call(DeviceRequest::post_empty(Endpoint::SystemPower))
        .await
        .expect("reply");

    assert_eq!(reply, Value::Null);
}

#[tokio::test]
async fn non_json_success_is_a_decode_error() {
    let (base_url, _state) = spawn_device().await.expect("spawn device");
    let gateway = gateway(&base_url);

    let err = gateway
        .call(DeviceRequest::get(Endpoint::DeviceIp))
        .await
        .expect_err("not json");

    assert!(matches!(err, GatewayError::Decode(_)));
}

#[tokio::test]
async fn unreachable_device_is_a_transport_error() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let gateway = gateway(&format!("http://{addr}"));

    let err = gateway
        .call(DeviceRequest::get(Endpoint::Hostname))
        .await
        .expect_err("nothing listening");

    assert!(matches!(err, GatewayError::Transport(_)));
}

#[test]
fn rejects_non_http_base_urls() {
    assert!(matches!(
        HttpDeviceGateway::new("ftp://camera.local", Duration::from_secs(1)),
        Err(GatewayError::Address(_))
    ));
    assert!(matches!(
        HttpDeviceGateway::new("camera.local:8080", Duration::from_secs(1)),
        Err(GatewayError::Address(_))
    ));
}

#[test]
fn endpoints_map_to_device_paths() {
    assert_eq!(Endpoint::Motion(Axis::Pan).path(), "/motion/pan");
    assert_eq!(Endpoint::MotionLimit(Axis::Tilt).path(), "/motion/tilt/limit");
    assert_eq!(Endpoint::Stream(StreamProtocol::Rtsp).path(), "/stream/rtsp");
    assert_eq!(Endpoint::ClientIp.path(), "/system/client_ip");
    assert_eq!(Endpoint::SystemPower.to_string(), "/power/system");
}

#[test]
fn unencodable_body_is_an_encode_error() {
    let mut readings = std::collections::HashMap::new();
    readings.insert((1, 2), 3.0);

    let err = DeviceRequest::post(Endpoint::SystemInit, &readings).expect_err("tuple keys");

    assert!(matches!(err, GatewayError::Encode(_)));
}
