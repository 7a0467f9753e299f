use super::*;
use crate::{gateway::Method, test_support::FakeDevice};
use serde_json::json;
use shared::domain::Axis;

fn client(device: &Arc<FakeDevice>) -> SystemClient {
    let gateway: Arc<dyn DeviceGateway> = device.clone();
    SystemClient::new(gateway)
}

#[tokio::test(start_paused = true)]
async fn hostname_can_be_changed_and_read_back() {
    let device = Arc::new(FakeDevice::new());
    let system = client(&device);

    assert_eq!(system.hostname().await.expect("hostname"), "ptz-cam");
    assert_eq!(
        system.set_hostname("  lab-cam-2 ").await.expect("set"),
        "lab-cam-2"
    );
    assert_eq!(system.hostname().await.expect("hostname"), "lab-cam-2");
}

#[tokio::test(start_paused = true)]
async fn blank_hostname_is_refused_locally() {
    let device = Arc::new(FakeDevice::new());
    let system = client(&device);

    let err = system.set_hostname("   ").await.expect_err("blank");

    assert!(matches!(err, SystemError::EmptyHostname));
    assert!(device.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn device_rejections_carry_the_device_message() {
    let device = Arc::new(FakeDevice::new());
    let system = client(&device);
    device.push(
        Method::Post,
        Endpoint::SystemPower,
        Err(GatewayError::Status {
            status: 500,
            body: Some(json!({"status": "error", "msg": "permission denied"})),
        }),
    );

    let err = system.reboot().await.expect_err("reboot refused");

    assert!(matches!(err, SystemError::Rejected(message) if message == "permission denied"));
}

#[tokio::test(start_paused = true)]
async fn reboot_acknowledged() {
    let device = Arc::new(FakeDevice::new());
    let system = client(&device);

    system.reboot().await.expect("reboot");

    let calls = device.calls_to(Method::Post, Endpoint::SystemPower);
    assert_eq!(calls.len(), 1);
    assert!(calls[0].request.body.is_none());
}

#[tokio::test(start_paused = true)]
async fn addresses_and_temperatures_are_decoded() {
    let device = Arc::new(FakeDevice::new());
    let system = client(&device);

    assert_eq!(
        system.device_ip().await.expect("ip").as_deref(),
        Some("192.168.1.20")
    );
    assert_eq!(
        system.client_ip().await.expect("ip").as_deref(),
        Some("192.168.1.50")
    );
    let temperatures = system.temperatures().await.expect("temperatures");
    assert_eq!(temperatures.get("cpu_thermal"), Some(&48.5));
}

#[tokio::test(start_paused = true)]
async fn camera_power_round_trip() {
    let device = Arc::new(FakeDevice::new());
    let system = client(&device);

    assert!(system.camera_power().await.expect("power"));
    assert!(!system.set_camera_power(false).await.expect("power off"));
    assert!(!system.camera_power().await.expect("power"));
}

#[tokio::test(start_paused = true)]
async fn init_config_update_never_sends_servo_limits() {
    let device = Arc::new(FakeDevice::new());
    let system = client(&device);

    let mut config = system.init_config().await.expect("init config");
    assert_eq!(config.pwr_init, Some(true));
    assert_eq!(
        config
            .servo_map
            .as_ref()
            .and_then(|map| map.get(&Axis::Pan))
            .map(|mapping| mapping.center),
        Some(120.0)
    );
    assert!(config.servo_limits.is_some());

    config.pan_init = Some(15.0);
    let applied = system
        .update_init_config(&config)
        .await
        .expect("update");

    assert_eq!(applied.pan_init, Some(15.0));
    let posts = device.calls_to(Method::Post, Endpoint::SystemInit);
    let body = posts[0].request.body.clone().expect("body");
    assert!(body.get("servo_limits").is_none());
    assert_eq!(body["pan_init"], json!(15.0));
}

#[test]
fn hottest_sensor_wins() {
    let telemetry = Telemetry {
        temperatures: [
            ("cpu_thermal".to_string(), 61.0),
            ("gpu_thermal".to_string(), 83.5),
            ("broken".to_string(), f64::NAN),
        ]
        .into_iter()
        .collect(),
        ..Telemetry::default()
    };

    assert_eq!(telemetry.hottest(), Some(("gpu_thermal", 83.5)));
    assert_eq!(Telemetry::default().hottest(), None);
}
