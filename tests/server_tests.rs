use pvbridge::bus::BusValue;
use pvbridge::config::{DeviceConfig, TimingConfig};
use pvbridge::protocol::{BusResponse, ResponseStatus, WatchEvent};
use pvbridge::service::*;
use pvbridge::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

const TOPIC: &str = "sma2/3001234567/inverter";
const FRAME: &[u8] = br#"{"spotacvoltage1":230,"spotacvoltage2":230,"spotacvoltage3":230,
    "spotacamperage1":0.4,"spotacamperage2":0.4,"spotacamperage3":0.4,
    "spotacpower1":100,"spotacpower2":100,"spotacpower3":100,
    "spotacpower":300,"total":5000}"#;

struct Harness {
    addr: SocketAddr,
    subscriber: FeedSubscriber,
    _stop: oneshot::Sender<()>,
}

async fn start() -> Harness {
    let device = DeviceConfig {
        instance: 40,
        serial: "3001234567".into(),
        custom_name: "Garage roof".into(),
        product_name: "MQTT Inverter".into(),
        connection: "MQTT Inverter JSON service".into(),
        position: 0,
    };
    let mut bus = LocalBus::new(service_name(device.instance));
    register_service(&mut bus, &device).unwrap();

    let queue = Arc::new(FrameQueue::new());
    let subscriber = FeedSubscriber::new(Arc::clone(&queue), "inverter");
    let timing = TimingConfig {
        publish_period_ms: 20,
        sign_of_life_minutes: 0,
    };
    let (runtime, handle) = BridgeRuntime::new(bus, queue, &timing, subscriber.stats_handle()).unwrap();

    let server = BusServer::bind("127.0.0.1:0", handle).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(runtime.run(async {
        let _ = stop_rx.await;
    }));

    Harness {
        addr,
        subscriber,
        _stop: stop_tx,
    }
}

async fn connect(addr: SocketAddr) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, writer) = stream.into_split();
    (BufReader::new(reader), writer)
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> String {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .expect("no reply within timeout")
        .unwrap();
    line
}

async fn request(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    line: &str,
) -> BusResponse {
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
    serde_json::from_str(read_line(reader).await.trim()).unwrap()
}

#[tokio::test]
async fn test_ping_get_set_over_tcp() {
    let harness = start().await;
    let (mut reader, mut writer) = connect(harness.addr).await;

    let response = request(&mut reader, &mut writer, r#"{"op":"ping"}"#).await;
    assert!(response.is_success());

    let response = request(&mut reader, &mut writer, r#"{"op":"get","path":"/ProductId"}"#).await;
    assert_eq!(response.value, Some(BusValue::Int(0xFFFF)));

    let response = request(
        &mut reader,
        &mut writer,
        r#"{"op":"set","path":"/Ac/Power","value":1234.5}"#,
    )
    .await;
    assert!(response.is_success());
    assert_eq!(response.text.as_deref(), Some("1234.5W"));

    let response = request(&mut reader, &mut writer, r#"{"op":"set","path":"/Serial","value":"x"}"#).await;
    assert_eq!(response.status, ResponseStatus::Error);
}

#[tokio::test]
async fn test_invalid_request_keeps_connection() {
    let harness = start().await;
    let (mut reader, mut writer) = connect(harness.addr).await;

    let response = request(&mut reader, &mut writer, "not json at all").await;
    assert_eq!(response.status, ResponseStatus::InvalidRequest);

    let response = request(&mut reader, &mut writer, r#"{"op":"dump"}"#).await;
    assert!(response.is_success());
    assert!(response.items.iter().any(|entry| entry.path == PATH_AC_ENERGY_FORWARD));
}

#[tokio::test]
async fn test_watch_streams_published_snapshots() {
    let harness = start().await;
    let (mut reader, mut writer) = connect(harness.addr).await;

    let ack = request(&mut reader, &mut writer, r#"{"op":"watch"}"#).await;
    assert!(ack.is_success());

    // Give the watcher a moment to subscribe before the frame arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.subscriber.handle_message(TOPIC, FRAME);

    let event: WatchEvent = serde_json::from_str(read_line(&mut reader).await.trim()).unwrap();
    assert_eq!(event.state.revision, 1);
    assert_eq!(event.state.energy_kwh, 5.0);
    assert!(event.state.connected);
}
