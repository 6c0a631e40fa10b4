//! End-to-end tests of the exchange protocol against a running application with
//! simulated instruments.

use erpes_daq::adapters::{shared, LinkAdapter};
use erpes_daq::app::DaqApp;
use erpes_daq::config::{ExchangeConfig, Settings};
use erpes_daq::error::{AppResult, DaqError};
use erpes_daq::exchange::{ExchangeClient, ExchangeServer, Record, RequestHandler};
use erpes_daq::instruments::MirrorDriver;
use erpes_daq::polling::{PollingEngine, PollingOptions};
use erpes_daq::core::Attribute;
use erpes_daq::store::AttributeStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const CONFIG: &str = r#"
[application]
name = "erpes-test"

[polling]
period = "50ms"
transaction_timeout = "200ms"

[exchange]
bind = "127.0.0.1:0"
idle_timeout = "2s"

[scan]
capture = ["compressor_he_discharge_temp", "TA", "slit_width"]
capture_attempts = 2
retry_delay = "20ms"

[[instruments]]
id = "compressor"
kind = "f70h"
link = { type = "simulate" }

[[instruments]]
id = "cryo"
kind = "query"
link = { type = "simulate" }
channels = [{ attribute = "TA", command = "KRDG? A", unit = "K" }]

[slit]
initial = 500
"#;

/// Start the application and wait for the first readings.
async fn start_app() -> DaqApp {
    let settings = Settings::from_toml_str(CONFIG).unwrap();
    let app = DaqApp::start(settings).await.unwrap();
    let store = app.store().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.get("TA").is_err() || store.get("compressor_he_discharge_temp").is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("instruments never reported");
    app
}

async fn read_reply(reader: &mut BufReader<TcpStream>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let line = line.trim_end().to_string();
        if line == "END" {
            return lines;
        }
        lines.push(line);
    }
}

#[tokio::test]
async fn test_unknown_name_is_marked_not_found_among_found_records() {
    let app = start_app().await;
    let mut client = ExchangeClient::new(app.exchange_addr().to_string());

    let names = vec!["TA".to_string(), "nope".to_string(), "slit_width".to_string()];
    let records = client.fetch(&names).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(matches!(&records[0], Record::Found(a) if a.name == "TA" && a.valid));
    assert_eq!(records[1], Record::NotFound("nope".to_string()));
    assert!(matches!(&records[2], Record::Found(a) if a.unit == "mm"));

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scan_start_and_end_over_exchange() {
    let app = start_app().await;
    let mut client = ExchangeClient::new(app.exchange_addr().to_string());

    let id = client.start_scan().await.unwrap();
    assert!(matches!(
        client.start_scan().await,
        Err(DaqError::ScanAlreadyRunning(_))
    ));
    assert_eq!(client.scan_status().await.unwrap(), format!("Running {id}"));

    let snapshot = client.end_scan().await.unwrap();
    let names: Vec<&str> = snapshot.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["TA", "compressor_he_discharge_temp", "slit_width"]);
    assert!(snapshot.values().all(|a| a.valid));

    assert_eq!(client.scan_status().await.unwrap(), "Idle");
    assert!(matches!(client.end_scan().await, Err(DaqError::ScanNotRunning)));

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_connections_from_one_peer() {
    let app = start_app().await;
    let addr = app.exchange_addr();

    let mut first = BufReader::new(TcpStream::connect(addr).await.unwrap());
    let mut second = BufReader::new(TcpStream::connect(addr).await.unwrap());

    second.get_mut().write_all(b"TA,slit_number\n").await.unwrap();
    let reply = read_reply(&mut second).await;
    assert_eq!(reply.len(), 2);
    assert!(reply[0].starts_with("TA="));
    assert!(reply[1].starts_with("slit_number=500;"));

    first.get_mut().write_all(b"@PING\n").await.unwrap();
    assert_eq!(read_reply(&mut first).await, vec!["OK PONG".to_string()]);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mirror_aggregates_remote_store() {
    let app = start_app().await;

    let front_end = Arc::new(AttributeStore::default());
    let mut link = ExchangeClient::new(app.exchange_addr().to_string());
    link.connect().await.unwrap();
    let mut engine = PollingEngine::new(
        shared(link),
        Box::new(MirrorDriver::new("cryo-mirror", vec!["TA".into(), "nope".into()])),
        front_end.clone(),
        PollingOptions::default(),
    );

    engine.poll_once().await.unwrap();
    let mirrored = front_end.get("TA").unwrap();
    assert_eq!(mirrored.unit, "K");
    assert!(front_end.get("nope").is_err());

    // The mirror's loop stops with the shared shutdown signal
    let (tx, rx) = watch::channel(false);
    let handle = engine.spawn(rx);
    tx.send(true).unwrap();
    handle.await.unwrap();

    app.shutdown().await.unwrap();
}

/// Bare exchange server with a short idle timeout and a small line limit.
async fn start_strict_server() -> (
    std::net::SocketAddr,
    watch::Sender<bool>,
    JoinHandle<AppResult<()>>,
) {
    let store = Arc::new(AttributeStore::default());
    store.update("cryo", vec![Attribute::new("TA", 12.5, "K")]);
    let server = ExchangeServer::bind(
        ExchangeConfig {
            bind: "127.0.0.1:0".to_string(),
            idle_timeout: Duration::from_millis(200),
            max_line_length: 64,
        },
        RequestHandler::new(store, None),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    (addr, tx, server.spawn(rx))
}

async fn expect_eof(reader: &mut BufReader<TcpStream>) {
    let mut line = String::new();
    let n = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .expect("connection was not closed")
        .unwrap();
    assert_eq!(n, 0, "unexpected data: {line:?}");
}

#[tokio::test]
async fn test_silent_client_disconnected_after_idle_timeout() {
    let (addr, tx, handle) = start_strict_server().await;

    let started = Instant::now();
    let mut silent = BufReader::new(TcpStream::connect(addr).await.unwrap());
    expect_eof(&mut silent).await;
    assert!(started.elapsed() >= Duration::from_millis(150));

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_overlong_request_rejected_and_closed() {
    let (addr, tx, handle) = start_strict_server().await;

    let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
    let mut request = "TA,".repeat(60);
    request.push('\n');
    client.get_mut().write_all(request.as_bytes()).await.unwrap();

    let reply = read_reply(&mut client).await;
    assert_eq!(reply.len(), 1);
    assert!(reply[0].starts_with("ERR ProtocolError"), "{reply:?}");
    expect_eof(&mut client).await;

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stalled_client_does_not_block_others() {
    let (addr, tx, handle) = start_strict_server().await;

    // Half a request, never finished
    let mut stalled = BufReader::new(TcpStream::connect(addr).await.unwrap());
    stalled.get_mut().write_all(b"T").await.unwrap();

    let mut other = BufReader::new(TcpStream::connect(addr).await.unwrap());
    other.get_mut().write_all(b"TA\n").await.unwrap();
    let reply = read_reply(&mut other).await;
    assert_eq!(reply.len(), 1);
    assert!(reply[0].starts_with("TA=12.5;K;"), "{reply:?}");

    expect_eof(&mut stalled).await;

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
