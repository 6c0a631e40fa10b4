//! Communication loss degrades freshness but never stops the exchange answering.

use erpes_daq::adapters::{shared, MockAdapter};
use erpes_daq::config::ExchangeConfig;
use erpes_daq::error_recovery::BackoffPolicy;
use erpes_daq::exchange::{ExchangeClient, ExchangeServer, Record, RequestHandler};
use erpes_daq::instruments::{QueryChannel, QueryDriver};
use erpes_daq::polling::{PollingEngine, PollingOptions};
use erpes_daq::store::AttributeStore;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

async fn fetch_ta(client: &mut ExchangeClient) -> Option<bool> {
    match client.fetch(&["TA".to_string()]).await.unwrap().pop() {
        Some(Record::Found(attr)) => Some(attr.valid),
        _ => None,
    }
}

async fn wait_for(client: &mut ExchangeClient, valid: bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while fetch_ta(client).await != Some(valid) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("TA never became valid={valid}"));
}

#[tokio::test]
async fn test_link_loss_marks_stale_and_recovery_restores() {
    let store = Arc::new(AttributeStore::default());
    let adapter = MockAdapter::fixed("cryo", "+012.500");
    let online = adapter.online_switch();
    let driver =
        QueryDriver::new("cryo", vec![QueryChannel::new("TA", "KRDG? A", "K")]).unwrap();
    let engine = PollingEngine::new(
        shared(adapter),
        Box::new(driver),
        store.clone(),
        PollingOptions {
            period: Duration::from_millis(20),
            transaction_timeout: Duration::from_millis(20),
            backoff: BackoffPolicy {
                base: Duration::from_millis(20),
                max: Duration::from_millis(40),
                multiplier: 2.0,
            },
            stale_after_failures: 3,
        },
    );

    let server = ExchangeServer::bind(
        ExchangeConfig {
            bind: "127.0.0.1:0".to_string(),
            ..ExchangeConfig::default()
        },
        RequestHandler::new(store.clone(), None),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let server_task = server.spawn(rx.clone());
    let poll_task = engine.spawn(rx);

    let mut client = ExchangeClient::new(addr.to_string()).with_timeout(Duration::from_secs(1));
    wait_for(&mut client, true).await;

    online.store(false, Ordering::SeqCst);
    wait_for(&mut client, false).await;

    online.store(true, Ordering::SeqCst);
    wait_for(&mut client, true).await;

    tx.send(true).unwrap();
    poll_task.await.unwrap();
    server_task.await.unwrap().unwrap();
}
