//! Application wiring.
//!
//! [`DaqApp::start`] turns a validated [`Settings`] into running components:
//!
//! 1. the attribute store
//! 2. one link and one driver per instrument, each polled by its own engine
//! 3. the alarm engine (configured alarms, or the compressor defaults)
//! 4. the scan orchestrator, capturing from the local store or a remote server
//! 5. the exchange server
//! 6. the motion queue and slit indicator when configured
//!
//! Every task watches one shutdown channel. [`DaqApp::shutdown`] flips it and
//! waits for each task, collecting failures into `ShutdownFailed`.

use crate::adapters::{
    LinkAdapter, MockAdapter, ModbusTcpAdapter, SerialAdapter, SharedLink, TcpAdapter,
};
use crate::alarm::{default_compressor_alarms, AlarmEngine, LogNotifier, Notifier};
use crate::config::{AlarmConfig, InstrumentConfig, InstrumentKind, LinkConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::exchange::{ExchangeClient, ExchangeServer, RemoteStore, RequestHandler};
use crate::instruments::{
    mg15, F70hDriver, InstrumentDriver, Mg15Driver, MirrorDriver, QueryDriver, SlitIndicator,
};
use crate::motion::MotionQueue;
use crate::polling::{PollingEngine, PollingOptions};
use crate::scan::{CapturePolicy, ScanEvent, ScanOrchestrator, SnapshotSource};
use crate::store::AttributeStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long shutdown waits for each task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The running telemetry core.
pub struct DaqApp {
    store: Arc<AttributeStore>,
    orchestrator: Arc<ScanOrchestrator>,
    links: HashMap<String, SharedLink>,
    motion: Option<MotionQueue>,
    slit: Option<Arc<SlitIndicator>>,
    exchange_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<AppResult<()>>)>,
}

/// Driver for one configured instrument.
pub fn build_driver(instrument: &InstrumentConfig) -> AppResult<Box<dyn InstrumentDriver>> {
    let id = instrument.id.clone();
    let driver: Box<dyn InstrumentDriver> = match instrument.kind {
        InstrumentKind::Query => Box::new(QueryDriver::new(id, instrument.channels.clone())?),
        InstrumentKind::F70h => Box::new(F70hDriver::new(id)),
        InstrumentKind::Mg15 => {
            let gauges = if instrument.gauges.is_empty() {
                mg15::default_channels()
            } else {
                instrument.gauges.clone()
            };
            Box::new(Mg15Driver::new(id, gauges)?)
        }
        InstrumentKind::Mirror => Box::new(MirrorDriver::new(id, instrument.names.clone())),
    };
    Ok(driver)
}

/// Link for one configured instrument. Simulated links speak the driver's protocol
/// when it has a simulator.
pub fn build_link(
    instrument: &InstrumentConfig,
    driver: &dyn InstrumentDriver,
) -> AppResult<Box<dyn LinkAdapter>> {
    let link: Box<dyn LinkAdapter> = match &instrument.link {
        LinkConfig::Serial {
            port,
            baud_rate,
            framing,
        } => Box::new(SerialAdapter::new(port, *baud_rate, framing.clone())),
        LinkConfig::Tcp { address, framing } => {
            Box::new(TcpAdapter::new(address, framing.clone()))
        }
        LinkConfig::ModbusTcp { address, unit } => Box::new(ModbusTcpAdapter::new(*address, *unit)),
        #[cfg(feature = "tokio_serial")]
        LinkConfig::ModbusRtu {
            port,
            baud_rate,
            unit,
        } => Box::new(crate::adapters::ModbusRtuAdapter::new(port, *baud_rate, *unit)),
        #[cfg(not(feature = "tokio_serial"))]
        LinkConfig::ModbusRtu { .. } => {
            return Err(DaqError::Configuration(format!(
                "Instrument '{}': Modbus RTU requires the tokio_serial feature",
                instrument.id
            )))
        }
        LinkConfig::Exchange { address } => Box::new(ExchangeClient::new(address)),
        LinkConfig::Simulate => {
            let endpoint = format!("sim:{}", instrument.id);
            match driver.simulator() {
                Some(responder) => Box::new(MockAdapter::new(endpoint, responder)),
                None => Box::new(MockAdapter::simulated(endpoint)),
            }
        }
    };
    Ok(link)
}

/// Alarms to evaluate: the configured ones, or the compressor defaults when none
/// are configured and an F70H is polled.
pub fn effective_alarms(settings: &Settings) -> Vec<AlarmConfig> {
    if settings.alarms.is_empty()
        && settings
            .instruments
            .iter()
            .any(|i| i.kind == InstrumentKind::F70h)
    {
        default_compressor_alarms()
    } else {
        settings.alarms.clone()
    }
}

fn task<F>(name: impl Into<String>, future: F) -> (String, JoinHandle<AppResult<()>>)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    (
        name.into(),
        tokio::spawn(async move {
            future.await;
            Ok(())
        }),
    )
}

async fn log_scan_events(
    mut events: broadcast::Receiver<ScanEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ScanEvent::Started { id, started_at }) => info!(%id, %started_at, "scan started"),
                Ok(ScanEvent::Completed(scan)) => info!(
                    id = %scan.id,
                    attributes = scan.snapshot.len(),
                    attempts = scan.attempts,
                    "scan snapshot captured"
                ),
                Ok(ScanEvent::Aborted { id }) => warn!(%id, "scan aborted"),
                Ok(ScanEvent::Failed { id, reason }) => error!(%id, %reason, "scan failed"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "scan log lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

impl DaqApp {
    /// Start with alerts going to the log.
    pub async fn start(settings: Settings) -> AppResult<Self> {
        Self::start_with_notifier(settings, Arc::new(LogNotifier)).await
    }

    /// Build and spawn every component.
    pub async fn start_with_notifier(
        settings: Settings,
        notifier: Arc<dyn Notifier>,
    ) -> AppResult<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = Arc::new(AttributeStore::new(settings.store.staleness_window));
        let mut tasks = Vec::new();
        let mut links = HashMap::new();

        for instrument in &settings.instruments {
            let driver = build_driver(instrument)?;
            let link: SharedLink = Arc::new(tokio::sync::Mutex::new(build_link(
                instrument,
                driver.as_ref(),
            )?));
            let period = settings.period_of(instrument);
            let engine = PollingEngine::new(
                link.clone(),
                driver,
                store.clone(),
                PollingOptions {
                    period,
                    transaction_timeout: settings.polling.transaction_timeout,
                    backoff: settings.polling.backoff(period),
                    stale_after_failures: settings.polling.stale_after_failures,
                },
            );
            let handle = engine.spawn(shutdown_rx.clone());
            tasks.push((
                format!("poll:{}", instrument.id),
                tokio::spawn(async move {
                    handle.await.map_err(|e| DaqError::TaskFailed {
                        task: "poll".into(),
                        reason: e.to_string(),
                    })
                }),
            ));
            links.insert(instrument.id.clone(), link);
        }

        let alarms = effective_alarms(&settings);
        if !alarms.is_empty() {
            let engine = AlarmEngine::from_config(&alarms, notifier);
            tasks.push(task("alarms", engine.run(store.subscribe(), shutdown_rx.clone())));
        }

        let source: Arc<dyn SnapshotSource> = match &settings.scan.source {
            Some(address) => Arc::new(RemoteStore::new(
                ExchangeClient::new(address).with_timeout(settings.exchange.idle_timeout),
            )),
            None => store.clone(),
        };
        let orchestrator = Arc::new(ScanOrchestrator::new(
            source,
            CapturePolicy {
                names: settings.scan.capture.clone(),
                retry: settings.scan.retry_policy(),
                allow_stale: settings.scan.allow_stale,
            },
        ));
        tasks.push(task(
            "scan-log",
            log_scan_events(orchestrator.subscribe(), shutdown_rx.clone()),
        ));

        let server = ExchangeServer::bind(
            settings.exchange.clone(),
            RequestHandler::new(store.clone(), Some(orchestrator.clone())),
        )
        .await?;
        let exchange_addr = server.local_addr()?;
        tasks.push(("exchange".to_string(), server.spawn(shutdown_rx.clone())));

        let motion = match &settings.motion {
            Some(config) => {
                let link = links.get(&config.instrument).cloned().ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "motion.instrument '{}' is not a configured instrument",
                        config.instrument
                    ))
                })?;
                Some(MotionQueue::spawn(
                    config,
                    link,
                    store.clone(),
                    settings.polling.transaction_timeout,
                    shutdown_rx.clone(),
                )?)
            }
            None => None,
        };

        let slit = match &settings.slit {
            Some(config) => {
                let indicator = Arc::new(SlitIndicator::new(store.clone()));
                if let Some(number) = config.initial {
                    indicator.select(number)?;
                }
                Some(indicator)
            }
            None => None,
        };

        info!(
            name = %settings.application.name,
            instruments = links.len(),
            alarms = alarms.len(),
            exchange = %exchange_addr,
            motion = motion.is_some(),
            "telemetry core started"
        );

        Ok(Self {
            store,
            orchestrator,
            links,
            motion,
            slit,
            exchange_addr,
            shutdown_tx,
            tasks,
        })
    }

    /// The process-local attribute store.
    pub fn store(&self) -> &Arc<AttributeStore> {
        &self.store
    }

    /// The scan state machine served over the exchange.
    pub fn orchestrator(&self) -> &Arc<ScanOrchestrator> {
        &self.orchestrator
    }

    /// Shared link of instrument `id`.
    pub fn link(&self, id: &str) -> Option<SharedLink> {
        self.links.get(id).cloned()
    }

    /// Motion queue, when `[motion]` is configured.
    pub fn motion(&self) -> Option<&MotionQueue> {
        self.motion.as_ref()
    }

    /// Slit indicator, when `[slit]` is configured.
    pub fn slit(&self) -> Option<&Arc<SlitIndicator>> {
        self.slit.as_ref()
    }

    /// Address the exchange server listens on.
    pub fn exchange_addr(&self) -> SocketAddr {
        self.exchange_addr
    }

    /// Stop every task.
    ///
    /// # Errors
    ///
    /// `ShutdownFailed` listing each task that failed, panicked or did not stop
    /// within the grace period.
    pub async fn shutdown(self) -> AppResult<()> {
        info!("shutting down");
        // Receivers may already be gone
        let _ = self.shutdown_tx.send(true);

        let mut errors = Vec::new();
        if let Some(motion) = self.motion {
            if tokio::time::timeout(SHUTDOWN_GRACE, motion.join()).await.is_err() {
                errors.push(DaqError::TaskFailed {
                    task: "motion".into(),
                    reason: format!("did not stop within {SHUTDOWN_GRACE:?}"),
                });
            }
        }
        for (name, handle) in self.tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(task = %name, error = %err, "task failed during shutdown");
                    errors.push(err);
                }
                Ok(Err(err)) => {
                    warn!(task = %name, error = %err, "task panicked during shutdown");
                    errors.push(DaqError::TaskFailed {
                        task: name,
                        reason: err.to_string(),
                    });
                }
                Err(_) => {
                    warn!(task = %name, "task did not stop within {SHUTDOWN_GRACE:?}");
                    errors.push(DaqError::TaskFailed {
                        task: name,
                        reason: format!("did not stop within {SHUTDOWN_GRACE:?}"),
                    });
                }
            }
        }

        if errors.is_empty() {
            info!("shutdown complete");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstrumentConfig, LinkConfig};

    const SIMULATED: &str = r#"
[exchange]
bind = "127.0.0.1:0"

[scan]
capture = ["compressor_he_discharge_temp", "slit_width"]

[[instruments]]
id = "compressor"
kind = "f70h"
link = { type = "simulate" }
period = "100ms"

[slit]
initial = 300
"#;

    #[test]
    fn test_compressor_alarms_default_only_without_explicit_alarms() {
        let settings = Settings::from_toml_str(SIMULATED).unwrap();
        assert_eq!(effective_alarms(&settings).len(), 7);

        let explicit = format!(
            "{SIMULATED}\n[[alarms]]\nname = \"hot\"\nattribute = \"compressor_water_out_temp\"\npredicate = {{ type = \"above\", threshold = 40.0 }}\n"
        );
        let settings = Settings::from_toml_str(&explicit).unwrap();
        let alarms = effective_alarms(&settings);
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].name, "hot");
    }

    #[test]
    fn test_simulated_link_uses_driver_protocol() {
        let instrument = InstrumentConfig {
            id: "compressor".into(),
            kind: InstrumentKind::F70h,
            link: LinkConfig::Simulate,
            period: None,
            channels: vec![],
            gauges: vec![],
            names: vec![],
        };
        let driver = build_driver(&instrument).unwrap();
        let link = build_link(&instrument, driver.as_ref()).unwrap();
        assert_eq!(link.session().endpoint, "sim:compressor");
    }

    #[tokio::test]
    async fn test_start_poll_and_shutdown() {
        let settings = Settings::from_toml_str(SIMULATED).unwrap();
        let app = DaqApp::start(settings).await.unwrap();
        assert_eq!(app.slit().unwrap().current().unwrap().number, 300);

        let store = app.store().clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get("compressor_he_discharge_temp").is_err() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        app.orchestrator().start().unwrap();
        let scan = app.orchestrator().complete().await.unwrap();
        assert_eq!(scan.snapshot.len(), 2);

        app.shutdown().await.unwrap();
    }
}
