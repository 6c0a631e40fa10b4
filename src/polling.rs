//! Per-instrument polling loop.
//!
//! One [`PollingEngine`] owns one instrument driver and borrows the instrument's
//! shared link for the duration of each cycle. A cycle connects if needed, lets the
//! driver run its transactions and writes the result to the store as one batch.
//!
//! Failures never end the loop. Each failed cycle grows the delay before the next
//! attempt (capped), and once `stale_after_failures` consecutive cycles have failed
//! the driver's attributes are marked invalid in the store. The first successful
//! cycle writes fresh, valid readings and drops the delay back to the period.

use crate::adapters::SharedLink;
use crate::error::AppResult;
use crate::error_recovery::{Backoff, BackoffPolicy};
use crate::instruments::InstrumentDriver;
use crate::store::AttributeStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Timing for one polling loop.
#[derive(Clone, Debug, PartialEq)]
pub struct PollingOptions {
    /// Delay between successful cycles
    pub period: Duration,
    /// Bound on every single transaction
    pub transaction_timeout: Duration,
    /// Delay growth while failing; `base` is normally `period`
    pub backoff: BackoffPolicy,
    /// Consecutive failed cycles before attributes are marked stale
    pub stale_after_failures: u32,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            transaction_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
            stale_after_failures: 3,
        }
    }
}

/// Polling loop for one instrument.
pub struct PollingEngine {
    id: String,
    link: SharedLink,
    driver: Box<dyn InstrumentDriver>,
    store: Arc<AttributeStore>,
    options: PollingOptions,
    backoff: Backoff,
}

impl PollingEngine {
    /// Engine for `driver`, polling over `link` into `store`.
    pub fn new(
        link: SharedLink,
        driver: Box<dyn InstrumentDriver>,
        store: Arc<AttributeStore>,
        options: PollingOptions,
    ) -> Self {
        Self {
            id: driver.id().to_string(),
            backoff: Backoff::new(options.backoff.clone()),
            link,
            driver,
            store,
            options,
        }
    }

    /// Instrument id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Consecutive failed cycles since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.consecutive_failures()
    }

    /// One cycle without failure bookkeeping; returns the store generation.
    pub async fn poll_once(&mut self) -> AppResult<u64> {
        let batch = {
            let mut link = self.link.lock().await;
            if !link.is_connected() {
                let session = link.connect().await?;
                info!(endpoint = %session.endpoint, "link connected");
            }
            self.driver
                .poll(&mut **link, self.options.transaction_timeout)
                .await?
        };
        debug!(count = batch.len(), "poll cycle complete");
        Ok(self.store.update(&self.id, batch))
    }

    /// One cycle with backoff and staleness handling; returns the delay before
    /// the next cycle.
    pub async fn cycle(&mut self) -> Duration {
        match self.poll_once().await {
            Ok(_) => {
                if self.backoff.consecutive_failures() > 0 {
                    info!(
                        failures = self.backoff.consecutive_failures(),
                        "instrument recovered"
                    );
                }
                self.backoff.on_success();
                self.options.period
            }
            Err(err) => {
                let delay = self.backoff.on_failure();
                let failures = self.backoff.consecutive_failures();
                if err.is_link_failure() {
                    warn!(error = %err, failures, retry_in = ?delay, "poll cycle failed");
                } else {
                    error!(error = %err, failures, retry_in = ?delay, "poll cycle failed");
                }
                if failures >= self.options.stale_after_failures {
                    let marked = self
                        .store
                        .mark_stale(&self.id, &self.driver.attribute_names());
                    if marked > 0 {
                        warn!(marked, failures, "attributes marked stale");
                    }
                }
                delay
            }
        }
    }

    /// Poll until `shutdown` turns true or its sender is dropped, then close the link.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(period = ?self.options.period, "polling started");
        while !*shutdown.borrow() {
            let delay = self.cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        if let Err(err) = self.link.lock().await.disconnect().await {
            warn!(error = %err, "disconnect failed");
        }
        info!("polling stopped");
    }

    /// Run on a new task inside a `poll` span for this instrument.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let span = info_span!("poll", instrument = %self.id);
        tokio::spawn(self.run(shutdown).instrument(span))
    }
}
