//! Analyzer slit indicator.
//!
//! The analyzer slit is changed by hand; the operator records the selection here
//! and it is published to the store so scans capture it. Nothing re-reads the slit,
//! so the batch is held: it stays valid past the store's staleness window.

use crate::core::Attribute;
use crate::error::{AppResult, DaqError};
use crate::store::AttributeStore;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// One physical slit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SlitSetting {
    /// Number engraved on the slit selector
    pub number: u32,
    /// Width in mm
    pub width: f64,
    /// Curved (true) or straight aperture
    pub curved: bool,
}

impl SlitSetting {
    /// `"curved"` or `"straight"`.
    pub fn aperture(&self) -> &'static str {
        if self.curved {
            "curved"
        } else {
            "straight"
        }
    }
}

const fn slit(number: u32, width: f64, curved: bool) -> SlitSetting {
    SlitSetting {
        number,
        width,
        curved,
    }
}

/// Slits fitted to the analyzer.
pub const SLIT_TABLE: [SlitSetting; 9] = [
    slit(100, 0.05, false),
    slit(200, 0.1, false),
    slit(300, 0.2, false),
    slit(400, 0.3, false),
    slit(500, 0.2, true),
    slit(600, 0.3, true),
    slit(700, 0.5, true),
    slit(800, 0.8, true),
    slit(900, 1.5, true),
];

/// Attributes published on every selection.
pub const SLIT_ATTRIBUTES: [&str; 3] = ["slit_number", "slit_width", "slit_aperture"];

/// Operator-set slit selection, published to the store.
pub struct SlitIndicator {
    store: Arc<AttributeStore>,
    current: Mutex<Option<SlitSetting>>,
}

impl SlitIndicator {
    /// Indicator with no selection yet.
    pub fn new(store: Arc<AttributeStore>) -> Self {
        Self {
            store,
            current: Mutex::new(None),
        }
    }

    /// Record slit `number` and publish it as one batch.
    pub fn select(&self, number: u32) -> AppResult<SlitSetting> {
        let setting = SLIT_TABLE
            .iter()
            .copied()
            .find(|s| s.number == number)
            .ok_or_else(|| DaqError::Configuration(format!("no slit numbered {number}")))?;

        let now = Utc::now();
        let batch = vec![
            Attribute::new("slit_number", f64::from(setting.number), "").with_timestamp(now),
            Attribute::new("slit_width", setting.width, "mm").with_timestamp(now),
            Attribute::new("slit_aperture", setting.aperture(), "").with_timestamp(now),
        ];
        *self.current.lock() = Some(setting);
        self.store.update_held("slit", batch);
        info!(slit = number, width = setting.width, aperture = setting.aperture(), "slit selected");
        Ok(setting)
    }

    /// Last selection, if any.
    pub fn current(&self) -> Option<SlitSetting> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AttributeValue;
    use crate::error_recovery::RetryPolicy;
    use crate::scan::{CapturePolicy, ScanOrchestrator};
    use std::time::Duration;

    #[test]
    fn test_select_publishes_batch() {
        let store = Arc::new(AttributeStore::default());
        let indicator = SlitIndicator::new(store.clone());
        assert_eq!(indicator.current(), None);

        let setting = indicator.select(700).unwrap();
        assert!(setting.curved);
        assert_eq!(store.get("slit_width").unwrap().value, AttributeValue::Number(0.5));
        assert_eq!(
            store.get("slit_aperture").unwrap().value,
            AttributeValue::from("curved")
        );
        assert_eq!(store.generation(), 1);
        assert_eq!(indicator.current(), Some(setting));
    }

    #[test]
    fn test_unknown_slit_rejected() {
        let store = Arc::new(AttributeStore::default());
        let indicator = SlitIndicator::new(store.clone());
        assert!(indicator.select(150).is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_selection_outlives_staleness_window_for_scans() {
        let store = Arc::new(AttributeStore::new(Some(Duration::from_millis(50))));
        let indicator = SlitIndicator::new(store.clone());
        indicator.select(500).unwrap();
        store.update("cryo", vec![Attribute::new("TA", 12.0, "K")]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!store.get("TA").unwrap().valid);

        let names = ["slit_number", "slit_width", "slit_aperture"];
        let orchestrator = ScanOrchestrator::new(
            store.clone(),
            CapturePolicy {
                names: names.iter().map(|n| n.to_string()).collect(),
                retry: RetryPolicy {
                    max_attempts: 3,
                    backoff_delay: Duration::from_millis(5),
                },
                allow_stale: false,
            },
        );
        orchestrator.start().unwrap();
        let scan = orchestrator.complete().await.unwrap();
        assert_eq!(scan.attempts, 1);
        assert!(scan.snapshot.values().all(|a| a.valid));
        assert_eq!(scan.snapshot["slit_number"].value, AttributeValue::Number(500.0));
    }
}
