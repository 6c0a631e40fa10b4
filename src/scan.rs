//! Scan orchestrator.
//!
//! State machine coordinating one acquisition run with the external acquisition
//! program:
//!
//! ```text
//! Idle --start--> Running --complete--> Finalizing --captured--> Idle
//!                    |                      |
//!                    '-------abort----------'----> Idle
//! ```
//!
//! At most one scan exists at a time. A second `start` while a scan is running or
//! finalizing is rejected with `ScanAlreadyRunning`, never queued.
//!
//! `complete` takes exactly one snapshot of the configured capture set. Capture is
//! retried a bounded number of times; a snapshot missing an attribute, or holding a
//! stale one when stale readings are not allowed, counts as a failed attempt. When
//! every attempt fails the scan fails loudly; it never completes with a partial or
//! substituted snapshot.
//!
//! An abort during finalization returns the orchestrator to `Idle` at once. The
//! in-flight capture still runs to completion and its result is discarded.

use crate::core::Snapshot;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{retry_with_policy, RetryPolicy};
use crate::store::AttributeStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where end-of-scan snapshots come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Atomic read of `names`. Unknown names are absent from the result.
    async fn capture(&self, names: &[String]) -> AppResult<Snapshot>;
}

#[async_trait]
impl SnapshotSource for AttributeStore {
    async fn capture(&self, names: &[String]) -> AppResult<Snapshot> {
        Ok(self.snapshot(names))
    }
}

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanPhase {
    /// No scan
    Idle,
    /// Scan started, waiting for the end-of-scan signal
    Running,
    /// Capturing the end-of-scan snapshot
    Finalizing,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanPhase::Idle => "Idle",
            ScanPhase::Running => "Running",
            ScanPhase::Finalizing => "Finalizing",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanStatus {
    /// Current phase
    pub phase: ScanPhase,
    /// Current scan, if any
    pub scan_id: Option<Uuid>,
    /// Start of the current scan
    pub started_at: Option<DateTime<Utc>>,
}

/// A finished scan with its single captured snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedScan {
    /// Scan id
    pub id: Uuid,
    /// When `start` was accepted
    pub started_at: DateTime<Utc>,
    /// When the snapshot was captured
    pub finished_at: DateTime<Utc>,
    /// The single end-of-scan snapshot
    pub snapshot: Snapshot,
    /// Capture attempts used
    pub attempts: u32,
}

/// Lifecycle notifications for the metadata writer.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// Scan accepted
    Started {
        /// New scan id
        id: Uuid,
        /// When `start` was accepted
        started_at: DateTime<Utc>,
    },
    /// Snapshot captured
    Completed(Arc<CompletedScan>),
    /// Scan abandoned; any in-flight capture is discarded
    Aborted {
        /// Abandoned scan
        id: Uuid,
    },
    /// Capture failed after every retry
    Failed {
        /// Failed scan
        id: Uuid,
        /// Last capture error
        reason: String,
    },
}

/// Capture settings.
#[derive(Debug, Clone)]
pub struct CapturePolicy {
    /// Names captured at scan end
    pub names: Vec<String>,
    /// Bounded retry for capture
    pub retry: RetryPolicy,
    /// Accept invalid readings
    pub allow_stale: bool,
}

struct ScanSession {
    id: Uuid,
    phase: ScanPhase,
    started_at: DateTime<Utc>,
}

/// The scan state machine.
pub struct ScanOrchestrator {
    session: Mutex<Option<ScanSession>>,
    source: Arc<dyn SnapshotSource>,
    policy: CapturePolicy,
    events: broadcast::Sender<ScanEvent>,
}

impl ScanOrchestrator {
    /// Idle orchestrator capturing from `source`.
    pub fn new(source: Arc<dyn SnapshotSource>, policy: CapturePolicy) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            session: Mutex::new(None),
            source,
            policy,
            events,
        }
    }

    /// Begin a scan.
    ///
    /// # Errors
    ///
    /// `ScanAlreadyRunning` when a scan is running or finalizing. The existing
    /// session is left untouched.
    pub fn start(&self) -> AppResult<Uuid> {
        let mut session = self.session.lock();
        if let Some(current) = session.as_ref() {
            return Err(DaqError::ScanAlreadyRunning(current.id.to_string()));
        }
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        *session = Some(ScanSession {
            id,
            phase: ScanPhase::Running,
            started_at,
        });
        drop(session);

        info!(scan = %id, "scan started");
        let _ = self.events.send(ScanEvent::Started { id, started_at });
        Ok(id)
    }

    /// Finish the running scan and capture its snapshot.
    ///
    /// # Errors
    ///
    /// - `ScanNotRunning` when no scan is in `Running` (including a second
    ///   completion racing a first one that is still finalizing)
    /// - `ScanAborted` when the scan was aborted while the capture was in flight
    /// - `SnapshotCaptureFailed` when every capture attempt failed
    pub async fn complete(&self) -> AppResult<CompletedScan> {
        let (id, started_at) = {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(s) if s.phase == ScanPhase::Running => {
                    s.phase = ScanPhase::Finalizing;
                    (s.id, s.started_at)
                }
                _ => return Err(DaqError::ScanNotRunning),
            }
        };
        info!(scan = %id, "scan finalizing");

        let captured = retry_with_policy(&self.policy.retry, |attempt| async move {
            self.capture_once()
                .await
                .map(|snapshot| (snapshot, attempt))
        })
        .await;

        // Hand back only if this scan still owns the session.
        let mut session = self.session.lock();
        if !matches!(session.as_ref(), Some(s) if s.id == id) {
            drop(session);
            warn!(scan = %id, "scan aborted during capture; snapshot discarded");
            return Err(DaqError::ScanAborted(id.to_string()));
        }
        *session = None;
        drop(session);

        match captured {
            Ok((snapshot, attempts)) => {
                let completed = CompletedScan {
                    id,
                    started_at,
                    finished_at: Utc::now(),
                    snapshot,
                    attempts,
                };
                info!(scan = %id, attributes = completed.snapshot.len(), attempts, "scan completed");
                let _ = self
                    .events
                    .send(ScanEvent::Completed(Arc::new(completed.clone())));
                Ok(completed)
            }
            Err(exhausted) => {
                let reason = exhausted.last_error.to_string();
                error!(scan = %id, attempts = exhausted.attempts, %reason, "snapshot capture failed");
                let _ = self.events.send(ScanEvent::Failed {
                    id,
                    reason: reason.clone(),
                });
                Err(DaqError::SnapshotCaptureFailed {
                    attempts: exhausted.attempts,
                    reason,
                })
            }
        }
    }

    /// Abort the current scan, running or finalizing.
    pub fn abort(&self) -> AppResult<Uuid> {
        let aborted = self
            .session
            .lock()
            .take()
            .ok_or(DaqError::ScanNotRunning)?;
        info!(scan = %aborted.id, phase = %aborted.phase, "scan aborted");
        let _ = self.events.send(ScanEvent::Aborted { id: aborted.id });
        Ok(aborted.id)
    }

    /// Current phase and scan.
    pub fn status(&self) -> ScanStatus {
        match self.session.lock().as_ref() {
            Some(s) => ScanStatus {
                phase: s.phase,
                scan_id: Some(s.id),
                started_at: Some(s.started_at),
            },
            None => ScanStatus {
                phase: ScanPhase::Idle,
                scan_id: None,
                started_at: None,
            },
        }
    }

    /// Receive lifecycle events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Names captured at scan end.
    pub fn capture_set(&self) -> &[String] {
        &self.policy.names
    }

    async fn capture_once(&self) -> AppResult<Snapshot> {
        let mut snapshot = self.source.capture(&self.policy.names).await?;
        if !self.policy.names.is_empty() {
            snapshot.retain(|name, _| self.policy.names.contains(name));
        }

        let missing: Vec<&str> = self
            .policy
            .names
            .iter()
            .filter(|n| !snapshot.contains_key(*n))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(DaqError::AttributeNotFound(missing.join(", ")));
        }

        if !self.policy.allow_stale {
            let stale: Vec<&str> = snapshot
                .values()
                .filter(|a| !a.valid)
                .map(|a| a.name.as_str())
                .collect();
            if !stale.is_empty() {
                return Err(DaqError::StaleAttribute(stale.join(", ")));
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Attribute;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn policy(names: &[&str]) -> CapturePolicy {
        CapturePolicy {
            names: names.iter().map(|s| s.to_string()).collect(),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_delay: Duration::from_millis(5),
            },
            allow_stale: false,
        }
    }

    fn populated_store() -> Arc<AttributeStore> {
        let store = Arc::new(AttributeStore::default());
        store.update(
            "cryo",
            vec![Attribute::new("TB", 12.0, "K"), Attribute::new("TA", 30.0, "K")],
        );
        store.update("gauges", vec![Attribute::new("torr_main", 1e-10, "torr")]);
        store
    }

    #[tokio::test]
    async fn test_full_lifecycle_captures_exactly_the_capture_set() {
        let orchestrator = ScanOrchestrator::new(populated_store(), policy(&["TB", "torr_main"]));
        let mut events = orchestrator.subscribe();

        let id = orchestrator.start().unwrap();
        assert_eq!(orchestrator.status().phase, ScanPhase::Running);

        let scan = orchestrator.complete().await.unwrap();
        assert_eq!(scan.id, id);
        assert_eq!(scan.attempts, 1);
        assert_eq!(
            scan.snapshot.keys().cloned().collect::<Vec<_>>(),
            vec!["TB".to_string(), "torr_main".to_string()]
        );
        assert_eq!(orchestrator.status().phase, ScanPhase::Idle);

        assert!(matches!(events.recv().await.unwrap(), ScanEvent::Started { .. }));
        assert!(matches!(events.recv().await.unwrap(), ScanEvent::Completed(c) if c.id == id));
    }

    #[tokio::test]
    async fn test_second_start_rejected_without_side_effects() {
        let orchestrator = ScanOrchestrator::new(populated_store(), policy(&["TB"]));
        let id = orchestrator.start().unwrap();
        let before = orchestrator.status();

        let err = orchestrator.start().unwrap_err();
        assert!(matches!(err, DaqError::ScanAlreadyRunning(ref running) if *running == id.to_string()));
        assert_eq!(orchestrator.status(), before);
    }

    #[tokio::test]
    async fn test_complete_when_idle() {
        let orchestrator = ScanOrchestrator::new(populated_store(), policy(&["TB"]));
        assert!(matches!(
            orchestrator.complete().await,
            Err(DaqError::ScanNotRunning)
        ));
    }

    #[tokio::test]
    async fn test_missing_attribute_fails_after_bounded_retries() {
        let orchestrator =
            ScanOrchestrator::new(populated_store(), policy(&["TB", "slit_number"]));
        orchestrator.start().unwrap();

        let err = orchestrator.complete().await.unwrap_err();
        match err {
            DaqError::SnapshotCaptureFailed { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("slit_number"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Failure returns to Idle so the operator can start again
        assert_eq!(orchestrator.status().phase, ScanPhase::Idle);
    }

    #[tokio::test]
    async fn test_stale_attribute_rejected_unless_allowed() {
        let store = populated_store();
        store.mark_stale("cryo", &["TB".to_string()]);

        let strict = ScanOrchestrator::new(store.clone(), policy(&["TB"]));
        strict.start().unwrap();
        assert!(matches!(
            strict.complete().await,
            Err(DaqError::SnapshotCaptureFailed { .. })
        ));

        let mut lenient_policy = policy(&["TB"]);
        lenient_policy.allow_stale = true;
        let lenient = ScanOrchestrator::new(store, lenient_policy);
        lenient.start().unwrap();
        let scan = lenient.complete().await.unwrap();
        assert!(!scan.snapshot["TB"].valid);
    }

    struct FlakySource {
        store: Arc<AttributeStore>,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SnapshotSource for FlakySource {
        async fn capture(&self, names: &[String]) -> AppResult<Snapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DaqError::ExchangeClientTimeout("remote store".into()));
            }
            Ok(self.store.snapshot(names))
        }
    }

    #[tokio::test]
    async fn test_transient_capture_failure_is_retried() {
        let source = Arc::new(FlakySource {
            store: populated_store(),
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let orchestrator = ScanOrchestrator::new(source.clone(), policy(&["TB"]));
        orchestrator.start().unwrap();

        let scan = orchestrator.complete().await.unwrap();
        assert_eq!(scan.attempts, 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    struct SlowSource(Arc<AttributeStore>);

    #[async_trait]
    impl SnapshotSource for SlowSource {
        async fn capture(&self, names: &[String]) -> AppResult<Snapshot> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(self.0.snapshot(names))
        }
    }

    #[tokio::test]
    async fn test_abort_during_capture_discards_snapshot() {
        let orchestrator = Arc::new(ScanOrchestrator::new(
            Arc::new(SlowSource(populated_store())),
            policy(&["TB"]),
        ));
        orchestrator.start().unwrap();

        let completing = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.complete().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(orchestrator.status().phase, ScanPhase::Finalizing);
        // Finalizing still blocks a new scan
        assert!(orchestrator.start().is_err());

        orchestrator.abort().unwrap();
        assert_eq!(orchestrator.status().phase, ScanPhase::Idle);

        let result = completing.await.unwrap();
        assert!(matches!(result, Err(DaqError::ScanAborted(_))));
        assert_eq!(orchestrator.status().phase, ScanPhase::Idle);
    }
}
