//! Edge-triggered alarms.
//!
//! Each [`AlarmCondition`] watches one attribute. The [`AlarmEngine`] subscribes to
//! store updates and evaluates only the conditions whose attribute is in the batch.
//! A condition notifies on transitions only: it has to hold (or stop holding) for
//! `debounce` consecutive evaluations before the state flips, and a sustained state
//! produces nothing further.

use crate::config::AlarmConfig;
use crate::core::{Attribute, AttributeValue};
use crate::error::{AppResult, DaqError};
use crate::instruments::f70h::{alarm_attribute, ALARM_BITS};
use crate::store::StoreUpdate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// When an alarm is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Numeric value strictly above `threshold`
    Above { threshold: f64 },
    /// Numeric value strictly below `threshold`
    Below { threshold: f64 },
    /// Numeric value outside `[low, high]`
    Outside { low: f64, high: f64 },
    /// Value equal to `value`
    Equals { value: AttributeValue },
    /// Attribute marked invalid
    Stale,
}

impl Predicate {
    /// Whether `attr` satisfies the predicate, or `None` if the reading cannot be
    /// judged (invalid reading, text where a number is needed).
    pub fn holds(&self, attr: &Attribute) -> Option<bool> {
        if let Predicate::Stale = self {
            return Some(!attr.valid);
        }
        if !attr.valid {
            return None;
        }
        match self {
            Predicate::Above { threshold } => attr.value.as_f64().map(|v| v > *threshold),
            Predicate::Below { threshold } => attr.value.as_f64().map(|v| v < *threshold),
            Predicate::Outside { low, high } => {
                attr.value.as_f64().map(|v| v < *low || v > *high)
            }
            Predicate::Equals { value } => Some(attr.value == *value),
            Predicate::Stale => Some(!attr.valid),
        }
    }
}

/// One alarm with its debounce state.
#[derive(Debug, Clone)]
pub struct AlarmCondition {
    /// Unique alarm name
    pub name: String,
    /// Watched attribute
    pub attribute: String,
    /// Condition under which the alarm is active
    pub predicate: Predicate,
    /// Consecutive evaluations needed for a transition
    pub debounce: u32,
    /// Text sent with notifications
    pub message: String,
    active: bool,
    // Consecutive evaluations disagreeing with `active`
    streak: u32,
}

impl AlarmCondition {
    /// Condition with `debounce` clamped to at least 1.
    pub fn new(
        name: impl Into<String>,
        attribute: impl Into<String>,
        predicate: Predicate,
        debounce: u32,
    ) -> Self {
        let name = name.into();
        Self {
            message: name.clone(),
            name,
            attribute: attribute.into(),
            predicate,
            debounce: debounce.max(1),
            active: false,
            streak: 0,
        }
    }

    /// Replace the notification text.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Condition from its configuration entry.
    pub fn from_config(config: &AlarmConfig) -> Self {
        let condition = Self::new(
            &config.name,
            &config.attribute,
            config.predicate.clone(),
            config.debounce,
        );
        match &config.message {
            Some(message) => condition.with_message(message),
            None => condition,
        }
    }

    /// Debounced state.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one reading; returns the new state on a debounced transition.
    pub fn evaluate(&mut self, attr: &Attribute) -> Option<bool> {
        let holds = self.predicate.holds(attr)?;
        if holds == self.active {
            self.streak = 0;
            return None;
        }
        self.streak += 1;
        if self.streak < self.debounce {
            return None;
        }
        self.streak = 0;
        self.active = holds;
        Some(holds)
    }
}

/// A debounced transition.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmEvent {
    /// Alarm that changed state
    pub name: String,
    /// Watched attribute
    pub attribute: String,
    /// True when the alarm became active
    pub active: bool,
    /// Notification text
    pub message: String,
    /// Reading that completed the transition
    pub value: AttributeValue,
    /// Time of the transition
    pub timestamp: DateTime<Utc>,
}

impl AlarmEvent {
    /// Text handed to the notifier.
    pub fn text(&self) -> String {
        let state = if self.active { "ALARM" } else { "CLEARED" };
        format!(
            "[{state}] {}: {} ({} = {})",
            self.name, self.message, self.attribute, self.value
        )
    }
}

/// Destination for alarm notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_alert(&self, message: &str) -> AppResult<()>;
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_alert(&self, message: &str) -> AppResult<()> {
        warn!(target: "erpes_daq::alert", "{message}");
        Ok(())
    }
}

/// Forwards alerts over an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<String>,
}

impl ChannelNotifier {
    /// Notifier and the receiving end of its queue.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send_alert(&self, message: &str) -> AppResult<()> {
        self.tx
            .send(message.to_string())
            .await
            .map_err(|_| DaqError::Notification("alert receiver dropped".into()))
    }
}

/// Compressor alarms derived from the F70H status bits.
pub fn default_compressor_alarms() -> Vec<AlarmConfig> {
    ALARM_BITS
        .iter()
        .map(|(_, suffix, label)| AlarmConfig {
            name: format!("compressor_{suffix}"),
            attribute: alarm_attribute(suffix),
            predicate: Predicate::Equals {
                value: AttributeValue::Number(1.0),
            },
            debounce: 2,
            message: Some(format!("Compressor {label} alarm")),
        })
        .collect()
}

/// Evaluates conditions against store updates and notifies on transitions.
pub struct AlarmEngine {
    conditions: Vec<AlarmCondition>,
    notifier: Arc<dyn Notifier>,
}

impl AlarmEngine {
    /// Engine over `conditions`, alerting through `notifier`.
    pub fn new(conditions: Vec<AlarmCondition>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            conditions,
            notifier,
        }
    }

    /// Engine built from configuration entries.
    pub fn from_config(configs: &[AlarmConfig], notifier: Arc<dyn Notifier>) -> Self {
        Self::new(configs.iter().map(AlarmCondition::from_config).collect(), notifier)
    }

    /// Number of conditions.
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// True without any condition.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Names of currently active alarms.
    pub fn active(&self) -> Vec<&str> {
        self.conditions
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Evaluate every condition watching an attribute in `batch`.
    pub fn evaluate(&mut self, batch: &[Attribute]) -> Vec<AlarmEvent> {
        let mut events = Vec::new();
        for attr in batch {
            for condition in self
                .conditions
                .iter_mut()
                .filter(|c| c.attribute == attr.name)
            {
                if let Some(active) = condition.evaluate(attr) {
                    events.push(AlarmEvent {
                        name: condition.name.clone(),
                        attribute: condition.attribute.clone(),
                        active,
                        message: condition.message.clone(),
                        value: attr.value.clone(),
                        timestamp: attr.timestamp,
                    });
                }
            }
        }
        events
    }

    async fn notify(&self, events: &[AlarmEvent]) {
        for event in events {
            if event.active {
                warn!(alarm = %event.name, value = %event.value, "alarm raised");
            } else {
                info!(alarm = %event.name, value = %event.value, "alarm cleared");
            }
            if let Err(err) = self.notifier.send_alert(&event.text()).await {
                error!(alarm = %event.name, error = %err, "failed to deliver alert");
            }
        }
    }

    /// Process one store update.
    pub async fn handle(&mut self, update: &StoreUpdate) -> Vec<AlarmEvent> {
        let events = self.evaluate(&update.attributes);
        self.notify(&events).await;
        events
    }

    /// React to store updates until shutdown or until the store goes away.
    pub async fn run(
        mut self,
        mut updates: broadcast::Receiver<StoreUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(conditions = self.conditions.len(), "alarm engine started");
        loop {
            tokio::select! {
                received = updates.recv() => match received {
                    Ok(update) => {
                        self.handle(&update).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "alarm engine lagged behind store updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("store update channel closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("alarm engine stopped");
    }

    /// Run on a new task inside an `alarms` span.
    pub fn spawn(
        self,
        updates: broadcast::Receiver<StoreUpdate>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let span = info_span!("alarms", conditions = self.len());
        tokio::spawn(self.run(updates, shutdown).instrument(span))
    }
}
