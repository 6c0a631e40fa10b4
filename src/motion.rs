//! Motion command queue.
//!
//! Every axis has a FIFO served by its own worker task, so an axis never has more
//! than one command in flight while different axes move concurrently. A command is
//! rendered from the configured template, written on the stage's shared link and
//! then watched in the attribute store: it completes once the axis read-back has
//! stayed within tolerance of the target for the stability window, counting only
//! readings taken after the command was sent. A move that does not settle within
//! the move timeout fails, and the worker continues with the next command.
//!
//! Command statuses stay queryable by uid until cleared. Only the most recent
//! [`RETAINED_FINISHED`] finished commands are kept; older ones are forgotten.

use crate::adapters::{LinkRequest, SharedLink};
use crate::config::{AxisConfig, MotionConfig};
use crate::error::{AppResult, DaqError};
use crate::store::AttributeStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Lifecycle of one command.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionStatus {
    /// Waiting behind earlier commands on the axis
    Queued,
    /// Sent; waiting for the axis to settle
    InFlight,
    /// Settled at the contained position
    Completed(f64),
    /// Rejected, timed out or interrupted by shutdown
    Failed(String),
}

impl MotionStatus {
    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MotionStatus::Completed(_) | MotionStatus::Failed(_))
    }
}

/// Handle for a submitted command.
#[derive(Debug)]
pub struct MotionTicket {
    /// Uid for `status` and `clear`
    pub id: Uuid,
    /// Axis the command was queued on
    pub axis: String,
    /// Requested position
    pub target: f64,
    completion: oneshot::Receiver<AppResult<f64>>,
}

impl MotionTicket {
    /// Wait for the command to finish; returns the settled position.
    pub async fn wait(self) -> AppResult<f64> {
        let axis = self.axis;
        self.completion.await.map_err(|_| {
            DaqError::MotionRejected(format!("queue for axis '{axis}' shut down"))
        })?
    }
}

struct Job {
    id: Uuid,
    target: f64,
    done: oneshot::Sender<AppResult<f64>>,
}

/// Finished commands kept for `status` lookups before the oldest are dropped.
pub const RETAINED_FINISHED: usize = 256;

#[derive(Default)]
struct StatusBook {
    entries: HashMap<Uuid, MotionStatus>,
    // Terminal ids, oldest first
    finished: VecDeque<Uuid>,
}

impl StatusBook {
    fn get(&self, id: &Uuid) -> Option<MotionStatus> {
        self.entries.get(id).cloned()
    }

    fn set(&mut self, id: Uuid, status: MotionStatus) {
        let terminal = status.is_terminal();
        self.entries.insert(id, status);
        if terminal {
            self.finished.push_back(id);
            while self.finished.len() > RETAINED_FINISHED {
                if let Some(old) = self.finished.pop_front() {
                    self.entries.remove(&old);
                }
            }
        }
    }

    fn discard(&mut self, id: &Uuid) {
        self.entries.remove(id);
    }

    fn clear(&mut self, id: &Uuid) -> bool {
        let terminal = self.entries.get(id).is_some_and(MotionStatus::is_terminal);
        if terminal {
            self.entries.remove(id);
            self.finished.retain(|f| f != id);
        }
        terminal
    }
}

type StatusMap = Arc<Mutex<StatusBook>>;

struct AxisQueue {
    config: AxisConfig,
    tx: mpsc::UnboundedSender<Job>,
}

/// Per-axis command queues for one stage.
pub struct MotionQueue {
    axes: HashMap<String, AxisQueue>,
    statuses: StatusMap,
    workers: Vec<JoinHandle<()>>,
}

struct AxisWorker {
    axis: AxisConfig,
    template: String,
    poll_interval: Duration,
    write_timeout: Duration,
    link: SharedLink,
    store: Arc<AttributeStore>,
    statuses: StatusMap,
}

fn render(template: &str, channel: &str, target: f64, id: Uuid) -> AppResult<String> {
    let mut vars = HashMap::new();
    vars.insert("axis".to_string(), channel.to_string());
    vars.insert("target".to_string(), format!("{target}"));
    vars.insert("uid".to_string(), id.simple().to_string());
    strfmt::strfmt(template, &vars)
        .map_err(|e| DaqError::Configuration(format!("bad move template '{template}': {e}")))
}

impl MotionQueue {
    /// Start one worker per configured axis.
    ///
    /// Move commands are written on `link` with `write_timeout`; completion is
    /// judged from `store`.
    pub fn spawn(
        config: &MotionConfig,
        link: SharedLink,
        store: Arc<AttributeStore>,
        write_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> AppResult<Self> {
        render(&config.command_template, "x", 0.0, Uuid::nil())?;

        let statuses: StatusMap = Arc::new(Mutex::new(StatusBook::default()));
        let mut axes = HashMap::new();
        let mut workers = Vec::new();
        for axis in &config.axes {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = AxisWorker {
                axis: axis.clone(),
                template: config.command_template.clone(),
                poll_interval: config.poll_interval,
                write_timeout,
                link: link.clone(),
                store: store.clone(),
                statuses: statuses.clone(),
            };
            let span = info_span!("motion", axis = %axis.name);
            workers.push(tokio::spawn(worker.run(rx, shutdown.clone()).instrument(span)));
            axes.insert(
                axis.name.clone(),
                AxisQueue {
                    config: axis.clone(),
                    tx,
                },
            );
        }
        info!(axes = axes.len(), "motion queue started");
        Ok(Self {
            axes,
            statuses,
            workers,
        })
    }

    /// Names of the controlled axes, sorted.
    pub fn axes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.axes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Queue a move of `axis` to `target`.
    ///
    /// Unknown axes and targets outside the soft limits are rejected here and never
    /// queued.
    pub fn submit(&self, axis: &str, target: f64) -> AppResult<MotionTicket> {
        let queue = self
            .axes
            .get(axis)
            .ok_or_else(|| DaqError::MotionRejected(format!("unknown axis '{axis}'")))?;
        let limits = &queue.config;
        if !target.is_finite()
            || limits.min.is_some_and(|min| target < min)
            || limits.max.is_some_and(|max| target > max)
        {
            return Err(DaqError::MotionRejected(format!(
                "target {target} outside limits [{}, {}] of axis '{axis}'",
                limits.min.map_or("-inf".to_string(), |v| v.to_string()),
                limits.max.map_or("inf".to_string(), |v| v.to_string()),
            )));
        }

        let id = Uuid::new_v4();
        let (done, completion) = oneshot::channel();
        self.statuses.lock().set(id, MotionStatus::Queued);
        if queue.tx.send(Job { id, target, done }).is_err() {
            self.statuses.lock().discard(&id);
            return Err(DaqError::MotionRejected(format!(
                "queue for axis '{axis}' shut down"
            )));
        }
        debug!(%id, axis, target, "motion command queued");
        Ok(MotionTicket {
            id,
            axis: axis.to_string(),
            target,
            completion,
        })
    }

    /// Status of command `id`; `None` once cleared or aged out.
    pub fn status(&self, id: Uuid) -> Option<MotionStatus> {
        self.statuses.lock().get(&id)
    }

    /// Forget a finished command. Pending commands are kept.
    pub fn clear(&self, id: Uuid) -> bool {
        self.statuses.lock().clear(&id)
    }

    /// Wait for every axis worker to stop (after shutdown).
    pub async fn join(self) {
        drop(self.axes);
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "motion worker panicked");
            }
        }
    }
}

impl AxisWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let job = tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            self.set_status(job.id, MotionStatus::InFlight);
            let result = tokio::select! {
                result = self.execute(job.id, job.target) => result,
                _ = shutdown.changed() => Err(DaqError::MotionRejected("motion queue shutting down".into())),
            };
            match &result {
                Ok(position) => {
                    info!(id = %job.id, target = job.target, position, "move complete");
                    self.set_status(job.id, MotionStatus::Completed(*position));
                }
                Err(err) => {
                    warn!(id = %job.id, target = job.target, error = %err, "move failed");
                    self.set_status(job.id, MotionStatus::Failed(err.to_string()));
                }
            }
            // Caller may have dropped the ticket
            let _ = job.done.send(result);
        }
        debug!("motion worker stopped");
    }

    fn set_status(&self, id: Uuid, status: MotionStatus) {
        self.statuses.lock().set(id, status);
    }

    async fn execute(&self, id: Uuid, target: f64) -> AppResult<f64> {
        let channel = self.axis.channel.as_deref().unwrap_or(&self.axis.name);
        let command = render(&self.template, channel, target, id)?;

        let dispatched = Utc::now();
        {
            let mut link = self.link.lock().await;
            if !link.is_connected() {
                link.connect().await?;
            }
            link.transact(&LinkRequest::Write(command.clone()), self.write_timeout)
                .await?;
        }
        debug!(%id, %command, "move dispatched");

        tokio::time::timeout(self.axis.move_timeout, self.settle(target, dispatched))
            .await
            .map_err(|_| DaqError::MotionTimeout {
                axis: self.axis.name.clone(),
                target,
            })
    }

    /// Poll the store until the read-back has been within tolerance for the
    /// stability window.
    async fn settle(&self, target: f64, dispatched: DateTime<Utc>) -> f64 {
        let mut within_since: Option<Instant> = None;
        loop {
            let position = self
                .store
                .get(&self.axis.position_attribute)
                .ok()
                .filter(|attr| attr.valid && attr.timestamp >= dispatched)
                .and_then(|attr| attr.value.as_f64());

            match position {
                Some(position) if (position - target).abs() <= self.axis.tolerance => {
                    let since = *within_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.axis.stability_window {
                        return position;
                    }
                }
                _ => within_since = None,
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
