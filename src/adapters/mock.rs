//! Scripted link adapter for tests and simulation.
//!
//! Replies come from a responder closure. Every request is appended to a shared
//! transaction log, and an `online` switch lets a test pull the cable mid-run.

use super::{LinkAdapter, LinkReply, LinkRequest, LinkSession, LinkState};
use crate::error::LinkError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Produces the reply for one request.
pub type Responder = Box<dyn FnMut(&LinkRequest) -> Result<LinkReply, LinkError> + Send>;

/// Mock adapter driven by a [`Responder`].
pub struct MockAdapter {
    session: LinkSession,
    responder: Responder,
    log: Arc<Mutex<Vec<LinkRequest>>>,
    online: Arc<AtomicBool>,
    latency: Duration,
}

impl MockAdapter {
    /// Adapter answering every request through `responder`.
    pub fn new(endpoint: impl Into<String>, responder: Responder) -> Self {
        Self {
            session: LinkSession::new(endpoint),
            responder,
            log: Arc::new(Mutex::new(Vec::new())),
            online: Arc::new(AtomicBool::new(true)),
            latency: Duration::ZERO,
        }
    }

    /// Adapter that answers every query with `reply` and acknowledges writes.
    pub fn fixed(endpoint: impl Into<String>, reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(
            endpoint,
            Box::new(move |request| match request {
                LinkRequest::Write(_) => Ok(LinkReply::Ack),
                _ => Ok(LinkReply::Text(reply.clone())),
            }),
        )
    }

    /// Generic simulated instrument: queries read a slow sine around 1.0, writes are
    /// acknowledged and register reads return zeros.
    pub fn simulated(endpoint: impl Into<String>) -> Self {
        let start = std::time::Instant::now();
        Self::new(
            endpoint,
            Box::new(move |request| match request {
                LinkRequest::Query(_) => {
                    let t = start.elapsed().as_secs_f64();
                    Ok(LinkReply::Text(format!("{:.4}", 1.0 + 0.1 * (t / 10.0).sin())))
                }
                LinkRequest::Write(_) => Ok(LinkReply::Ack),
                LinkRequest::ReadHoldingRegisters { count, .. }
                | LinkRequest::ReadInputRegisters { count, .. } => {
                    Ok(LinkReply::Registers(vec![0; usize::from(*count)]))
                }
            }),
        )
    }

    /// Delay every transaction by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shared log of every request the adapter received.
    pub fn transactions(&self) -> Arc<Mutex<Vec<LinkRequest>>> {
        self.log.clone()
    }

    /// Switch that takes the simulated instrument offline when set to false.
    pub fn online_switch(&self) -> Arc<AtomicBool> {
        self.online.clone()
    }
}

#[async_trait]
impl LinkAdapter for MockAdapter {
    fn session(&self) -> &LinkSession {
        &self.session
    }

    async fn connect(&mut self) -> Result<LinkSession, LinkError> {
        self.session.state = LinkState::Connecting;
        if !self.online.load(Ordering::SeqCst) {
            return Err(self
                .session
                .fail(LinkError::Disconnected("mock instrument offline".to_string())));
        }
        self.session.state = LinkState::Connected;
        Ok(self.session.clone())
    }

    async fn transact(
        &mut self,
        request: &LinkRequest,
        timeout: Duration,
    ) -> Result<LinkReply, LinkError> {
        if self.session.state != LinkState::Connected {
            return Err(self
                .session
                .fail(LinkError::Disconnected("not connected".to_string())));
        }
        self.log.lock().push(request.clone());

        if !self.online.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
            return Err(self.session.fail(LinkError::Timeout(timeout)));
        }
        if !self.latency.is_zero() {
            if self.latency > timeout {
                tokio::time::sleep(timeout).await;
                return Err(self.session.fail(LinkError::Timeout(timeout)));
            }
            tokio::time::sleep(self.latency).await;
        }

        (self.responder)(request).map_err(|err| self.session.fail(err))
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.session.state = LinkState::Disconnected;
        Ok(())
    }
}
