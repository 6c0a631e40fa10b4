//! Exchange protocol client.
//!
//! Keeps one connection open and reconnects on demand. Used three ways: by
//! operators (`erpes-daq query`), as the link of a [`MirrorDriver`] in the
//! aggregating front-end, and as a remote [`SnapshotSource`] for a scan
//! orchestrator that does not own the instruments.
//!
//! [`MirrorDriver`]: crate::instruments::MirrorDriver

use super::protocol::{self, Record, Reply, Request, TERMINATOR};
use crate::adapters::{LinkAdapter, LinkReply, LinkRequest, LinkSession, LinkState};
use crate::core::Snapshot;
use crate::error::{AppResult, DaqError, LinkError};
use crate::scan::SnapshotSource;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Client for one exchange server.
pub struct ExchangeClient {
    address: String,
    timeout: Duration,
    session: LinkSession,
    stream: Option<BufReader<TcpStream>>,
}

impl ExchangeClient {
    /// Client for `address` (`host:port`) with a 5 s timeout.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            session: LinkSession::new(address.clone()),
            address,
            timeout: Duration::from_secs(5),
            stream: None,
        }
    }

    /// Bound on connecting and on each request/reply exchange.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request and decode the reply.
    pub async fn request(&mut self, request: &Request) -> AppResult<Reply> {
        let timeout = self.timeout;
        let lines = match self.round_trip(&request.encode(), timeout).await {
            Ok(lines) => lines,
            Err(LinkError::Timeout(_)) => {
                return Err(DaqError::ExchangeClientTimeout(format!(
                    "{} did not answer within {timeout:?}",
                    self.address
                )))
            }
            Err(err) => return Err(err.into()),
        };
        protocol::decode_reply(&lines)
    }

    /// Fetch records for `names` (empty: all).
    pub async fn fetch(&mut self, names: &[String]) -> AppResult<Vec<Record>> {
        match self.request(&Request::Attributes(names.to_vec())).await? {
            Reply::Records(records) => Ok(records),
            Reply::Ok(text) => Err(unexpected(&text)),
        }
    }

    /// Begin a scan on the server; returns the scan id.
    pub async fn start_scan(&mut self) -> AppResult<String> {
        self.control(Request::Start).await
    }

    /// Signal end-of-scan; returns the captured snapshot.
    pub async fn end_scan(&mut self) -> AppResult<Snapshot> {
        match self.request(&Request::End).await? {
            Reply::Records(records) => Ok(found(records)),
            Reply::Ok(text) => Err(unexpected(&text)),
        }
    }

    /// Abort the server's scan; returns its id.
    pub async fn abort_scan(&mut self) -> AppResult<String> {
        self.control(Request::Abort).await
    }

    /// `<phase> [scan-id]`
    pub async fn scan_status(&mut self) -> AppResult<String> {
        self.control(Request::Status).await
    }

    /// Round-trip `@PING`.
    pub async fn ping(&mut self) -> AppResult<()> {
        self.control(Request::Ping).await.map(|_| ())
    }

    async fn control(&mut self, request: Request) -> AppResult<String> {
        match self.request(&request).await? {
            Reply::Ok(text) => Ok(text),
            Reply::Records(_) => Err(DaqError::ProtocolError(format!(
                "expected OK reply to {}",
                request.encode()
            ))),
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), LinkError> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        Ok(())
    }

    /// Write one line and collect reply lines up to the terminator.
    async fn round_trip(&mut self, line: &str, timeout: Duration) -> Result<Vec<String>, LinkError> {
        self.ensure_connected().await?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(LinkError::Disconnected("not connected".into()));
        };
        debug!(address = %self.address, request = line, "exchange ->");

        let exchange = async {
            let mut payload = line.to_string();
            payload.push('\n');
            stream
                .get_mut()
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| LinkError::Disconnected(format!("write failed: {e}")))?;

            let mut lines = Vec::new();
            let mut buf = String::new();
            loop {
                buf.clear();
                let n = stream
                    .read_line(&mut buf)
                    .await
                    .map_err(|e| LinkError::Disconnected(format!("read failed: {e}")))?;
                if n == 0 {
                    return Err(LinkError::Disconnected(
                        "server closed connection mid-reply".into(),
                    ));
                }
                let reply = buf.trim_end_matches(['\r', '\n']);
                if reply == TERMINATOR {
                    return Ok(lines);
                }
                lines.push(reply.to_string());
            }
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(timeout)),
        };
        match result {
            Ok(lines) => Ok(lines),
            Err(err) => {
                self.stream = None;
                Err(self.session.fail(err))
            }
        }
    }
}

fn unexpected(text: &str) -> DaqError {
    DaqError::ProtocolError(format!("expected records, got OK {text}"))
}

/// Keep found records; unknown names are left out.
fn found(records: Vec<Record>) -> Snapshot {
    records
        .into_iter()
        .filter_map(|record| match record {
            Record::Found(attr) => Some((attr.name.clone(), attr)),
            Record::NotFound(_) => None,
        })
        .collect()
}

#[async_trait]
impl LinkAdapter for ExchangeClient {
    fn session(&self) -> &LinkSession {
        &self.session
    }

    async fn connect(&mut self) -> Result<LinkSession, LinkError> {
        self.session.state = LinkState::Connecting;
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => {
                self.stream = Some(BufReader::new(stream));
                self.session.state = LinkState::Connected;
                Ok(self.session.clone())
            }
            Ok(Err(e)) => Err(self.session.fail(LinkError::Disconnected(format!(
                "connect to {} failed: {e}",
                self.address
            )))),
            Err(_) => Err(self.session.fail(LinkError::Timeout(self.timeout))),
        }
    }

    /// `Query` carries one request line and returns the reply lines.
    async fn transact(
        &mut self,
        request: &LinkRequest,
        timeout: Duration,
    ) -> Result<LinkReply, LinkError> {
        match request {
            LinkRequest::Query(line) => self.round_trip(line, timeout).await.map(LinkReply::Lines),
            LinkRequest::Write(line) => self.round_trip(line, timeout).await.map(|_| LinkReply::Ack),
            other => Err(self.session.fail(LinkError::Protocol(format!(
                "exchange link cannot carry {other:?}"
            )))),
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
        }
        self.session.state = LinkState::Disconnected;
        Ok(())
    }
}

/// Snapshot source backed by another process's exchange server.
pub struct RemoteStore {
    client: Mutex<ExchangeClient>,
}

impl RemoteStore {
    /// Snapshot source backed by `client`.
    pub fn new(client: ExchangeClient) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }
}

#[async_trait]
impl SnapshotSource for RemoteStore {
    async fn capture(&self, names: &[String]) -> AppResult<Snapshot> {
        let records = self.client.lock().await.fetch(names).await?;
        Ok(found(records))
    }
}
