//! Attribute exchange server.
//!
//! One task accepts connections; every connection gets its own task, so a stalled
//! client never delays another one, and several connections from the same peer are
//! served side by side. A connection is closed when it sits idle, or stalls while
//! being written to, for longer than the configured idle timeout.
//!
//! The server answers from whatever the store holds right now. It never waits for
//! a fresh polling cycle: stale readings go out flagged `valid = 0`.

use super::protocol::{self, Request, TERMINATOR};
use crate::config::ExchangeConfig;
use crate::error::{AppResult, DaqError};
use crate::scan::ScanOrchestrator;
use crate::store::AttributeStore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Answers requests from the store and, when attached, the scan orchestrator.
#[derive(Clone)]
pub struct RequestHandler {
    store: Arc<AttributeStore>,
    orchestrator: Option<Arc<ScanOrchestrator>>,
}

impl RequestHandler {
    /// Scan-control lines answer `ERR` when `orchestrator` is `None`.
    pub fn new(store: Arc<AttributeStore>, orchestrator: Option<Arc<ScanOrchestrator>>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Reply lines for one request line, terminator excluded.
    pub async fn handle_line(&self, line: &str) -> Vec<String> {
        match Request::parse(line) {
            Ok(request) => match self.handle(request).await {
                Ok(lines) => lines,
                Err(err) => vec![protocol::encode_error(&err)],
            },
            Err(err) => vec![protocol::encode_error(&err)],
        }
    }

    async fn handle(&self, request: Request) -> AppResult<Vec<String>> {
        match request {
            Request::Attributes(names) => Ok(self.records(&names)),
            Request::Ping => Ok(vec![protocol::encode_ok("PONG")]),
            Request::Status => {
                let status = self.orchestrator()?.status();
                let text = match status.scan_id {
                    Some(id) => format!("{} {id}", status.phase),
                    None => status.phase.to_string(),
                };
                Ok(vec![protocol::encode_ok(&text)])
            }
            Request::Start => {
                let id = self.orchestrator()?.start()?;
                Ok(vec![protocol::encode_ok(&id.to_string())])
            }
            Request::Abort => {
                let id = self.orchestrator()?.abort()?;
                Ok(vec![protocol::encode_ok(&id.to_string())])
            }
            Request::End => {
                let scan = self.orchestrator()?.complete().await?;
                Ok(scan
                    .snapshot
                    .values()
                    .map(protocol::encode_attribute)
                    .collect())
            }
        }
    }

    fn orchestrator(&self) -> AppResult<&ScanOrchestrator> {
        self.orchestrator
            .as_deref()
            .ok_or_else(|| DaqError::ProtocolError("scan control is not available here".into()))
    }

    /// One record per requested name, in request order; all attributes when empty.
    fn records(&self, names: &[String]) -> Vec<String> {
        let snapshot = self.store.snapshot(names);
        if names.is_empty() {
            return snapshot.values().map(protocol::encode_attribute).collect();
        }
        names
            .iter()
            .map(|name| match snapshot.get(name) {
                Some(attr) => protocol::encode_attribute(attr),
                None => protocol::encode_not_found(name),
            })
            .collect()
    }
}

/// A bound exchange listener.
pub struct ExchangeServer {
    listener: TcpListener,
    handler: RequestHandler,
    config: ExchangeConfig,
    active: Arc<AtomicUsize>,
}

impl ExchangeServer {
    /// Bind the configured address.
    pub async fn bind(config: ExchangeConfig, handler: RequestHandler) -> AppResult<Self> {
        let listener = TcpListener::bind(&config.bind).await?;
        info!(address = %listener.local_addr()?, "exchange server listening");
        Ok(Self {
            listener,
            handler,
            config,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Bound address; useful after binding port 0.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of open client connections.
    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        self.active.clone()
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            // Resource exhaustion is transient; keep serving
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "exchange client connected");
                    let connection = Connection {
                        handler: self.handler.clone(),
                        config: self.config.clone(),
                        peer,
                    };
                    let active = self.active.clone();
                    active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        if let Err(err) = connection.serve(stream).await {
                            debug!(%peer, error = %err, "exchange connection closed");
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("exchange server stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Run on a new task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<AppResult<()>> {
        tokio::spawn(self.run(shutdown))
    }
}

struct Connection {
    handler: RequestHandler,
    config: ExchangeConfig,
    peer: SocketAddr,
}

enum Line {
    Complete(String),
    TooLong,
    Eof,
}

impl Connection {
    async fn serve(self, stream: TcpStream) -> AppResult<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let idle = self.config.idle_timeout;

        loop {
            let line = tokio::time::timeout(idle, self.read_line(&mut reader))
                .await
                .map_err(|_| DaqError::ExchangeClientTimeout(format!("{} idle", self.peer)))??;

            let (mut reply, close) = match line {
                Line::Eof => return Ok(()),
                Line::TooLong => {
                    let err = DaqError::ProtocolError(format!(
                        "request exceeds {} bytes",
                        self.config.max_line_length
                    ));
                    (vec![protocol::encode_error(&err)], true)
                }
                Line::Complete(text) => {
                    debug!(peer = %self.peer, request = %text, "exchange request");
                    (self.handler.handle_line(&text).await, false)
                }
            };

            reply.push(TERMINATOR.to_string());
            let mut payload = reply.join("\n");
            payload.push('\n');
            tokio::time::timeout(idle, write.write_all(payload.as_bytes()))
                .await
                .map_err(|_| {
                    DaqError::ExchangeClientTimeout(format!("{} stalled reading reply", self.peer))
                })??;

            if close {
                write.shutdown().await?;
                return Ok(());
            }
        }
    }

    async fn read_line<R>(&self, reader: &mut R) -> AppResult<Line>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        let limit = self.config.max_line_length;
        let mut buf = Vec::new();
        let n = reader
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(Line::Eof);
        }
        let complete = buf.last() == Some(&b'\n');
        if !complete && buf.len() > limit {
            return Ok(Line::TooLong);
        }
        let text = String::from_utf8_lossy(&buf);
        Ok(Line::Complete(text.trim_end_matches(['\r', '\n']).to_string()))
    }
}
