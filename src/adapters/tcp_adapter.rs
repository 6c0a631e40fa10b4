//! Line-oriented ASCII over TCP.
//!
//! Used for stage controllers and terminal servers that expose the same command set
//! as their RS-232 counterparts over the network.

use super::{Framing, LinkAdapter, LinkReply, LinkRequest, LinkSession, LinkState};
use crate::error::LinkError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP adapter with configurable framing.
pub struct TcpAdapter {
    address: String,
    framing: Framing,
    connect_timeout: Duration,
    session: LinkSession,
    stream: Option<BufReader<TcpStream>>,
}

impl TcpAdapter {
    /// Create an adapter for `address` (`host:port`).
    pub fn new(address: impl Into<String>, framing: Framing) -> Self {
        let address = address.into();
        Self {
            session: LinkSession::new(address.clone()),
            address,
            framing,
            connect_timeout: Duration::from_secs(5),
            stream: None,
        }
    }

    /// Bound on the TCP handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn exchange(
        stream: &mut BufReader<TcpStream>,
        framing: &Framing,
        payload: &[u8],
        expect_reply: bool,
    ) -> Result<Option<String>, LinkError> {
        stream
            .get_mut()
            .write_all(payload)
            .await
            .map_err(|e| LinkError::Disconnected(format!("write failed: {e}")))?;
        if !expect_reply {
            return Ok(None);
        }

        let mut response = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| LinkError::Disconnected(format!("read failed: {e}")))?;
            if n == 0 {
                return Err(LinkError::Disconnected("peer closed connection".to_string()));
            }
            response.extend_from_slice(&chunk[..n]);
            if framing.is_complete(&response) {
                return framing.decode(&response).map(Some);
            }
        }
    }
}

#[async_trait]
impl LinkAdapter for TcpAdapter {
    fn session(&self) -> &LinkSession {
        &self.session
    }

    async fn connect(&mut self) -> Result<LinkSession, LinkError> {
        self.session.state = LinkState::Connecting;
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address)).await
        {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                self.stream = Some(BufReader::new(stream));
                self.session.state = LinkState::Connected;
                debug!(address = %self.address, "tcp link connected");
                Ok(self.session.clone())
            }
            Ok(Err(e)) => Err(self.session.fail(LinkError::Disconnected(format!(
                "connect to {} failed: {e}",
                self.address
            )))),
            Err(_) => Err(self.session.fail(LinkError::Timeout(self.connect_timeout))),
        }
    }

    async fn transact(
        &mut self,
        request: &LinkRequest,
        timeout: Duration,
    ) -> Result<LinkReply, LinkError> {
        let (command, expect_reply) = match request {
            LinkRequest::Query(cmd) => (cmd.as_str(), true),
            LinkRequest::Write(cmd) => (cmd.as_str(), false),
            other => {
                return Err(self
                    .session
                    .fail(LinkError::Protocol(format!("tcp link cannot carry {other:?}"))))
            }
        };
        let Some(stream) = self.stream.as_mut() else {
            return Err(self
                .session
                .fail(LinkError::Disconnected("not connected".to_string())));
        };

        debug!(address = %self.address, %command, "tcp ->");
        let payload = self.framing.encode(command);
        let result = match tokio::time::timeout(
            timeout,
            Self::exchange(stream, &self.framing, &payload, expect_reply),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(timeout)),
        };

        match result {
            Ok(Some(reply)) => {
                debug!(address = %self.address, reply = %reply, "tcp <-");
                Ok(LinkReply::Text(reply))
            }
            Ok(None) => Ok(LinkReply::Ack),
            Err(err) => {
                if !matches!(err, LinkError::Protocol(_)) {
                    // A late reply would desynchronize the next transaction.
                    self.stream = None;
                }
                Err(self.session.fail(err))
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    async fn echo_server(reply_prefix: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = tokio::io::BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.ends_with('?') || line.contains("? ") {
                    let reply = format!("{reply_prefix}{line}\n");
                    write.write_all(reply.as_bytes()).await.unwrap();
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_query_and_write() {
        let addr = echo_server("=").await;
        let mut adapter = TcpAdapter::new(addr, Framing::default());
        adapter.connect().await.unwrap();
        assert!(adapter.is_connected());

        let reply = adapter
            .transact(&LinkRequest::Query("POS? 1".into()), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, LinkReply::Text("=POS? 1".to_string()));

        let ack = adapter
            .transact(&LinkRequest::Write("MOVE 1,2.5".into()), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ack, LinkReply::Ack);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_and_faults() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut adapter = TcpAdapter::new(addr, Framing::default());
        adapter.connect().await.unwrap();
        let err = adapter
            .transact(&LinkRequest::Query("KRDG? B".into()), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout(_)));
        assert_eq!(adapter.session().state, LinkState::Faulted);
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut adapter = TcpAdapter::new(addr, Framing::default());
        assert!(adapter.connect().await.is_err());
        assert_eq!(adapter.session().state, LinkState::Disconnected);
    }
}
