//! Hardware link adapters
//!
//! This module defines the [`LinkAdapter`] contract and its implementations, providing
//! low-level I/O abstraction for the communication protocols the instruments use:
//!
//! - [`SerialAdapter`]: RS-232 ASCII instruments (compressor, temperature controller)
//! - [`TcpAdapter`]: line-oriented ASCII over TCP (networked stage controllers)
//! - [`ModbusTcpAdapter`]: Modbus register reads (vacuum gauge array)
//! - [`MockAdapter`]: scripted responses for tests and simulation
//!
//! Adapters never retry. A failed transaction updates the adapter's [`LinkSession`]
//! and is reported to the caller, which owns the retry policy.

pub mod mock;
pub mod modbus_adapter;
pub mod serial_adapter;
pub mod tcp_adapter;

pub use mock::MockAdapter;
pub use modbus_adapter::ModbusTcpAdapter;
#[cfg(feature = "tokio_serial")]
pub use modbus_adapter::ModbusRtuAdapter;
pub use serial_adapter::SerialAdapter;
pub use tcp_adapter::TcpAdapter;

use crate::error::LinkError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Connection state of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No session; `connect` has not run or the link was closed
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Ready for transactions
    Connected,
    /// Last transaction or connect attempt failed; the link must reconnect.
    Faulted,
}

/// Bookkeeping for one adapter's connection.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSession {
    /// Human-readable endpoint (port path, host:port)
    pub endpoint: String,
    /// Current state
    pub state: LinkState,
    /// Most recent failure, kept after recovery for diagnostics
    pub last_error: Option<LinkError>,
}

impl LinkSession {
    /// A fresh, disconnected session.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: LinkState::Disconnected,
            last_error: None,
        }
    }

    /// Record a failure and move to the state it implies.
    ///
    /// Timeouts fault the link, so the next cycle reconnects and drops any late
    /// reply still in flight. Protocol errors leave the connection usable.
    pub fn fail(&mut self, err: LinkError) -> LinkError {
        self.state = match err {
            LinkError::Timeout(_) => LinkState::Faulted,
            LinkError::Disconnected(_) => LinkState::Disconnected,
            LinkError::Protocol(_) => self.state,
        };
        self.last_error = Some(err.clone());
        err
    }
}

/// One transaction against an instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkRequest {
    /// Send a command and read one reply frame
    Query(String),
    /// Send a command, expect no reply
    Write(String),
    /// Read Modbus holding registers
    ReadHoldingRegisters { address: u16, count: u16 },
    /// Read Modbus input registers
    ReadInputRegisters { address: u16, count: u16 },
}

/// Raw reply from a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkReply {
    /// One reply frame, terminator stripped
    Text(String),
    /// A multi-line reply (exchange protocol)
    Lines(Vec<String>),
    /// Register values
    Registers(Vec<u16>),
    /// Write accepted
    Ack,
}

impl LinkReply {
    /// The reply as a single text frame.
    pub fn into_text(self) -> Result<String, LinkError> {
        match self {
            LinkReply::Text(s) => Ok(s),
            LinkReply::Lines(lines) => Ok(lines.join("\n")),
            other => Err(LinkError::Protocol(format!("expected text reply, got {other:?}"))),
        }
    }

    /// The reply as register values.
    pub fn into_registers(self) -> Result<Vec<u16>, LinkError> {
        match self {
            LinkReply::Registers(regs) => Ok(regs),
            other => Err(LinkError::Protocol(format!(
                "expected register reply, got {other:?}"
            ))),
        }
    }

    /// The reply as lines.
    pub fn into_lines(self) -> Result<Vec<String>, LinkError> {
        match self {
            LinkReply::Lines(lines) => Ok(lines),
            LinkReply::Text(s) => Ok(s.lines().map(str::to_string).collect()),
            other => Err(LinkError::Protocol(format!("expected line reply, got {other:?}"))),
        }
    }
}

/// Byte-level framing for ASCII instruments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framing {
    /// Appended to every outgoing command
    #[serde(default = "default_write_terminator")]
    pub write_terminator: String,
    /// Marks the end of a reply frame
    #[serde(default = "default_read_terminator")]
    pub read_terminator: String,
}

fn default_write_terminator() -> String {
    "\r\n".to_string()
}

fn default_read_terminator() -> String {
    "\n".to_string()
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            write_terminator: default_write_terminator(),
            read_terminator: default_read_terminator(),
        }
    }
}

impl Framing {
    /// Framing with the same terminator in both directions (e.g. `"\r"` for the F70H).
    pub fn symmetric(terminator: &str) -> Self {
        Self {
            write_terminator: terminator.to_string(),
            read_terminator: terminator.to_string(),
        }
    }

    /// Bytes to put on the wire for `command`.
    pub fn encode(&self, command: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(command.len() + self.write_terminator.len());
        out.extend_from_slice(command.as_bytes());
        out.extend_from_slice(self.write_terminator.as_bytes());
        out
    }

    /// Whether `buffer` holds a complete frame.
    pub fn is_complete(&self, buffer: &[u8]) -> bool {
        let terminator = self.read_terminator.as_bytes();
        !terminator.is_empty() && buffer.ends_with(terminator)
    }

    /// Strip the terminator and surrounding whitespace from a complete frame.
    pub fn decode(&self, buffer: &[u8]) -> Result<String, LinkError> {
        let body = buffer
            .strip_suffix(self.read_terminator.as_bytes())
            .unwrap_or(buffer);
        let text = std::str::from_utf8(body)
            .map_err(|e| LinkError::Protocol(format!("reply is not valid UTF-8: {e}")))?;
        Ok(text.trim().to_string())
    }
}

/// Owns one connection to one instrument.
///
/// The contract is deliberately small: connect, run one transaction bounded by a
/// caller-supplied timeout, disconnect. Implementations update their own
/// [`LinkSession`] on every transition and never retry internally.
#[async_trait]
pub trait LinkAdapter: Send {
    /// Current session bookkeeping.
    fn session(&self) -> &LinkSession;

    /// Open the connection.
    async fn connect(&mut self) -> Result<LinkSession, LinkError>;

    /// Run one request/reply exchange.
    async fn transact(
        &mut self,
        request: &LinkRequest,
        timeout: Duration,
    ) -> Result<LinkReply, LinkError>;

    /// Close the connection. Closing a closed link is not an error.
    async fn disconnect(&mut self) -> Result<(), LinkError>;

    /// Whether transactions can be attempted right now.
    fn is_connected(&self) -> bool {
        self.session().state == LinkState::Connected
    }
}

/// A link shared between a polling engine and a command issuer (the motion queue).
pub type SharedLink = Arc<Mutex<Box<dyn LinkAdapter>>>;

/// Wrap an adapter for sharing.
pub fn shared(adapter: impl LinkAdapter + 'static) -> SharedLink {
    Arc::new(Mutex::new(Box::new(adapter)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_transitions() {
        let mut session = LinkSession::new("/dev/ttyUSB0");
        session.state = LinkState::Connected;

        session.fail(LinkError::Protocol("garbage".into()));
        assert_eq!(session.state, LinkState::Connected);

        session.fail(LinkError::Timeout(Duration::from_millis(200)));
        assert_eq!(session.state, LinkState::Faulted);

        session.fail(LinkError::Disconnected("unplugged".into()));
        assert_eq!(session.state, LinkState::Disconnected);
        assert!(matches!(session.last_error, Some(LinkError::Disconnected(_))));
    }

    #[test]
    fn test_framing_roundtrip() {
        let framing = Framing::symmetric("\r");
        assert_eq!(framing.encode("$TEA"), b"$TEA\r".to_vec());
        assert!(!framing.is_complete(b"$TEA,1"));
        assert!(framing.is_complete(b"$TEA,1\r"));
        assert_eq!(framing.decode(b" $TEA,1 \r").unwrap(), "$TEA,1");
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(LinkReply::Text("1.0".into()).into_text().unwrap(), "1.0");
        assert!(LinkReply::Ack.into_registers().is_err());
        assert_eq!(
            LinkReply::Text("a\nb".into()).into_lines().unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
