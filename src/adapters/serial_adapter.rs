//! RS-232 link adapter.
//!
//! Wraps the `serialport` crate and provides async I/O using Tokio's blocking task
//! executor for the synchronous serial operations.

use super::{Framing, LinkAdapter, LinkReply, LinkRequest, LinkSession, LinkState};
use crate::error::LinkError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// Serial adapter for RS-232 communication
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Command and reply terminators
    framing: Framing,

    session: LinkSession,

    /// The actual serial port (behind Arc<Mutex> for access from blocking tasks)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// Create a new serial adapter.
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    /// * `framing` - Command/reply terminators
    pub fn new(port_name: impl Into<String>, baud_rate: u32, framing: Framing) -> Self {
        let port_name = port_name.into();
        Self {
            session: LinkSession::new(port_name.clone()),
            port_name,
            baud_rate,
            framing,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Baud rate the port is opened with.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

#[cfg(feature = "instrument_serial")]
fn exchange_blocking(
    port: &mut dyn SerialPort,
    payload: &[u8],
    framing: &Framing,
    expect_reply: bool,
    timeout: Duration,
) -> Result<Option<String>, LinkError> {
    use std::io::{Read, Write};

    port.write_all(payload)
        .and_then(|_| port.flush())
        .map_err(|e| LinkError::Disconnected(format!("serial write failed: {e}")))?;

    if !expect_reply {
        return Ok(None);
    }

    let mut response = Vec::new();
    let mut buffer = [0u8; 64];
    let start = std::time::Instant::now();

    loop {
        if start.elapsed() > timeout {
            return Err(LinkError::Timeout(timeout));
        }

        match port.read(&mut buffer) {
            Ok(0) => {
                // EOF - shouldn't happen with serial ports
                return Err(LinkError::Disconnected("unexpected EOF".to_string()));
            }
            Ok(n) => {
                response.extend_from_slice(&buffer[..n]);
                if framing.is_complete(&response) {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Port timeout is shorter than our overall timeout
                continue;
            }
            Err(e) => return Err(LinkError::Disconnected(format!("serial read error: {e}"))),
        }
    }

    framing.decode(&response).map(Some)
}

#[async_trait]
impl LinkAdapter for SerialAdapter {
    fn session(&self) -> &LinkSession {
        &self.session
    }

    async fn connect(&mut self) -> Result<LinkSession, LinkError> {
        self.session.state = LinkState::Connecting;

        #[cfg(feature = "instrument_serial")]
        {
            let port_name = self.port_name.clone();
            let baud_rate = self.baud_rate;
            let opened = tokio::task::spawn_blocking(move || {
                serialport::new(&port_name, baud_rate)
                    .timeout(Duration::from_millis(100)) // Internal read timeout
                    .open()
            })
            .await
            .map_err(|e| LinkError::Disconnected(format!("serial open task failed: {e}")))?;

            match opened {
                Ok(port) => {
                    self.port = Some(Arc::new(Mutex::new(port)));
                    self.session.state = LinkState::Connected;
                    debug!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
                    Ok(self.session.clone())
                }
                Err(e) => Err(self.session.fail(LinkError::Disconnected(format!(
                    "failed to open serial port '{}' at {} baud: {e}",
                    self.port_name, self.baud_rate
                )))),
            }
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(self.session.fail(LinkError::Disconnected(
                "serial support not enabled; rebuild with --features instrument_serial"
                    .to_string(),
            )))
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
                return Err(self.session.fail(LinkError::Protocol(format!(
                    "serial link cannot carry {other:?}"
                ))))
            }
        };

        #[cfg(feature = "instrument_serial")]
        {
            let port = match self.port.as_ref() {
                Some(port) if self.session.state == LinkState::Connected => port.clone(),
                _ => {
                    return Err(self
                        .session
                        .fail(LinkError::Disconnected("serial port not open".to_string())))
                }
            };
            let payload = self.framing.encode(command);
            let framing = self.framing.clone();
            debug!(port = %self.port_name, %command, "serial ->");

            // Execute blocking serial I/O on dedicated thread
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = port.blocking_lock();
                exchange_blocking(&mut **guard, &payload, &framing, expect_reply, timeout)
            })
            .await
            .map_err(|e| LinkError::Disconnected(format!("serial I/O task failed: {e}")))
            .and_then(|r| r);

            match result {
                Ok(Some(reply)) => {
                    debug!(port = %self.port_name, reply = %reply, "serial <-");
                    Ok(LinkReply::Text(reply))
                }
                Ok(None) => Ok(LinkReply::Ack),
                Err(err) => {
                    if !matches!(err, LinkError::Protocol(_)) {
                        self.port = None;
                    }
                    Err(self.session.fail(err))
                }
            }
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (command, expect_reply, timeout);
            Err(self
                .session
                .fail(LinkError::Disconnected("serial support not enabled".to_string())))
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!(port = %self.port_name, "serial port closed");
            }
        }
        self.session.state = LinkState::Disconnected;
        Ok(())
    }
}
