//! Modbus register links (`tokio-modbus`).
//!
//! The vacuum gauge controller answers on Modbus TCP port 502; RTU over RS-485 is
//! available with the `tokio_serial` feature. Only register reads are carried: text
//! requests are a protocol error on these links.

use super::{LinkAdapter, LinkReply, LinkRequest, LinkSession, LinkState};
use crate::error::LinkError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tracing::debug;

/// Run one register read on an attached context.
async fn read_registers(
    ctx: &mut Context,
    request: &LinkRequest,
    timeout: Duration,
) -> Result<Vec<u16>, LinkError> {
    let (holding, address, count) = match *request {
        LinkRequest::ReadHoldingRegisters { address, count } => (true, address, count),
        LinkRequest::ReadInputRegisters { address, count } => (false, address, count),
        LinkRequest::Query(_) | LinkRequest::Write(_) => {
            return Err(LinkError::Protocol("not a register request".to_string()))
        }
    };
    let read = async {
        if holding {
            ctx.read_holding_registers(address, count).await
        } else {
            ctx.read_input_registers(address, count).await
        }
    };

    match tokio::time::timeout(timeout, read).await {
        Err(_) => Err(LinkError::Timeout(timeout)),
        Ok(Err(e)) => Err(LinkError::Disconnected(e.to_string())),
        Ok(Ok(Err(exception))) => Err(LinkError::Protocol(format!(
            "modbus exception: {exception}"
        ))),
        Ok(Ok(Ok(registers))) => Ok(registers),
    }
}

fn reject_text(request: &LinkRequest) -> Option<LinkError> {
    match request {
        LinkRequest::Query(cmd) | LinkRequest::Write(cmd) => Some(LinkError::Protocol(format!(
            "modbus link cannot carry text command '{cmd}'"
        ))),
        _ => None,
    }
}

/// Modbus TCP client for one unit.
pub struct ModbusTcpAdapter {
    address: SocketAddr,
    unit: u8,
    connect_timeout: Duration,
    session: LinkSession,
    ctx: Option<Context>,
}

impl ModbusTcpAdapter {
    /// Client for `unit` at `address`.
    pub fn new(address: SocketAddr, unit: u8) -> Self {
        Self {
            session: LinkSession::new(address.to_string()),
            address,
            unit,
            connect_timeout: Duration::from_secs(5),
            ctx: None,
        }
    }

    /// Bound the TCP connect.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl LinkAdapter for ModbusTcpAdapter {
    fn session(&self) -> &LinkSession {
        &self.session
    }

    async fn connect(&mut self) -> Result<LinkSession, LinkError> {
        self.session.state = LinkState::Connecting;
        let connecting = tcp::connect_slave(self.address, Slave(self.unit));
        match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(ctx)) => {
                self.ctx = Some(ctx);
                self.session.state = LinkState::Connected;
                debug!(address = %self.address, unit = self.unit, "modbus tcp connected");
                Ok(self.session.clone())
            }
            Ok(Err(e)) => Err(self.session.fail(LinkError::Disconnected(format!(
                "modbus connect to {} failed: {e}",
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
        if let Some(err) = reject_text(request) {
            return Err(self.session.fail(err));
        }
        let Some(ctx) = self.ctx.as_mut() else {
            return Err(self
                .session
                .fail(LinkError::Disconnected("not connected".to_string())));
        };

        debug!(address = %self.address, ?request, "modbus ->");
        match read_registers(ctx, request, timeout).await {
            Ok(registers) => Ok(LinkReply::Registers(registers)),
            Err(err) => {
                if !matches!(err, LinkError::Protocol(_)) {
                    self.ctx = None;
                }
                Err(self.session.fail(err))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.ctx = None;
        self.session.state = LinkState::Disconnected;
        Ok(())
    }
}

/// Modbus RTU client over a serial line.
#[cfg(feature = "tokio_serial")]
pub struct ModbusRtuAdapter {
    port_name: String,
    baud_rate: u32,
    unit: u8,
    session: LinkSession,
    ctx: Option<Context>,
}

#[cfg(feature = "tokio_serial")]
impl ModbusRtuAdapter {
    /// Client for `unit` on `port_name`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32, unit: u8) -> Self {
        let port_name = port_name.into();
        Self {
            session: LinkSession::new(port_name.clone()),
            port_name,
            baud_rate,
            unit,
            ctx: None,
        }
    }
}

#[cfg(feature = "tokio_serial")]
#[async_trait]
impl LinkAdapter for ModbusRtuAdapter {
    fn session(&self) -> &LinkSession {
        &self.session
    }

    async fn connect(&mut self) -> Result<LinkSession, LinkError> {
        use tokio_modbus::client::rtu;
        use tokio_serial::SerialStream;

        self.session.state = LinkState::Connecting;
        let builder = tokio_serial::new(&self.port_name, self.baud_rate);
        match SerialStream::open(&builder) {
            Ok(port) => {
                self.ctx = Some(rtu::attach_slave(port, Slave(self.unit)));
                self.session.state = LinkState::Connected;
                debug!(port = %self.port_name, unit = self.unit, "modbus rtu attached");
                Ok(self.session.clone())
            }
            Err(e) => Err(self.session.fail(LinkError::Disconnected(format!(
                "failed to open '{}': {e}",
                self.port_name
            )))),
        }
    }

    async fn transact(
        &mut self,
        request: &LinkRequest,
        timeout: Duration,
    ) -> Result<LinkReply, LinkError> {
        if let Some(err) = reject_text(request) {
            return Err(self.session.fail(err));
        }
        let Some(ctx) = self.ctx.as_mut() else {
            return Err(self
                .session
                .fail(LinkError::Disconnected("not connected".to_string())));
        };
        match read_registers(ctx, request, timeout).await {
            Ok(registers) => Ok(LinkReply::Registers(registers)),
            Err(err) => {
                if !matches!(err, LinkError::Protocol(_)) {
                    self.ctx = None;
                }
                Err(self.session.fail(err))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.ctx = None;
        self.session.state = LinkState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_request_is_protocol_error() {
        let mut adapter = ModbusTcpAdapter::new("127.0.0.1:502".parse().unwrap(), 1);
        let err = adapter
            .transact(&LinkRequest::Query("KRDG? B".into()), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)));
        assert_eq!(adapter.session().state, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_read_without_connect_is_disconnected() {
        let mut adapter = ModbusTcpAdapter::new("127.0.0.1:502".parse().unwrap(), 1);
        let err = adapter
            .transact(
                &LinkRequest::ReadHoldingRegisters { address: 0, count: 21 },
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Disconnected(_)));
    }
}
