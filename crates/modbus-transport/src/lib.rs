use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::{Reader, Slave};
use tracing::debug;

/// Connection options for a single Modbus TCP session.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// Upper bound on session establishment.
    pub connect_timeout: Duration,
    /// Upper bound on a single register read; a stuck read fails instead of
    /// hanging the polling loop.
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1502,
            unit_id: 1,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid socket address {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("modbus transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("not connected")]
    NotConnected,
}

/// One owned Modbus TCP session. The transport performs no retries of its
/// own: a failed read surfaces to the caller, which owns the reconnect
/// policy and calls [`ModbusTransport::close`] / [`ModbusTransport::connect`]
/// as it sees fit.
#[derive(Debug)]
pub struct ModbusTransport {
    config: TransportConfig,
    context: Option<Context>,
}

impl ModbusTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            context: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    /// Establishes the session. Idempotent: connecting while connected is a
    /// no-op.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.context.is_some() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.config.host, self.config.port)
            .parse::<SocketAddr>()
            .map_err(|_| {
                TransportError::InvalidAddress(self.config.host.clone(), self.config.port)
            })?;
        let connect = tcp::connect_slave(addr, Slave(self.config.unit_id));
        let context = timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout {
                timeout_ms: self.config.connect_timeout.as_millis() as u64,
            })??;

        debug!(host = %self.config.host, port = self.config.port, "modbus session established");
        self.context = Some(context);
        Ok(())
    }

    /// Releases the session unconditionally. Idempotent and infallible;
    /// closing an already-closed transport does nothing.
    pub async fn close(&mut self) {
        if self.context.take().is_some() {
            debug!(host = %self.config.host, "modbus session closed");
        }
    }

    /// Reads `count` holding registers starting at `start`. Requires a
    /// connected session.
    pub async fn read_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let context = self.context.as_mut().ok_or(TransportError::NotConnected)?;
        let request = context.read_holding_registers(start, count);
        match timeout(self.config.request_timeout, request).await {
            Ok(Ok(registers)) => {
                debug!(start, count, "modbus read ok");
                Ok(registers)
            }
            Ok(Err(err)) => Err(TransportError::Io(err)),
            Err(_) => Err(TransportError::Timeout {
                timeout_ms: self.config.request_timeout.as_millis() as u64,
            }),
        }
    }
}
