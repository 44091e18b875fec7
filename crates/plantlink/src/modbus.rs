//! # Modbus Transport
//!
//! Field devices are reached over Modbus TCP. A connection is opened for one
//! poll and closed afterwards; every call is bounded by the timeout given at
//! connect time.
//!
//! [`ModbusConnector`] is the seam the programs depend on. [`TcpConnector`]
//! talks to real devices through `tokio-modbus`; [`SimulatedDevices`] serves
//! register banks from memory.

use crate::register_map::RegisterTable;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_modbus::prelude::*;

#[derive(Debug, Error)]
pub enum ModbusError {
    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("device exception at address {address}: {code}")]
    Exception { address: u16, code: String },
}

/// Address of one Modbus unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModbusEndpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl ModbusEndpoint {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
        }
    }
}

impl fmt::Display for ModbusEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.unit_id)
    }
}

#[async_trait]
pub trait ModbusConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &ModbusEndpoint,
        timeout: Duration,
    ) -> Result<Box<dyn ModbusSession>, ModbusError>;
}

#[async_trait]
pub trait ModbusSession: Send {
    async fn read_holding(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError>;

    async fn read_input(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError>;

    async fn write_multiple(&mut self, address: u16, values: &[u16]) -> Result<(), ModbusError>;

    async fn close(&mut self);

    async fn read(
        &mut self,
        table: RegisterTable,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        match table {
            RegisterTable::Holding => self.read_holding(address, quantity).await,
            RegisterTable::Input => self.read_input(address, quantity).await,
        }
    }
}

/// Encodes a kW setpoint as a signed 32-bit register pair, high word first.
pub fn encode_setpoint(kw: f64, scale: f64) -> [u16; 2] {
    let raw = (kw * scale).trunc() as i32 as u32;
    [(raw >> 16) as u16, (raw & 0xFFFF) as u16]
}

// --- TCP ---

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl ModbusConnector for TcpConnector {
    async fn connect(
        &self,
        endpoint: &ModbusEndpoint,
        limit: Duration,
    ) -> Result<Box<dyn ModbusSession>, ModbusError> {
        let addr = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| ModbusError::Resolve(format!("{}: {e}", endpoint.host)))?
            .next()
            .ok_or_else(|| ModbusError::Resolve(endpoint.host.clone()))?;

        let ctx = timeout(limit, tcp::connect_slave(addr, Slave(endpoint.unit_id)))
            .await
            .map_err(|_| ModbusError::Timeout(limit))?
            .map_err(|e| ModbusError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(TcpSession { ctx, limit }))
    }
}

struct TcpSession {
    ctx: client::Context,
    limit: Duration,
}

fn flatten<T>(
    address: u16,
    limit: Duration,
    result: Result<tokio_modbus::Result<T>, tokio::time::error::Elapsed>,
) -> Result<T, ModbusError> {
    match result {
        Err(_) => Err(ModbusError::Timeout(limit)),
        Ok(Err(e)) => Err(ModbusError::Transport(e.to_string())),
        Ok(Ok(Err(code))) => Err(ModbusError::Exception {
            address,
            code: format!("{code:?}"),
        }),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}

#[async_trait]
impl ModbusSession for TcpSession {
    async fn read_holding(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError> {
        let result = timeout(self.limit, self.ctx.read_holding_registers(address, quantity)).await;
        flatten(address, self.limit, result)
    }

    async fn read_input(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError> {
        let result = timeout(self.limit, self.ctx.read_input_registers(address, quantity)).await;
        flatten(address, self.limit, result)
    }

    async fn write_multiple(&mut self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        let result = timeout(self.limit, self.ctx.write_multiple_registers(address, values)).await;
        flatten(address, self.limit, result)
    }

    async fn close(&mut self) {
        let _ = timeout(self.limit, self.ctx.disconnect()).await;
    }
}

// --- Simulation ---

#[derive(Debug, Default)]
struct Bank {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
}

#[derive(Debug, Default)]
struct SimulatedState {
    banks: HashMap<ModbusEndpoint, Bank>,
    unreachable: HashSet<ModbusEndpoint>,
    failing_reads: HashSet<(ModbusEndpoint, u16)>,
    writes: Vec<(ModbusEndpoint, u16, Vec<u16>)>,
}

/// In-memory devices keyed by endpoint.
///
/// Unknown endpoints refuse connections; unset registers read as zero.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevices {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        // a poisoned lock only means a panicking test thread held it
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_device(&self, endpoint: &ModbusEndpoint) {
        self.state().banks.entry(endpoint.clone()).or_default();
    }

    pub fn set_holding(&self, endpoint: &ModbusEndpoint, address: u16, values: &[u16]) {
        let mut state = self.state();
        let bank = state.banks.entry(endpoint.clone()).or_default();
        for (offset, value) in values.iter().enumerate() {
            bank.holding.insert(address + offset as u16, *value);
        }
    }

    pub fn set_input(&self, endpoint: &ModbusEndpoint, address: u16, values: &[u16]) {
        let mut state = self.state();
        let bank = state.banks.entry(endpoint.clone()).or_default();
        for (offset, value) in values.iter().enumerate() {
            bank.input.insert(address + offset as u16, *value);
        }
    }

    pub fn set_unreachable(&self, endpoint: &ModbusEndpoint, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(endpoint.clone());
        } else {
            state.unreachable.remove(endpoint);
        }
    }

    /// Reads starting at `address` answer with an illegal-address exception.
    pub fn fail_reads_at(&self, endpoint: &ModbusEndpoint, address: u16) {
        self.state().failing_reads.insert((endpoint.clone(), address));
    }

    pub fn writes(&self) -> Vec<(ModbusEndpoint, u16, Vec<u16>)> {
        self.state().writes.clone()
    }
}

#[async_trait]
impl ModbusConnector for SimulatedDevices {
    async fn connect(
        &self,
        endpoint: &ModbusEndpoint,
        _timeout: Duration,
    ) -> Result<Box<dyn ModbusSession>, ModbusError> {
        let state = self.state();
        if state.unreachable.contains(endpoint) || !state.banks.contains_key(endpoint) {
            return Err(ModbusError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(SimulatedSession {
            devices: self.clone(),
            endpoint: endpoint.clone(),
        }))
    }
}

struct SimulatedSession {
    devices: SimulatedDevices,
    endpoint: ModbusEndpoint,
}

impl SimulatedSession {
    fn read_table(
        &self,
        table: RegisterTable,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let state = self.devices.state();
        if state.failing_reads.contains(&(self.endpoint.clone(), address)) {
            return Err(ModbusError::Exception {
                address,
                code: "IllegalDataAddress".to_string(),
            });
        }
        let bank = state
            .banks
            .get(&self.endpoint)
            .ok_or_else(|| ModbusError::Transport("device removed".to_string()))?;
        let registers = match table {
            RegisterTable::Holding => &bank.holding,
            RegisterTable::Input => &bank.input,
        };
        Ok((0..quantity)
            .map(|offset| registers.get(&(address + offset)).copied().unwrap_or(0))
            .collect())
    }
}

#[async_trait]
impl ModbusSession for SimulatedSession {
    async fn read_holding(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError> {
        self.read_table(RegisterTable::Holding, address, quantity)
    }

    async fn read_input(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError> {
        self.read_table(RegisterTable::Input, address, quantity)
    }

    async fn write_multiple(&mut self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        let mut state = self.devices.state();
        if state.unreachable.contains(&self.endpoint) {
            return Err(ModbusError::Transport("connection reset".to_string()));
        }
        state
            .writes
            .push((self.endpoint.clone(), address, values.to_vec()));
        let bank = state.banks.entry(self.endpoint.clone()).or_default();
        for (offset, value) in values.iter().enumerate() {
            bank.holding.insert(address + offset as u16, *value);
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setpoint_is_truncated_and_split() {
        assert_eq!(encode_setpoint(150.0, 10.0), [0x0000, 1500]);
        assert_eq!(encode_setpoint(12.37, 10.0), [0x0000, 123]);
        // -25.0 kW -> -250 -> 0xFFFF_FF06
        assert_eq!(encode_setpoint(-25.0, 10.0), [0xFFFF, 0xFF06]);
        assert_eq!(encode_setpoint(-0.05, 10.0), [0, 0]);
        assert_eq!(encode_setpoint(10_000.0, 10.0), [0x0001, 0x86A0]);
    }

    #[tokio::test]
    async fn simulated_device_reads_and_records_writes() {
        let devices = SimulatedDevices::new();
        let ess = ModbusEndpoint::new("10.0.0.5", 502, 3);
        devices.set_input(&ess, 10, &[1, 2]);

        let mut session = devices.connect(&ess, Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.read(RegisterTable::Input, 10, 3).await.unwrap(), vec![1, 2, 0]);
        session.write_multiple(600, &[0, 1500]).await.unwrap();
        assert_eq!(session.read_holding(600, 2).await.unwrap(), vec![0, 1500]);
        session.close().await;

        assert_eq!(devices.writes(), vec![(ess.clone(), 600, vec![0, 1500])]);

        let other = ModbusEndpoint::new("10.0.0.6", 502, 1);
        assert!(matches!(
            devices.connect(&other, Duration::from_secs(1)).await,
            Err(ModbusError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn simulated_read_failure_is_an_exception() {
        let devices = SimulatedDevices::new();
        let logger = ModbusEndpoint::new("10.0.0.1", 502, 1);
        devices.add_device(&logger);
        devices.fail_reads_at(&logger, 40_200);

        let mut session = devices.connect(&logger, Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            session.read_holding(40_200, 2).await,
            Err(ModbusError::Exception { address: 40_200, .. })
        ));
        assert!(session.read_holding(40_204, 1).await.is_ok());
    }
}
