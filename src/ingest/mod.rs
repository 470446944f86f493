//! Clients for the remote ingestion endpoint.
//!
//! The worker only sees [`Ingestor`] and [`Connection`]; how a reading is framed and
//! authenticated on the wire is up to the implementation behind them.

pub mod console;
pub mod credential;
pub mod mqtt;

use crate::config::SensorConfig;
use crate::error::SensorError;
use async_trait::async_trait;

pub use console::ConsoleIngestor;
pub use credential::DeviceCredential;
pub use mqtt::{MqttIngestor, MqttSettings};

#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Opens the sensor's link to the endpoint. Failing here is fatal for that sensor.
    async fn connect(&self, sensor: &SensorConfig) -> Result<Box<dyn Connection>, SensorError>;
}

#[async_trait]
pub trait Connection: Send {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), SensorError>;

    /// Tears the link down. Must not block; called at most once, possibly from `Drop`.
    fn release(self: Box<Self>);
}
