use super::{Connection, Ingestor};
use crate::config::SensorConfig;
use crate::error::SensorError;
use async_trait::async_trait;

/// Stand-in endpoint for `--dry-run`: every reading goes to the log instead of the network.
#[derive(Debug, Default, Clone)]
pub struct ConsoleIngestor;

impl ConsoleIngestor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Ingestor for ConsoleIngestor {
    async fn connect(&self, sensor: &SensorConfig) -> Result<Box<dyn Connection>, SensorError> {
        tracing::info!(sensor_id = %sensor.id, "dry run: not connecting to ingestion endpoint");
        Ok(Box::new(ConsoleConnection {
            sensor_id: sensor.id.clone(),
        }))
    }
}

struct ConsoleConnection {
    sensor_id: String,
}

#[async_trait]
impl Connection for ConsoleConnection {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), SensorError> {
        tracing::info!(
            sensor_id = %self.sensor_id,
            payload = %String::from_utf8_lossy(payload),
            "telemetry data"
        );
        Ok(())
    }

    fn release(self: Box<Self>) {
        tracing::debug!(sensor_id = %self.sensor_id, "dry run connection released");
    }
}
