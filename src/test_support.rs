use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::ingest::{Connection, Ingestor};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub enum ConnectBehavior {
    Succeed,
    Fail,
    Delay(Duration),
}

#[derive(Debug, Clone, Copy)]
pub enum PublishBehavior {
    Succeed,
    /// The n-th publish (zero based) and every one after it fails.
    FailFrom(usize),
    Delay(Duration),
    Hang,
}

/// Everything the fake endpoint saw, keyed by sensor id.
#[derive(Debug, Default)]
pub struct Ledger {
    connect_attempts: Mutex<HashMap<String, usize>>,
    opened: Mutex<HashMap<String, usize>>,
    releases: Mutex<HashMap<String, usize>>,
    published: Mutex<Vec<(String, JsonValue)>>,
}

impl Ledger {
    pub fn connect_attempts(&self, sensor_id: &str) -> usize {
        count(&self.connect_attempts, sensor_id)
    }

    pub fn opened(&self, sensor_id: &str) -> usize {
        count(&self.opened, sensor_id)
    }

    pub fn releases(&self, sensor_id: &str) -> usize {
        count(&self.releases, sensor_id)
    }

    pub fn total_opened(&self) -> usize {
        self.opened.lock().unwrap().values().sum()
    }

    pub fn total_releases(&self) -> usize {
        self.releases.lock().unwrap().values().sum()
    }

    pub fn published_for(&self, sensor_id: &str) -> Vec<JsonValue> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == sensor_id)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn bump(map: &Mutex<HashMap<String, usize>>, sensor_id: &str) {
        *map.lock().unwrap().entry(sensor_id.to_string()).or_default() += 1;
    }
}

fn count(map: &Mutex<HashMap<String, usize>>, sensor_id: &str) -> usize {
    map.lock().unwrap().get(sensor_id).copied().unwrap_or(0)
}

/// In-memory endpoint with per-sensor scripted failures. Clones share one ledger.
#[derive(Debug, Clone, Default)]
pub struct ScriptedIngestor {
    ledger: Arc<Ledger>,
    connect: HashMap<String, ConnectBehavior>,
    publish: HashMap<String, PublishBehavior>,
}

impl ScriptedIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect(mut self, sensor_id: &str, behavior: ConnectBehavior) -> Self {
        self.connect.insert(sensor_id.to_string(), behavior);
        self
    }

    pub fn with_publish(mut self, sensor_id: &str, behavior: PublishBehavior) -> Self {
        self.publish.insert(sensor_id.to_string(), behavior);
        self
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        self.ledger.clone()
    }
}

#[async_trait]
impl Ingestor for ScriptedIngestor {
    async fn connect(&self, sensor: &SensorConfig) -> Result<Box<dyn Connection>, SensorError> {
        Ledger::bump(&self.ledger.connect_attempts, &sensor.id);
        match self
            .connect
            .get(&sensor.id)
            .copied()
            .unwrap_or(ConnectBehavior::Succeed)
        {
            ConnectBehavior::Succeed => {}
            ConnectBehavior::Fail => {
                return Err(SensorError::connection(format!("{} unreachable", sensor.id)))
            }
            ConnectBehavior::Delay(delay) => tokio::time::sleep(delay).await,
        }
        Ledger::bump(&self.ledger.opened, &sensor.id);
        Ok(Box::new(ScriptedConnection {
            sensor_id: sensor.id.clone(),
            behavior: self
                .publish
                .get(&sensor.id)
                .copied()
                .unwrap_or(PublishBehavior::Succeed),
            attempts: 0,
            ledger: self.ledger.clone(),
        }))
    }
}

struct ScriptedConnection {
    sensor_id: String,
    behavior: PublishBehavior,
    attempts: usize,
    ledger: Arc<Ledger>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), SensorError> {
        let attempt = self.attempts;
        self.attempts += 1;
        match self.behavior {
            PublishBehavior::Succeed => {}
            PublishBehavior::FailFrom(n) if attempt >= n => {
                return Err(SensorError::transport("broker went away"))
            }
            PublishBehavior::FailFrom(_) => {}
            PublishBehavior::Delay(delay) => tokio::time::sleep(delay).await,
            PublishBehavior::Hang => std::future::pending::<()>().await,
        }
        let payload: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| SensorError::transport(err.to_string()))?;
        self.ledger
            .published
            .lock()
            .unwrap()
            .push((self.sensor_id.clone(), payload));
        Ok(())
    }

    fn release(self: Box<Self>) {
        Ledger::bump(&self.ledger.releases, &self.sensor_id);
    }
}
