use super::credential::DeviceCredential;
use super::{Connection, Ingestor};
use crate::config::SensorConfig;
use crate::error::SensorError;
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    Transport,
};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub port: u16,
    pub tls: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Lifetime of the SAS token presented as the MQTT password. There is no renewal; the hub
    /// drops the session once it expires.
    pub token_ttl: Duration,
    pub api_version: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            port: 8883,
            tls: true,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            token_ttl: Duration::from_secs(24 * 3600),
            api_version: "2021-04-12".to_string(),
        }
    }
}

/// IoT-hub style MQTT device client: one session per sensor, QoS1 device-to-cloud messages.
#[derive(Debug, Clone)]
pub struct MqttIngestor {
    settings: MqttSettings,
}

impl MqttIngestor {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self, credential: &DeviceCredential) -> Result<MqttOptions, SensorError> {
        let expiry = i64::try_from(self.settings.token_ttl.as_secs())
            .ok()
            .and_then(|ttl| Utc::now().timestamp().checked_add(ttl))
            .ok_or_else(|| {
                SensorError::configuration(format!(
                    "SAS token lifetime {:?} is out of range",
                    self.settings.token_ttl
                ))
            })?;
        let password = credential.sas_token(expiry)?;

        let mut options = MqttOptions::new(
            credential.device_id.clone(),
            credential.host_name.clone(),
            self.settings.port,
        );
        options.set_keep_alive(self.settings.keep_alive);
        options.set_credentials(credential.mqtt_username(&self.settings.api_version), password);
        if self.settings.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        Ok(options)
    }
}

#[async_trait]
impl Ingestor for MqttIngestor {
    async fn connect(&self, sensor: &SensorConfig) -> Result<Box<dyn Connection>, SensorError> {
        let credential: DeviceCredential = sensor.connection_string.parse()?;
        let options = self.options(&credential)?;
        let (client, mut eventloop) = AsyncClient::new(options, 16);

        tokio::time::timeout(self.settings.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                SensorError::connection(format!(
                    "no CONNACK from {} within {:?}",
                    credential.host_name, self.settings.connect_timeout
                ))
            })??;

        tracing::info!(
            sensor_id = %sensor.id,
            host = %credential.host_name,
            device_id = %credential.device_id,
            "connected to ingestion endpoint"
        );

        let (failure_tx, failure_rx) = watch::channel(None);
        let poller = spawn_poller(eventloop, sensor.id.clone(), failure_tx);
        Ok(Box::new(MqttConnection {
            client,
            topic: credential.telemetry_topic(),
            poller,
            failure: failure_rx,
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), SensorError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(SensorError::connection(format!(
                    "broker refused connection: {:?}",
                    ack.code
                )));
            }
            Ok(_) => {}
            Err(err) => return Err(SensorError::connection(err.to_string())),
        }
    }
}

// Drives the session after CONNACK. Stops on our own DISCONNECT or on the first transport error,
// which is parked in `failure` for the next publish to report.
fn spawn_poller(
    mut eventloop: EventLoop,
    sensor_id: String,
    failure: watch::Sender<Option<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::debug!(sensor_id = %sensor_id, "mqtt session closed");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(sensor_id = %sensor_id, error = %err, "mqtt event loop stopped");
                    failure.send_replace(Some(err.to_string()));
                    break;
                }
            }
        }
    })
}

struct MqttConnection {
    client: AsyncClient,
    topic: String,
    poller: JoinHandle<()>,
    failure: watch::Receiver<Option<String>>,
}

#[async_trait]
impl Connection for MqttConnection {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), SensorError> {
        let failure = self.failure.borrow().clone();
        if let Some(reason) = failure {
            return Err(SensorError::transport(reason));
        }
        if self.poller.is_finished() {
            return Err(SensorError::transport("mqtt session is closed"));
        }
        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|err| SensorError::transport(err.to_string()))
    }

    fn release(self: Box<Self>) {
        // The poller exits once the DISCONNECT is flushed; if it cannot be queued, stop it here.
        if let Err(err) = self.client.try_disconnect() {
            tracing::debug!(error = %err, "mqtt disconnect not queued; stopping event loop");
            self.poller.abort();
        }
    }
}
