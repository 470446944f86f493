use crate::cli::Args;
use crate::error::SensorError;
use crate::ingest::mqtt::MqttSettings;
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Inclusive `[min, max]` bounds for one synthesized quantity.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }

    fn validate(&self, quantity: &str) -> Result<(), String> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(format!("{quantity} range must be finite"));
        }
        if self.min > self.max {
            return Err(format!(
                "{quantity} range has min {} greater than max {}",
                self.min, self.max
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRanges {
    pub ice_thickness: ValueRange,
    pub surface_temperature: ValueRange,
    pub snow_accumulation: ValueRange,
    pub external_temperature: ValueRange,
}

impl Default for SensorRanges {
    fn default() -> Self {
        Self {
            ice_thickness: ValueRange::new(20.0, 40.0),
            surface_temperature: ValueRange::new(-30.0, 5.0),
            snow_accumulation: ValueRange::new(0.0, 20.0),
            external_temperature: ValueRange::new(-30.0, 5.0),
        }
    }
}

impl SensorRanges {
    fn validate(&self) -> Result<(), String> {
        self.ice_thickness.validate("iceThickness")?;
        self.surface_temperature.validate("surfaceTemperature")?;
        self.snow_accumulation.validate("snowAccumulation")?;
        self.external_temperature.validate("externalTemperature")?;
        Ok(())
    }
}

/// Everything one simulated sensor needs. The connection string is handed to the ingestor
/// untouched.
#[derive(Clone)]
pub struct SensorConfig {
    pub id: String,
    pub location: String,
    pub connection_string: String,
    pub interval: Duration,
    pub ranges: SensorRanges,
}

impl SensorConfig {
    pub fn new(
        id: impl Into<String>,
        location: impl Into<String>,
        connection_string: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            connection_string: connection_string.into(),
            interval: DEFAULT_INTERVAL,
            ranges: SensorRanges::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_ranges(mut self, ranges: SensorRanges) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn validate(&self) -> Result<(), SensorError> {
        if self.id.trim().is_empty() {
            return Err(SensorError::configuration("sensor id is empty"));
        }
        if self.location.trim().is_empty() {
            return Err(SensorError::configuration(format!(
                "sensor {} has an empty location",
                self.id
            )));
        }
        if self.interval.is_zero() {
            return Err(SensorError::configuration(format!(
                "sensor {} has a zero publish interval",
                self.id
            )));
        }
        self.ranges
            .validate()
            .map_err(|reason| SensorError::configuration(format!("sensor {}: {reason}", self.id)))
    }
}

impl fmt::Debug for SensorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorConfig")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("connection_string", &"<redacted>")
            .field("interval", &self.interval)
            .field("ranges", &self.ranges)
            .finish()
    }
}

/// What a worker does when a single publish fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishFailurePolicy {
    /// Stop the worker and report the failure.
    #[default]
    Terminate,
    /// Log the failure and keep publishing on the normal cadence.
    Continue,
}

impl FromStr for PublishFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "terminate" | "stop" => Ok(Self::Terminate),
            "continue" | "tolerate" => Ok(Self::Continue),
            other => Err(anyhow!(
                "unknown publish failure policy {other:?} (expected terminate or continue)"
            )),
        }
    }
}

/// One sensor as described in a fleet file.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub id: String,
    pub location: String,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub connection_string_env: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub ranges: Option<SensorRanges>,
}

impl SensorEntry {
    fn builtin(id: &str, location: &str, env_key: &str) -> Self {
        Self {
            id: id.to_string(),
            location: location.to_string(),
            connection_string: None,
            connection_string_env: Some(env_key.to_string()),
            interval_seconds: None,
            ranges: None,
        }
    }
}

/// The three Rideau Canal skateway sensors.
pub fn builtin_fleet() -> Vec<SensorEntry> {
    vec![
        SensorEntry::builtin("dows_lake_sensor", "Dow's Lake", "DOWS_LAKE_CONNECTION_STRING"),
        SensorEntry::builtin(
            "fifth_avenue_sensor",
            "Fifth Avenue",
            "FIFTH_AVENUE_CONNECTION_STRING",
        ),
        SensorEntry::builtin("nac_sensor", "NAC", "NAC_CONNECTION_STRING"),
    ]
}

pub fn load_fleet_file(path: &Path) -> Result<Vec<SensorEntry>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse fleet file {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub sensors: Vec<SensorConfig>,
    pub dry_run: bool,
    pub publish_failure: PublishFailurePolicy,
    pub publish_timeout: Option<Duration>,
    pub shutdown_timeout: Option<Duration>,
    pub mqtt: MqttSettings,
}

impl FleetConfig {
    /// Reads the process environment; command-line values win over their env equivalents.
    pub fn load(args: &Args) -> Result<Self> {
        Self::from_lookup(args, |key| env::var(key).ok())
    }

    pub fn from_lookup<F>(args: &Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };

        let fleet_file = args
            .fleet_file
            .clone()
            .or_else(|| env.optional("SENSOR_SIM_FLEET_FILE").map(PathBuf::from));
        let interval_secs = match args.interval {
            Some(secs) => secs,
            None => env.u64("SENSOR_SIM_INTERVAL_SECONDS", Some(DEFAULT_INTERVAL.as_secs()))?,
        };
        if interval_secs == 0 {
            bail!("publish interval must be at least one second");
        }
        let default_interval = Duration::from_secs(interval_secs);
        let dry_run = args.dry_run || env.bool("SENSOR_SIM_DRY_RUN", false)?;

        let publish_failure = env
            .string("SENSOR_SIM_PUBLISH_FAILURE", Some("terminate".to_string()))?
            .parse::<PublishFailurePolicy>()
            .context("invalid SENSOR_SIM_PUBLISH_FAILURE")?;
        let publish_timeout = env.optional_secs("SENSOR_SIM_PUBLISH_TIMEOUT_SECONDS")?;
        let shutdown_timeout = env.optional_secs("SENSOR_SIM_SHUTDOWN_TIMEOUT_SECONDS")?;

        let mut mqtt = MqttSettings::default();
        mqtt.port = u16::try_from(env.u64("SENSOR_SIM_MQTT_PORT", Some(u64::from(mqtt.port)))?)
            .context("invalid SENSOR_SIM_MQTT_PORT")?;
        mqtt.tls = env.bool("SENSOR_SIM_MQTT_TLS", mqtt.tls)?;
        mqtt.keep_alive = Duration::from_secs(env.u64(
            "SENSOR_SIM_MQTT_KEEPALIVE_SECONDS",
            Some(mqtt.keep_alive.as_secs()),
        )?);
        mqtt.connect_timeout = Duration::from_secs(env.u64(
            "SENSOR_SIM_CONNECT_TIMEOUT_SECONDS",
            Some(mqtt.connect_timeout.as_secs()),
        )?);
        mqtt.token_ttl = Duration::from_secs(env.u64(
            "SENSOR_SIM_SAS_TTL_SECONDS",
            Some(mqtt.token_ttl.as_secs()),
        )?);

        let entries = match &fleet_file {
            Some(path) => load_fleet_file(path)?,
            None => builtin_fleet(),
        };
        let entries = select_sensors(entries, &args.sensors)?;
        let sensors = resolve_sensors(entries, default_interval, dry_run, &env)?;

        Ok(Self {
            sensors,
            dry_run,
            publish_failure,
            publish_timeout,
            shutdown_timeout,
            mqtt,
        })
    }
}

fn select_sensors(entries: Vec<SensorEntry>, wanted: &[String]) -> Result<Vec<SensorEntry>> {
    if wanted.is_empty() {
        return Ok(entries);
    }
    for id in wanted {
        if !entries.iter().any(|entry| &entry.id == id) {
            bail!("unknown sensor {id:?}");
        }
    }
    Ok(entries
        .into_iter()
        .filter(|entry| wanted.contains(&entry.id))
        .collect())
}

fn resolve_sensors<F>(
    entries: Vec<SensorEntry>,
    default_interval: Duration,
    dry_run: bool,
    env: &EnvSource<F>,
) -> Result<Vec<SensorConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    if entries.is_empty() {
        bail!("fleet has no sensors");
    }

    let mut seen = HashSet::new();
    let mut sensors = Vec::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(entry.id.clone()) {
            bail!("duplicate sensor id {:?}", entry.id);
        }

        let connection_string = entry
            .connection_string
            .clone()
            .or_else(|| {
                entry
                    .connection_string_env
                    .as_deref()
                    .and_then(|key| env.optional(key))
            })
            .unwrap_or_default();
        if connection_string.is_empty() && !dry_run {
            // Only this sensor's worker fails; the rest of the fleet still starts.
            tracing::warn!(
                sensor_id = %entry.id,
                env_key = entry.connection_string_env.as_deref().unwrap_or("-"),
                "no connection string configured"
            );
        }

        let interval = entry
            .interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(default_interval);
        sensors.push(
            SensorConfig::new(entry.id, entry.location, connection_string)
                .with_interval(interval)
                .with_ranges(entry.ranges.unwrap_or_default()),
        );
    }
    Ok(sensors)
}

struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: Option<String>) -> Result<String> {
        match (self.lookup)(key) {
            Some(value) => Ok(value.trim().to_string()),
            None => default.ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn u64(&self, key: &str, default: Option<u64>) -> Result<u64> {
        match (self.lookup)(key) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid {key}")),
            None => default.ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(anyhow!("invalid {key}: expected a boolean")),
            },
            None => Ok(default),
        }
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn optional_secs(&self, key: &str) -> Result<Option<Duration>> {
        match self.optional(key) {
            Some(raw) => {
                let secs = raw.parse::<u64>().with_context(|| format!("invalid {key}"))?;
                Ok(Some(Duration::from_secs(secs)))
            }
            None => Ok(None),
        }
    }
}
