use crate::config::{SensorConfig, ValueRange};
use crate::error::SensorError;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

/// UTC, second precision, literal `Z`. The ingestion side parses this exact shape.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One telemetry snapshot. Field names are the payload keys the ingestion endpoint expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub location: String,
    pub ice_thickness: f64,
    pub surface_temperature: f64,
    pub snow_accumulation: f64,
    pub external_temperature: f64,
    pub timestamp: String,
}

impl Reading {
    /// Flat JSON object, keys in declaration order.
    pub fn to_payload(&self) -> Result<Vec<u8>, SensorError> {
        serde_json::to_vec(self)
            .map_err(|err| SensorError::transport(format!("encode reading: {err}")))
    }
}

pub fn generate(config: &SensorConfig) -> Reading {
    generate_with(config, Utc::now(), &mut rand::thread_rng())
}

pub fn generate_with<R: Rng + ?Sized>(
    config: &SensorConfig,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Reading {
    let ranges = &config.ranges;
    Reading {
        location: config.location.clone(),
        ice_thickness: sample(&ranges.ice_thickness, rng),
        surface_temperature: sample(&ranges.surface_temperature, rng),
        snow_accumulation: sample(&ranges.snow_accumulation, rng),
        external_temperature: sample(&ranges.external_temperature, rng),
        timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
    }
}

// Callers validate ranges first; gen_range panics on min > max.
fn sample<R: Rng + ?Sized>(range: &ValueRange, rng: &mut R) -> f64 {
    rng.gen_range(range.min..=range.max)
}
