use crate::error::SensorError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

/// Parsed `HostName=...;DeviceId=...;SharedAccessKey=...` device connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredential {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: String,
}

impl FromStr for DeviceCredential {
    type Err = SensorError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;

        for (index, part) in raw
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .enumerate()
        {
            // Keys are base64 and may end in '=', so only split on the first one.
            let Some((key, value)) = part.split_once('=') else {
                return Err(SensorError::configuration(format!(
                    "connection string segment {} is not key=value",
                    index + 1
                )));
            };
            let value = value.trim().to_string();
            match key.trim() {
                "HostName" => host_name = Some(value),
                "DeviceId" => device_id = Some(value),
                "SharedAccessKey" => shared_access_key = Some(value),
                _ => {}
            }
        }

        let require = |value: Option<String>, key: &str| {
            value
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SensorError::configuration(format!("connection string missing {key}")))
        };

        Ok(Self {
            host_name: require(host_name, "HostName")?,
            device_id: require(device_id, "DeviceId")?,
            shared_access_key: require(shared_access_key, "SharedAccessKey")?,
        })
    }
}

impl DeviceCredential {
    /// `{host}/devices/{device}` form-urlencoded, the resource a token is scoped to.
    pub fn resource_uri(&self) -> String {
        let resource = format!("{}/devices/{}", self.host_name, self.device_id);
        form_urlencoded::byte_serialize(resource.as_bytes()).collect()
    }

    pub fn mqtt_username(&self, api_version: &str) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.host_name, self.device_id, api_version
        )
    }

    pub fn telemetry_topic(&self) -> String {
        format!("devices/{}/messages/events/", self.device_id)
    }

    /// Shared access signature valid until `expiry` (unix seconds).
    pub fn sas_token(&self, expiry: i64) -> Result<String, SensorError> {
        let key = STANDARD.decode(self.shared_access_key.as_bytes()).map_err(|err| {
            SensorError::configuration(format!("SharedAccessKey is not valid base64: {err}"))
        })?;
        let resource = self.resource_uri();

        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|err| SensorError::configuration(format!("unusable SharedAccessKey: {err}")))?;
        mac.update(format!("{resource}\n{expiry}").as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        let signature: String = form_urlencoded::byte_serialize(signature.as_bytes()).collect();

        Ok(format!(
            "SharedAccessSignature sr={resource}&sig={signature}&se={expiry}"
        ))
    }
}

impl fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("shared_access_key", &"<redacted>")
            .finish()
    }
}
