//! Canonical anisette header set: remapping, local field computation and
//! completeness validation.

use std::collections::HashMap;

use chrono::{Local, Utc};
use serde::Serialize;

use crate::client_info::ClientInfo;
use crate::identity::DeviceIdentity;

/// Outbound date format, `yyyy-MM-dd'T'HH:mm:ss'Z'`.
///
/// The `Z` is a literal: request signing uses UTC wall time, while the
/// header-fetch `date` field uses *local* wall time with the same literal
/// suffix. The asymmetry is what Apple's servers expect.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Serial number reported for every virtual device. The validator requires a
/// value even though the backend never uses it.
const DEVICE_SERIAL_NUMBER: &str = "0";

/// Locale and time zone the client reports to Apple.
#[derive(Debug, Clone)]
pub struct LocalEnvironment {
    /// Locale identifier, e.g. `en_US`.
    pub locale: String,
    /// Time zone abbreviation, e.g. `UTC` or `PST`.
    pub time_zone: String,
}

impl Default for LocalEnvironment {
    fn default() -> Self {
        Self {
            locale: "en_US".to_string(),
            time_zone: "UTC".to_string(),
        }
    }
}

/// Current UTC time in [`TIMESTAMP_FORMAT`], used to sign Apple requests.
pub(crate) fn signing_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Current local wall time in [`TIMESTAMP_FORMAT`], used for the header-fetch
/// `date` field.
pub(crate) fn header_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// The complete anisette header set, immutable once constructed.
///
/// Construction goes through [`AnisetteHeaders::validate`], which refuses any
/// field map with a required key missing or empty, so a value of this type is
/// always complete.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AnisetteHeaders {
    /// Always `"0"`; required downstream despite being unused.
    #[serde(rename = "deviceSerialNumber")]
    pub device_serial_number: String,
    /// The `X-Apple-I-MD-M` machine identifier.
    #[serde(rename = "machineID")]
    pub machine_id: String,
    /// The `X-Apple-I-MD` one-time password.
    #[serde(rename = "oneTimePassword")]
    pub one_time_password: String,
    /// The `X-Apple-I-MD-LU` local user identifier.
    #[serde(rename = "localUserID")]
    pub local_user_id: String,
    /// The `X-Apple-I-MD-RINFO` routing info, when the server provides it.
    #[serde(rename = "routingInfo", skip_serializing_if = "Option::is_none")]
    pub routing_info: Option<String>,
    /// The `X-Mme-Device-Id` device UUID.
    #[serde(rename = "deviceUniqueIdentifier")]
    pub device_unique_identifier: String,
    /// The `X-MMe-Client-Info` device description.
    #[serde(rename = "deviceDescription")]
    pub device_description: String,
    /// Client time in [`TIMESTAMP_FORMAT`].
    pub date: String,
    /// Locale identifier.
    pub locale: String,
    /// Time zone abbreviation.
    #[serde(rename = "timeZone")]
    pub time_zone: String,
}

impl AnisetteHeaders {
    /// Validates a canonical field map into a complete header set.
    ///
    /// # Errors
    ///
    /// Returns the list of missing or empty required fields.
    pub(crate) fn validate(fields: &HashMap<String, String>) -> Result<Self, String> {
        let mut missing = Vec::new();
        let mut require = |key: &'static str| -> String {
            match fields.get(key) {
                Some(value) if !value.is_empty() => value.clone(),
                _ => {
                    missing.push(key);
                    String::new()
                }
            }
        };

        let headers = Self {
            device_serial_number: require("deviceSerialNumber"),
            machine_id: require("machineID"),
            one_time_password: require("oneTimePassword"),
            local_user_id: require("localUserID"),
            routing_info: fields.get("routingInfo").cloned(),
            device_unique_identifier: require("deviceUniqueIdentifier"),
            device_description: require("deviceDescription"),
            date: require("date"),
            locale: require("locale"),
            time_zone: require("timeZone"),
        };

        if missing.is_empty() {
            Ok(headers)
        } else {
            Err(format!("missing or empty fields: {}", missing.join(", ")))
        }
    }
}

/// Apple header name → canonical field name, for the legacy response body.
const V1_FIELD_MAP: &[(&str, &str)] = &[
    ("X-Apple-I-MD-M", "machineID"),
    ("X-Apple-I-MD", "oneTimePassword"),
    ("X-Apple-I-MD-LU", "localUserID"),
    ("X-Apple-I-MD-RINFO", "routingInfo"),
    ("X-Mme-Device-Id", "deviceUniqueIdentifier"),
    ("X-MMe-Client-Info", "deviceDescription"),
    ("X-Apple-I-Client-Time", "date"),
    ("X-Apple-Locale", "locale"),
    ("X-Apple-I-TimeZone", "timeZone"),
];

/// Remaps a legacy (V1) response into the canonical field set.
///
/// Legacy servers are trusted for every field they return, including the
/// identity-derived ones; that is deliberate per-version behavior, not an
/// oversight. Only the serial number is forced locally.
pub(crate) fn remap_v1(raw: &HashMap<String, String>) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    fields.insert(
        "deviceSerialNumber".to_string(),
        DEVICE_SERIAL_NUMBER.to_string(),
    );
    for (apple_name, canonical) in V1_FIELD_MAP {
        if let Some(value) = raw.get(*apple_name) {
            fields.insert((*canonical).to_string(), value.clone());
        }
    }
    fields
}

/// Assembles the canonical field set from a V3 `get_headers` response.
///
/// Only `machineID`, `oneTimePassword` and `routingInfo` are taken from the
/// server. Every identity-derived or client-computed field is overwritten
/// locally even if the server supplied a value with the same name.
pub(crate) fn assemble_v3(
    raw: &HashMap<String, String>,
    identity: &DeviceIdentity,
    client_info: &ClientInfo,
    env: &LocalEnvironment,
) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    fields.insert(
        "deviceSerialNumber".to_string(),
        DEVICE_SERIAL_NUMBER.to_string(),
    );
    if let Some(machine_id) = raw.get("X-Apple-I-MD-M") {
        fields.insert("machineID".to_string(), machine_id.clone());
    }
    if let Some(otp) = raw.get("X-Apple-I-MD") {
        fields.insert("oneTimePassword".to_string(), otp.clone());
    }
    if let Some(routing_info) = raw.get("X-Apple-I-MD-RINFO") {
        fields.insert("routingInfo".to_string(), routing_info.clone());
    }

    fields.insert(
        "deviceDescription".to_string(),
        client_info.client_info.clone(),
    );
    fields.insert("localUserID".to_string(), identity.local_user_id());
    fields.insert(
        "deviceUniqueIdentifier".to_string(),
        identity.device_unique_identifier(),
    );
    fields.insert("date".to_string(), header_timestamp());
    fields.insert("locale".to_string(), env.locale.clone());
    fields.insert("timeZone".to_string(), env.time_zone.clone());
    fields
}
