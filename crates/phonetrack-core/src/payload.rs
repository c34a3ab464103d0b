//! Decoding and selection of the PhoneTrack `getlastpositions` payload.
//!
//! ## Wire shape
//!
//! ```text
//! { "<token>": { "<device>": { "lat": .., "lon": .., "accuracy": ..,
//!                              "batterylevel": .., "timestamp": .. }, .. } }
//! ```
//!
//! Nothing in a device record is trusted: every field is read through a
//! coercion helper that yields `None` instead of failing.

use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Longest body excerpt carried by a decode failure.
pub const SNIPPET_MAX_CHARS: usize = 200;

pub const FIELD_LAT: &str = "lat";
pub const FIELD_LON: &str = "lon";
pub const FIELD_ACCURACY: &str = "accuracy";
pub const FIELD_BATTERY: &str = "batterylevel";
pub const FIELD_TIMESTAMP: &str = "timestamp";

// ── Coercion ──────────────────────────────────────────────────────────────────

/// Read a JSON value as a finite float. Numeric strings are accepted,
/// booleans are not.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Read a JSON value as an integer. Floats truncate toward zero; strings must
/// be integer literals.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            let f = n.as_f64()?;
            // `as` saturates, so bound-check to keep huge values out
            (f.is_finite() && f.abs() < i64::MAX as f64).then(|| f.trunc() as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

// ── DeviceRecord ──────────────────────────────────────────────────────────────

/// One device's loosely-typed telemetry as reported by the source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRecord(Map<String, Value>);

impl DeviceRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Raw field value; JSON `null` reads as absent.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(coerce_f64)
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(coerce_i64)
    }

    pub fn latitude(&self) -> Option<f64> {
        self.number(FIELD_LAT)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.number(FIELD_LON)
    }

    pub fn accuracy(&self) -> Option<f64> {
        self.number(FIELD_ACCURACY)
    }

    pub fn battery(&self) -> Option<f64> {
        self.number(FIELD_BATTERY)
    }

    /// Unix seconds, UTC.
    pub fn timestamp(&self) -> Option<f64> {
        self.number(FIELD_TIMESTAMP)
    }
}

impl From<Map<String, Value>> for DeviceRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self::new(fields)
    }
}

// ── DeviceRecordMap ───────────────────────────────────────────────────────────

/// Device name → raw device entry, in the order the source listed them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRecordMap(Map<String, Value>);

impl DeviceRecordMap {
    pub fn new(mut devices: Map<String, Value>) -> Self {
        devices.retain(|name, _| !name.is_empty());
        Self(devices)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn device_names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }
}

// ── Payload validator ─────────────────────────────────────────────────────────

fn snippet(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .take(SNIPPET_MAX_CHARS)
        .collect()
}

/// Decode a raw response body into the per-device map nested under the
/// first top-level key.
pub fn validate(raw: &[u8]) -> Result<DeviceRecordMap, ValidationError> {
    let decoded: Value = serde_json::from_slice(raw).map_err(|e| ValidationError::Decode {
        message: e.to_string(),
        snippet: snippet(raw),
    })?;

    let Value::Object(top) = decoded else {
        return Err(ValidationError::InvalidResponseShape(
            "top level is not an object".into(),
        ));
    };

    // The API emits exactly one token key; anything after the first is ignored.
    match top.into_iter().next() {
        None => Err(ValidationError::InvalidResponseShape(
            "top level object is empty".into(),
        )),
        Some((_, Value::Object(devices))) => Ok(DeviceRecordMap::new(devices)),
        Some((_, _)) => Err(ValidationError::InvalidResponseShape(
            "token entry is not an object".into(),
        )),
    }
}

// ── Device selector ───────────────────────────────────────────────────────────

/// Pick `device_name`'s record out of the decoded map.
pub fn select(devices: &DeviceRecordMap, device_name: &str) -> Result<DeviceRecord, ValidationError> {
    if devices.is_empty() {
        return Err(ValidationError::SourceEmpty);
    }

    match devices.0.get(device_name) {
        None => Err(ValidationError::DeviceNotFound {
            device: device_name.to_string(),
            available: devices.device_names(),
        }),
        Some(Value::Object(fields)) => Ok(DeviceRecord::new(fields.clone())),
        Some(_) => Err(ValidationError::InvalidResponseShape(format!(
            "entry for device '{device_name}' is not an object"
        ))),
    }
}
