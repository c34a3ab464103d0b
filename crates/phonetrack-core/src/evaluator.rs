//! Derived, time-aware view of a tracker's state.
//!
//! Everything here is a pure function of `(TrackedDeviceState, config, now)`.
//! Gating checks fail closed (unknown accuracy or timestamp ⇒ not usable);
//! display values fail to a default instead.

use chrono::{DateTime, Local, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::coordinator::TrackedDeviceState;
use crate::payload::{DeviceRecord, FIELD_ACCURACY, FIELD_BATTERY};

pub const MANUFACTURER: &str = "PhoneTrack";
pub const MODEL: &str = "Tracked Device";

/// Static per-tracker thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationConfig {
    /// Meters.
    pub max_gps_accuracy: f64,
    pub last_update_timeout_minutes: u32,
}

/// Conceptual lifecycle of a tracked device, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerPhase {
    /// No cycle has produced a record yet.
    Unknown,
    FreshAccurate,
    FreshInaccurate,
    Stale,
    /// The most recent cycle failed.
    FetchFailing,
}

// ── Gates ─────────────────────────────────────────────────────────────────────

pub fn is_accurate_enough(record: &DeviceRecord, max_accuracy: f64) -> bool {
    match record.accuracy() {
        Some(acc) => acc > 0.0 && acc <= max_accuracy,
        None => false,
    }
}

fn timestamp_to_utc(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    if whole.abs() >= i64::MAX as f64 {
        return None;
    }
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}

/// Last-seen time of the record in UTC, if `timestamp` is usable.
pub fn last_seen_utc(record: &DeviceRecord) -> Option<DateTime<Utc>> {
    record.timestamp().and_then(timestamp_to_utc)
}

pub fn is_within_timeout(record: &DeviceRecord, timeout_minutes: u32, now: DateTime<Utc>) -> bool {
    let Some(seen) = last_seen_utc(record) else {
        return false;
    };
    match now.checked_sub_signed(TimeDelta::minutes(i64::from(timeout_minutes))) {
        Some(cutoff) => seen > cutoff,
        None => true,
    }
}

pub fn available(state: &TrackedDeviceState, config: &EvaluationConfig, now: DateTime<Utc>) -> bool {
    let Some(record) = state.record.as_deref() else {
        return false;
    };
    state.last_fetch_succeeded
        && is_accurate_enough(record, config.max_gps_accuracy)
        && is_within_timeout(record, config.last_update_timeout_minutes, now)
}

pub fn phase(state: &TrackedDeviceState, config: &EvaluationConfig, now: DateTime<Utc>) -> TrackerPhase {
    if state.rev > 0 && !state.last_fetch_succeeded {
        return TrackerPhase::FetchFailing;
    }
    let Some(record) = state.record.as_deref() else {
        return TrackerPhase::Unknown;
    };
    if !is_accurate_enough(record, config.max_gps_accuracy) {
        TrackerPhase::FreshInaccurate
    } else if !is_within_timeout(record, config.last_update_timeout_minutes, now) {
        TrackerPhase::Stale
    } else {
        TrackerPhase::FreshAccurate
    }
}

// ── Values ────────────────────────────────────────────────────────────────────

/// `(lat, lon)`, only when the fix passes the accuracy gate.
pub fn position(state: &TrackedDeviceState, config: &EvaluationConfig) -> Option<(f64, f64)> {
    let record = state.record.as_deref()?;
    if !is_accurate_enough(record, config.max_gps_accuracy) {
        return None;
    }
    Some((record.latitude()?, record.longitude()?))
}

/// Battery percentage clamped into `0..=100`.
pub fn battery_level(record: &DeviceRecord) -> Option<u8> {
    let pct = record.battery()?.trunc().clamp(0.0, 100.0);
    Some(pct as u8)
}

/// Reported accuracy for display; `0` when unusable.
pub fn location_accuracy_meters(record: &DeviceRecord) -> i64 {
    record.integer(FIELD_ACCURACY).unwrap_or(0)
}

pub fn last_seen_local(record: &DeviceRecord) -> Option<DateTime<Local>> {
    last_seen_utc(record).map(|t| t.with_timezone(&Local))
}

// ── Entity projection ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityIdentity {
    pub unique_id: String,
    pub display_name: String,
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
}

/// Extra attributes.  Empty until the first record arrives.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// As reported by the source, unclamped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Local>>,
}

/// What an observer sees of one tracker at a given instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerEntity {
    pub unique_id: String,
    pub name: String,
    pub source_type: &'static str,
    pub available: bool,
    pub phase: TrackerPhase,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub battery_level: Option<u8>,
    pub location_accuracy: i64,
    pub attributes: EntityAttributes,
    pub device: DeviceInfo,
}

pub fn entity(
    identity: &EntityIdentity,
    state: &TrackedDeviceState,
    config: &EvaluationConfig,
    now: DateTime<Utc>,
) -> TrackerEntity {
    let record = state.record.as_deref();
    let (latitude, longitude) = position(state, config).unzip();

    let attributes = match record {
        Some(r) => EntityAttributes {
            device_name: Some(identity.device_name.clone()),
            battery_level: r.get(FIELD_BATTERY).cloned(),
            last_seen: last_seen_local(r),
        },
        None => EntityAttributes::default(),
    };

    TrackerEntity {
        unique_id: identity.unique_id.clone(),
        name: identity.display_name.clone(),
        source_type: "gps",
        available: available(state, config, now),
        phase: phase(state, config, now),
        latitude,
        longitude,
        battery_level: record.and_then(battery_level),
        location_accuracy: record.map(location_accuracy_meters).unwrap_or(0),
        attributes,
        device: DeviceInfo {
            name: identity.device_name.clone(),
            manufacturer: MANUFACTURER,
            model: MODEL,
        },
    }
}
