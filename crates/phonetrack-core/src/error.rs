//! Error taxonomy shared by the refresh path and the setup path.
//!
//! Everything on the refresh path is `Clone`: a coalesced refresh hands the
//! same outcome to every caller that waited on the in-flight cycle.

use std::time::Duration;

use thiserror::Error;

/// The request never produced a usable body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("API returned HTTP {0}")]
    Status(u16),
    /// Message is already stripped of the request URL.
    #[error("request failed: {0}")]
    Request(String),
}

/// Tag for [`ValidationError`], matching the failure kinds a fetched payload
/// can be rejected with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidResponseShape,
    DecodeError,
    DeviceNotFound,
    SourceEmpty,
}

/// The body arrived but could not be turned into a device record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unexpected API response format: {0}")]
    InvalidResponseShape(String),
    #[error("invalid JSON response: {message}")]
    Decode {
        message: String,
        /// At most [`crate::payload::SNIPPET_MAX_CHARS`] characters of the body.
        snippet: String,
    },
    /// `available` is for debug logs; it is deliberately left out of `Display`.
    #[error("device '{device}' temporarily unavailable")]
    DeviceNotFound {
        device: String,
        available: Vec<String>,
    },
    #[error("source reported no devices")]
    SourceEmpty,
}

impl ValidationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidResponseShape(_) => FailureKind::InvalidResponseShape,
            Self::Decode { .. } => FailureKind::DecodeError,
            Self::DeviceNotFound { .. } => FailureKind::DeviceNotFound,
            Self::SourceEmpty => FailureKind::SourceEmpty,
        }
    }
}

/// Why a single fetch cycle failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("error fetching PhoneTrack data: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl RefreshError {
    /// `None` for transport failures.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Transport(_) => None,
            Self::Validation(e) => Some(e.kind()),
        }
    }
}

/// Rejected tracker configuration. Each variant has a stable form-level code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("URL must be a valid HTTP/HTTPS URL")]
    InvalidUrl,
    #[error("URL must be a PhoneTrack getlastpositions endpoint")]
    InvalidPhoneTrackUrl,
    #[error("device name cannot be empty")]
    InvalidDeviceName,
    #[error("update interval must be at least one second")]
    InvalidUpdateInterval,
    #[error(
        "timeout ({timeout_minutes} min) must be at least 2x the polling interval ({interval_minutes:.1} min)"
    )]
    InvalidTimeoutConfiguration {
        timeout_minutes: u32,
        interval_minutes: f64,
    },
    #[error("cannot connect: {0}")]
    CannotConnect(String),
    #[error("device '{device}' not found. Available devices: {available:?}")]
    DeviceNotFound {
        device: String,
        available: Vec<String>,
    },
    #[error("tracker for device '{0}' is already configured")]
    AlreadyConfigured(String),
}

impl ConfigError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::InvalidPhoneTrackUrl => "invalid_phonetrack_url",
            Self::InvalidDeviceName => "invalid_device_name",
            Self::InvalidUpdateInterval => "invalid_update_interval",
            Self::InvalidTimeoutConfiguration { .. } => "invalid_timeout_configuration",
            Self::CannotConnect(_) => "cannot_connect",
            Self::DeviceNotFound { .. } => "device_not_found",
            Self::AlreadyConfigured(_) => "already_configured",
        }
    }
}

/// Why a tracker could not be activated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The first refresh failed; the tracker is not ready.
    #[error("failed to validate PhoneTrack configuration: {0}")]
    NotReady(#[from] RefreshError),
}
