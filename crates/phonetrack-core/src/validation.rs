//! Setup-time validation of a tracker configuration.
//!
//! [`validate_static`] runs the checks that need no network and normalises the
//! input; [`validate_connection`] additionally performs a one-shot probe of the
//! endpoint so a bad URL or device name is rejected before the tracker is
//! activated.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::TrackerConfig;
use crate::coordinator::fetch_device_record;
use crate::error::{ConfigError, RefreshError, TransportError, ValidationError};
use crate::evaluator::EvaluationConfig;
use crate::fetch::Fetcher;
use crate::redact::Redacted;

/// Timeout for the setup-time probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Path marker of the PhoneTrack "last positions" API.
pub const LAST_POSITIONS_MARKER: &str = "getlastpositions";

fn http_scheme() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://").expect("scheme regex is valid"))
}

/// A tracker configuration that passed validation, with normalised inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTracker {
    pub url: String,
    pub device_name: String,
    pub display_name: String,
    pub max_gps_accuracy: u32,
    pub update_interval: Duration,
    pub last_update_timeout_minutes: u32,
}

impl ValidatedTracker {
    /// Key used to detect the same device configured twice.
    pub fn config_key(&self) -> String {
        format!("{}_{}", self.url, self.device_name).to_lowercase()
    }

    pub fn evaluation_config(&self) -> EvaluationConfig {
        EvaluationConfig {
            max_gps_accuracy: f64::from(self.max_gps_accuracy),
            last_update_timeout_minutes: self.last_update_timeout_minutes,
        }
    }
}

pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

pub fn normalize_device_name(name: &str) -> String {
    name.trim().to_string()
}

/// Checks that need no network access.
pub fn validate_static(config: &TrackerConfig) -> Result<ValidatedTracker, ConfigError> {
    let url = normalize_url(&config.url);
    let device_name = normalize_device_name(&config.device_name);

    if url.is_empty() || !http_scheme().is_match(&url) {
        return Err(ConfigError::InvalidUrl);
    }
    if !url.contains(LAST_POSITIONS_MARKER) {
        return Err(ConfigError::InvalidPhoneTrackUrl);
    }
    if device_name.is_empty() {
        return Err(ConfigError::InvalidDeviceName);
    }
    if config.update_interval == 0 {
        return Err(ConfigError::InvalidUpdateInterval);
    }

    // A device that misses one or two polls must not already count as stale.
    let interval_minutes = config.update_interval as f64 / 60.0;
    if f64::from(config.last_update_timeout) < interval_minutes * 2.0 {
        return Err(ConfigError::InvalidTimeoutConfiguration {
            timeout_minutes: config.last_update_timeout,
            interval_minutes,
        });
    }

    Ok(ValidatedTracker {
        url,
        device_name,
        display_name: config.display_name.clone(),
        max_gps_accuracy: config.max_gps_accuracy,
        update_interval: Duration::from_secs(config.update_interval),
        last_update_timeout_minutes: config.last_update_timeout,
    })
}

fn probe_error(err: RefreshError) -> ConfigError {
    match err {
        RefreshError::Transport(TransportError::Status(status)) => {
            ConfigError::CannotConnect(format!("API returned HTTP {status}"))
        }
        RefreshError::Transport(e) => ConfigError::CannotConnect(e.to_string()),
        RefreshError::Validation(ValidationError::Decode { .. }) => {
            ConfigError::CannotConnect("API returned invalid JSON".into())
        }
        RefreshError::Validation(ValidationError::InvalidResponseShape(_)) => {
            ConfigError::CannotConnect("API returned unexpected response format".into())
        }
        RefreshError::Validation(ValidationError::SourceEmpty) => ConfigError::DeviceNotFound {
            device: String::new(),
            available: Vec::new(),
        },
        RefreshError::Validation(ValidationError::DeviceNotFound { device, available }) => {
            ConfigError::DeviceNotFound { device, available }
        }
    }
}

/// Static checks followed by a one-shot fetch of the configured device.
pub async fn validate_connection(
    config: &TrackerConfig,
    fetcher: &dyn Fetcher,
) -> Result<ValidatedTracker, ConfigError> {
    let tracker = validate_static(config)?;

    debug!("[setup] testing connection to {}", Redacted(&tracker.url));
    match fetch_device_record(fetcher, &tracker.url, &tracker.device_name, PROBE_TIMEOUT).await {
        Ok(_) => {
            debug!("[setup] validated tracker for device '{}'", tracker.device_name);
            Ok(tracker)
        }
        Err(err) => {
            if let RefreshError::Transport(TransportError::Status(status)) = &err {
                warn!(
                    "[setup] API test failed with HTTP {} for {}",
                    status,
                    Redacted(&tracker.url)
                );
            }
            let err = match probe_error(err) {
                ConfigError::DeviceNotFound { available, .. } => {
                    debug!(
                        "[setup] device '{}' not found, available: {:?}",
                        tracker.device_name, available
                    );
                    ConfigError::DeviceNotFound {
                        device: tracker.device_name.clone(),
                        available,
                    }
                }
                other => other,
            };
            Err(err)
        }
    }
}
