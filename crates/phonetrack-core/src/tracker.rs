//! Lifecycle of one configured tracker: setup, polling, entity reads, unload.
//!
//! ```text
//!   TrackerConfig ──validate_static──▶ ValidatedTracker
//!        │                                   │
//!        │                     RefreshCoordinator::refresh()  (first cycle, must succeed)
//!        │                                   │
//!        └──────────────▶ Tracker ── spawn_polling(update_interval)
//!                           │
//!                           ├── entity(now)  → TrackerEntity (pull, never blocks a cycle)
//!                           └── unload()     → cancel poller, drop state
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::TrackerConfig;
use crate::coordinator::{RefreshCoordinator, RefreshOutcome};
use crate::error::{ConfigError, SetupError};
use crate::evaluator::{self, EntityIdentity, EvaluationConfig, TrackerEntity};
use crate::fetch::Fetcher;
use crate::redact::Redacted;
use crate::validation::{validate_static, ValidatedTracker};

/// Token-free identifier derived from the config key: the first 8 bytes of
/// its SHA-256, hex encoded. Same key, same id, across runs and builds.
pub fn make_unique_id(config_key: &str) -> String {
    let digest = Sha256::digest(config_key.as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct Tracker {
    settings: ValidatedTracker,
    identity: EntityIdentity,
    evaluation: EvaluationConfig,
    coordinator: Arc<RefreshCoordinator>,
    cancel: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

impl Tracker {
    /// Validate `config`, run the first refresh and start polling.
    ///
    /// A failed first refresh aborts setup with [`SetupError::NotReady`];
    /// nothing is left running in that case.
    pub async fn setup(config: &TrackerConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self, SetupError> {
        let settings = validate_static(config)?;
        let coordinator = Arc::new(RefreshCoordinator::new(
            settings.url.clone(),
            settings.device_name.clone(),
            fetcher,
        ));

        if let Err(err) = coordinator.refresh().await {
            error!(
                "[setup] {}: first refresh from {} failed: {}",
                coordinator.name(),
                Redacted(&settings.url),
                err
            );
            return Err(SetupError::NotReady(err));
        }

        let identity = EntityIdentity {
            unique_id: make_unique_id(&settings.config_key()),
            display_name: settings.display_name.clone(),
            device_name: settings.device_name.clone(),
        };
        let evaluation = settings.evaluation_config();
        let cancel = CancellationToken::new();
        let poller = coordinator.spawn_polling(settings.update_interval, cancel.clone());

        info!(
            "[setup] {}: tracker '{}' ready ({})",
            coordinator.name(),
            settings.display_name,
            identity.unique_id
        );

        Ok(Self {
            settings,
            identity,
            evaluation,
            coordinator,
            cancel,
            poller: Some(poller),
        })
    }

    /// Keep retrying [`Tracker::setup`], one attempt per `period`, after a
    /// first attempt came back [`SetupError::NotReady`].
    ///
    /// Returns `Ok(None)` once `cancel` fires. A configuration error ends the
    /// retries.
    pub async fn retry_setup(
        config: &TrackerConfig,
        fetcher: Arc<dyn Fetcher>,
        period: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Self>, ConfigError> {
        let mut attempt = 1u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(period) => {}
            }
            attempt += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = Self::setup(config, Arc::clone(&fetcher)) => result,
            };
            match result {
                Ok(tracker) => {
                    info!(
                        "[setup] {}: ready after {} attempts",
                        tracker.coordinator.name(),
                        attempt
                    );
                    return Ok(Some(tracker));
                }
                Err(SetupError::Config(e)) => return Err(e),
                Err(SetupError::NotReady(e)) => {
                    debug!(
                        "[setup] device '{}' still not ready (attempt {}): {}",
                        config.device_name.trim(),
                        attempt,
                        e
                    );
                }
            }
        }
    }

    pub fn settings(&self) -> &ValidatedTracker {
        &self.settings
    }

    pub fn identity(&self) -> &EntityIdentity {
        &self.identity
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub async fn entity(&self, now: DateTime<Utc>) -> TrackerEntity {
        let state = self.coordinator.snapshot().await;
        evaluator::entity(&self.identity, &state, &self.evaluation, now)
    }

    /// Out-of-schedule refresh; joins a cycle already in flight.
    pub async fn request_refresh(&self) -> RefreshOutcome {
        self.coordinator.refresh().await
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.coordinator.subscribe()
    }

    /// Stop polling.  An in-flight cycle is abandoned; the state it would
    /// have committed is dropped with the tracker.
    pub async fn unload(mut self) {
        self.cancel.cancel();
        if let Some(poller) = self.poller.take() {
            if let Err(e) = poller.await {
                error!("[setup] {}: poller task failed: {}", self.coordinator.name(), e);
            }
        }
        info!("[setup] {}: unloaded", self.coordinator.name());
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RefreshError, TransportError, ValidationError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const URL: &str = "https://h/apps/phonetrack/api/getlastpositions?token=abc";

    struct CountingFetcher {
        body: Result<&'static str, TransportError>,
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        fn new(body: Result<&'static str, TransportError>) -> Arc<Self> {
            Arc::new(Self {
                body,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, _url: &str, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.body.clone().map(|s| s.as_bytes().to_vec())
        }
    }

    /// Fails the first `failures` calls, then serves a fresh fix.
    struct RecoversAfter {
        failures: usize,
        calls: AtomicUsize,
    }

    impl RecoversAfter {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetcher for RecoversAfter {
        async fn fetch(&self, _: &str, _: Duration) -> Result<Vec<u8>, TransportError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(TransportError::Status(502))
            } else {
                Ok(body_at(Utc::now().timestamp()).as_bytes().to_vec())
            }
        }
    }

    fn body_at(ts: i64) -> &'static str {
        Box::leak(
            format!(
                r#"{{"tok":{{"phone1":{{"lat":1.0,"lon":2.0,"accuracy":10,"batterylevel":80,"timestamp":{ts}}}}}}}"#
            )
            .into_boxed_str(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_runs_first_refresh_then_polls() {
        let fetcher = CountingFetcher::new(Ok(body_at(Utc::now().timestamp())));
        let tracker = Tracker::setup(&TrackerConfig::new(URL, "phone1"), fetcher.clone())
            .await
            .unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let entity = tracker.entity(Utc::now()).await;
        assert!(entity.available);
        assert_eq!(entity.latitude, Some(1.0));
        assert_eq!(entity.name, "PhoneTrack");
        assert_eq!(entity.unique_id.len(), 16);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        tracker.unload().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_setup_fails_not_ready_on_first_refresh_failure() {
        let fetcher = CountingFetcher::new(Ok(r#"{"tok":{}}"#));
        let err = Tracker::setup(&TrackerConfig::new(URL, "phone1"), fetcher)
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            SetupError::NotReady(RefreshError::Validation(ValidationError::SourceEmpty))
        );
    }

    #[tokio::test]
    async fn test_setup_rejects_bad_config_before_network() {
        let fetcher = CountingFetcher::new(Ok("{}"));
        let mut cfg = TrackerConfig::new(URL, "phone1");
        cfg.last_update_timeout = 1;
        let err = Tracker::setup(&cfg, fetcher.clone()).await.err().unwrap();
        assert!(matches!(
            err,
            SetupError::Config(ConfigError::InvalidTimeoutConfiguration { .. })
        ));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_refresh_failure_makes_entity_unavailable() {
        struct Flaky(AtomicUsize);
        #[async_trait]
        impl Fetcher for Flaky {
            async fn fetch(&self, _: &str, _: Duration) -> Result<Vec<u8>, TransportError> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(body_at(Utc::now().timestamp()).as_bytes().to_vec())
                } else {
                    Err(TransportError::Status(503))
                }
            }
        }

        let tracker = Tracker::setup(
            &TrackerConfig::new(URL, "phone1"),
            Arc::new(Flaky(AtomicUsize::new(0))),
        )
        .await
        .unwrap();
        assert!(tracker.entity(Utc::now()).await.available);

        assert!(tracker.request_refresh().await.is_err());
        let entity = tracker.entity(Utc::now()).await;
        assert!(!entity.available);
        // The last good record still backs the display values.
        assert_eq!(entity.battery_level, Some(80));
        tracker.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_setup_brings_up_tracker_after_not_ready() {
        let fetcher = RecoversAfter::new(1);
        let cfg = TrackerConfig::new(URL, "phone1");

        let err = Tracker::setup(&cfg, fetcher.clone()).await.err().unwrap();
        assert!(matches!(err, SetupError::NotReady(_)));

        let cancel = CancellationToken::new();
        let tracker = Tracker::retry_setup(&cfg, fetcher.clone(), Duration::from_secs(60), &cancel)
            .await
            .unwrap()
            .expect("tracker should come up");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(tracker.entity(Utc::now()).await.available);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        tracker.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_setup_keeps_trying_until_cancelled() {
        let fetcher = RecoversAfter::new(usize::MAX);
        let cfg = TrackerConfig::new(URL, "phone1");
        let cancel = CancellationToken::new();

        let task = {
            let fetcher = fetcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                Tracker::retry_setup(&cfg, fetcher, Duration::from_secs(60), &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        assert!(task.await.unwrap().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_setup_stops_on_config_error() {
        let fetcher = RecoversAfter::new(0);
        let mut cfg = TrackerConfig::new(URL, "phone1");
        cfg.device_name = "  ".into();
        let cancel = CancellationToken::new();

        let err = Tracker::retry_setup(&cfg, fetcher.clone(), Duration::from_secs(60), &cancel)
            .await
            .err()
            .unwrap();
        assert_eq!(err, ConfigError::InvalidDeviceName);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unique_id_is_fixed_and_hides_token() {
        let a = make_unique_id("https://h/getlastpositions?token=abc_phone1");
        let b = make_unique_id("https://h/getlastpositions?token=abc_phone1");
        assert_eq!(a, b);
        assert!(!a.contains("token"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, make_unique_id("https://h/getlastpositions?token=abc_phone2"));
        // SHA-256("abc") starts with ba7816bf8f01cfea.
        assert_eq!(make_unique_id("abc"), "ba7816bf8f01cfea");
    }
}
