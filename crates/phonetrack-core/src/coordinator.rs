//! Refresh coordinator: the single owner of one tracker's `TrackedDeviceState`.
//!
//! A fetch cycle is: GET (bounded by a timeout) → `payload::validate` →
//! `payload::select` → commit.  The commit replaces the whole state value
//! under a write lock, so readers see either the previous cycle's state or
//! the new one.
//!
//! Single-flight: cycles are serialised by an async mutex.  A caller that
//! finds a cycle in flight waits for it and returns *its* outcome instead of
//! issuing a second request.
//!
//! A failed cycle keeps the last good record but clears
//! `last_fetch_succeeded`, which alone is enough to make the entity
//! unavailable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{RefreshError, TransportError, ValidationError};
use crate::fetch::Fetcher;
use crate::payload::{self, DeviceRecord};
use crate::redact::Redacted;

/// Timeout for a scheduled refresh.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

pub type RefreshOutcome = Result<(), RefreshError>;

// ── TrackedDeviceState ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedDeviceState {
    /// Last successfully fetched record.  Survives failed cycles.
    pub record: Option<Arc<DeviceRecord>>,
    /// Outcome of the most recent cycle.
    pub last_fetch_succeeded: bool,
    /// Number of completed cycles; `0` means nothing has been attempted yet.
    pub rev: u64,
}

// ── Shared fetch pipeline ─────────────────────────────────────────────────────

/// One GET + validate + select, bounded by `timeout`.  Also used by the
/// one-shot connection probe.
pub async fn fetch_device_record(
    fetcher: &dyn Fetcher,
    url: &str,
    device_name: &str,
    timeout: Duration,
) -> Result<DeviceRecord, RefreshError> {
    let body = tokio::time::timeout(timeout, fetcher.fetch(url, timeout))
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
    let devices = payload::validate(&body)?;
    Ok(payload::select(&devices, device_name)?)
}

// ── RefreshCoordinator ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CycleLedger {
    completed: u64,
    last_outcome: Option<RefreshOutcome>,
}

pub struct RefreshCoordinator {
    name: String,
    url: String,
    device_name: String,
    timeout: Duration,
    fetcher: Arc<dyn Fetcher>,
    state: RwLock<TrackedDeviceState>,
    /// Held for the whole duration of a cycle.
    ledger: Mutex<CycleLedger>,
    /// Mirror of `ledger.completed`, readable without waiting on the lock.
    completed: AtomicU64,
    rev_tx: watch::Sender<u64>,
}

impl RefreshCoordinator {
    pub fn new(url: String, device_name: String, fetcher: Arc<dyn Fetcher>) -> Self {
        let (rev_tx, _) = watch::channel(0);
        Self {
            name: format!("PhoneTrack {device_name}"),
            url,
            device_name,
            timeout: REFRESH_TIMEOUT,
            fetcher,
            state: RwLock::new(TrackedDeviceState::default()),
            ledger: Mutex::new(CycleLedger::default()),
            completed: AtomicU64::new(0),
            rev_tx,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Current state.  Cheap: the record is behind an `Arc`.
    pub async fn snapshot(&self) -> TrackedDeviceState {
        self.state.read().await.clone()
    }

    /// Receives the state revision after every completed cycle.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.rev_tx.subscribe()
    }

    /// Run one fetch cycle, or join the one already in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        let seen = self.completed.load(Ordering::Acquire);
        let mut ledger = self.ledger.lock().await;

        if ledger.completed > seen {
            if let Some(outcome) = &ledger.last_outcome {
                debug!("[refresh] {}: joined in-flight cycle", self.name);
                return outcome.clone();
            }
        }

        let outcome = self.run_cycle().await;

        ledger.completed += 1;
        ledger.last_outcome = Some(outcome.clone());
        self.completed.store(ledger.completed, Ordering::Release);
        outcome
    }

    async fn run_cycle(&self) -> RefreshOutcome {
        debug!(
            "[refresh] {}: fetching {}",
            self.name,
            Redacted(&self.url)
        );

        let result = fetch_device_record(
            self.fetcher.as_ref(),
            &self.url,
            &self.device_name,
            self.timeout,
        )
        .await;

        let rev = {
            let mut state = self.state.write().await;
            let next = match &result {
                Ok(record) => TrackedDeviceState {
                    record: Some(Arc::new(record.clone())),
                    last_fetch_succeeded: true,
                    rev: state.rev + 1,
                },
                Err(_) => TrackedDeviceState {
                    record: state.record.clone(),
                    last_fetch_succeeded: false,
                    rev: state.rev + 1,
                },
            };
            *state = next;
            state.rev
        };
        self.rev_tx.send_replace(rev);

        match result {
            Ok(_) => {
                debug!(
                    "[refresh] {}: fetched data for device '{}'",
                    self.name, self.device_name
                );
                Ok(())
            }
            Err(err) => {
                self.log_failure(&err);
                Err(err)
            }
        }
    }

    fn log_failure(&self, err: &RefreshError) {
        debug!("[refresh] {}: {}", self.name, err);
        match err {
            RefreshError::Validation(ValidationError::DeviceNotFound { device, available }) => {
                debug!(
                    "[refresh] {}: device '{}' not in response, available devices: {:?}",
                    self.name, device, available
                );
            }
            RefreshError::Validation(ValidationError::Decode { snippet, .. }) => {
                debug!(
                    "[refresh] {}: failed to parse JSON from {}, response snippet: {}",
                    self.name,
                    Redacted(&self.url),
                    snippet
                );
            }
            _ => {}
        }
    }

    /// Spawn the periodic poller.  The first tick fires one `period` from now:
    /// the setup-time refresh has already run.
    pub fn spawn_polling(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "[refresh] {}: polling every {}s",
                coordinator.name,
                period.as_secs()
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    // Failures are logged by the cycle; the next tick retries.
                    _ = coordinator.refresh() => {}
                }
            }

            info!("[refresh] {}: polling stopped", coordinator.name);
        })
    }
}
