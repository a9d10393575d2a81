//! Scan controller.
//! Drives discovery with filtering, de-duplication, retry attempts and a
//! per-attempt timeout. Start/complete fire exactly once per multi-attempt
//! sequence.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::device::DeviceIdentity;
use crate::error::EngineError;
use crate::events::{ScanCallback, ScanReport};
use crate::platform::{Advertisement, Radio};

/// Filter applied to sightings before de-duplication. An empty list on any
/// dimension means no restriction on that dimension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Allowlist of advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Allowlist of device names.
    pub names: Vec<String>,
    /// Match names by substring instead of exact equality.
    pub fuzzy_name: bool,
    /// Allowlist of device addresses (case-insensitive).
    pub addresses: Vec<String>,
}

impl ScanFilter {
    pub(crate) fn matches(&self, adv: &Advertisement) -> bool {
        if !self.service_uuids.is_empty() {
            let advertised = &adv.service_uuids;
            if !self
                .service_uuids
                .iter()
                .any(|wanted| advertised.contains(wanted))
            {
                return false;
            }
        }
        if !self.names.is_empty() {
            let Some(name) = adv.name.as_deref() else {
                return false;
            };
            let name_matches = self.names.iter().any(|wanted| {
                if self.fuzzy_name {
                    name.contains(wanted.as_str())
                } else {
                    name == wanted
                }
            });
            if !name_matches {
                return false;
            }
        }
        if !self.addresses.is_empty()
            && !self
                .addresses
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(&adv.address))
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Idle,
    Scanning,
}

struct ScannerInner {
    radio: Arc<dyn Radio>,
    config: Arc<EngineConfig>,
    state: Mutex<ScanState>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// Owns the scan lifecycle. One sequence at a time; a second start fails
/// fast with `AlreadyScanning`. Cheap to clone.
#[derive(Clone)]
pub(crate) struct ScanController {
    inner: Arc<ScannerInner>,
}

impl ScanController {
    pub(crate) fn new(radio: Arc<dyn Radio>, config: Arc<EngineConfig>) -> Self {
        Self {
            inner: Arc::new(ScannerInner {
                radio,
                config,
                state: Mutex::new(ScanState::Idle),
                cancel: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn is_scanning(&self) -> bool {
        *self.inner.state.lock().unwrap() == ScanState::Scanning
    }

    /// Starts a multi-attempt scan sequence. Fails fast through the
    /// callback when a sequence is already running.
    pub(crate) fn start(&self, filter: ScanFilter, callback: ScanCallback) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == ScanState::Scanning {
                drop(state);
                if let Some(handler) = &callback.on_fail {
                    handler(&EngineError::AlreadyScanning);
                }
                return;
            }
            *state = ScanState::Scanning;
        }
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().unwrap() = Some(cancel.clone());

        let controller = self.clone();
        tokio::spawn(async move {
            controller.run(filter, callback, cancel).await;
        });
    }

    /// Ends the running sequence, if any. The sequence's `on_complete`
    /// still fires with everything accumulated so far.
    pub(crate) fn stop(&self) {
        if let Some(cancel) = self.inner.cancel.lock().unwrap().take() {
            debug!("stopping scan");
            cancel.cancel();
        }
    }

    async fn run(&self, filter: ScanFilter, callback: ScanCallback, cancel: CancellationToken) {
        if let Some(handler) = &callback.on_start {
            handler();
        }
        info!(
            "scan started ({} ms per attempt, {} retries)",
            self.inner.config.scan_timeout_ms, self.inner.config.scan_retry_count
        );

        let attempt_timeout = Duration::from_millis(self.inner.config.scan_timeout_ms);
        let retry_interval = Duration::from_millis(self.inner.config.scan_retry_interval_ms);
        let total_attempts = self.inner.config.scan_retry_count + 1;

        let mut raw = Vec::new();
        let mut deduplicated = Vec::new();
        let mut seen = HashSet::new();

        'attempts: for attempt in 0..total_attempts {
            if cancel.is_cancelled() {
                break;
            }
            let (sink, mut sightings) = mpsc::unbounded_channel();
            let session = match self.inner.radio.start_discovery(sink).await {
                Ok(session) => session,
                Err(err) => {
                    error!("discovery attempt {} failed to start: {err}", attempt + 1);
                    self.finish();
                    if let Some(handler) = &callback.on_fail {
                        handler(&EngineError::ScanFailed(err.to_string()));
                    }
                    return;
                }
            };

            let deadline = sleep(attempt_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        session.stop();
                        break 'attempts;
                    }
                    _ = &mut deadline => {
                        session.stop();
                        break;
                    }
                    sighting = sightings.recv() => match sighting {
                        Some(adv) => {
                            self.record_sighting(
                                &adv, &filter, &callback,
                                &mut raw, &mut deduplicated, &mut seen,
                            );
                        }
                        None => {
                            // Platform ended the stream early; the attempt is over.
                            session.stop();
                            break;
                        }
                    }
                }
            }

            if attempt + 1 < total_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => break 'attempts,
                    _ = sleep(retry_interval) => {}
                }
            }
        }

        self.finish();
        info!(
            "scan complete: {} sightings, {} unique devices",
            raw.len(),
            deduplicated.len()
        );
        if let Some(handler) = &callback.on_complete {
            handler(ScanReport { raw, deduplicated });
        }
    }

    fn record_sighting(
        &self,
        adv: &Advertisement,
        filter: &ScanFilter,
        callback: &ScanCallback,
        raw: &mut Vec<DeviceIdentity>,
        deduplicated: &mut Vec<DeviceIdentity>,
        seen: &mut HashSet<String>,
    ) {
        let identity = DeviceIdentity::from_advertisement(adv);
        if self.inner.config.log_enabled {
            debug!("sighting: {identity}");
        }
        if let Some(handler) = &callback.on_sighting {
            handler(&identity);
        }
        raw.push(identity.clone());

        if filter.matches(adv) && seen.insert(identity.address().to_string()) {
            if let Some(handler) = &callback.on_dedup_sighting {
                handler(&identity);
            }
            deduplicated.push(identity);
        }
    }

    fn finish(&self) {
        *self.inner.state.lock().unwrap() = ScanState::Idle;
        self.inner.cancel.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(address: &str, name: Option<&str>, services: Vec<Uuid>) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-50),
            payload: None,
            service_uuids: services,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = ScanFilter::default();
        assert!(filter.matches(&adv("AA:BB:CC:DD:EE:01", None, vec![])));
    }

    #[test]
    fn name_filter_supports_exact_and_fuzzy() {
        let exact = ScanFilter {
            names: vec!["Thermo".into()],
            ..Default::default()
        };
        assert!(exact.matches(&adv("AA:BB:CC:DD:EE:01", Some("Thermo"), vec![])));
        assert!(!exact.matches(&adv("AA:BB:CC:DD:EE:01", Some("Thermo-2"), vec![])));
        assert!(!exact.matches(&adv("AA:BB:CC:DD:EE:01", None, vec![])));

        let fuzzy = ScanFilter {
            names: vec!["Thermo".into()],
            fuzzy_name: true,
            ..Default::default()
        };
        assert!(fuzzy.matches(&adv("AA:BB:CC:DD:EE:01", Some("Thermo-2"), vec![])));
    }

    #[test]
    fn address_filter_is_case_insensitive() {
        let filter = ScanFilter {
            addresses: vec!["aa:bb:cc:dd:ee:01".into()],
            ..Default::default()
        };
        assert!(filter.matches(&adv("AA:BB:CC:DD:EE:01", None, vec![])));
        assert!(!filter.matches(&adv("AA:BB:CC:DD:EE:02", None, vec![])));
    }

    #[test]
    fn service_filter_requires_any_advertised_match() {
        let wanted = Uuid::from_u128(0x180f);
        let filter = ScanFilter {
            service_uuids: vec![wanted],
            ..Default::default()
        };
        assert!(filter.matches(&adv("AA:BB:CC:DD:EE:01", None, vec![wanted])));
        assert!(!filter.matches(&adv("AA:BB:CC:DD:EE:01", None, vec![Uuid::from_u128(0x1800)])));
        assert!(!filter.matches(&adv("AA:BB:CC:DD:EE:01", None, vec![])));
    }
}
