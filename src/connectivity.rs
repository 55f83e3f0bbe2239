//! Connectivity monitoring.
//!
//! The monitor is an explicit state machine over an injected probe and an
//! injected clock, so tests drive online/offline transitions and time
//! without real timers or network events. The production probe is a
//! lightweight HEAD request against the remote authority's health endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

// ---------------------------------------------------------------------------
// Injected clock
// ---------------------------------------------------------------------------

/// Time source for the engine. Production uses [`SystemClock`]; tests use a
/// manually advanced clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Injected probe
// ---------------------------------------------------------------------------

/// Source of truth for "can we reach the remote authority right now".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check_online(&self) -> bool;
}

/// Production probe: HEAD request to the remote health endpoint with a
/// short timeout. Any error counts as offline.
pub struct HttpProbe {
    health_url: String,
    api_key: String,
    client: reqwest::Client,
}

/// Timeout used for the lightweight connectivity probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

impl HttpProbe {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, crate::error::NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| crate::error::NetworkError::Client(e.to_string()))?;
        Ok(Self {
            health_url: format!("{base_url}/api/health"),
            api_key: api_key.to_string(),
            client,
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check_online(&self) -> bool {
        match self
            .client
            .head(&self.health_url)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Boolean online/offline signal with change notifications.
///
/// Whoever owns the probe (the drain loop, or a test) pushes observations
/// in via [`ConnectivityMonitor::set_online`]; consumers read the current
/// state or subscribe to transitions.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    notify: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (notify, _) = watch::channel(initially_online);
        Self {
            online: AtomicBool::new(initially_online),
            notify,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record an observation. Returns `true` when this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }
        if online {
            info!("Network restored; resuming queued sync");
        } else {
            info!("Network offline; deferring remote sync and keeping queue pending");
        }
        let _ = self.notify.send(online);
        true
    }

    /// Subscribe to online/offline transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_online_reports_transitions_only() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(!monitor.is_online());

        assert!(monitor.set_online(true), "offline -> online is a transition");
        assert!(monitor.is_online());
        assert!(!monitor.set_online(true), "online -> online is not");
        assert!(monitor.set_online(false), "online -> offline is");
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();

        monitor.set_online(true);
        rx.changed().await.expect("sender alive");
        assert!(*rx.borrow());

        monitor.set_online(false);
        rx.changed().await.expect("sender alive");
        assert!(!*rx.borrow());
    }

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
