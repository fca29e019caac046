//! Busy-lamp-field (BLF) presence bookkeeping
//!
//! [`PresenceBook`] tracks one [`PresenceSubscription`] per monitored
//! extension plus the desired extension set. It is pure state: the engine
//! performs the network side (subscribe, unsubscribe, refresh) and feeds the
//! results back in. Methods that change a lamp return the new state so the
//! caller can publish it.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::transport::{DialogState, SubscriptionHandle};

/// Presence shown for a monitored extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlfState {
    Idle,
    Ringing,
    Busy,
    Hold,
    /// Not registered; no subscription exists
    Inactive,
    /// Subscription failed or was terminated by the server
    Offline,
}

impl BlfState {
    /// Map a dialog-info NOTIFY to a lamp state
    pub fn from_dialog(state: DialogState, remote_held: bool) -> Self {
        match state {
            DialogState::Terminated => BlfState::Idle,
            DialogState::Trying | DialogState::Proceeding | DialogState::Early => BlfState::Ringing,
            DialogState::Confirmed if remote_held => BlfState::Hold,
            DialogState::Confirmed => BlfState::Busy,
        }
    }
}

impl fmt::Display for BlfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlfState::Idle => "idle",
            BlfState::Ringing => "ringing",
            BlfState::Busy => "busy",
            BlfState::Hold => "hold",
            BlfState::Inactive => "inactive",
            BlfState::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// BLF subscription settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Expiry requested for each dialog subscription
    pub subscription_expires_secs: u64,
    /// Refresh this long before expiry
    pub refresh_margin_secs: u64,
    /// Interval at which the server is expected to re-NOTIFY
    pub expected_notify_interval_secs: u64,
    /// A subscription is stale after this many silent notify intervals
    pub stale_multiplier: u32,
    pub health_check_interval_secs: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    /// Extensions monitored from startup
    pub monitored_extensions: Vec<String>,
}

impl PresenceConfig {
    pub fn subscription_expires(&self) -> Duration {
        Duration::from_secs(self.subscription_expires_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.expected_notify_interval_secs) * self.stale_multiplier
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            subscription_expires_secs: 600,
            refresh_margin_secs: 60,
            expected_notify_interval_secs: 300,
            stale_multiplier: 3,
            health_check_interval_secs: 30,
            batch_size: 10,
            batch_delay_ms: 500,
            monitored_extensions: Vec::new(),
        }
    }
}

/// Why the health sweep wants a subscription renewed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    NearExpiry,
    Stale,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSubscription {
    pub extension: String,
    /// `None` until the subscribe request succeeds
    pub handle: Option<SubscriptionHandle>,
    pub state: BlfState,
    pub subscribed_at: Option<Instant>,
    pub expires_at: Option<Instant>,
    pub last_notify: Option<Instant>,
    /// Consecutive failed subscribe attempts
    pub failures: u32,
}

impl PresenceSubscription {
    fn pending(extension: &str) -> Self {
        Self {
            extension: extension.to_string(),
            handle: None,
            state: BlfState::Inactive,
            subscribed_at: None,
            expires_at: None,
            last_notify: None,
            failures: 0,
        }
    }

    pub fn refresh_reason(&self, now: Instant, config: &PresenceConfig) -> Option<RefreshReason> {
        if self.handle.is_none() || self.state == BlfState::Offline {
            return Some(RefreshReason::Failed);
        }
        if let Some(expires_at) = self.expires_at {
            if now + config.refresh_margin() >= expires_at {
                return Some(RefreshReason::NearExpiry);
            }
        }
        let heard_from = self.last_notify.or(self.subscribed_at)?;
        if now.duration_since(heard_from) > config.stale_after() {
            return Some(RefreshReason::Stale);
        }
        None
    }
}

/// Difference between the desired extension set and current subscriptions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub to_subscribe: Vec<String>,
    pub to_unsubscribe: Vec<String>,
}

/// Result of recording a successful subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    /// New lamp state, when it changed
    pub changed: Option<BlfState>,
    /// Handle the new subscription superseded; the caller releases it
    pub replaced: Option<SubscriptionHandle>,
}

/// Subscription table keyed by extension with a reverse index by handle
#[derive(Debug, Default)]
pub struct PresenceBook {
    subscriptions: DashMap<String, PresenceSubscription>,
    by_handle: DashMap<SubscriptionHandle, String>,
    desired: RwLock<BTreeSet<String>>,
}

impl PresenceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the desired set; returns what must change to match it
    pub fn set_desired<I, S>(&self, extensions: I) -> Reconciliation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let desired: BTreeSet<String> = extensions
            .into_iter()
            .map(Into::into)
            .map(|e: String| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        *self.desired.write() = desired;
        self.reconcile()
    }

    pub fn add_desired(&self, extension: &str) -> bool {
        self.desired.write().insert(extension.to_string())
    }

    pub fn remove_desired(&self, extension: &str) -> bool {
        self.desired.write().remove(extension)
    }

    pub fn desired(&self) -> Vec<String> {
        self.desired.read().iter().cloned().collect()
    }

    pub fn is_desired(&self, extension: &str) -> bool {
        self.desired.read().contains(extension)
    }

    /// Compare the desired set against live (handle-bearing) subscriptions
    pub fn reconcile(&self) -> Reconciliation {
        let desired = self.desired.read();
        let to_subscribe = desired
            .iter()
            .filter(|ext| {
                self.subscriptions
                    .get(ext.as_str())
                    .map_or(true, |sub| sub.handle.is_none())
            })
            .cloned()
            .collect();
        let mut to_unsubscribe: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| !desired.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        to_unsubscribe.sort();
        Reconciliation {
            to_subscribe,
            to_unsubscribe,
        }
    }

    /// Ensure an entry exists for `extension` before subscribing
    pub fn track(&self, extension: &str) {
        self.subscriptions
            .entry(extension.to_string())
            .or_insert_with(|| PresenceSubscription::pending(extension));
    }

    /// Record a successful subscribe. The new handle replaces any previous
    /// one and the lamp shows `Idle` until the first NOTIFY arrives.
    ///
    /// Returns `None` and records nothing when the extension stopped being
    /// monitored while the request was in flight. The caller owns the handle
    /// then and must release it.
    pub fn record_subscribed(
        &self,
        extension: &str,
        handle: SubscriptionHandle,
        expires: Duration,
        now: Instant,
    ) -> Option<Recorded> {
        let desired = self.desired.read();
        if !desired.contains(extension) {
            return None;
        }
        let mut entry = self.subscriptions.get_mut(extension)?;
        let replaced = entry.handle.replace(handle.clone());
        if let Some(old) = &replaced {
            self.by_handle.remove(old);
        }
        entry.subscribed_at = Some(now);
        entry.expires_at = Some(now + expires);
        entry.failures = 0;
        let changed = matches!(entry.state, BlfState::Inactive | BlfState::Offline).then(|| {
            entry.state = BlfState::Idle;
            BlfState::Idle
        });
        drop(entry);
        self.by_handle.insert(handle, extension.to_string());
        Some(Recorded { changed, replaced })
    }

    /// Record a failed subscribe; the lamp goes `Offline`. Untracked
    /// extensions are left alone.
    pub fn record_failure(&self, extension: &str) -> Option<BlfState> {
        let mut entry = self.subscriptions.get_mut(extension)?;
        entry.failures += 1;
        if let Some(old) = entry.handle.take() {
            self.by_handle.remove(&old);
        }
        (entry.state != BlfState::Offline).then(|| {
            entry.state = BlfState::Offline;
            BlfState::Offline
        })
    }

    /// Apply a NOTIFY; returns the extension and its new state only when the
    /// lamp changed.
    pub fn apply_notify(
        &self,
        handle: &SubscriptionHandle,
        dialog: DialogState,
        remote_held: bool,
        now: Instant,
    ) -> Option<(String, BlfState)> {
        let extension = self.by_handle.get(handle)?.value().clone();
        let mut entry = self.subscriptions.get_mut(&extension)?;
        entry.last_notify = Some(now);
        let next = BlfState::from_dialog(dialog, remote_held);
        if entry.state == next {
            return None;
        }
        entry.state = next;
        Some((extension, next))
    }

    /// Server ended the subscription; the lamp goes `Offline` until the
    /// health sweep renews it.
    pub fn terminate(&self, handle: &SubscriptionHandle) -> Option<(String, Option<BlfState>)> {
        let (_, extension) = self.by_handle.remove(handle)?;
        let mut entry = self.subscriptions.get_mut(&extension)?;
        entry.handle = None;
        let changed = (entry.state != BlfState::Offline).then(|| {
            entry.state = BlfState::Offline;
            BlfState::Offline
        });
        Some((extension.clone(), changed))
    }

    /// Drop an extension's subscription entirely
    pub fn remove(&self, extension: &str) -> Option<PresenceSubscription> {
        let (_, sub) = self.subscriptions.remove(extension)?;
        if let Some(handle) = &sub.handle {
            self.by_handle.remove(handle);
        }
        Some(sub)
    }

    /// Forget every handle and set every lamp `Inactive`.
    ///
    /// Returns the handles that were live (for graceful unsubscribe) and the
    /// extensions whose lamp changed.
    pub fn deactivate_all(&self) -> (Vec<SubscriptionHandle>, Vec<String>) {
        let mut handles = Vec::new();
        let mut changed = Vec::new();
        for mut entry in self.subscriptions.iter_mut() {
            if let Some(handle) = entry.handle.take() {
                handles.push(handle);
            }
            entry.subscribed_at = None;
            entry.expires_at = None;
            entry.last_notify = None;
            if entry.state != BlfState::Inactive {
                entry.state = BlfState::Inactive;
                changed.push(entry.extension.clone());
            }
        }
        self.by_handle.clear();
        changed.sort();
        (handles, changed)
    }

    /// Extensions the health sweep should renew, with the reason
    pub fn due_for_refresh(&self, now: Instant, config: &PresenceConfig) -> Vec<(String, RefreshReason)> {
        let desired = self.desired.read();
        let mut due: Vec<(String, RefreshReason)> = self
            .subscriptions
            .iter()
            .filter(|entry| desired.contains(entry.key()))
            .filter_map(|entry| {
                entry
                    .refresh_reason(now, config)
                    .map(|reason| (entry.key().clone(), reason))
            })
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));
        due
    }

    pub fn handle_of(&self, extension: &str) -> Option<SubscriptionHandle> {
        self.subscriptions.get(extension)?.handle.clone()
    }

    pub fn state(&self, extension: &str) -> Option<BlfState> {
        self.subscriptions.get(extension).map(|sub| sub.state)
    }

    pub fn get(&self, extension: &str) -> Option<PresenceSubscription> {
        self.subscriptions.get(extension).map(|sub| sub.clone())
    }

    /// Current lamp per tracked extension, sorted by extension
    pub fn snapshot(&self) -> Vec<(String, BlfState)> {
        let mut lamps: Vec<_> = self
            .subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.state))
            .collect();
        lamps.sort_by(|a, b| a.0.cmp(&b.0));
        lamps
    }

    pub fn active_count(&self) -> usize {
        self.by_handle.len()
    }
}
