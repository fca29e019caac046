//! BLF presence commands, NOTIFY handling and the subscription health monitor

use std::collections::BTreeSet;

use futures::future::join_all;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::manager::SoftphoneEngine;
use crate::client::types::BlfBatchReport;
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::EngineEvent;
use crate::presence::BlfState;
use crate::transport::{DialogState, SubscriptionHandle};

impl SoftphoneEngine {
    /// Replace the set of monitored extensions.
    ///
    /// While unregistered the set is only stored and every extension is
    /// reported as deferred. Otherwise extensions no longer wanted are
    /// unsubscribed and new ones are subscribed in batches.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use softphone_core::{SoftphoneEngine, SoftphoneResult};
    /// # async fn demo(engine: SoftphoneEngine) -> SoftphoneResult<()> {
    /// let report = engine.set_monitored_extensions(["200", "201", "202"]).await?;
    /// for extension in &report.failed {
    ///     eprintln!("BLF for {extension} will be retried by the health sweep");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn set_monitored_extensions<I, S>(&self, extensions: I) -> SoftphoneResult<BlfBatchReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let plan = self.presence.set_desired(extensions);
        let registered = self.is_registered();
        info!(
            monitored = self.presence.desired().len(),
            added = plan.to_subscribe.len(),
            removed = plan.to_unsubscribe.len(),
            registered,
            "Monitored extensions updated"
        );

        for extension in &plan.to_unsubscribe {
            self.release_subscription(extension, registered).await;
        }
        if !registered {
            return Ok(BlfBatchReport {
                deferred: self.presence.desired(),
                ..Default::default()
            });
        }
        Ok(self
            .subscribe_batches(plan.to_subscribe, self.config.presence.batch_size)
            .await)
    }

    /// Monitor one more extension.
    ///
    /// While unregistered the extension is only remembered; it is subscribed
    /// after the next successful registration.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty extension
    /// - `SubscriptionFailed` when the SUBSCRIBE is refused, or when the
    ///   extension stopped being monitored before it completed
    pub async fn subscribe_blf(&self, extension: &str) -> SoftphoneResult<()> {
        let extension = validate_extension(extension)?;
        self.presence.add_desired(extension);
        if !self.is_registered() {
            debug!(extension, "Not registered; BLF subscription deferred");
            return Ok(());
        }
        self.subscribe_one(extension).await
    }

    /// Stop monitoring an extension; its lamp goes inactive
    pub async fn unsubscribe_blf(&self, extension: &str) -> SoftphoneResult<()> {
        let extension = validate_extension(extension)?;
        self.presence.remove_desired(extension);
        let registered = self.is_registered();
        self.release_subscription(extension, registered).await;
        Ok(())
    }

    /// Subscribe to `extensions` in groups of `batch_size`.
    ///
    /// Each group is issued concurrently; groups are separated by the
    /// configured batch delay. Failures are reported per extension and leave
    /// the lamp offline for the health sweep to retry.
    pub async fn batch_subscribe_blf<I, S>(&self, extensions: I, batch_size: usize) -> SoftphoneResult<BlfBatchReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if batch_size == 0 {
            return Err(SoftphoneError::invalid_argument("batch_size", "must be at least 1"));
        }
        let mut seen = BTreeSet::new();
        let extensions: Vec<String> = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().to_string())
            .filter(|e| !e.is_empty() && seen.insert(e.clone()))
            .collect();
        for extension in &extensions {
            self.presence.add_desired(extension);
        }

        if !self.is_registered() {
            debug!(count = extensions.len(), "Not registered; BLF batch deferred");
            return Ok(BlfBatchReport {
                deferred: extensions,
                ..Default::default()
            });
        }
        Ok(self.subscribe_batches(extensions, batch_size).await)
    }

    async fn subscribe_batches(&self, extensions: Vec<String>, batch_size: usize) -> BlfBatchReport {
        let mut report = BlfBatchReport::default();
        let batch_count = extensions.chunks(batch_size.max(1)).count();

        for (index, batch) in extensions.chunks(batch_size.max(1)).enumerate() {
            if !self.is_registered() {
                report.deferred.extend(batch.iter().cloned());
                continue;
            }
            debug!(batch = index + 1, of = batch_count, size = batch.len(), "Subscribing BLF batch");
            let results = join_all(batch.iter().map(|extension| self.subscribe_one(extension))).await;
            for (extension, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => report.subscribed.push(extension.clone()),
                    Err(_) => report.failed.push(extension.clone()),
                }
            }
            if index + 1 < batch_count {
                tokio::time::sleep(self.config.presence.batch_delay()).await;
            }
        }

        info!(
            subscribed = report.subscribed.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "BLF batch finished"
        );
        report
    }

    /// Subscribe (or renew) one extension. A renewal swaps in the new handle
    /// before the old one is released.
    async fn subscribe_one(&self, extension: &str) -> SoftphoneResult<()> {
        self.presence.track(extension);
        let expires = self.config.presence.subscription_expires();

        match self.transport.subscribe_dialog(extension, expires).await {
            Ok(handle) => {
                if !self.is_registered() {
                    // Registration dropped while the SUBSCRIBE was in flight
                    if let Err(e) = self.transport.unsubscribe_dialog(&handle).await {
                        debug!(extension, error = %e, "Releasing late subscription failed");
                    }
                    return Err(SoftphoneError::SubscriptionFailed {
                        extension: extension.to_string(),
                        reason: "registration lost".to_string(),
                    });
                }

                let Some(recorded) = self
                    .presence
                    .record_subscribed(extension, handle.clone(), expires, Instant::now())
                else {
                    // Monitoring stopped while the SUBSCRIBE was in flight; the
                    // removal already released any earlier handle
                    debug!(extension, subscription = %handle, "Releasing subscription for dropped extension");
                    if let Err(e) = self.transport.unsubscribe_dialog(&handle).await {
                        debug!(extension, error = %e, "Releasing late subscription failed");
                    }
                    return Err(SoftphoneError::SubscriptionFailed {
                        extension: extension.to_string(),
                        reason: "no longer monitored".to_string(),
                    });
                };
                debug!(extension, subscription = %handle, "BLF subscribed");
                if let Some(state) = recorded.changed {
                    self.emit_blf(extension, state);
                }
                if let Some(old) = recorded.replaced.filter(|old| *old != handle) {
                    if let Err(e) = self.transport.unsubscribe_dialog(&old).await {
                        debug!(extension, subscription = %old, error = %e, "Releasing replaced subscription failed");
                    }
                }
                Ok(())
            }
            Err(e) => {
                let err = SoftphoneError::SubscriptionFailed {
                    extension: extension.to_string(),
                    reason: e.to_string(),
                };
                warn!(extension, error = %e, "BLF subscription failed");
                if let Some(state) = self.presence.record_failure(extension) {
                    self.emit_blf(extension, state);
                }
                self.events.emit(EngineEvent::Error {
                    error: err.clone(),
                    session_id: None,
                });
                Err(err)
            }
        }
    }

    /// Forget an extension and unsubscribe its live handle, if any
    async fn release_subscription(&self, extension: &str, registered: bool) {
        let Some(subscription) = self.presence.remove(extension) else {
            return;
        };
        if let Some(handle) = subscription.handle.filter(|_| registered) {
            if let Err(e) = self.transport.unsubscribe_dialog(&handle).await {
                warn!(extension, subscription = %handle, error = %e, "BLF unsubscribe failed");
            }
        }
        if subscription.state != BlfState::Inactive {
            self.emit_blf(extension, BlfState::Inactive);
        }
        debug!(extension, "BLF monitoring stopped");
    }

    /// Subscribe whatever the desired set is missing. Runs after every
    /// (re)registration.
    pub(crate) async fn reconcile_presence(&self) -> BlfBatchReport {
        if !self.is_registered() {
            return BlfBatchReport::default();
        }
        let plan = self.presence.reconcile();
        for extension in &plan.to_unsubscribe {
            self.release_subscription(extension, true).await;
        }
        if plan.to_subscribe.is_empty() {
            return BlfBatchReport::default();
        }
        self.subscribe_batches(plan.to_subscribe, self.config.presence.batch_size)
            .await
    }

    pub(crate) fn on_blf_notify(&self, subscription: &SubscriptionHandle, state: DialogState, remote_held: bool) {
        match self
            .presence
            .apply_notify(subscription, state, remote_held, Instant::now())
        {
            Some((extension, lamp)) => {
                debug!(extension = %extension, dialog = ?state, lamp = %lamp, "BLF changed");
                self.emit_blf(&extension, lamp);
            }
            None => debug!(%subscription, dialog = ?state, "NOTIFY without lamp change"),
        }
    }

    pub(crate) fn on_subscription_terminated(&self, subscription: &SubscriptionHandle, reason: Option<String>) {
        let Some((extension, changed)) = self.presence.terminate(subscription) else {
            debug!(%subscription, "Termination for unknown subscription");
            return;
        };
        warn!(extension = %extension, reason = ?reason, "BLF subscription terminated by server");
        if let Some(state) = changed {
            self.emit_blf(&extension, state);
        }
    }

    /// Renew every monitored subscription that is near expiry, stale or
    /// failed. Returns the extensions renewed successfully.
    pub async fn health_sweep(&self) -> Vec<String> {
        if !self.is_registered() {
            return Vec::new();
        }
        let due = self
            .presence
            .due_for_refresh(Instant::now(), &self.config.presence);
        if due.is_empty() {
            return Vec::new();
        }
        for (extension, reason) in &due {
            debug!(extension = %extension, ?reason, "BLF subscription due for renewal");
        }
        let extensions = due.into_iter().map(|(extension, _)| extension).collect();
        self.subscribe_batches(extensions, self.config.presence.batch_size)
            .await
            .subscribed
    }

    pub(crate) fn start_presence_monitor(&self) {
        let mut slot = self.presence_monitor.lock();
        if slot.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }
        let engine = self.clone();
        let period = self.config.presence.health_check_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !engine.is_registered() {
                    break;
                }
                let renewed = engine.health_sweep().await;
                if !renewed.is_empty() {
                    info!(renewed = ?renewed, "BLF subscriptions renewed");
                }
            }
            debug!("Presence monitor stopped");
        }));
    }

    pub(crate) fn stop_presence_monitor(&self) {
        if let Some(task) = self.presence_monitor.lock().take() {
            task.abort();
        }
    }

    fn emit_blf(&self, extension: &str, state: BlfState) {
        self.events.emit(EngineEvent::BlfStateChanged {
            extension: extension.to_string(),
            state,
        });
    }
}

fn validate_extension(extension: &str) -> SoftphoneResult<&str> {
    let extension = extension.trim();
    if extension.is_empty() {
        return Err(SoftphoneError::invalid_argument("extension", "must not be empty"));
    }
    Ok(extension)
}
