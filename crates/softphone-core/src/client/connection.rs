//! Transport and registration control, including the reconnect driver

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::client::manager::SoftphoneEngine;
use crate::client::recovery::{with_timeout, ReconnectBackoff};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::EngineEvent;
use crate::presence::BlfState;
use crate::registration::{Connectivity, ConnectivityChange, RegistrationState, TransportState};

impl SoftphoneEngine {
    /// Mutate connectivity and publish the resulting changes under the lock
    pub(crate) fn update_connectivity<F>(&self, reason: Option<String>, apply: F) -> ConnectivityChange
    where
        F: FnOnce(&mut Connectivity) -> ConnectivityChange,
    {
        let mut connectivity = self.connectivity.lock();
        let change = apply(&mut connectivity);
        if let Some((previous, current)) = change.transport {
            info!(from = %previous, to = %current, "Transport state changed");
            self.events.emit(EngineEvent::TransportStateChanged { previous, current });
        }
        if let Some((previous, current)) = change.registration {
            info!(from = %previous, to = %current, reason = ?reason, "Registration state changed");
            self.events.emit(EngineEvent::RegistrationStateChanged {
                previous,
                current,
                reason,
            });
        }
        change
    }

    /// Establish the transport to the configured server.
    ///
    /// Does nothing when already connected. Clears a previous user
    /// [`disconnect`](Self::disconnect), so automatic reconnection is armed
    /// again.
    ///
    /// # Errors
    ///
    /// `Transport` when the server cannot be reached within the configured
    /// connect timeout.
    pub async fn connect(&self) -> SoftphoneResult<()> {
        {
            let mut connectivity = self.connectivity.lock();
            connectivity.user_disconnected = false;
            if connectivity.transport() == TransportState::Connected {
                return Ok(());
            }
        }
        self.update_connectivity(None, |c| c.set_transport(TransportState::Connecting));

        let server = &self.config.server;
        info!(server = %server.uri, "Connecting transport");
        let result = with_timeout("connect", server.connect_timeout(), async {
            self.transport
                .connect(server)
                .await
                .map_err(|e| SoftphoneError::Transport { reason: e.to_string() })
        })
        .await;

        match result {
            Ok(()) => {
                self.update_connectivity(None, |c| c.set_transport(TransportState::Connected));
                Ok(())
            }
            Err(e) => {
                self.update_connectivity(None, |c| c.set_transport(TransportState::Disconnected));
                let err = match e {
                    SoftphoneError::OperationTimeout { duration_ms, .. } => SoftphoneError::Transport {
                        reason: format!("connect timed out after {}ms", duration_ms),
                    },
                    other => other,
                };
                warn!(error = %err, "Transport connect failed");
                Err(err)
            }
        }
    }

    /// Register the configured account; the transport must be connected.
    ///
    /// The first success after being unregistered subscribes every monitored
    /// extension and starts the presence health monitor.
    ///
    /// # Errors
    ///
    /// - `InvalidState` while the transport is not connected
    /// - `Registration` when the registrar refuses or does not answer in time
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use softphone_core::{SoftphoneEngine, SoftphoneResult};
    /// # async fn demo(engine: SoftphoneEngine) -> SoftphoneResult<()> {
    /// engine.connect().await?;
    /// engine.register().await?;
    /// assert!(engine.is_registered());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn register(&self) -> SoftphoneResult<()> {
        {
            let connectivity = self.connectivity.lock();
            if !connectivity.can_register() {
                let err = SoftphoneError::invalid_state("register", connectivity.transport());
                warn!(error = %err, "Register refused");
                return Err(err);
            }
        }
        let was_registered = self.is_registered();
        self.update_connectivity(None, |c| c.set_registration(RegistrationState::Registering));

        let registration = &self.config.registration;
        info!(aor = %registration.aor, "Registering");
        let result = with_timeout("register", registration.timeout(), async {
            self.transport
                .register(registration)
                .await
                .map_err(|e| SoftphoneError::Registration { reason: e.to_string() })
        })
        .await;

        match result {
            Ok(()) => {
                let change =
                    self.update_connectivity(None, |c| c.set_registration(RegistrationState::Registered));
                if !self.is_registered() {
                    return Err(SoftphoneError::Transport {
                        reason: "transport lost during registration".to_string(),
                    });
                }
                if change.registration.is_some() && !was_registered {
                    self.on_became_registered();
                }
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    SoftphoneError::OperationTimeout { duration_ms, .. } => SoftphoneError::Registration {
                        reason: format!("no answer from registrar within {}ms", duration_ms),
                    },
                    other => other,
                };
                self.update_connectivity(Some(err.to_string()), |c| {
                    c.set_registration(RegistrationState::Failed)
                });
                self.deactivate_presence();
                warn!(error = %err, "Registration failed");
                Err(err)
            }
        }
    }

    /// Tear down the registration.
    ///
    /// `fast` skips graceful BLF unsubscribes and does not wait for the
    /// registrar; use it when the network is already gone.
    pub async fn unregister(&self, fast: bool) -> SoftphoneResult<()> {
        let handles = self.deactivate_presence();
        if !fast && !handles.is_empty() {
            let unsubscribes = handles.iter().map(|handle| self.transport.unsubscribe_dialog(handle));
            for result in join_all(unsubscribes).await {
                if let Err(e) = result {
                    warn!(error = %e, "BLF unsubscribe failed during unregister");
                }
            }
        }

        let result = if self.transport_state() == TransportState::Connected {
            self.transport.unregister(!fast).await
        } else {
            Ok(())
        };
        self.update_connectivity(Some("unregistered".to_string()), |c| {
            c.set_registration(RegistrationState::Unregistered)
        });

        match result {
            Ok(()) => Ok(()),
            Err(e) if fast => {
                warn!(error = %e, "Fast unregister failed; state cleared locally");
                Ok(())
            }
            Err(e) => Err(SoftphoneError::Registration { reason: e.to_string() }),
        }
    }

    /// Tear down the transport on the user's request; no reconnection follows
    pub async fn disconnect(&self) -> SoftphoneResult<()> {
        self.connectivity.lock().user_disconnected = true;
        self.abort_reconnect();

        if self.is_registered() {
            if let Err(e) = self.unregister(false).await {
                warn!(error = %e, "Unregister before disconnect failed");
            }
        }

        let result = self.transport.disconnect().await;
        self.update_connectivity(Some("disconnected".to_string()), |c| {
            c.set_transport(TransportState::Disconnected)
        });
        result.map_err(|e| SoftphoneError::Transport { reason: e.to_string() })
    }

    /// Host reports the network is gone: tear everything down immediately
    pub async fn notify_network_offline(&self) {
        self.connectivity.lock().network_online = false;
        self.abort_reconnect();
        info!("Network offline; tearing down registration");

        if let Err(e) = self.unregister(true).await {
            warn!(error = %e, "Fast unregister failed");
        }
        if self.transport_state() != TransportState::Disconnected {
            if let Err(e) = self.transport.disconnect().await {
                warn!(error = %e, "Transport disconnect failed while offline");
            }
        }
        self.update_connectivity(Some("network offline".to_string()), |c| {
            c.set_transport(TransportState::Disconnected)
        });
    }

    /// Host reports the network is back: one connect+register attempt,
    /// even after earlier reconnect attempts ran out
    pub async fn notify_network_online(&self) -> SoftphoneResult<()> {
        {
            let mut connectivity = self.connectivity.lock();
            connectivity.network_online = true;
            connectivity.user_disconnected = false;
        }
        self.abort_reconnect();
        info!("Network online; attempting reconnection");
        self.connect_and_register().await
    }

    async fn connect_and_register(&self) -> SoftphoneResult<()> {
        self.connect().await?;
        self.register().await
    }

    pub(crate) fn abort_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    /// A reconnect driver task is running
    pub fn is_reconnecting(&self) -> bool {
        self.reconnect_task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    fn start_reconnect(&self) {
        let mut slot = self.reconnect_task.lock();
        if slot.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }
        let engine = self.clone();
        *slot = Some(tokio::spawn(async move { engine.run_reconnect().await }));
    }

    async fn run_reconnect(self) {
        let mut backoff = ReconnectBackoff::new(self.config.reconnect.clone());
        while let Some(delay) = backoff.next_delay() {
            info!(
                attempt = backoff.attempts(),
                max_attempts = self.config.reconnect.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnection attempt"
            );
            tokio::time::sleep(delay).await;

            {
                let connectivity = self.connectivity.lock();
                if connectivity.user_disconnected || !connectivity.network_online {
                    return;
                }
            }
            match self.connect_and_register().await {
                Ok(()) => {
                    info!(attempt = backoff.attempts(), "Reconnected");
                    return;
                }
                Err(e) => warn!(attempt = backoff.attempts(), error = %e, "Reconnection attempt failed"),
            }
        }

        let attempts = backoff.attempts();
        let err = SoftphoneError::ReconnectExhausted { attempts };
        error!(attempts, "Reconnection abandoned");
        self.update_connectivity(Some(err.to_string()), |c| c.set_registration(RegistrationState::Failed));
        self.events.emit(EngineEvent::Error {
            error: err,
            session_id: None,
        });
    }

    pub(crate) fn on_transport_connected(&self) {
        self.update_connectivity(None, |c| c.set_transport(TransportState::Connected));
    }

    pub(crate) fn on_transport_disconnected(&self, reason: Option<String>) {
        let (change, reconnect) = {
            let change = self.update_connectivity(reason.clone(), |c| c.set_transport(TransportState::Disconnected));
            let connectivity = self.connectivity.lock();
            let reconnect = change.transport.is_some() && !connectivity.user_disconnected && connectivity.network_online;
            (change, reconnect)
        };
        if change.is_empty() {
            return;
        }
        warn!(reason = ?reason, "Transport lost");
        self.deactivate_presence();
        if reconnect {
            self.start_reconnect();
        }
    }

    /// Registrar confirmed (initial or refresh) outside an explicit `register`
    pub(crate) fn on_registered_event(&self) {
        let change = self.update_connectivity(None, |c| c.set_registration(RegistrationState::Registered));
        if change.registration.is_some() {
            self.on_became_registered();
        }
    }

    pub(crate) fn on_registration_failed(&self, reason: String) {
        let change = self.update_connectivity(Some(reason.clone()), |c| {
            c.set_registration(RegistrationState::Failed)
        });
        self.deactivate_presence();
        if change.registration.is_some() {
            warn!(reason = %reason, "Registration lost");
            self.events.emit(EngineEvent::Error {
                error: SoftphoneError::Registration { reason },
                session_id: None,
            });
        }
    }

    fn on_became_registered(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            let report = engine.reconcile_presence().await;
            if !report.failed.is_empty() {
                warn!(failed = ?report.failed, "Some BLF subscriptions failed after registration");
            }
        });
        self.start_presence_monitor();
    }

    /// Forget every subscription and set every lamp inactive; returns the
    /// handles that were live
    fn deactivate_presence(&self) -> Vec<crate::transport::SubscriptionHandle> {
        self.stop_presence_monitor();
        let (handles, changed) = self.presence.deactivate_all();
        for extension in changed {
            self.events.emit(EngineEvent::BlfStateChanged {
                extension,
                state: BlfState::Inactive,
            });
        }
        handles
    }
}
