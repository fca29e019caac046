//! Engine root: shared state and transport event dispatch
//!
//! Command methods live in sibling modules as further `impl SoftphoneEngine`
//! blocks: connection control in `connection.rs`, calls in `calls.rs`,
//! in-call controls in `controls.rs`, transfers in `transfer.rs` and BLF in
//! `presence.rs`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::call::{CallSession, SessionId};
use crate::client::config::EngineConfig;
use crate::client::types::EngineStats;
use crate::events::{EventBus, EventFilter, EventSubscription, SubscriptionKey};
use crate::lines::{Line, LineNumber};
use crate::presence::{BlfState, PresenceBook};
use crate::registration::{Connectivity, RegistrationState, TransportState};
use crate::registry::{SessionRegistry, SharedRegistry};
use crate::transfer::TransferOperation;
use crate::transport::{SignalingTransport, TransportEvent};

/// Call-session and presence engine for one agent
///
/// Cheap to clone; clones share all state. Build one with
/// [`EngineBuilder`](crate::EngineBuilder).
#[derive(Clone)]
pub struct SoftphoneEngine {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) transport: Arc<dyn SignalingTransport>,
    pub(crate) registry: SharedRegistry,
    pub(crate) connectivity: Arc<Mutex<Connectivity>>,
    pub(crate) presence: Arc<PresenceBook>,
    pub(crate) events: EventBus,
    pub(crate) reconnect_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    pub(crate) presence_monitor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SoftphoneEngine {
    pub(crate) fn new(config: EngineConfig, transport: Arc<dyn SignalingTransport>) -> Self {
        let events = EventBus::new();
        let presence = PresenceBook::new();
        presence.set_desired(config.presence.monitored_extensions.iter().cloned());

        info!(
            server = %config.server.uri,
            aor = %config.registration.aor,
            monitored = config.presence.monitored_extensions.len(),
            "Softphone engine created"
        );

        Self {
            config: Arc::new(config),
            transport,
            registry: Arc::new(Mutex::new(SessionRegistry::new(events.clone()))),
            connectivity: Arc::new(Mutex::new(Connectivity::new())),
            presence: Arc::new(presence),
            events,
            reconnect_task: Arc::new(Mutex::new(None)),
            presence_monitor: Arc::new(Mutex::new(None)),
        }
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a new event channel receiving every event that passes `filter`
    pub fn subscribe_events(&self, filter: EventFilter) -> EventSubscription {
        self.events.subscribe(filter)
    }

    /// Close a subscription opened by [`subscribe_events`](Self::subscribe_events).
    /// Returns false when the key was unknown.
    pub fn unsubscribe_events(&self, key: SubscriptionKey) -> bool {
        self.events.unsubscribe(key)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn transport_state(&self) -> TransportState {
        self.connectivity.lock().transport()
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.connectivity.lock().registration()
    }

    /// Shorthand for `registration_state().is_registered()`
    pub fn is_registered(&self) -> bool {
        self.registration_state().is_registered()
    }

    /// Snapshot of one session; later changes are not reflected
    pub fn get_session(&self, id: SessionId) -> Option<CallSession> {
        self.registry.lock().get(id)
    }

    /// Every live session ordered by id
    pub fn sessions(&self) -> Vec<CallSession> {
        self.registry.lock().sessions()
    }

    /// The three lines in order
    pub fn lines(&self) -> Vec<Line> {
        self.registry.lock().lines().lines().to_vec()
    }

    pub fn selected_line(&self) -> LineNumber {
        self.registry.lock().lines().selected()
    }

    /// Session on the foreground line, if any
    pub fn selected_session(&self) -> Option<SessionId> {
        self.registry.lock().lines().selected_session()
    }

    /// Sessions waiting for a free line, oldest first
    pub fn waiting_sessions(&self) -> Vec<SessionId> {
        self.registry.lock().unassigned()
    }

    /// In-flight transfer touching `session`
    pub fn transfer_for(&self, session: SessionId) -> Option<TransferOperation> {
        self.registry.lock().transfer_for(session)
    }

    /// Current lamp of a tracked extension
    pub fn blf_state(&self, extension: &str) -> Option<BlfState> {
        self.presence.state(extension)
    }

    /// Lamp state of every tracked extension, sorted by extension
    pub fn blf_states(&self) -> Vec<(String, BlfState)> {
        self.presence.snapshot()
    }

    /// Extensions the engine wants to monitor, whether or not subscribed yet
    pub fn monitored_extensions(&self) -> Vec<String> {
        self.presence.desired()
    }

    pub fn stats(&self) -> EngineStats {
        let (transport, registration) = {
            let connectivity = self.connectivity.lock();
            (connectivity.transport(), connectivity.registration())
        };
        let registry = self.registry.lock();
        let counters = registry.counters();
        EngineStats {
            transport,
            registration,
            total_calls: counters.total,
            answered_calls: counters.answered,
            inbound_calls: counters.inbound,
            outbound_calls: counters.outbound,
            active_calls: registry.sessions().len(),
            waiting_calls: registry.unassigned().len(),
            occupied_lines: registry.lines().occupied_count(),
            selected_line: registry.lines().selected(),
            transfers_in_flight: registry.transfer_count(),
            monitored_extensions: self.presence.desired().len(),
            active_subscriptions: self.presence.active_count(),
        }
    }

    /// Apply one event reported by the transport capability
    pub fn handle_transport_event(&self, event: TransportEvent) {
        debug!(?event, "Transport event");
        match event {
            TransportEvent::TransportConnected => self.on_transport_connected(),
            TransportEvent::TransportDisconnected { reason } => self.on_transport_disconnected(reason),
            TransportEvent::Registered => self.on_registered_event(),
            TransportEvent::RegistrationFailed { reason } => self.on_registration_failed(reason),
            TransportEvent::IncomingInvite(invite) => {
                self.accept_inbound(invite);
            }
            TransportEvent::SessionProgress { handle, code } => self.on_session_progress(&handle, code),
            TransportEvent::SessionEstablished { handle } => self.on_session_established(&handle),
            TransportEvent::SessionTerminated { handle, code, reason } => {
                self.on_session_terminated(&handle, code, reason)
            }
            TransportEvent::Notify {
                subscription,
                state,
                remote_held,
            } => self.on_blf_notify(&subscription, state, remote_held),
            TransportEvent::SubscriptionTerminated { subscription, reason } => {
                self.on_subscription_terminated(&subscription, reason)
            }
        }
    }

    /// Feed transport events from `events` into the engine until the sender
    /// side is dropped
    pub fn spawn_event_loop(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.handle_transport_event(event);
            }
            debug!("Transport event stream closed");
        })
    }

    /// Stop background tasks. Sessions and presence state are left as they are.
    pub fn shutdown(&self) {
        self.abort_reconnect();
        self.stop_presence_monitor();
        info!("Softphone engine background tasks stopped");
    }
}

impl std::fmt::Debug for SoftphoneEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftphoneEngine")
            .field("server", &self.config.server.uri)
            .field("transport", &self.transport_state())
            .field("registration", &self.registration_state())
            .finish()
    }
}
