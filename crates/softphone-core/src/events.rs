//! Event bus for engine notifications
//!
//! Every mutation of the engine is published as an [`EngineEvent`]. Consumers
//! call [`EventBus::subscribe`] to get their own typed channel and drop it (or
//! call [`EventBus::unsubscribe`] with its key) when done. Emission never
//! blocks: each subscriber owns an unbounded queue, so a slow consumer only
//! delays itself.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::call::{CallOutcome, CallRecord, CallSession, CallState, SessionId};
use crate::error::SoftphoneError;
use crate::lines::LineNumber;
use crate::presence::BlfState;
use crate::registration::{RegistrationState, TransportState};
use crate::transfer::TransferOperation;

/// Event priority levels for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventPriority {
    /// Presence updates, routine progress
    Low,
    /// State changes, DTMF
    Normal,
    /// Incoming calls, registration changes
    High,
    /// Failures needing operator attention
    Critical,
}

/// Notifications published by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    SessionCreated {
        session: CallSession,
    },
    SessionStateChanged {
        session_id: SessionId,
        previous: CallState,
        current: CallState,
        line: Option<LineNumber>,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A non-state attribute changed (mute, recording, line binding)
    SessionUpdated {
        session: CallSession,
    },
    SessionTerminated {
        session_id: SessionId,
        outcome: CallOutcome,
        duration: Duration,
        reason: Option<String>,
    },
    CallRecorded {
        record: CallRecord,
    },
    LineSelected {
        line: LineNumber,
        session_id: Option<SessionId>,
    },
    /// A waiting session was bound to a freed line
    LineAssigned {
        line: LineNumber,
        session_id: SessionId,
    },
    RegistrationStateChanged {
        previous: RegistrationState,
        current: RegistrationState,
        reason: Option<String>,
    },
    TransportStateChanged {
        previous: TransportState,
        current: TransportState,
    },
    BlfStateChanged {
        extension: String,
        state: BlfState,
    },
    TransferInitiated {
        transfer: TransferOperation,
    },
    TransferProgress {
        transfer: TransferOperation,
    },
    TransferCompleted {
        transfer: TransferOperation,
    },
    TransferCancelled {
        transfer: TransferOperation,
    },
    TransferRejected {
        transfer: TransferOperation,
        reason: String,
    },
    DtmfSent {
        session_id: SessionId,
        digits: String,
    },
    Error {
        error: SoftphoneError,
        session_id: Option<SessionId>,
    },
}

impl EngineEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            EngineEvent::BlfStateChanged { .. } | EngineEvent::TransferProgress { .. } => EventPriority::Low,
            EngineEvent::SessionCreated { .. }
            | EngineEvent::RegistrationStateChanged { .. }
            | EngineEvent::TransportStateChanged { .. }
            | EngineEvent::TransferRejected { .. } => EventPriority::High,
            EngineEvent::Error { error, .. } => {
                if error.is_recoverable() {
                    EventPriority::High
                } else {
                    EventPriority::Critical
                }
            }
            _ => EventPriority::Normal,
        }
    }

    /// Session this event is about, if any
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            EngineEvent::SessionCreated { session } | EngineEvent::SessionUpdated { session } => Some(session.id),
            EngineEvent::SessionStateChanged { session_id, .. }
            | EngineEvent::SessionTerminated { session_id, .. }
            | EngineEvent::LineAssigned { session_id, .. }
            | EngineEvent::DtmfSent { session_id, .. } => Some(*session_id),
            EngineEvent::CallRecorded { record } => Some(record.session_id),
            EngineEvent::LineSelected { session_id, .. } | EngineEvent::Error { session_id, .. } => *session_id,
            EngineEvent::TransferInitiated { transfer }
            | EngineEvent::TransferProgress { transfer }
            | EngineEvent::TransferCompleted { transfer }
            | EngineEvent::TransferCancelled { transfer }
            | EngineEvent::TransferRejected { transfer, .. } => Some(transfer.source),
            _ => None,
        }
    }

    /// Check if this event passes the given filter
    pub fn passes_filter(&self, filter: &EventFilter) -> bool {
        if let Some(min_priority) = filter.min_priority {
            if self.priority() < min_priority {
                return false;
            }
        }

        if let Some(session_ids) = &filter.session_ids {
            let consultation = match self {
                EngineEvent::TransferInitiated { transfer }
                | EngineEvent::TransferProgress { transfer }
                | EngineEvent::TransferCompleted { transfer }
                | EngineEvent::TransferCancelled { transfer }
                | EngineEvent::TransferRejected { transfer, .. } => transfer.consultation,
                _ => None,
            };
            let matches = self
                .session_id()
                .into_iter()
                .chain(consultation)
                .any(|id| session_ids.contains(&id));
            if !matches {
                return false;
            }
        }

        true
    }
}

/// Event filtering options for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only receive events for specific sessions
    pub session_ids: Option<HashSet<SessionId>>,
    /// Minimum event priority level
    pub min_priority: Option<EventPriority>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn session(session_id: SessionId) -> Self {
        Self {
            session_ids: Some(HashSet::from([session_id])),
            ..Default::default()
        }
    }

    pub fn min_priority(priority: EventPriority) -> Self {
        Self {
            min_priority: Some(priority),
            ..Default::default()
        }
    }
}

/// Key returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(Uuid);

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    key: SubscriptionKey,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

/// Receiving side of a subscription
#[derive(Debug)]
pub struct EventSubscription {
    key: SubscriptionKey,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl EventSubscription {
    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    /// Wait for the next event; `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued so far
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Fan-out of engine events to keyed subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = SubscriptionKey(Uuid::new_v4());
        self.subscribers.write().push(Subscriber { key, filter, tx });
        EventSubscription { key, rx }
    }

    /// Remove a subscription; its receiver sees the end of the stream
    pub fn unsubscribe(&self, key: SubscriptionKey) -> bool {
        let mut subscribers = self.subscribers.write();
        match subscribers.iter().position(|s| s.key == key) {
            Some(pos) => {
                subscribers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every matching subscriber, pruning dropped receivers
    pub fn emit(&self, event: EngineEvent) {
        let mut closed = false;
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                if !event.passes_filter(&subscriber.filter) {
                    continue;
                }
                if subscriber.tx.send(event.clone()).is_err() {
                    closed = true;
                }
            }
        }
        if closed {
            self.subscribers.write().retain(|s| !s.tx.is_closed());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dtmf(session: u64) -> EngineEvent {
        EngineEvent::DtmfSent {
            session_id: SessionId(session),
            digits: "1".into(),
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::all());
        bus.emit(dtmf(1));
        bus.emit(dtmf(2));

        let ids: Vec<_> = sub.drain().iter().filter_map(|e| e.session_id()).collect();
        assert_eq!(ids, vec![SessionId(1), SessionId(2)]);
    }

    #[tokio::test]
    async fn test_session_filter() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::session(SessionId(2)));
        bus.emit(dtmf(1));
        bus.emit(dtmf(2));
        bus.emit(EngineEvent::TransportStateChanged {
            previous: TransportState::Disconnected,
            current: TransportState::Connected,
        });

        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id(), Some(SessionId(2)));
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::all());
        assert!(bus.unsubscribe(sub.key()));
        assert!(!bus.unsubscribe(sub.key()));
        bus.emit(dtmf(1));
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::all());
        let _keep = bus.subscribe(EventFilter::all());
        drop(sub);
        bus.emit(dtmf(1));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_priority_filter() {
        let filter = EventFilter::min_priority(EventPriority::High);
        assert!(!dtmf(1).passes_filter(&filter));
        let error = EngineEvent::Error {
            error: SoftphoneError::ReconnectExhausted { attempts: 5 },
            session_id: None,
        };
        assert_eq!(error.priority(), EventPriority::Critical);
        assert!(error.passes_filter(&filter));
    }
}
