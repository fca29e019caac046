//! Shared harness for engine scenario tests: a scripted transport that
//! records every request and can be told to fail specific ones.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use softphone_core::registration::{RegistrationConfig, ServerConfig};
use softphone_core::transport::SignalingResult;
use softphone_core::{
    CallHandle, DialogState, EngineBuilder, EngineConfig, EngineEvent, IncomingInvite, SessionId,
    SignalingError, SignalingTransport, SoftphoneEngine, SubscriptionHandle, TransportEvent,
};

#[derive(Debug, Clone)]
struct Failure {
    /// `None` fails every time
    remaining: Option<u32>,
    error: SignalingError,
}

/// Transport double: every request is appended to a log such as
/// `"invite <handle> sip:2001@pbx.test"`, and answered from the failure
/// script or with success. A gated operation is logged on arrival and then
/// suspended until the test opens its gate.
#[derive(Debug, Default)]
pub struct MockTransport {
    log: Mutex<Vec<String>>,
    failures: Mutex<HashMap<&'static str, Failure>>,
    gates: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
    next_subscription: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every `operation` request fail with `error`
    pub fn fail(&self, operation: &'static str, error: SignalingError) {
        self.failures.lock().insert(
            operation,
            Failure {
                remaining: None,
                error,
            },
        );
    }

    /// Fail the next `times` `operation` requests, then succeed
    pub fn fail_times(&self, operation: &'static str, times: u32, error: SignalingError) {
        self.failures.lock().insert(
            operation,
            Failure {
                remaining: Some(times),
                error,
            },
        );
    }

    pub fn succeed(&self, operation: &'static str) {
        self.failures.lock().remove(operation);
    }

    /// Suspend `operation` requests until [`MockTransport::open`]
    pub fn gate(&self, operation: &'static str) {
        self.gates.lock().insert(operation, Arc::new(Semaphore::new(0)));
    }

    /// Let every suspended `operation` request finish; later ones pass freely
    pub fn open(&self, operation: &'static str) {
        if let Some(gate) = self.gates.lock().remove(operation) {
            gate.close();
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Requests whose first word is `operation`
    pub fn requests_of(&self, operation: &str) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|entry| entry.split_whitespace().next() == Some(operation))
            .cloned()
            .collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.requests_of(operation).len()
    }

    pub fn clear_requests(&self) {
        self.log.lock().clear();
    }

    fn log_request(&self, operation: &'static str, detail: String) {
        let entry = if detail.is_empty() {
            operation.to_string()
        } else {
            format!("{} {}", operation, detail)
        };
        self.log.lock().push(entry);
    }

    fn outcome(&self, operation: &'static str) -> SignalingResult<()> {
        let mut failures = self.failures.lock();
        let Some(failure) = failures.get_mut(operation) else {
            return Ok(());
        };
        let error = failure.error.clone();
        let fail = match failure.remaining.as_mut() {
            None => true,
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            Some(_) => false,
        };
        if failure.remaining == Some(0) {
            failures.remove(operation);
        }
        if fail {
            Err(error)
        } else {
            Ok(())
        }
    }

    fn record(&self, operation: &'static str, detail: String) -> SignalingResult<()> {
        self.log_request(operation, detail);
        self.outcome(operation)
    }

    async fn request(&self, operation: &'static str, detail: String) -> SignalingResult<()> {
        self.log_request(operation, detail);
        let gate = self.gates.lock().get(operation).cloned();
        if let Some(gate) = gate {
            // Closing the semaphore is what opens the gate
            let _ = gate.acquire().await;
        }
        self.outcome(operation)
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn connect(&self, server: &ServerConfig) -> SignalingResult<()> {
        self.request("connect", server.uri.clone()).await
    }

    async fn disconnect(&self) -> SignalingResult<()> {
        self.request("disconnect", String::new()).await
    }

    async fn register(&self, registration: &RegistrationConfig) -> SignalingResult<()> {
        self.request("register", registration.aor.clone()).await
    }

    async fn unregister(&self, graceful: bool) -> SignalingResult<()> {
        self.request("unregister", graceful.to_string()).await
    }

    async fn invite(&self, call: &CallHandle, target: &str) -> SignalingResult<()> {
        self.request("invite", format!("{} {}", call, target)).await
    }

    async fn answer(&self, call: &CallHandle) -> SignalingResult<()> {
        self.request("answer", call.to_string()).await
    }

    async fn reject(&self, call: &CallHandle, status_code: u16) -> SignalingResult<()> {
        self.request("reject", format!("{} {}", call, status_code)).await
    }

    async fn hangup(&self, call: &CallHandle) -> SignalingResult<()> {
        self.request("hangup", call.to_string()).await
    }

    async fn set_hold(&self, call: &CallHandle, on_hold: bool) -> SignalingResult<()> {
        self.request("hold", format!("{} {}", call, on_hold)).await
    }

    fn set_microphone_muted(&self, call: &CallHandle, muted: bool) -> SignalingResult<()> {
        self.record("mute", format!("{} {}", call, muted))
    }

    async fn send_dtmf(&self, call: &CallHandle, tone: char, _duration: Duration) -> SignalingResult<()> {
        self.request("dtmf", format!("{} {}", call, tone)).await
    }

    async fn refer(&self, call: &CallHandle, target: &str) -> SignalingResult<()> {
        self.request("refer", format!("{} {}", call, target)).await
    }

    async fn refer_with_replaces(&self, call: &CallHandle, consultation: &CallHandle) -> SignalingResult<()> {
        self.request("refer_replaces", format!("{} {}", call, consultation)).await
    }

    async fn subscribe_dialog(&self, extension: &str, _expires: Duration) -> SignalingResult<SubscriptionHandle> {
        self.request("subscribe", extension.to_string()).await?;
        let n = self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubscriptionHandle(format!("sub-{}-{}", extension, n)))
    }

    async fn unsubscribe_dialog(&self, subscription: &SubscriptionHandle) -> SignalingResult<()> {
        self.request("unsubscribe", subscription.to_string()).await
    }
}

pub fn rejected(code: u16, reason: &str) -> SignalingError {
    SignalingError::Rejected {
        code,
        reason: reason.to_string(),
    }
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::new(
        ServerConfig::new("wss://pbx.test:8089/ws", "pbx.test"),
        RegistrationConfig::new("sip:1000@pbx.test").with_credentials("1000", "secret"),
    );
    config.presence.batch_delay_ms = 10;
    config
}

/// Route engine logs to the test harness; `RUST_LOG` selects the level
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn engine_with(config: EngineConfig) -> (SoftphoneEngine, Arc<MockTransport>) {
    init_test_logging();
    let transport = MockTransport::new();
    let engine = EngineBuilder::new(transport.clone())
        .config(config)
        .build()
        .expect("test config is valid");
    (engine, transport)
}

/// Engine that is connected and registered
pub async fn registered_engine() -> (SoftphoneEngine, Arc<MockTransport>) {
    registered_engine_with(test_config()).await
}

pub async fn registered_engine_with(config: EngineConfig) -> (SoftphoneEngine, Arc<MockTransport>) {
    let (engine, transport) = engine_with(config);
    engine.connect().await.expect("connect");
    engine.register().await.expect("register");
    settle().await;
    (engine, transport)
}

/// Let spawned engine tasks run to their next suspension point
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn invite(handle: &str, caller: &str) -> TransportEvent {
    TransportEvent::IncomingInvite(IncomingInvite::new(
        CallHandle(handle.to_string()),
        format!("<sip:{}@pbx.test>", caller),
        "sip:1000@pbx.test",
    ))
}

pub fn handle_of(engine: &SoftphoneEngine, id: SessionId) -> CallHandle {
    engine.get_session(id).expect("session exists").handle
}

/// Dial `target` and have the far end answer
pub async fn established_outbound(engine: &SoftphoneEngine, target: &str) -> SessionId {
    let id = engine.make_call(target, None).await.expect("make_call");
    let handle = handle_of(engine, id);
    engine.handle_transport_event(TransportEvent::SessionProgress {
        handle: handle.clone(),
        code: 180,
    });
    engine.handle_transport_event(TransportEvent::SessionEstablished { handle });
    id
}

pub fn notify(subscription: &SubscriptionHandle, state: DialogState) -> TransportEvent {
    TransportEvent::Notify {
        subscription: subscription.clone(),
        state,
        remote_held: false,
    }
}

/// BLF lamp changes in the order published
pub fn blf_changes(events: &[EngineEvent]) -> Vec<(String, softphone_core::BlfState)> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::BlfStateChanged { extension, state } => Some((extension.clone(), *state)),
            _ => None,
        })
        .collect()
}
