//! Registration, transport loss and the reconnection driver

mod common;

use std::time::Duration;

use common::*;
use softphone_core::{
    BlfState, EngineEvent, EventFilter, RegistrationState, SignalingError, SoftphoneError, TransportEvent,
    TransportState,
};
use tokio::time::{sleep_until, Instant};

fn lose_transport(engine: &softphone_core::SoftphoneEngine) {
    engine.handle_transport_event(TransportEvent::TransportDisconnected {
        reason: Some("socket closed".to_string()),
    });
}

#[tokio::test]
async fn test_connect_and_register_publish_state_changes() {
    let (engine, transport) = engine_with(test_config());
    let mut events = engine.subscribe_events(EventFilter::all());

    assert!(matches!(
        engine.register().await,
        Err(SoftphoneError::InvalidState { .. })
    ));

    engine.connect().await.unwrap();
    engine.register().await.unwrap();
    assert_eq!(engine.transport_state(), TransportState::Connected);
    assert!(engine.is_registered());
    assert_eq!(transport.requests_of("register"), vec!["register sip:1000@pbx.test".to_string()]);

    let registrations: Vec<_> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::RegistrationStateChanged { current, .. } => Some(current),
            _ => None,
        })
        .collect();
    assert_eq!(
        registrations,
        vec![RegistrationState::Registering, RegistrationState::Registered]
    );
}

#[tokio::test]
async fn test_register_failure_marks_failed() {
    let (engine, transport) = engine_with(test_config());
    transport.fail("register", rejected(403, "Forbidden"));
    engine.connect().await.unwrap();

    let err = engine.register().await.unwrap_err();
    assert!(matches!(err, SoftphoneError::Registration { .. }));
    assert!(!err.is_recoverable());
    assert_eq!(engine.registration_state(), RegistrationState::Failed);
}

#[tokio::test]
async fn test_registrar_rejection_event_reports_error() {
    let (engine, _transport) = registered_engine().await;
    let mut events = engine.subscribe_events(EventFilter::all());

    engine.handle_transport_event(TransportEvent::RegistrationFailed {
        reason: "401 Unauthorized".to_string(),
    });

    assert_eq!(engine.registration_state(), RegistrationState::Failed);
    assert!(events.drain().iter().any(|e| matches!(
        e,
        EngineEvent::Error {
            error: SoftphoneError::Registration { .. },
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backs_off_then_gives_up() {
    let (engine, transport) = registered_engine().await;
    let mut events = engine.subscribe_events(EventFilter::all());
    transport.fail("connect", SignalingError::NotConnected);
    let start = Instant::now();

    lose_transport(&engine);
    assert_eq!(engine.registration_state(), RegistrationState::Unregistered);
    assert!(engine.is_reconnecting());

    // Default policy: 1s, 2s, 4s, 8s, 16s between attempts
    let expected = [(500, 1), (1_500, 2), (3_500, 3), (7_500, 4), (15_500, 5), (31_500, 6)];
    for (at_ms, connects) in expected {
        sleep_until(start + Duration::from_millis(at_ms)).await;
        settle().await;
        assert_eq!(transport.count("connect"), connects, "connect attempts at {}ms", at_ms);
    }

    assert_eq!(engine.registration_state(), RegistrationState::Failed);
    assert!(!engine.is_reconnecting());
    assert!(events.drain().iter().any(|e| matches!(
        e,
        EngineEvent::Error {
            error: SoftphoneError::ReconnectExhausted { attempts: 5 },
            ..
        }
    )));

    sleep_until(start + Duration::from_secs(120)).await;
    assert_eq!(transport.count("connect"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_succeeds_after_failures() {
    let (engine, transport) = registered_engine().await;
    transport.fail_times("connect", 2, SignalingError::Timeout);
    let start = Instant::now();

    lose_transport(&engine);
    sleep_until(start + Duration::from_millis(7_500)).await;
    settle().await;

    assert_eq!(transport.count("connect"), 4);
    assert!(engine.is_registered());
    assert!(!engine.is_reconnecting());

    sleep_until(start + Duration::from_secs(60)).await;
    assert_eq!(transport.count("connect"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_user_disconnect_does_not_reconnect() {
    let (engine, transport) = registered_engine().await;

    engine.disconnect().await.unwrap();
    assert_eq!(engine.transport_state(), TransportState::Disconnected);
    assert_eq!(engine.registration_state(), RegistrationState::Unregistered);
    assert_eq!(transport.count("unregister"), 1);

    lose_transport(&engine);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!engine.is_reconnecting());
    assert_eq!(transport.count("connect"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_network_offline_tears_down_and_online_reconnects_once() {
    let (engine, transport) = registered_engine().await;
    engine.subscribe_blf("200").await.unwrap();

    engine.notify_network_offline().await;
    assert_eq!(engine.transport_state(), TransportState::Disconnected);
    assert!(!engine.is_registered());
    assert_eq!(engine.blf_state("200"), Some(BlfState::Inactive));
    // Fast teardown: no graceful unsubscribe, no wait on the registrar
    assert_eq!(transport.count("unsubscribe"), 0);
    assert_eq!(transport.requests_of("unregister"), vec!["unregister false".to_string()]);

    lose_transport(&engine);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.count("connect"), 1);

    engine.notify_network_online().await.unwrap();
    settle().await;
    assert_eq!(transport.count("connect"), 2);
    assert!(engine.is_registered());
    assert_eq!(engine.blf_state("200"), Some(BlfState::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_network_online_retries_after_exhaustion() {
    let mut config = test_config();
    config.reconnect.max_attempts = 2;
    let (engine, transport) = registered_engine_with(config).await;
    transport.fail("connect", SignalingError::NotConnected);

    lose_transport(&engine);
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(engine.registration_state(), RegistrationState::Failed);
    assert_eq!(transport.count("connect"), 3);

    transport.succeed("connect");
    engine.notify_network_online().await.unwrap();
    assert!(engine.is_registered());
    assert_eq!(transport.count("connect"), 4);
}
