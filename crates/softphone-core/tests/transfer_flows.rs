//! Blind and attended transfer scenarios

mod common;

use anyhow::{Context, Result};
use common::*;
use softphone_core::{
    CallOutcome, CallState, EngineEvent, EventFilter, SessionId, SoftphoneError, TransferPhase, TransportEvent,
};

fn outcome_of(events: &[EngineEvent], id: SessionId) -> Option<CallOutcome> {
    events.iter().find_map(|event| match event {
        EngineEvent::SessionTerminated { session_id, outcome, .. } if *session_id == id => Some(*outcome),
        _ => None,
    })
}

#[tokio::test]
async fn test_blind_transfer_ends_call_as_transferred() {
    let (engine, transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let handle = handle_of(&engine, a);
    let mut events = engine.subscribe_events(EventFilter::all());

    engine.blind_transfer(a, "100").await.unwrap();

    assert!(engine.get_session(a).is_none());
    assert_eq!(
        transport.requests_of("refer"),
        vec![format!("refer {} sip:100@pbx.test", handle)]
    );
    let events = events.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferInitiated { transfer } if transfer.target == "100")));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferCompleted { .. })));
    // Straight from Established to Terminated
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::SessionStateChanged {
            previous: CallState::Established,
            current: CallState::Terminated,
            ..
        }
    )));
    assert_eq!(outcome_of(&events, a), Some(CallOutcome::Transferred));
    assert!(engine.transfer_for(a).is_none());
}

#[tokio::test]
async fn test_blind_transfer_rejected_keeps_call() {
    let (engine, transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let mut events = engine.subscribe_events(EventFilter::all());
    transport.fail("refer", rejected(603, "Decline"));

    let err = engine.blind_transfer(a, "100").await.unwrap_err();
    assert!(matches!(
        err,
        SoftphoneError::TransferFailed {
            phase: TransferPhase::Initiated,
            ..
        }
    ));
    assert_eq!(engine.get_session(a).unwrap().state, CallState::Established);
    assert!(engine.transfer_for(a).is_none());
    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferRejected { .. })));
}

#[tokio::test]
async fn test_blind_transfer_requires_established_call() {
    let (engine, _transport) = registered_engine().await;
    let a = engine.make_call("2001", None).await.unwrap();
    assert!(matches!(
        engine.blind_transfer(a, "100").await,
        Err(SoftphoneError::InvalidState { .. })
    ));
    assert!(matches!(
        engine.blind_transfer(a, "").await,
        Err(SoftphoneError::InvalidArgument { .. })
    ));
}

#[tokio::test]
async fn test_attended_cancel_before_answer_restores_original() -> Result<()> {
    let (engine, transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let before = engine.get_session(a).context("original call")?;

    let consultation = engine.start_attended_transfer(a, "2002").await?;
    assert_eq!(engine.get_session(a).context("original call")?.state, CallState::Held);
    assert_eq!(engine.selected_session(), Some(consultation));
    let op = engine.transfer_for(a).context("transfer in progress")?;
    assert_eq!(op.consultation, Some(consultation));

    engine.cancel_attended_transfer(a, consultation).await?;

    let after = engine.get_session(a).context("original call after cancel")?;
    assert_eq!(after.state, CallState::Established);
    assert_eq!(after.line, before.line);
    assert_eq!(after.answered_at, before.answered_at);
    assert!(engine.get_session(consultation).is_none());
    assert_eq!(engine.sessions().len(), 1);
    assert!(engine.transfer_for(a).is_none());
    assert_eq!(engine.selected_session(), Some(a));
    assert_eq!(transport.count("hold"), 2);
    Ok(())
}

#[tokio::test]
async fn test_attended_transfer_completes_after_consultation_answers() {
    let (engine, transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let mut events = engine.subscribe_events(EventFilter::all());

    let consultation = engine.start_attended_transfer(a, "2002").await.unwrap();
    let consult_handle = handle_of(&engine, consultation);
    engine.handle_transport_event(TransportEvent::SessionProgress {
        handle: consult_handle.clone(),
        code: 180,
    });
    assert_eq!(engine.transfer_for(a).unwrap().phase, TransferPhase::Ringing);
    engine.handle_transport_event(TransportEvent::SessionEstablished {
        handle: consult_handle.clone(),
    });
    assert_eq!(engine.transfer_for(a).unwrap().phase, TransferPhase::Answered);

    engine.complete_attended_transfer(a, consultation).await.unwrap();

    assert!(engine.sessions().is_empty());
    assert_eq!(transport.count("refer_replaces"), 1);
    let events = events.drain();
    assert_eq!(outcome_of(&events, a), Some(CallOutcome::Transferred));
    assert_eq!(outcome_of(&events, consultation), Some(CallOutcome::Transferred));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferCompleted { .. })));
}

#[tokio::test]
async fn test_complete_requires_answered_consultation() {
    let (engine, transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let consultation = engine.start_attended_transfer(a, "2002").await.unwrap();

    let err = engine.complete_attended_transfer(a, consultation).await.unwrap_err();
    assert!(matches!(err, SoftphoneError::InvalidState { .. }));
    assert_eq!(transport.count("refer_replaces"), 0);
    assert_eq!(engine.get_session(a).unwrap().state, CallState::Held);
    assert!(engine.transfer_for(a).is_some());
}

#[tokio::test]
async fn test_complete_rejected_keeps_both_legs() {
    let (engine, transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let consultation = engine.start_attended_transfer(a, "2002").await.unwrap();
    engine.handle_transport_event(TransportEvent::SessionEstablished {
        handle: handle_of(&engine, consultation),
    });
    transport.fail("refer_replaces", rejected(503, "Service Unavailable"));

    let err = engine.complete_attended_transfer(a, consultation).await.unwrap_err();
    assert!(matches!(
        err,
        SoftphoneError::TransferFailed {
            phase: TransferPhase::Answered,
            ..
        }
    ));
    assert_eq!(engine.get_session(a).unwrap().state, CallState::Held);
    assert_eq!(engine.get_session(consultation).unwrap().state, CallState::Established);
    assert!(engine.transfer_for(a).is_some());
}

#[tokio::test]
async fn test_busy_consultation_cancels_transfer() {
    let (engine, _transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let mut events = engine.subscribe_events(EventFilter::all());
    let consultation = engine.start_attended_transfer(a, "2002").await.unwrap();

    engine.handle_transport_event(TransportEvent::SessionTerminated {
        handle: handle_of(&engine, consultation),
        code: Some(486),
        reason: Some("Busy Here".to_string()),
    });
    settle().await;

    assert!(engine.get_session(consultation).is_none());
    assert!(engine.transfer_for(a).is_none());
    assert_eq!(engine.get_session(a).unwrap().state, CallState::Established);
    assert_eq!(engine.selected_session(), Some(a));
    let events = events.drain();
    assert_eq!(outcome_of(&events, consultation), Some(CallOutcome::Busy));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferCancelled { .. })));
}

#[tokio::test]
async fn test_consultation_invite_failure_resumes_original() {
    let (engine, transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    transport.fail("invite", rejected(404, "Not Found"));

    let err = engine.start_attended_transfer(a, "2999").await.unwrap_err();
    assert!(matches!(err, SoftphoneError::TransferFailed { .. }));
    assert_eq!(engine.get_session(a).unwrap().state, CallState::Established);
    assert!(engine.transfer_for(a).is_none());
    assert_eq!(engine.sessions().len(), 1);
}

#[tokio::test]
async fn test_cancel_keeps_previously_held_call_on_hold() {
    let (engine, transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    engine.hold_call(a).await.unwrap();

    let consultation = engine.start_attended_transfer(a, "2002").await.unwrap();
    engine.cancel_attended_transfer(a, consultation).await.unwrap();

    assert_eq!(engine.get_session(a).unwrap().state, CallState::Held);
    assert_eq!(transport.count("hold"), 1);
}

#[tokio::test]
async fn test_consultation_cannot_be_held() {
    let (engine, _transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let consultation = engine.start_attended_transfer(a, "2002").await.unwrap();
    engine.handle_transport_event(TransportEvent::SessionEstablished {
        handle: handle_of(&engine, consultation),
    });

    assert!(matches!(
        engine.hold_call(consultation).await,
        Err(SoftphoneError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_source_hangup_abandons_transfer() {
    let (engine, _transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let consultation = engine.start_attended_transfer(a, "2002").await.unwrap();
    engine.handle_transport_event(TransportEvent::SessionEstablished {
        handle: handle_of(&engine, consultation),
    });

    engine.hangup_call(a).await.unwrap();

    assert!(engine.transfer_for(consultation).is_none());
    assert_eq!(engine.get_session(consultation).unwrap().state, CallState::Established);
    engine.hold_call(consultation).await.unwrap();
}

#[tokio::test]
async fn test_second_transfer_on_same_call_is_refused() {
    let (engine, _transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    engine.start_attended_transfer(a, "2002").await.unwrap();

    assert!(matches!(
        engine.start_attended_transfer(a, "2003").await,
        Err(SoftphoneError::InvalidState { .. })
    ));
    assert!(matches!(
        engine.blind_transfer(a, "100").await,
        Err(SoftphoneError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_consultation_ending_during_completion_fails_transfer() {
    let (engine, transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let consultation = engine.start_attended_transfer(a, "2002").await.unwrap();
    let consult_handle = handle_of(&engine, consultation);
    engine.handle_transport_event(TransportEvent::SessionEstablished {
        handle: consult_handle.clone(),
    });
    let mut events = engine.subscribe_events(EventFilter::all());
    transport.gate("refer_replaces");

    let completing = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.complete_attended_transfer(a, consultation).await })
    };
    settle().await;
    assert_eq!(transport.count("refer_replaces"), 1);

    engine.handle_transport_event(TransportEvent::SessionTerminated {
        handle: consult_handle,
        code: None,
        reason: Some("BYE".to_string()),
    });
    settle().await;
    // The completion still owns the original call; nothing touches it yet
    assert_eq!(engine.get_session(a).unwrap().state, CallState::Held);
    assert_eq!(transport.count("hold"), 1);

    transport.open("refer_replaces");
    let err = completing.await.unwrap().unwrap_err();

    assert!(matches!(
        err,
        SoftphoneError::TransferFailed {
            phase: TransferPhase::Answered,
            ..
        }
    ));
    assert_eq!(engine.get_session(a).unwrap().state, CallState::Established);
    assert_eq!(transport.count("hold"), 2);
    assert_eq!(transport.count("hangup"), 0);
    assert!(engine.transfer_for(a).is_none());
    assert_eq!(engine.selected_session(), Some(a));

    let events = events.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferRejected { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferCompleted { .. })));
    assert_eq!(outcome_of(&events, a), None);
}

#[tokio::test]
async fn test_cancel_with_failed_resume_still_ends_transfer() {
    let (engine, transport) = registered_engine().await;
    let a = established_outbound(&engine, "2001").await;
    let consultation = engine.start_attended_transfer(a, "2002").await.unwrap();
    let mut events = engine.subscribe_events(EventFilter::all());
    transport.fail_times("hold", 1, rejected(491, "Request Pending"));

    let err = engine.cancel_attended_transfer(a, consultation).await.unwrap_err();

    assert!(matches!(err, SoftphoneError::TransferFailed { .. }));
    assert!(engine.transfer_for(a).is_none());
    assert!(engine.get_session(consultation).is_none());
    assert_eq!(engine.get_session(a).unwrap().state, CallState::Held);
    assert_eq!(engine.selected_session(), Some(a));

    let events = events.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferCancelled { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::Error {
            error: SoftphoneError::TransferFailed { .. },
            ..
        }
    )));

    // The call is left on hold and can be resumed by hand
    engine.unhold_call(a).await.unwrap();
    assert_eq!(engine.get_session(a).unwrap().state, CallState::Established);
}
