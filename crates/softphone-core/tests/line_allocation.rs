//! Three-line allocation, the waiting queue and foreground selection

mod common;

use common::*;
use softphone_core::{EngineEvent, EventFilter, LineNumber, LineState, SoftphoneError, TransportEvent};

fn line(n: u8) -> LineNumber {
    LineNumber::new(n).unwrap()
}

#[tokio::test]
async fn test_fourth_inbound_call_waits_for_a_free_line() {
    let (engine, _transport) = registered_engine().await;
    let mut events = engine.subscribe_events(EventFilter::all());

    for n in 1..=4 {
        engine.handle_transport_event(invite(&format!("in-{}", n), &format!("300{}", n)));
    }
    let sessions = engine.sessions();
    assert_eq!(sessions.len(), 4);
    assert_eq!(sessions[0].line, Some(line(1)));
    assert_eq!(sessions[1].line, Some(line(2)));
    assert_eq!(sessions[2].line, Some(line(3)));
    assert_eq!(sessions[3].line, None);
    assert_eq!(engine.waiting_sessions(), vec![sessions[3].id]);
    assert_eq!(engine.stats().occupied_lines, 3);

    // The caller on line 2 gives up; the waiting call takes the freed line
    engine.handle_transport_event(TransportEvent::SessionTerminated {
        handle: sessions[1].handle.clone(),
        code: Some(487),
        reason: None,
    });

    let waiting = engine.get_session(sessions[3].id).unwrap();
    assert_eq!(waiting.line, Some(line(2)));
    assert!(engine.waiting_sessions().is_empty());
    assert!(events.drain().iter().any(|e| matches!(
        e,
        EngineEvent::LineAssigned { line: l, session_id } if *l == line(2) && *session_id == sessions[3].id
    )));
}

#[tokio::test]
async fn test_waiting_call_can_be_answered_once_a_line_frees() {
    let (engine, _transport) = registered_engine().await;
    for n in 1..=4 {
        engine.handle_transport_event(invite(&format!("in-{}", n), &format!("300{}", n)));
    }
    let sessions = engine.sessions();

    // No line for the fourth call yet
    assert!(matches!(
        engine.answer_call(sessions[3].id).await,
        Err(SoftphoneError::NoLineAvailable)
    ));

    engine.reject_call(sessions[0].id).await.unwrap();
    engine.answer_call(sessions[3].id).await.unwrap();
    assert_eq!(engine.get_session(sessions[3].id).unwrap().line, Some(line(1)));
}

#[tokio::test]
async fn test_outbound_refused_when_all_lines_busy() {
    let (engine, transport) = registered_engine().await;
    for n in 1..=3 {
        engine.make_call(&format!("200{}", n), None).await.unwrap();
    }

    let err = engine.make_call("2004", None).await.unwrap_err();
    assert_eq!(err, SoftphoneError::NoLineAvailable);
    assert_eq!(transport.count("invite"), 3);
    assert_eq!(engine.sessions().len(), 3);
}

#[tokio::test]
async fn test_line_hint_is_honoured() {
    let (engine, _transport) = registered_engine().await;
    let id = engine.make_call("2001", Some(line(3))).await.unwrap();
    assert_eq!(engine.get_session(id).unwrap().line, Some(line(3)));
    assert_eq!(engine.selected_line(), line(3));
    assert_eq!(engine.lines()[2].state, LineState::Dialing);
}

#[tokio::test]
async fn test_second_inbound_does_not_steal_focus() {
    let (engine, _transport) = registered_engine().await;
    let first = established_outbound(&engine, "2001").await;

    engine.handle_transport_event(invite("in-1", "3001"));
    assert_eq!(engine.selected_session(), Some(first));
    assert_eq!(engine.lines()[1].state, LineState::Ringing);
}

#[tokio::test]
async fn test_select_line_switches_foreground() {
    let (engine, _transport) = registered_engine().await;
    let mut events = engine.subscribe_events(EventFilter::all());
    let first = established_outbound(&engine, "2001").await;
    engine.handle_transport_event(invite("in-1", "3001"));

    engine.select_line(line(2)).unwrap();
    assert_eq!(engine.selected_line(), line(2));
    assert_ne!(engine.selected_session(), Some(first));
    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, EngineEvent::LineSelected { line: l, .. } if *l == line(2))));
}

#[tokio::test]
async fn test_select_line_refused_during_transfer() {
    let (engine, _transport) = registered_engine().await;
    let source = established_outbound(&engine, "2001").await;
    let consultation = engine.start_attended_transfer(source, "2002").await.unwrap();

    let selected = engine.selected_line();
    assert_eq!(engine.get_session(consultation).unwrap().line, Some(selected));
    let err = engine.select_line(line(3)).unwrap_err();
    assert!(matches!(err, SoftphoneError::InvalidState { .. }));
    assert_eq!(engine.selected_line(), selected);
}
