//! Call lifecycle: dial, accept, answer, reject, hang up, and the reactions
//! to call-progress events from the transport

use tracing::{debug, info, warn};

use crate::call::{CallDirection, CallHandle, CallOutcome, CallState, SessionId};
use crate::client::manager::SoftphoneEngine;
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::lines::LineNumber;
use crate::registry::{FinishedSession, OpGuard};
use crate::transfer::{TransferId, TransferPhase};
use crate::transport::{IncomingInvite, SignalingError};

impl SoftphoneEngine {
    /// Dial `target` (extension, number or SIP URI) on `line_hint` or the
    /// lowest free line.
    ///
    /// Resolves once the transport has accepted the invite; ringing and
    /// answer arrive as events. A bare extension is expanded to
    /// `sip:<target>@<domain>` using the configured server domain. The new
    /// call becomes the foreground line.
    ///
    /// # Errors
    ///
    /// - `InvalidState` when the account is not registered
    /// - `InvalidArgument` for an empty target
    /// - `NoLineAvailable` when all three lines are occupied
    /// - `SignalingFailed` or `Transport` when the invite could not go out;
    ///   the session is then already ended with a `Failed` outcome
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use softphone_core::{LineNumber, SoftphoneEngine, SoftphoneResult};
    /// # async fn demo(engine: SoftphoneEngine) -> SoftphoneResult<()> {
    /// // Any free line
    /// let first = engine.make_call("2001", None).await?;
    ///
    /// // Prefer line 3 for a supervisor call
    /// let second = engine.make_call("sip:9000@pbx.example.com", LineNumber::new(3)).await?;
    /// # let _ = (first, second);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn make_call(&self, target: &str, line_hint: Option<LineNumber>) -> SoftphoneResult<SessionId> {
        self.place_call(target, line_hint, None).await
    }

    /// Outbound dial shared with attended transfers. A consultation is linked
    /// to `transfer` in the same registry step that creates it.
    pub(crate) async fn place_call(
        &self,
        target: &str,
        line_hint: Option<LineNumber>,
        transfer: Option<TransferId>,
    ) -> SoftphoneResult<SessionId> {
        let target = target.trim();
        if target.is_empty() {
            return Err(SoftphoneError::invalid_argument("target", "must not be empty"));
        }
        let registration = self.registration_state();
        if !registration.is_registered() {
            let err = SoftphoneError::invalid_state("make_call", registration);
            warn!(error = %err, "Dial refused");
            return Err(err);
        }

        let handle = CallHandle::generate();
        let id = {
            let mut registry = self.registry.lock();
            let (id, _) = registry.create_outbound(handle.clone(), target, line_hint, transfer.is_some())?;
            if let Some(transfer) = transfer {
                registry.link_consultation(transfer, id);
            }
            id
        };
        let _guard = OpGuard::adopt(&self.registry, id);

        let request_uri = self.request_uri(target);
        let timeout = self.config.calls.invite_timeout();
        let result = match tokio::time::timeout(timeout, self.transport.invite(&handle, &request_uri)).await {
            Ok(result) => result,
            Err(_) => Err(SignalingError::Timeout),
        };

        match result {
            Ok(()) => {
                debug!(session_id = %id, uri = %request_uri, "Invite accepted by transport");
                Ok(id)
            }
            Err(e) => {
                if e == SignalingError::Timeout {
                    if let Err(cancel_err) = self.transport.hangup(&handle).await {
                        debug!(session_id = %id, error = %cancel_err, "Cancel after invite timeout failed");
                    }
                }
                let outcome = outcome_for_failure(CallDirection::Outbound, rejection_code(&e));
                let err = match e {
                    SignalingError::Timeout => SoftphoneError::OperationTimeout {
                        operation: "invite".to_string(),
                        duration_ms: timeout.as_millis() as u64,
                    },
                    other => SoftphoneError::signaling("invite", other),
                };
                warn!(session_id = %id, error = %err, "Outbound call failed");
                self.finish_and_restore(id, CallState::Failed, outcome, Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    /// Register an incoming invite as a ringing session.
    ///
    /// The session gets a line only if one is free; otherwise it waits until
    /// a line is released. A repeated invite for a known handle returns the
    /// existing session.
    pub fn accept_inbound(&self, invite: IncomingInvite) -> SessionId {
        let number = invite.caller_number();
        let display_name = invite.caller_display_name();
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.find_by_handle(&invite.handle) {
            debug!(session_id = %existing, "Duplicate invite ignored");
            return existing;
        }
        let (id, _) = registry.create_inbound(invite.handle, number, invite.from, display_name);
        id
    }

    /// Answer a ringing inbound call.
    ///
    /// A call still waiting for a line is bound to the first free one. With
    /// `auto_hold_on_answer` enabled every other established call is put on
    /// hold before the answer goes out. The answered call takes the
    /// foreground line.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound` for an unknown id
    /// - `InvalidState` unless the call is an inbound call in `Ringing`
    /// - `SessionBusy` while another command is in flight on it
    /// - `NoLineAvailable` for a waiting call when no line has freed up
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use softphone_core::{CallDirection, EngineEvent, EventFilter, SoftphoneEngine, SoftphoneResult};
    /// # async fn demo(engine: SoftphoneEngine) -> SoftphoneResult<()> {
    /// let mut events = engine.subscribe_events(EventFilter::all());
    /// while let Some(event) = events.recv().await {
    ///     if let EngineEvent::SessionCreated { session } = event {
    ///         if session.direction == CallDirection::Inbound {
    ///             engine.answer_call(session.id).await?;
    ///         }
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn answer_call(&self, id: SessionId) -> SoftphoneResult<()> {
        let (_guard, session) = OpGuard::acquire(&self.registry, id, |session, _| {
            if session.direction == CallDirection::Inbound && session.state == CallState::Ringing {
                Ok(())
            } else {
                Err(SoftphoneError::invalid_state("answer_call", session.state))
            }
        })
        .map_err(|e| {
            warn!(session_id = %id, error = %e, "Answer refused");
            e
        })?;

        let line = self.registry.lock().bind_line(id)?;

        if self.config.calls.auto_hold_on_answer {
            let others: Vec<SessionId> = self
                .sessions()
                .into_iter()
                .filter(|s| s.id != id && s.state == CallState::Established)
                .map(|s| s.id)
                .collect();
            for other in others {
                if let Err(e) = self.hold_call(other).await {
                    warn!(session_id = %other, error = %e, "Auto-hold before answer failed");
                }
            }
        }

        self.transport
            .answer(&session.handle)
            .await
            .map_err(|e| SoftphoneError::signaling("answer", e))?;

        let mut registry = self.registry.lock();
        registry.transition(id, CallState::Established, Some("answered".to_string()))?;
        registry.focus_session(id);
        drop(registry);
        info!(session_id = %id, line = line.get(), "Call answered");
        Ok(())
    }

    /// Decline a ringing inbound call with the configured status code
    /// (`486 Busy Here` by default). The session ends with outcome
    /// `Rejected` even if the transport fails to send the response.
    pub async fn reject_call(&self, id: SessionId) -> SoftphoneResult<()> {
        let (_guard, session) = OpGuard::acquire(&self.registry, id, |session, _| {
            if session.direction == CallDirection::Inbound && session.state == CallState::Ringing {
                Ok(())
            } else {
                Err(SoftphoneError::invalid_state("reject_call", session.state))
            }
        })
        .map_err(|e| {
            warn!(session_id = %id, error = %e, "Reject refused");
            e
        })?;

        if let Err(e) = self.transport.reject(&session.handle, self.config.calls.reject_code).await {
            warn!(session_id = %id, error = %e, "Reject signaling failed; ending session locally");
        }
        self.finish_and_restore(id, CallState::Terminated, CallOutcome::Rejected, Some("rejected".to_string()))
            .await;
        Ok(())
    }

    /// End a call in any non-terminal state: cancel before answer, decline
    /// a ringing inbound call, bye once answered.
    ///
    /// The session always ends locally, even when the transport fails.
    pub async fn hangup_call(&self, id: SessionId) -> SoftphoneResult<()> {
        let (_guard, session) = OpGuard::acquire(&self.registry, id, |session, _| {
            if session.state.is_terminal() {
                Err(SoftphoneError::invalid_state("hangup_call", session.state))
            } else {
                Ok(())
            }
        })?;

        let (outcome, result) = match (session.direction, session.state) {
            (_, CallState::Established | CallState::Held) => {
                (CallOutcome::Completed, self.transport.hangup(&session.handle).await)
            }
            (CallDirection::Inbound, _) => (
                CallOutcome::Rejected,
                self.transport.reject(&session.handle, self.config.calls.reject_code).await,
            ),
            (CallDirection::Outbound, _) => (CallOutcome::Cancelled, self.transport.hangup(&session.handle).await),
        };
        if let Err(e) = result {
            warn!(session_id = %id, error = %e, "Hangup signaling failed; ending session locally");
        }

        self.finish_and_restore(id, CallState::Terminated, outcome, Some("local hangup".to_string()))
            .await;
        Ok(())
    }

    pub(crate) fn on_session_progress(&self, handle: &CallHandle, code: u16) {
        let mut registry = self.registry.lock();
        let Some(id) = registry.find_by_handle(handle) else {
            debug!(%handle, code, "Progress for unknown dialog");
            return;
        };
        registry.record_response_code(id, code);
        if (180..200).contains(&code) && registry.state_of(id) == Some(CallState::Initiating) {
            if let Err(e) = registry.transition(id, CallState::Ringing, Some(code.to_string())) {
                debug!(session_id = %id, error = %e, "Ignoring progress");
            }
            if let Some(op) = registry.transfer_for(id).filter(|op| op.consultation == Some(id)) {
                registry.set_transfer_phase(op.id, TransferPhase::Ringing);
            }
        }
    }

    pub(crate) fn on_session_established(&self, handle: &CallHandle) {
        let mut registry = self.registry.lock();
        let Some(id) = registry.find_by_handle(handle) else {
            debug!(%handle, "Established for unknown dialog");
            return;
        };
        match registry.state_of(id) {
            Some(CallState::Initiating | CallState::Ringing) => {}
            _ => return,
        }
        if let Err(e) = registry.transition(id, CallState::Established, Some("200".to_string())) {
            warn!(session_id = %id, error = %e, "Could not mark session established");
            return;
        }
        info!(session_id = %id, "Call established");
        if let Some(op) = registry.transfer_for(id).filter(|op| op.consultation == Some(id)) {
            registry.set_transfer_phase(op.id, TransferPhase::Answered);
        }
    }

    pub(crate) fn on_session_terminated(&self, handle: &CallHandle, code: Option<u16>, reason: Option<String>) {
        let (id, state, direction) = {
            let registry = self.registry.lock();
            let Some(id) = registry.find_by_handle(handle) else {
                debug!(%handle, "Termination for unknown dialog");
                return;
            };
            let Some(session) = registry.get(id) else {
                return;
            };
            (id, session.state, session.direction)
        };

        let (terminal, outcome) = if state.is_answered() {
            (CallState::Terminated, CallOutcome::Completed)
        } else {
            match direction {
                CallDirection::Outbound => (CallState::Failed, outcome_for_failure(direction, code)),
                CallDirection::Inbound => (CallState::Terminated, CallOutcome::Missed),
            }
        };
        let reason = reason.or_else(|| code.map(|c| c.to_string()));

        let finished = {
            let mut registry = self.registry.lock();
            if let Some(code) = code {
                registry.record_response_code(id, code);
            }
            registry.finish(id, terminal, outcome, reason)
        };
        if let Some(source) = finished.and_then(|f| f.unhold_source) {
            let engine = self.clone();
            tokio::spawn(async move { engine.resume_transfer_source(source).await });
        }
    }

    /// Remove a terminal session and, when a consultation ended under an
    /// attended transfer, take its source off hold before returning
    pub(crate) async fn finish_and_restore(
        &self,
        id: SessionId,
        state: CallState,
        outcome: CallOutcome,
        reason: Option<String>,
    ) -> Option<FinishedSession> {
        let finished = self.registry.lock().finish(id, state, outcome, reason);
        if let Some(source) = finished.as_ref().and_then(|f| f.unhold_source) {
            self.resume_transfer_source(source).await;
        }
        finished
    }

    /// Build the request URI for a dial target
    pub(crate) fn request_uri(&self, target: &str) -> String {
        if target.contains(':') || target.contains('@') {
            return target.to_string();
        }
        let domain = if self.config.server.domain.is_empty() {
            self.config
                .registration
                .aor
                .rsplit_once('@')
                .map(|(_, host)| host)
                .unwrap_or_default()
        } else {
            self.config.server.domain.as_str()
        };
        format!("sip:{}@{}", target, domain)
    }
}

fn rejection_code(error: &SignalingError) -> Option<u16> {
    match error {
        SignalingError::Rejected { code, .. } => Some(*code),
        _ => None,
    }
}

/// Outcome of a call that ended before it was answered
fn outcome_for_failure(direction: CallDirection, code: Option<u16>) -> CallOutcome {
    match (direction, code) {
        (CallDirection::Inbound, _) => CallOutcome::Missed,
        (CallDirection::Outbound, Some(486 | 600)) => CallOutcome::Busy,
        (CallDirection::Outbound, Some(487)) => CallOutcome::Cancelled,
        (CallDirection::Outbound, Some(603)) => CallOutcome::Rejected,
        (CallDirection::Outbound, _) => CallOutcome::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_failure_outcomes() {
        assert_eq!(outcome_for_failure(CallDirection::Outbound, Some(486)), CallOutcome::Busy);
        assert_eq!(outcome_for_failure(CallDirection::Outbound, Some(603)), CallOutcome::Rejected);
        assert_eq!(outcome_for_failure(CallDirection::Outbound, None), CallOutcome::Failed);
        assert_eq!(outcome_for_failure(CallDirection::Inbound, Some(487)), CallOutcome::Missed);
    }
}
