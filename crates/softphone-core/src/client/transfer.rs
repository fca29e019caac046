//! Blind and attended transfers

use tracing::{debug, info, warn};

use crate::call::{CallHandle, CallOutcome, CallState, SessionId};
use crate::client::manager::SoftphoneEngine;
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::EngineEvent;
use crate::registry::OpGuard;
use crate::transfer::{TransferId, TransferMode, TransferOperation, TransferPhase};

impl SoftphoneEngine {
    /// Transfer an established call to `target` without consultation.
    ///
    /// On acceptance the local session ends with outcome `Transferred`. On
    /// rejection it stays established and `TransferRejected` is published.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty target
    /// - `InvalidState` unless the call is `Established` with no transfer
    ///   already running on it
    /// - `SessionBusy` while another command is in flight on the call
    /// - `TransferFailed` when the far end refuses the REFER
    pub async fn blind_transfer(&self, id: SessionId, target: &str) -> SoftphoneResult<()> {
        let target = validate_target(target)?;
        let (_guard, session) = OpGuard::acquire(&self.registry, id, |session, registry| {
            if session.state != CallState::Established {
                return Err(SoftphoneError::invalid_state("blind_transfer", session.state));
            }
            if registry.transfer_for(session.id).is_some() {
                return Err(SoftphoneError::invalid_state("blind_transfer", "transfer in progress"));
            }
            Ok(())
        })
        .map_err(|e| {
            warn!(session_id = %id, error = %e, "Blind transfer refused");
            e
        })?;

        let op = TransferOperation::new(id, target, TransferMode::Blind, false);
        let transfer_id = op.id;
        self.registry.lock().insert_transfer(op);
        info!(session_id = %id, target = target, "Blind transfer requested");

        let refer_to = self.request_uri(target);
        let referred = self.transport.refer(&session.handle, &refer_to).await;

        let op = self.registry.lock().take_transfer(transfer_id);
        let Some(mut op) = op else {
            return Err(SoftphoneError::SessionGone { session_id: id });
        };

        match referred {
            Ok(()) => {
                if let Err(e) = self.transport.hangup(&session.handle).await {
                    debug!(session_id = %id, error = %e, "Hangup after transfer failed");
                }
                op.phase = TransferPhase::Completed;
                let mut registry = self.registry.lock();
                registry.emit(EngineEvent::TransferCompleted { transfer: op });
                registry.finish(id, CallState::Terminated, CallOutcome::Transferred, Some("blind transfer".to_string()));
                drop(registry);
                info!(session_id = %id, "Blind transfer completed");
                Ok(())
            }
            Err(e) => {
                let err = SoftphoneError::transfer_failed(TransferPhase::Initiated, e.to_string());
                op.phase = TransferPhase::Failed;
                warn!(session_id = %id, error = %err, "Blind transfer rejected");
                let registry = self.registry.lock();
                registry.emit(EngineEvent::TransferRejected {
                    transfer: op,
                    reason: e.to_string(),
                });
                registry.emit(EngineEvent::Error {
                    error: err.clone(),
                    session_id: Some(id),
                });
                drop(registry);
                Err(err)
            }
        }
    }

    /// Hold `id` (unless already held) and dial `target` as a consultation.
    ///
    /// Returns the consultation session, which becomes the foreground line.
    /// If the consultation cannot be placed the transfer is abandoned and
    /// the original call is resumed, unless it was already held.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the call is answered and free of transfers
    /// - `SessionBusy` while another command is in flight on the call
    /// - `TransferFailed` when the hold fails or the consultation cannot be
    ///   placed, including when no line is free for it
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use softphone_core::{SessionId, SoftphoneEngine, SoftphoneResult};
    /// # async fn demo(engine: SoftphoneEngine, customer: SessionId) -> SoftphoneResult<()> {
    /// let supervisor = engine.start_attended_transfer(customer, "3000").await?;
    /// // Once the supervisor has answered and agreed:
    /// engine.complete_attended_transfer(customer, supervisor).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start_attended_transfer(&self, id: SessionId, target: &str) -> SoftphoneResult<SessionId> {
        let target = validate_target(target)?;
        let (_guard, session) = OpGuard::acquire(&self.registry, id, |session, registry| {
            if !session.state.is_answered() {
                return Err(SoftphoneError::invalid_state("start_attended_transfer", session.state));
            }
            if registry.transfer_for(session.id).is_some() {
                return Err(SoftphoneError::invalid_state("start_attended_transfer", "transfer in progress"));
            }
            Ok(())
        })
        .map_err(|e| {
            warn!(session_id = %id, error = %e, "Attended transfer refused");
            e
        })?;

        let was_held = session.state == CallState::Held;
        let op = TransferOperation::new(id, target, TransferMode::Attended, was_held);
        let transfer_id = op.id;
        self.registry.lock().insert_transfer(op);
        info!(session_id = %id, target = target, was_held, "Attended transfer started");

        if !was_held {
            if let Err(e) = self.apply_hold(id, &session.handle, true).await {
                return Err(self.abort_transfer_start(transfer_id, id, e));
            }
        }

        match self.place_call(target, None, Some(transfer_id)).await {
            Ok(consultation) => {
                info!(session_id = %id, consultation = %consultation, "Consultation call placed");
                Ok(consultation)
            }
            Err(e) => {
                // This command owns the source, so it resumes it even when the
                // failed consultation already detached the transfer
                let source_state = self.registry.lock().state_of(id);
                if !was_held && source_state == Some(CallState::Held) {
                    self.resume_held_source(id, &session.handle).await;
                }
                Err(self.abort_transfer_start(transfer_id, id, e))
            }
        }
    }

    fn abort_transfer_start(&self, transfer_id: TransferId, id: SessionId, cause: SoftphoneError) -> SoftphoneError {
        let err = SoftphoneError::transfer_failed(TransferPhase::Initiated, cause.to_string());
        warn!(session_id = %id, error = %err, "Attended transfer could not start");
        let op = self.registry.lock().take_transfer(transfer_id);
        if let Some(mut op) = op {
            op.phase = TransferPhase::Failed;
            self.registry.lock().emit(EngineEvent::TransferRejected {
                transfer: op,
                reason: cause.to_string(),
            });
        }
        self.events.emit(EngineEvent::Error {
            error: err.clone(),
            session_id: Some(id),
        });
        err
    }

    /// Join the held party to the answered consultation and end both legs.
    ///
    /// A refused REFER keeps the transfer so it can be retried or cancelled.
    /// If the consultation ends while the REFER is pending, the transfer
    /// fails and the original call is resumed and brought back to the
    /// foreground.
    ///
    /// # Errors
    ///
    /// - `InvalidState` when `consultation` is not the answered consultation
    ///   of a transfer on `id`
    /// - `SessionBusy` while another command is in flight on the call
    /// - `TransferFailed` when the REFER is refused or the consultation
    ///   ended first
    pub async fn complete_attended_transfer(&self, id: SessionId, consultation: SessionId) -> SoftphoneResult<()> {
        let op = self.linked_transfer(id, consultation, "complete_attended_transfer")?;
        let (_guard, source) = OpGuard::acquire(&self.registry, id, |session, _| {
            if session.state.is_answered() {
                Ok(())
            } else {
                Err(SoftphoneError::invalid_state("complete_attended_transfer", session.state))
            }
        })?;
        let (_consult_guard, consult) = OpGuard::acquire(&self.registry, consultation, |session, _| {
            if session.state == CallState::Established {
                Ok(())
            } else {
                Err(SoftphoneError::invalid_state("complete_attended_transfer", session.state))
            }
        })
        .map_err(|e| {
            warn!(session_id = %id, consultation = %consultation, error = %e, "Transfer completion refused");
            e
        })?;

        let referred = self.transport.refer_with_replaces(&source.handle, &consult.handle).await;
        let current = {
            let mut registry = self.registry.lock();
            if referred.is_ok() {
                registry.take_transfer(op.id)
            } else {
                registry.transfer(op.id)
            }
        };
        let Some(mut completed) = current else {
            let cause = match referred {
                Ok(()) => "consultation ended before the transfer completed".to_string(),
                Err(e) => e.to_string(),
            };
            return Err(self.abandon_completion(op, &source.handle, cause).await);
        };

        if let Err(e) = referred {
            let err = SoftphoneError::transfer_failed(op.phase, e.to_string());
            warn!(session_id = %id, error = %err, "Attended transfer rejected");
            self.events.emit(EngineEvent::Error {
                error: err.clone(),
                session_id: Some(id),
            });
            return Err(err);
        }

        for handle in [&source.handle, &consult.handle] {
            if let Err(e) = self.transport.hangup(handle).await {
                debug!(%handle, error = %e, "Hangup after attended transfer failed");
            }
        }

        completed.phase = TransferPhase::Completed;
        let mut registry = self.registry.lock();
        registry.emit(EngineEvent::TransferCompleted { transfer: completed });
        let reason = Some("attended transfer".to_string());
        registry.finish(consultation, CallState::Terminated, CallOutcome::Transferred, reason.clone());
        registry.finish(id, CallState::Terminated, CallOutcome::Transferred, reason);
        drop(registry);
        info!(session_id = %id, consultation = %consultation, "Attended transfer completed");
        Ok(())
    }

    /// The consultation ended while the REFER was pending. The source is kept
    /// and resumed here, since this command still owns it.
    async fn abandon_completion(&self, mut op: TransferOperation, source: &CallHandle, cause: String) -> SoftphoneError {
        let id = op.source;
        let state = self.registry.lock().state_of(id);
        let Some(state) = state else {
            return SoftphoneError::SessionGone { session_id: id };
        };
        let err = SoftphoneError::transfer_failed(op.phase, cause.clone());
        warn!(session_id = %id, error = %err, "Consultation ended during transfer completion");
        if state == CallState::Held && !op.source_was_held {
            self.resume_held_source(id, source).await;
        }

        op.phase = TransferPhase::Failed;
        let mut registry = self.registry.lock();
        registry.focus_session(id);
        registry.emit(EngineEvent::TransferRejected {
            transfer: op,
            reason: cause,
        });
        registry.emit(EngineEvent::Error {
            error: err.clone(),
            session_id: Some(id),
        });
        drop(registry);
        err
    }

    /// Abandon an attended transfer: end the consultation, resume the
    /// original call if it was not held before, and bring its line back to
    /// the foreground.
    ///
    /// The transfer always ends and `TransferCancelled` is always published.
    /// If resuming the original call fails it stays held and the call fails
    /// with `TransferFailed`; resume it with
    /// [`unhold_call`](Self::unhold_call).
    pub async fn cancel_attended_transfer(&self, id: SessionId, consultation: SessionId) -> SoftphoneResult<()> {
        let op = self.linked_transfer(id, consultation, "cancel_attended_transfer")?;
        let (_guard, _) = OpGuard::acquire(&self.registry, id, |_, _| Ok(()))?;

        let op = self.registry.lock().take_transfer(op.id);
        let Some(mut op) = op else {
            return Err(SoftphoneError::SessionGone { session_id: id });
        };

        if let Some(consult) = self.get_session(consultation) {
            if let Err(e) = self.transport.hangup(&consult.handle).await {
                warn!(session_id = %consultation, error = %e, "Consultation hangup failed; ending it locally");
            }
            let outcome = if consult.answered_at.is_some() {
                CallOutcome::Completed
            } else {
                CallOutcome::Cancelled
            };
            self.registry.lock().finish(
                consultation,
                CallState::Terminated,
                outcome,
                Some("transfer cancelled".to_string()),
            );
        }

        let source = self.get_session(id);
        let resumed = match source.filter(|s| s.state == CallState::Held && !op.source_was_held) {
            Some(source) => self.apply_hold(id, &source.handle, false).await,
            None => Ok(()),
        };

        let phase = op.phase;
        op.phase = TransferPhase::Cancelled;
        let mut registry = self.registry.lock();
        registry.focus_session(id);
        registry.emit(EngineEvent::TransferCancelled { transfer: op });
        drop(registry);

        if let Err(e) = resumed {
            let err = SoftphoneError::transfer_failed(phase, e.to_string());
            warn!(session_id = %id, error = %err, "Could not resume call after cancelling transfer");
            self.events.emit(EngineEvent::Error {
                error: err.clone(),
                session_id: Some(id),
            });
            return Err(err);
        }
        info!(session_id = %id, consultation = %consultation, "Attended transfer cancelled");
        Ok(())
    }

    fn linked_transfer(
        &self,
        id: SessionId,
        consultation: SessionId,
        operation: &str,
    ) -> SoftphoneResult<TransferOperation> {
        let registry = self.registry.lock();
        if registry.get(id).is_none() {
            return Err(SoftphoneError::SessionNotFound { session_id: id });
        }
        registry
            .transfer_for(id)
            .filter(|op| op.mode == TransferMode::Attended && op.source == id && op.consultation == Some(consultation))
            .ok_or_else(|| SoftphoneError::invalid_state(operation, "no attended transfer links these sessions"))
    }
}

fn validate_target(target: &str) -> SoftphoneResult<&str> {
    let target = target.trim();
    if target.is_empty() {
        return Err(SoftphoneError::invalid_argument("target", "must not be empty"));
    }
    Ok(target)
}
