//! In-call controls: hold, mute, recording, DTMF and line selection

use tracing::{debug, info, warn};

use crate::call::{CallHandle, CallState, SessionId};
use crate::client::manager::SoftphoneEngine;
use crate::dtmf::{parse_sequence, DtmfStep};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::EngineEvent;
use crate::lines::LineNumber;
use crate::registry::OpGuard;

impl SoftphoneEngine {
    /// Put an established call on hold.
    ///
    /// The FSM only moves to `Held` once the transport has renegotiated
    /// media; a refused re-INVITE leaves the call established.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound` for an unknown id
    /// - `InvalidState` unless the call is `Established`, or when it is the
    ///   consultation leg of an attended transfer
    /// - `SessionBusy` while another command is in flight on the call
    /// - `SessionGone` when the call ended while the hold was pending
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use softphone_core::{SessionId, SoftphoneEngine, SoftphoneResult};
    /// # async fn demo(engine: SoftphoneEngine, id: SessionId) -> SoftphoneResult<()> {
    /// engine.hold_call(id).await?;
    /// // ... look something up for the caller ...
    /// engine.unhold_call(id).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn hold_call(&self, id: SessionId) -> SoftphoneResult<()> {
        let (_guard, session) = OpGuard::acquire(&self.registry, id, |session, registry| {
            if session.state != CallState::Established {
                return Err(SoftphoneError::invalid_state("hold_call", session.state));
            }
            if registry.is_consultation(session.id) {
                return Err(SoftphoneError::invalid_state("hold_call", "active consultation"));
            }
            Ok(())
        })
        .map_err(|e| {
            warn!(session_id = %id, error = %e, "Hold refused");
            e
        })?;

        self.apply_hold(id, &session.handle, true).await
    }

    /// Resume a held call
    pub async fn unhold_call(&self, id: SessionId) -> SoftphoneResult<()> {
        let (_guard, session) = OpGuard::acquire(&self.registry, id, |session, _| {
            if session.state == CallState::Held {
                Ok(())
            } else {
                Err(SoftphoneError::invalid_state("unhold_call", session.state))
            }
        })
        .map_err(|e| {
            warn!(session_id = %id, error = %e, "Unhold refused");
            e
        })?;

        self.apply_hold(id, &session.handle, false).await
    }

    /// Renegotiate media direction, then move the FSM. A transport failure
    /// leaves the session untouched. Callers own the busy flag.
    pub(crate) async fn apply_hold(&self, id: SessionId, handle: &CallHandle, on_hold: bool) -> SoftphoneResult<()> {
        let operation = if on_hold { "hold" } else { "unhold" };
        self.transport
            .set_hold(handle, on_hold)
            .await
            .map_err(|e| SoftphoneError::signaling(operation, e))?;

        let next = if on_hold { CallState::Held } else { CallState::Established };
        self.registry.lock().transition(id, next, Some(operation.to_string()))?;
        info!(session_id = %id, on_hold, "Hold state changed");
        Ok(())
    }

    /// Take a transfer source off hold after its consultation went away.
    ///
    /// Claims the source's busy flag first. When a command already owns it
    /// (a transfer start or completion still in flight) the resume is left
    /// to that command.
    pub(crate) async fn resume_transfer_source(&self, source: SessionId) {
        let acquired = OpGuard::acquire(&self.registry, source, |session, _| {
            if session.state == CallState::Held {
                Ok(())
            } else {
                Err(SoftphoneError::invalid_state("resume", session.state))
            }
        });
        match acquired {
            Ok((_guard, session)) => self.resume_held_source(source, &session.handle).await,
            Err(SoftphoneError::SessionBusy { .. }) => {
                debug!(session_id = %source, "Transfer source busy; resume left to the running command");
            }
            Err(e) => debug!(session_id = %source, error = %e, "Transfer source needs no resume"),
        }
    }

    /// Unhold a transfer source whose busy flag the caller owns. Failures are
    /// published as engine errors.
    pub(crate) async fn resume_held_source(&self, source: SessionId, handle: &CallHandle) {
        if let Err(e) = self.apply_hold(source, handle, false).await {
            warn!(session_id = %source, error = %e, "Could not resume transfer source");
            if !e.is_benign() {
                self.events.emit(EngineEvent::Error {
                    error: e,
                    session_id: Some(source),
                });
            }
        }
    }

    /// Mute the local microphone. See [`set_muted`](Self::set_muted).
    pub async fn mute_call(&self, id: SessionId) -> SoftphoneResult<()> {
        self.set_muted(id, true)
    }

    /// Unmute the local microphone
    pub async fn unmute_call(&self, id: SessionId) -> SoftphoneResult<()> {
        self.set_muted(id, false)
    }

    /// Local microphone mute; valid while the call is established or held
    pub fn set_muted(&self, id: SessionId, muted: bool) -> SoftphoneResult<()> {
        let handle = self.answered_session_handle(id, "set_muted")?;
        self.transport
            .set_microphone_muted(&handle, muted)
            .map_err(|e| SoftphoneError::signaling("mute", e))?;
        self.registry.lock().update(id, |session| session.muted = muted)?;
        debug!(session_id = %id, muted, "Microphone mute changed");
        Ok(())
    }

    /// Local recording flag; valid while the call is established or held
    pub fn set_recording(&self, id: SessionId, recording: bool) -> SoftphoneResult<()> {
        self.answered_session_handle(id, "set_recording")?;
        self.registry.lock().update(id, |session| session.recording = recording)?;
        info!(session_id = %id, recording, "Recording flag changed");
        Ok(())
    }

    fn answered_session_handle(&self, id: SessionId, operation: &str) -> SoftphoneResult<CallHandle> {
        let session = self
            .get_session(id)
            .ok_or(SoftphoneError::SessionNotFound { session_id: id })?;
        if !session.state.is_answered() {
            return Err(SoftphoneError::invalid_state(operation, session.state));
        }
        Ok(session.handle)
    }

    /// Send a single tone; shorthand for a one-digit sequence
    pub async fn send_dtmf(&self, id: SessionId, tone: char) -> SoftphoneResult<()> {
        self.send_dtmf_sequence(id, &tone.to_string()).await
    }

    /// Send a tone sequence on an established call.
    ///
    /// Sequences on the same session queue behind each other; tones are
    /// paced by the configured inter-digit delay and `,` inserts a pause.
    /// Ending the call stops the sequence with `SessionGone`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for characters outside `0-9 * # A-D ,`
    /// - `InvalidState` unless the call is `Established`
    /// - `SessionGone` when the call ends before the last tone
    /// - `SignalingFailed` when the transport refuses a tone; tones already
    ///   sent are not repeated
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use softphone_core::{SessionId, SoftphoneEngine, SoftphoneResult};
    /// # async fn demo(engine: SoftphoneEngine, id: SessionId) -> SoftphoneResult<()> {
    /// // Conference PIN, pause, then confirm
    /// engine.send_dtmf_sequence(id, "4321,#").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn send_dtmf_sequence(&self, id: SessionId, digits: &str) -> SoftphoneResult<()> {
        let steps = parse_sequence(digits)?;
        let (handle, lane) = {
            let registry = self.registry.lock();
            let session = registry
                .get(id)
                .ok_or(SoftphoneError::SessionNotFound { session_id: id })?;
            if session.state != CallState::Established {
                return Err(SoftphoneError::invalid_state("send_dtmf", session.state));
            }
            let lane = registry
                .dtmf_lane(id)
                .ok_or(SoftphoneError::SessionGone { session_id: id })?;
            (session.handle, lane)
        };

        let _turn = lane.acquire().await;
        let gone = SoftphoneError::SessionGone { session_id: id };
        if lane.is_cancelled() {
            return Err(gone);
        }

        let config = &self.config.dtmf;
        let mut sent = String::new();
        let mut previous_was_tone = false;
        for step in steps {
            match step {
                DtmfStep::Pause => {
                    if !lane.pace(config.pause()).await {
                        return Err(gone);
                    }
                    previous_was_tone = false;
                }
                DtmfStep::Tone(tone) => {
                    if previous_was_tone && !lane.pace(config.inter_digit_delay()).await {
                        return Err(gone);
                    }
                    if let Err(e) = self.transport.send_dtmf(&handle, tone, config.tone_duration()).await {
                        if lane.is_cancelled() {
                            return Err(gone);
                        }
                        return Err(SoftphoneError::signaling("dtmf", e));
                    }
                    sent.push(tone);
                    previous_was_tone = true;
                }
            }
        }

        debug!(session_id = %id, digits = %sent, "DTMF sent");
        self.events.emit(EngineEvent::DtmfSent {
            session_id: id,
            digits: sent,
        });
        Ok(())
    }

    /// Bring `line` to the foreground. Refused while a transfer is in flight
    /// on the selected session.
    pub fn select_line(&self, line: LineNumber) -> SoftphoneResult<()> {
        self.registry.lock().select_line(line).map_err(|e| {
            warn!(line = line.get(), error = %e, "Line switch refused");
            e
        })
    }
}
