//! Session registry
//!
//! The registry is the single owner of call sessions, the line table and
//! in-flight transfer operations. The engine keeps it behind one
//! `parking_lot::Mutex` and never holds that lock across an `.await`; every
//! event is emitted while the lock is held so subscribers see mutations in
//! the order they happened.
//!
//! Sessions are removed as soon as they reach a terminal state. The terminal
//! snapshot travels in `SessionTerminated` / `CallRecorded` events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::call::{CallDirection, CallHandle, CallOutcome, CallSession, CallState, SessionId};
use crate::dtmf::DtmfLane;
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::{EngineEvent, EventBus};
use crate::lines::{LineNumber, LineState, LineTable};
use crate::transfer::{TransferId, TransferOperation, TransferPhase};

pub(crate) type SharedRegistry = Arc<Mutex<SessionRegistry>>;

#[derive(Debug)]
struct SessionEntry {
    session: CallSession,
    /// A network operation is in flight on this session
    busy: bool,
    dtmf: Arc<DtmfLane>,
}

/// Result of removing a session that reached a terminal state
#[derive(Debug, Clone)]
pub struct FinishedSession {
    pub session: CallSession,
    pub outcome: CallOutcome,
    /// Source of an attended transfer whose consultation just ended and
    /// which must be taken off hold
    pub unhold_source: Option<SessionId>,
}

/// Running call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounters {
    pub total: u64,
    pub answered: u64,
    pub inbound: u64,
    pub outbound: u64,
}

/// Every live call session with its line binding, transfer links and
/// busy flag.
///
/// All mutation goes through this type, so published events always match
/// the state they describe. It sits behind a shared mutex that is never
/// held across an `.await`.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionEntry>,
    by_handle: HashMap<CallHandle, SessionId>,
    lines: LineTable,
    /// Inbound sessions waiting for a line, oldest first
    unassigned: VecDeque<SessionId>,
    transfers: HashMap<TransferId, TransferOperation>,
    next_id: u64,
    counters: CallCounters,
    events: EventBus,
}

impl SessionRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            sessions: HashMap::new(),
            by_handle: HashMap::new(),
            lines: LineTable::new(),
            unassigned: VecDeque::new(),
            transfers: HashMap::new(),
            next_id: 1,
            counters: CallCounters::default(),
            events,
        }
    }

    fn allocate_id(&mut self) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, session: CallSession, busy: bool) {
        self.counters.total += 1;
        match session.direction {
            CallDirection::Inbound => self.counters.inbound += 1,
            CallDirection::Outbound => self.counters.outbound += 1,
        }
        self.by_handle.insert(session.handle.clone(), session.id);
        self.events.emit(EngineEvent::SessionCreated {
            session: session.clone(),
        });
        self.sessions.insert(
            session.id,
            SessionEntry {
                session,
                busy,
                dtmf: Arc::new(DtmfLane::new()),
            },
        );
    }

    /// Create an outbound session in `Initiating` bound to a line.
    ///
    /// The session starts busy: the caller owns the invite operation and
    /// must release it with [`end_op`](Self::end_op).
    pub fn create_outbound(
        &mut self,
        handle: CallHandle,
        target: &str,
        line_hint: Option<LineNumber>,
        force_select: bool,
    ) -> SoftphoneResult<(SessionId, LineNumber)> {
        if !self.lines.has_free_line() {
            return Err(SoftphoneError::NoLineAvailable);
        }
        let id = self.allocate_id();
        let line = self
            .lines
            .allocate_preferred(id, line_hint)
            .ok_or(SoftphoneError::NoLineAvailable)?;
        self.lines.set_state(line, LineState::Dialing);

        let mut session = CallSession::new(
            id,
            handle,
            CallDirection::Outbound,
            CallState::Initiating,
            crate::call::number_from_uri(target),
        );
        session.remote_identity = Some(target.to_string());
        session.line = Some(line);
        self.insert(session, true);

        if force_select || !self.selection_locked() {
            self.select_internal(line);
        }
        info!(session_id = %id, line = line.get(), target = target, "Outbound session created");
        Ok((id, line))
    }

    /// Create an inbound session in `Ringing`. Binds a line when one is free,
    /// otherwise queues the session until a line is released.
    pub fn create_inbound(
        &mut self,
        handle: CallHandle,
        number: String,
        identity: String,
        display_name: Option<String>,
    ) -> (SessionId, Option<LineNumber>) {
        let id = self.allocate_id();
        let line = self.lines.allocate(id);

        let mut session = CallSession::new(id, handle, CallDirection::Inbound, CallState::Ringing, number);
        session.remote_identity = Some(identity);
        session.remote_display_name = display_name;
        session.line = line;
        if let Some(line) = line {
            self.lines.set_state(line, LineState::Ringing);
        } else {
            self.unassigned.push_back(id);
        }
        self.insert(session, false);

        match line {
            Some(line) => {
                if !self.lines.others_busy(line) {
                    self.select_internal(line);
                }
                info!(session_id = %id, line = line.get(), "Inbound session created");
            }
            None => {
                info!(session_id = %id, waiting = self.unassigned.len(), "Inbound session waiting for a free line");
            }
        }
        (id, line)
    }

    pub fn get(&self, id: SessionId) -> Option<CallSession> {
        self.sessions.get(&id).map(|entry| entry.session.clone())
    }

    pub fn state_of(&self, id: SessionId) -> Option<CallState> {
        self.sessions.get(&id).map(|entry| entry.session.state)
    }

    pub fn find_by_handle(&self, handle: &CallHandle) -> Option<SessionId> {
        self.by_handle.get(handle).copied()
    }

    pub fn dtmf_lane(&self, id: SessionId) -> Option<Arc<DtmfLane>> {
        self.sessions.get(&id).map(|entry| entry.dtmf.clone())
    }

    /// Snapshot of every live session ordered by id
    pub fn sessions(&self) -> Vec<CallSession> {
        let mut sessions: Vec<_> = self.sessions.values().map(|e| e.session.clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn lines(&self) -> &LineTable {
        &self.lines
    }

    pub fn counters(&self) -> CallCounters {
        self.counters
    }

    pub fn unassigned(&self) -> Vec<SessionId> {
        self.unassigned.iter().copied().collect()
    }

    /// Mark `id` busy after `check` accepts its current state.
    ///
    /// A session already busy fails with `SessionBusy` before the state check.
    pub fn begin_op<F>(&mut self, id: SessionId, check: F) -> SoftphoneResult<CallSession>
    where
        F: FnOnce(&CallSession, &SessionRegistry) -> SoftphoneResult<()>,
    {
        let entry = self
            .sessions
            .get(&id)
            .ok_or(SoftphoneError::SessionNotFound { session_id: id })?;
        if entry.busy {
            return Err(SoftphoneError::SessionBusy { session_id: id });
        }
        check(&entry.session, self)?;
        let entry = self
            .sessions
            .get_mut(&id)
            .ok_or(SoftphoneError::SessionNotFound { session_id: id })?;
        entry.busy = true;
        Ok(entry.session.clone())
    }

    /// Clear the busy flag; a session that already ended is ignored
    pub fn end_op(&mut self, id: SessionId) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.busy = false;
        }
    }

    pub fn is_busy(&self, id: SessionId) -> bool {
        self.sessions.get(&id).map_or(false, |e| e.busy)
    }

    /// Move a live session along a non-terminal FSM edge.
    ///
    /// Returns the previous state. Moving to the current state is a no-op.
    pub fn transition(&mut self, id: SessionId, next: CallState, reason: Option<String>) -> SoftphoneResult<CallState> {
        let entry = self
            .sessions
            .get_mut(&id)
            .ok_or(SoftphoneError::SessionGone { session_id: id })?;
        let previous = entry.session.state;
        if previous == next {
            return Ok(previous);
        }
        if next.is_terminal() || !previous.can_transition_to(next) {
            return Err(SoftphoneError::invalid_state(format!("transition to {}", next), previous));
        }

        entry.session.state = next;
        if next == CallState::Established && entry.session.answered_at.is_none() {
            entry.session.answered_at = Some(Utc::now());
            self.counters.answered += 1;
        }
        let line = entry.session.line;
        if let Some(line) = line {
            self.lines
                .set_state(line, LineState::from_call(next, entry.session.direction));
        }
        debug!(session_id = %id, from = %previous, to = %next, "Session state changed");
        self.events.emit(EngineEvent::SessionStateChanged {
            session_id: id,
            previous,
            current: next,
            line,
            reason,
            timestamp: Utc::now(),
        });
        Ok(previous)
    }

    /// Apply a local attribute change and publish `SessionUpdated`
    pub fn update<F>(&mut self, id: SessionId, apply: F) -> SoftphoneResult<CallSession>
    where
        F: FnOnce(&mut CallSession),
    {
        let entry = self
            .sessions
            .get_mut(&id)
            .ok_or(SoftphoneError::SessionGone { session_id: id })?;
        apply(&mut entry.session);
        let session = entry.session.clone();
        self.events.emit(EngineEvent::SessionUpdated {
            session: session.clone(),
        });
        Ok(session)
    }

    pub fn record_response_code(&mut self, id: SessionId, code: u16) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.session.last_response_code = Some(code);
        }
    }

    /// Bind a session without a line to the lowest free line
    pub fn bind_line(&mut self, id: SessionId) -> SoftphoneResult<LineNumber> {
        let entry = self
            .sessions
            .get_mut(&id)
            .ok_or(SoftphoneError::SessionGone { session_id: id })?;
        if let Some(line) = entry.session.line {
            return Ok(line);
        }
        let line = self.lines.allocate(id).ok_or(SoftphoneError::NoLineAvailable)?;
        entry.session.line = Some(line);
        self.lines
            .set_state(line, LineState::from_call(entry.session.state, entry.session.direction));
        self.unassigned.retain(|waiting| *waiting != id);
        self.events.emit(EngineEvent::LineAssigned { line, session_id: id });
        Ok(line)
    }

    /// Remove a session that reached `state` (terminal) and publish its end.
    ///
    /// Releases the line, cancels pending DTMF, detaches transfers and hands
    /// the freed line to the oldest waiting session. Returns `None` when the
    /// session is already gone.
    pub fn finish(
        &mut self,
        id: SessionId,
        state: CallState,
        outcome: CallOutcome,
        reason: Option<String>,
    ) -> Option<FinishedSession> {
        debug_assert!(state.is_terminal());
        let mut entry = self.sessions.remove(&id)?;
        self.by_handle.remove(&entry.session.handle);
        self.unassigned.retain(|waiting| *waiting != id);
        entry.dtmf.cancel();

        let previous = entry.session.state;
        let now = Utc::now();
        entry.session.state = state;
        entry.session.ended_at = Some(now);
        let freed = entry.session.line;
        if let Some(line) = freed {
            self.lines.release(line);
        }

        info!(
            session_id = %id,
            outcome = %outcome,
            duration_secs = entry.session.duration().as_secs(),
            "Session ended"
        );
        self.events.emit(EngineEvent::SessionStateChanged {
            session_id: id,
            previous,
            current: state,
            line: freed,
            reason: reason.clone(),
            timestamp: now,
        });
        self.events.emit(EngineEvent::SessionTerminated {
            session_id: id,
            outcome,
            duration: entry.session.duration(),
            reason,
        });
        if entry.session.answered_at.is_some() {
            self.events.emit(EngineEvent::CallRecorded {
                record: entry.session.to_record(outcome),
            });
        }

        let unhold_source = self.detach_transfers(id);
        if let Some(line) = freed {
            self.assign_waiting(line);
        }

        Some(FinishedSession {
            session: entry.session,
            outcome,
            unhold_source,
        })
    }

    fn detach_transfers(&mut self, id: SessionId) -> Option<SessionId> {
        let affected: Vec<TransferId> = self
            .transfers
            .iter()
            .filter(|(_, op)| op.involves(id))
            .map(|(tid, _)| *tid)
            .collect();

        let mut unhold = None;
        for tid in affected {
            let Some(mut op) = self.transfers.remove(&tid) else {
                continue;
            };
            op.phase = TransferPhase::Cancelled;
            if op.source == id {
                info!(transfer_id = %op.id, "Transfer source ended; consultation continues as a normal call");
            } else {
                info!(transfer_id = %op.id, "Consultation ended before completion; cancelling transfer");
                if let Some(line) = self.lines.line_of(op.source) {
                    self.select_internal(line);
                }
                let source_held = self.state_of(op.source) == Some(CallState::Held);
                if source_held && !op.source_was_held {
                    unhold = Some(op.source);
                }
            }
            self.events.emit(EngineEvent::TransferCancelled { transfer: op });
        }
        unhold
    }

    fn assign_waiting(&mut self, line: LineNumber) {
        while let Some(waiting) = self.unassigned.pop_front() {
            let Some(entry) = self.sessions.get_mut(&waiting) else {
                continue;
            };
            if entry.session.line.is_some() {
                continue;
            }
            if self.lines.allocate_preferred(waiting, Some(line)).is_none() {
                self.unassigned.push_front(waiting);
                return;
            }
            let bound = self.lines.line_of(waiting).unwrap_or(line);
            entry.session.line = Some(bound);
            self.lines
                .set_state(bound, LineState::from_call(entry.session.state, entry.session.direction));
            info!(session_id = %waiting, line = bound.get(), "Waiting session assigned to released line");
            self.events.emit(EngineEvent::LineAssigned {
                line: bound,
                session_id: waiting,
            });
            if !self.lines.others_busy(bound) {
                self.select_internal(bound);
            }
            return;
        }
    }

    fn select_internal(&mut self, line: LineNumber) {
        if self.lines.select(line) {
            self.events.emit(EngineEvent::LineSelected {
                line,
                session_id: self.lines.session_on(line),
            });
        }
    }

    /// A transfer is in flight on the foreground session
    pub fn selection_locked(&self) -> bool {
        self.lines
            .selected_session()
            .map_or(false, |selected| self.transfer_for(selected).is_some())
    }

    /// Operator line switch
    pub fn select_line(&mut self, line: LineNumber) -> SoftphoneResult<()> {
        if line != self.lines.selected() && self.selection_locked() {
            return Err(SoftphoneError::invalid_state(
                "select_line",
                "transfer in progress on the selected line",
            ));
        }
        self.select_internal(line);
        Ok(())
    }

    /// Bring the session's line to the foreground unless a transfer pins the
    /// current selection
    pub fn focus_session(&mut self, id: SessionId) {
        let Some(line) = self.lines.line_of(id) else {
            return;
        };
        if !self.selection_locked() {
            self.select_internal(line);
        }
    }

    pub fn insert_transfer(&mut self, op: TransferOperation) {
        self.events.emit(EngineEvent::TransferInitiated { transfer: op.clone() });
        self.transfers.insert(op.id, op);
    }

    /// Link a freshly created consultation to its transfer
    pub fn link_consultation(&mut self, transfer: TransferId, consultation: SessionId) {
        if let Some(op) = self.transfers.get_mut(&transfer) {
            op.consultation = Some(consultation);
        }
    }

    pub fn transfer(&self, id: TransferId) -> Option<TransferOperation> {
        self.transfers.get(&id).cloned()
    }

    /// In-flight transfer touching `session` as source or consultation
    pub fn transfer_for(&self, session: SessionId) -> Option<TransferOperation> {
        self.transfers
            .values()
            .find(|op| op.involves(session) && op.is_in_flight())
            .cloned()
    }

    /// Session is the consultation leg of an in-flight attended transfer
    pub fn is_consultation(&self, session: SessionId) -> bool {
        self.transfers
            .values()
            .any(|op| op.consultation == Some(session) && op.is_in_flight())
    }

    /// Advance a transfer's phase and publish progress
    pub fn set_transfer_phase(&mut self, id: TransferId, phase: TransferPhase) -> Option<TransferOperation> {
        let op = self.transfers.get_mut(&id)?;
        if op.phase == phase {
            return Some(op.clone());
        }
        op.phase = phase;
        let snapshot = op.clone();
        self.events.emit(EngineEvent::TransferProgress {
            transfer: snapshot.clone(),
        });
        Some(snapshot)
    }

    /// Remove a transfer without publishing anything
    pub fn take_transfer(&mut self, id: TransferId) -> Option<TransferOperation> {
        self.transfers.remove(&id)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    /// Publish an event while the caller still holds the lock, keeping it
    /// ordered with the state change it describes
    pub fn emit(&self, event: EngineEvent) {
        self.events.emit(event);
    }
}

/// Clears a session's busy flag when dropped.
///
/// Must never be dropped while the registry lock is held by the same task.
#[must_use = "dropping the guard ends the operation"]
pub(crate) struct OpGuard {
    registry: SharedRegistry,
    id: SessionId,
}

impl OpGuard {
    pub(crate) fn acquire<F>(registry: &SharedRegistry, id: SessionId, check: F) -> SoftphoneResult<(Self, CallSession)>
    where
        F: FnOnce(&CallSession, &SessionRegistry) -> SoftphoneResult<()>,
    {
        let session = registry.lock().begin_op(id, check)?;
        Ok((Self::adopt(registry, id), session))
    }

    /// Take over a busy flag set elsewhere (outbound creation)
    pub(crate) fn adopt(registry: &SharedRegistry, id: SessionId) -> Self {
        Self {
            registry: registry.clone(),
            id,
        }
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.registry.lock().end_op(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::transfer::TransferMode;

    fn registry() -> (SessionRegistry, crate::events::EventSubscription) {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::all());
        (SessionRegistry::new(bus), sub)
    }

    fn inbound(reg: &mut SessionRegistry, n: u32) -> (SessionId, Option<LineNumber>) {
        reg.create_inbound(
            CallHandle(format!("in-{}", n)),
            format!("10{}", n),
            format!("sip:10{}@pbx", n),
            None,
        )
    }

    #[test]
    fn test_fourth_inbound_waits_then_takes_freed_line() {
        let (mut reg, _sub) = registry();
        let lines: Vec<_> = (1..=3).map(|n| inbound(&mut reg, n).1).collect();
        assert_eq!(lines, vec![LineNumber::new(1), LineNumber::new(2), LineNumber::new(3)]);

        let (fourth, line) = inbound(&mut reg, 4);
        assert_eq!(line, None);
        assert_eq!(reg.unassigned(), vec![fourth]);

        reg.finish(SessionId(2), CallState::Terminated, CallOutcome::Missed, None);
        assert_eq!(reg.get(fourth).and_then(|s| s.line), LineNumber::new(2));
        assert!(reg.unassigned().is_empty());
    }

    #[test]
    fn test_outbound_without_free_line_fails() {
        let (mut reg, _sub) = registry();
        for n in 1..=3 {
            inbound(&mut reg, n);
        }
        let result = reg.create_outbound(CallHandle::generate(), "sip:200@pbx", None, false);
        assert_eq!(result, Err(SoftphoneError::NoLineAvailable));
        assert_eq!(reg.sessions().len(), 3);
    }

    #[test]
    fn test_busy_session_rejects_second_operation() {
        let (mut reg, _sub) = registry();
        let (id, _) = inbound(&mut reg, 1);
        reg.begin_op(id, |_, _| Ok(())).unwrap();
        assert_eq!(
            reg.begin_op(id, |_, _| Ok(())),
            Err(SoftphoneError::SessionBusy { session_id: id })
        );
        reg.end_op(id);
        assert!(reg.begin_op(id, |_, _| Ok(())).is_ok());
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let (mut reg, _sub) = registry();
        let (id, _) = inbound(&mut reg, 1);
        let result = reg.transition(id, CallState::Held, None);
        assert!(matches!(result, Err(SoftphoneError::InvalidState { .. })));
        assert_eq!(reg.state_of(id), Some(CallState::Ringing));
    }

    #[test]
    fn test_record_only_for_answered_calls() {
        let (mut reg, mut sub) = registry();
        let (missed, _) = inbound(&mut reg, 1);
        let (answered, _) = inbound(&mut reg, 2);
        reg.transition(answered, CallState::Established, None).unwrap();
        sub.drain();

        reg.finish(missed, CallState::Terminated, CallOutcome::Missed, None);
        reg.finish(answered, CallState::Terminated, CallOutcome::Completed, None);
        let records: Vec<_> = sub
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::CallRecorded { record } => Some(record.session_id),
                _ => None,
            })
            .collect();
        assert_eq!(records, vec![answered]);
        assert_eq!(reg.counters().answered, 1);
    }

    #[test]
    fn test_consultation_end_requests_unhold() {
        let (mut reg, _sub) = registry();
        let (source, _) = inbound(&mut reg, 1);
        reg.transition(source, CallState::Established, None).unwrap();
        reg.transition(source, CallState::Held, None).unwrap();

        let op = TransferOperation::new(source, "2001", TransferMode::Attended, false);
        let tid = op.id;
        reg.insert_transfer(op);
        let (consult, _) = reg
            .create_outbound(CallHandle::generate(), "2001", None, true)
            .unwrap();
        reg.link_consultation(tid, consult);
        assert!(reg.selection_locked());

        let finished = reg
            .finish(consult, CallState::Failed, CallOutcome::Busy, None)
            .unwrap();
        assert_eq!(finished.unhold_source, Some(source));
        assert_eq!(reg.transfer_count(), 0);
        assert_eq!(reg.lines().selected_session(), Some(source));
    }

    #[test]
    fn test_op_guard_releases_on_drop() {
        let (reg, _sub) = registry();
        let shared: SharedRegistry = Arc::new(Mutex::new(reg));
        let (id, _) = inbound(&mut shared.lock(), 1);
        {
            let (_guard, _) = OpGuard::acquire(&shared, id, |_, _| Ok(())).unwrap();
            assert!(shared.lock().is_busy(id));
        }
        assert!(!shared.lock().is_busy(id));
    }
}
