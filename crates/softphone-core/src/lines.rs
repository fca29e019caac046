//! Line allocation
//!
//! The agent works with a fixed set of [`LINE_COUNT`] lines. Each line holds
//! at most one session; a session is bound to at most one line. Exactly one
//! line is selected (foreground) at any time, even when it is idle.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::call::{CallDirection, CallState, SessionId};

/// Number of concurrently manageable call slots
pub const LINE_COUNT: usize = 3;

/// 1-based line number, always within `1..=LINE_COUNT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct LineNumber(u8);

impl LineNumber {
    pub fn new(number: u8) -> Option<Self> {
        (1..=LINE_COUNT as u8)
            .contains(&number)
            .then_some(Self(number))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        usize::from(self.0 - 1)
    }

    /// All lines in ascending order
    pub fn all() -> impl Iterator<Item = LineNumber> {
        (1..=LINE_COUNT as u8).map(LineNumber)
    }
}

impl TryFrom<u8> for LineNumber {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        LineNumber::new(value).ok_or_else(|| format!("line {} out of range 1..={}", value, LINE_COUNT))
    }
}

impl From<LineNumber> for u8 {
    fn from(line: LineNumber) -> u8 {
        line.0
    }
}

impl fmt::Display for LineNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}", self.0)
    }
}

/// Coarse display state of a line, derived from its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineState {
    Idle,
    Ringing,
    Dialing,
    Active,
    Hold,
}

impl LineState {
    pub fn from_call(state: CallState, direction: CallDirection) -> Self {
        match (state, direction) {
            (CallState::Initiating, _) => LineState::Dialing,
            (CallState::Ringing, CallDirection::Outbound) => LineState::Dialing,
            (CallState::Ringing, CallDirection::Inbound) => LineState::Ringing,
            (CallState::Established, _) => LineState::Active,
            (CallState::Held, _) => LineState::Hold,
            (CallState::Terminated | CallState::Failed, _) => LineState::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub number: LineNumber,
    pub session: Option<SessionId>,
    pub state: LineState,
}

impl Line {
    fn idle(number: LineNumber) -> Self {
        Self {
            number,
            session: None,
            state: LineState::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.session.is_none()
    }
}

/// Fixed table of lines plus the foreground selection
#[derive(Debug, Clone)]
pub struct LineTable {
    lines: [Line; LINE_COUNT],
    selected: LineNumber,
}

impl LineTable {
    pub fn new() -> Self {
        Self {
            lines: [
                Line::idle(LineNumber(1)),
                Line::idle(LineNumber(2)),
                Line::idle(LineNumber(3)),
            ],
            selected: LineNumber(1),
        }
    }

    /// Bind `session` to the lowest free line.
    ///
    /// Returns the line the session already holds if it is bound, and `None`
    /// when every line is occupied.
    pub fn allocate(&mut self, session: SessionId) -> Option<LineNumber> {
        if let Some(existing) = self.line_of(session) {
            return Some(existing);
        }
        let line = self.lines.iter_mut().find(|line| line.is_idle())?;
        line.session = Some(session);
        Some(line.number)
    }

    /// Bind to `hint` when it is free, otherwise fall back to [`allocate`](Self::allocate)
    pub fn allocate_preferred(&mut self, session: SessionId, hint: Option<LineNumber>) -> Option<LineNumber> {
        if let Some(existing) = self.line_of(session) {
            return Some(existing);
        }
        if let Some(hint) = hint {
            let line = &mut self.lines[hint.index()];
            if line.is_idle() {
                line.session = Some(session);
                return Some(hint);
            }
        }
        self.allocate(session)
    }

    /// Unbind whatever session holds `line`
    pub fn release(&mut self, line: LineNumber) -> Option<SessionId> {
        let slot = &mut self.lines[line.index()];
        slot.state = LineState::Idle;
        slot.session.take()
    }

    pub fn release_session(&mut self, session: SessionId) -> Option<LineNumber> {
        let line = self.line_of(session)?;
        self.release(line);
        Some(line)
    }

    pub fn line_of(&self, session: SessionId) -> Option<LineNumber> {
        self.lines
            .iter()
            .find(|line| line.session == Some(session))
            .map(|line| line.number)
    }

    pub fn session_on(&self, line: LineNumber) -> Option<SessionId> {
        self.lines[line.index()].session
    }

    pub fn set_state(&mut self, line: LineNumber, state: LineState) {
        self.lines[line.index()].state = state;
    }

    /// Change the foreground line; returns `true` when the selection changed
    pub fn select(&mut self, line: LineNumber) -> bool {
        let changed = self.selected != line;
        self.selected = line;
        changed
    }

    pub fn selected(&self) -> LineNumber {
        self.selected
    }

    pub fn selected_session(&self) -> Option<SessionId> {
        self.session_on(self.selected)
    }

    pub fn occupied_count(&self) -> usize {
        self.lines.iter().filter(|line| !line.is_idle()).count()
    }

    pub fn has_free_line(&self) -> bool {
        self.occupied_count() < LINE_COUNT
    }

    /// Check whether any line other than `line` is in use
    pub fn others_busy(&self, line: LineNumber) -> bool {
        self.lines
            .iter()
            .any(|other| other.number != line && !other.is_idle())
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }
}

impl Default for LineTable {
    fn default() -> Self {
        Self::new()
    }
}
