//! DTMF tone sequencing
//!
//! Tones are sent one at a time per session. Each session owns a
//! [`DtmfLane`]: a queue lock that serializes sequences and a cancellation
//! signal raised when the session terminates, so a sequence still pacing its
//! digits stops and resolves with `SessionGone`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::error::{SoftphoneError, SoftphoneResult};

/// Pacing of DTMF sequences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtmfConfig {
    /// Length of each tone
    pub tone_duration_ms: u64,
    /// Gap between consecutive tones of one sequence
    pub inter_digit_delay_ms: u64,
    /// Length of a `,` pause in a sequence
    pub pause_ms: u64,
}

impl DtmfConfig {
    pub fn tone_duration(&self) -> Duration {
        Duration::from_millis(self.tone_duration_ms)
    }

    pub fn inter_digit_delay(&self) -> Duration {
        Duration::from_millis(self.inter_digit_delay_ms)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

impl Default for DtmfConfig {
    fn default() -> Self {
        Self {
            tone_duration_ms: 100,
            inter_digit_delay_ms: 250,
            pause_ms: 1_000,
        }
    }
}

/// One step of a DTMF sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfStep {
    Tone(char),
    Pause,
}

pub fn is_dtmf_tone(c: char) -> bool {
    matches!(c, '0'..='9' | 'A'..='D' | '*' | '#')
}

/// Parse a dial string such as `"1234#"` or `"9,,123"` into steps.
///
/// Letters are accepted in either case. Whitespace is ignored.
pub fn parse_sequence(digits: &str) -> SoftphoneResult<Vec<DtmfStep>> {
    let mut steps = Vec::with_capacity(digits.len());
    for c in digits.chars().filter(|c| !c.is_whitespace()) {
        let c = c.to_ascii_uppercase();
        if c == ',' {
            steps.push(DtmfStep::Pause);
        } else if is_dtmf_tone(c) {
            steps.push(DtmfStep::Tone(c));
        } else {
            return Err(SoftphoneError::invalid_argument(
                "digits",
                format!("'{}' is not a DTMF tone", c),
            ));
        }
    }
    if !steps.iter().any(|s| matches!(s, DtmfStep::Tone(_))) {
        return Err(SoftphoneError::invalid_argument("digits", "no tones to send"));
    }
    Ok(steps)
}

/// Per-session DTMF queue and cancellation signal
#[derive(Debug)]
pub struct DtmfLane {
    queue: Mutex<()>,
    cancelled: watch::Sender<bool>,
}

impl DtmfLane {
    pub fn new() -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            queue: Mutex::new(()),
            cancelled,
        }
    }

    /// Wait for earlier sequences on this session to finish
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.queue.lock().await
    }

    /// Stop any sequence in progress; later waits return immediately
    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Sleep for `delay`; returns `false` if the lane was cancelled first
    pub async fn pace(&self, delay: Duration) -> bool {
        let mut cancelled = self.cancelled.subscribe();
        if *cancelled.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancelled.wait_for(|c| *c) => false,
        }
    }
}

impl Default for DtmfLane {
    fn default() -> Self {
        Self::new()
    }
}
