//! Trial outcome classification.
//!
//! Scans console fragments for the status phrases the provisioning firmware
//! prints and decides, once per trial, whether the attempt passed.
//!
//! ## Marker priority (per fragment)
//!
//! ```text
//! 1. failure markers        → finished, code -1
//! 2. tentative success      → code 0, NOT finished
//! 3. success marker         → finished, code 0
//! ```
//!
//! In strict two-stage mode the success marker only finishes the trial; the
//! code stays whatever rule 2 primed it to, so a success phrase without the
//! tentative marker before it counts as a failure.
//!
//! The first rule that finishes the trial wins; later rules are not consulted
//! for that fragment.

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

pub const PROVISIONING_FAILED: &str = "Provisioning was not successful.";
pub const DEVICE_REBOOTING: &str = "Rebooting...";
pub const PROVISIONEE_TERMINAL: &str = "Ffs Wi-Fi provisionee task reached terminal state";
pub const PROVISIONING_SUCCEEDED: &str = "Provisioning was successful.";

/// Longest incomplete line carried into the next scan.
const MAX_CARRY: usize = 4096;

/// Final decision for one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

impl Verdict {
    /// Status code as the firmware test scripts report it: 0 or -1.
    pub fn code(self) -> i32 {
        match self {
            Verdict::Success => 0,
            Verdict::Failure => -1,
        }
    }
}

/// Terminal result recorded for a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// No verdict before the per-trial timeout.
    Unknown,
}

impl Outcome {
    /// 0 for success, -1 otherwise; `code() + 1` is the trial's contribution
    /// to the success count.
    pub fn code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure | Outcome::Unknown => -1,
        }
    }

    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

impl From<Verdict> for Outcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Success => Outcome::Success,
            Verdict::Failure => Outcome::Failure,
        }
    }
}

/// Compiled marker phrases, in the order they are checked.
#[derive(Debug, Clone)]
pub struct MarkerSet {
    failure: Vec<Regex>,
    tentative_success: Regex,
    success: Regex,
}

impl MarkerSet {
    /// Build a marker set from raw patterns. Patterns are regular expressions,
    /// so the trailing dots of the stock phrases match any character.
    pub fn new<S: AsRef<str>>(failure: &[S], tentative_success: &str, success: &str) -> Result<Self> {
        let failure = failure
            .iter()
            .map(|p| compile(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            failure,
            tentative_success: compile(tentative_success)?,
            success: compile(success)?,
        })
    }

    /// The phrases printed by the FFS provisioning firmware.
    pub fn ffs_default() -> Self {
        Self {
            failure: vec![
                Regex::new(PROVISIONING_FAILED).unwrap(),
                Regex::new(DEVICE_REBOOTING).unwrap(),
            ],
            tentative_success: Regex::new(PROVISIONEE_TERMINAL).unwrap(),
            success: Regex::new(PROVISIONING_SUCCEEDED).unwrap(),
        }
    }
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self::ffs_default()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid marker pattern {pattern:?}"))
}

/// Per-trial scan state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierState {
    pub finished: bool,
    pub return_code: i32,
}

impl Default for ClassifierState {
    fn default() -> Self {
        Self {
            finished: false,
            return_code: -1,
        }
    }
}

/// Marker-driven outcome state machine.
///
/// Call [`reset`](Self::reset) at the start of every trial and feed each
/// fragment to [`observe`](Self::observe) until it returns a verdict.
pub struct OutcomeClassifier {
    markers: MarkerSet,
    strict_two_stage: bool,
    state: ClassifierState,
    carry: String,
}

impl OutcomeClassifier {
    pub fn new(markers: MarkerSet) -> Self {
        Self {
            markers,
            strict_two_stage: false,
            state: ClassifierState::default(),
            carry: String::new(),
        }
    }

    /// Require the tentative marker before the success marker counts.
    pub fn with_strict_two_stage(mut self, strict: bool) -> Self {
        self.strict_two_stage = strict;
        self
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ClassifierState::default();
        self.carry.clear();
    }

    /// The verdict, once one has been reached.
    pub fn verdict(&self) -> Option<Verdict> {
        if !self.state.finished {
            return None;
        }
        Some(if self.state.return_code == 0 {
            Verdict::Success
        } else {
            Verdict::Failure
        })
    }

    /// Consume one fragment. Returns the verdict as soon as the trial is
    /// decided; fragments after that are ignored.
    pub fn observe(&mut self, fragment: &str) -> Option<Verdict> {
        if self.state.finished {
            return self.verdict();
        }

        // A marker can straddle two reads; scan the unfinished line from the
        // previous fragment together with this one.
        let mut window = std::mem::take(&mut self.carry);
        window.push_str(fragment);

        if self.markers.failure.iter().any(|m| m.is_match(&window)) {
            self.state.finished = true;
            self.state.return_code = -1;
        }
        if !self.state.finished && self.markers.tentative_success.is_match(&window) {
            debug!("provisionee reached terminal state");
            self.state.return_code = 0;
        }
        if !self.state.finished && self.markers.success.is_match(&window) {
            self.state.finished = true;
            if !self.strict_two_stage {
                self.state.return_code = 0;
            }
        }

        if !self.state.finished {
            self.carry = trailing_line(&window).to_string();
        }
        self.verdict()
    }
}

/// Text after the last newline, bounded to `MAX_CARRY` bytes.
fn trailing_line(text: &str) -> &str {
    let tail = match text.rfind('\n') {
        Some(pos) => &text[pos + 1..],
        None => text,
    };
    if tail.len() <= MAX_CARRY {
        return tail;
    }
    let mut start = tail.len() - MAX_CARRY;
    while !tail.is_char_boundary(start) {
        start += 1;
    }
    &tail[start..]
}
