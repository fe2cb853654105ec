//! Trial loop.
//!
//! Runs N provisioning trials back to back against one device session:
//!
//! ```text
//! settle → for each trial:
//!            reset classifier → stream fragments into log + classifier
//!            → verdict (or timeout) → rename log → restart device → sleep
//!        → stop monitor → summary
//! ```
//!
//! Trials are never retried; a failed trial still counts toward N.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::classifier::{Outcome, OutcomeClassifier};
use crate::error::Result;
use crate::reader::{ByteSource, StreamReader};
use crate::session::DeviceControl;
use crate::trial_log::TrialLog;

/// Everything the trial loop needs to know, passed in explicitly.
#[derive(Debug, Clone)]
pub struct TrialSettings {
    pub num_trials: u32,
    /// Pause after each restart so the device can reboot.
    pub sleep_time: Duration,
    /// Pause after the session starts, before the first trial.
    pub settle_delay: Duration,
    pub log_prefix: String,
    /// `None` waits for a verdict forever.
    pub trial_timeout: Option<Duration>,
    /// Mirror console output to stdout.
    pub echo_console: bool,
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            num_trials: 1,
            sleep_time: Duration::from_secs(5),
            settle_delay: Duration::from_secs(2),
            log_prefix: "log".to_string(),
            trial_timeout: None,
            echo_console: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRecord {
    pub index: u32,
    pub outcome: Outcome,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub records: Vec<TrialRecord>,
}

impl RunSummary {
    pub fn trials(&self) -> usize {
        self.records.len()
    }

    pub fn successes(&self) -> usize {
        self.records
            .iter()
            .map(|r| (r.outcome.code() + 1) as usize)
            .sum()
    }

    pub fn timeouts(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.outcome == Outcome::Unknown)
            .count()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tried {} times, with {} successes.",
            self.trials(),
            self.successes()
        )
    }
}

/// Drives trials over a device that is both a console source and a control
/// sink.
pub struct TrialOrchestrator<D> {
    reader: StreamReader<D>,
    classifier: OutcomeClassifier,
    settings: TrialSettings,
    echo_failed: bool,
}

impl<D: ByteSource + DeviceControl> TrialOrchestrator<D> {
    pub fn new(reader: StreamReader<D>, classifier: OutcomeClassifier, settings: TrialSettings) -> Self {
        Self {
            reader,
            classifier,
            settings,
            echo_failed: false,
        }
    }

    pub fn device(&self) -> &D {
        self.reader.get_ref()
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.reader.get_mut()
    }

    /// Run every trial, then send the stop key.
    ///
    /// Decode and log I/O errors abort the run. Control write failures are
    /// only logged.
    pub fn run(&mut self) -> Result<RunSummary> {
        if !self.settings.settle_delay.is_zero() {
            debug!(delay_ms = self.settings.settle_delay.as_millis() as u64, "waiting for session to settle");
            thread::sleep(self.settings.settle_delay);
        }

        let total = self.settings.num_trials;
        let mut summary = RunSummary::default();
        for index in 0..total {
            info!("trial {}/{}", index + 1, total);
            let record = self.run_trial(index)?;
            summary.records.push(record);

            if let Err(e) = self.device_mut().restart() {
                warn!(trial = index, "failed to send restart to monitor: {e}");
            }
            thread::sleep(self.settings.sleep_time);
        }

        if let Err(e) = self.device_mut().stop() {
            warn!("failed to send stop to monitor: {e}");
        }
        info!(
            trials = summary.trials(),
            successes = summary.successes(),
            timeouts = summary.timeouts(),
            "run finished"
        );
        Ok(summary)
    }

    fn run_trial(&mut self, index: u32) -> Result<TrialRecord> {
        self.classifier.reset();
        let mut log = TrialLog::create(&self.settings.log_prefix, index)?;
        let deadline = self.settings.trial_timeout.map(|t| Instant::now() + t);

        let outcome = loop {
            let Some(fragment) = self.reader.next_fragment(deadline)? else {
                warn!(trial = index, "no verdict before the trial timeout");
                break Outcome::Unknown;
            };

            if self.settings.echo_console {
                self.echo(&fragment);
            }
            log.append(&fragment)?;

            if let Some(verdict) = self.classifier.observe(&fragment) {
                break Outcome::from(verdict);
            }
            // A chatty device never lets the reader hit its idle deadline.
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(trial = index, "no verdict before the trial timeout");
                break Outcome::Unknown;
            }
        };

        match outcome {
            Outcome::Success => info!(trial = index, "provisioning succeeded"),
            Outcome::Failure => info!(trial = index, "provisioning failed"),
            Outcome::Unknown => info!(trial = index, "provisioning outcome unknown"),
        }

        let log_path = log.finish(outcome)?;
        Ok(TrialRecord {
            index,
            outcome,
            log_path,
        })
    }

    fn echo(&mut self, fragment: &str) {
        mirror(&mut std::io::stdout().lock(), fragment, &mut self.echo_failed);
    }
}

/// Copy a fragment to `out`. Only the first failure is logged; `failed`
/// remembers it.
fn mirror<W: Write>(out: &mut W, fragment: &str, failed: &mut bool) {
    let result = out.write_all(fragment.as_bytes()).and_then(|()| out.flush());
    if let Err(e) = result {
        if !*failed {
            debug!("console mirroring to stdout failed: {e}");
            *failed = true;
        }
    }
}
