//! Hardware-in-the-loop provisioning trial harness.
//!
//! Launches a device monitor in a PTY, watches its console for provisioning
//! status markers, keeps one transcript per trial and restarts the device
//! between trials.

pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod reader;
pub mod session;
pub mod trial_log;

pub use classifier::{MarkerSet, Outcome, OutcomeClassifier, Verdict};
pub use error::HarnessError;
pub use orchestrator::{RunSummary, TrialOrchestrator, TrialRecord, TrialSettings};
pub use reader::{ByteSource, StreamReader};
pub use session::{DeviceControl, DeviceSession, MonitorSettings};
