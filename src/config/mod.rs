use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::{
    DEVICE_REBOOTING, MarkerSet, PROVISIONEE_TERMINAL, PROVISIONING_FAILED, PROVISIONING_SUCCEEDED,
};
use crate::orchestrator::TrialSettings;
use crate::reader::{DEFAULT_CHUNK_SIZE, DEFAULT_POLL_INTERVAL};
use crate::session::{DEFAULT_MONITOR_COMMAND, MonitorSettings};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".ffs-harness";

fn default_monitor_command() -> String {
    DEFAULT_MONITOR_COMMAND.to_string()
}

fn default_settle_delay_millis() -> u64 {
    2000
}

fn default_shutdown_grace_millis() -> u64 {
    1000
}

fn default_num_trials() -> u32 {
    1
}

fn default_sleep_time_secs() -> u64 {
    5
}

fn default_log_prefix() -> String {
    "log".to_string()
}

fn default_echo_console() -> bool {
    true
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_poll_interval_millis() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_failure_markers() -> Vec<String> {
    vec![PROVISIONING_FAILED.to_string(), DEVICE_REBOOTING.to_string()]
}

fn default_tentative_marker() -> String {
    PROVISIONEE_TERMINAL.to_string()
}

fn default_success_marker() -> String {
    PROVISIONING_SUCCEEDED.to_string()
}

#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_command")]
    pub command: String,
    #[serde(default = "default_settle_delay_millis")]
    pub settle_delay_millis: u64,
    #[serde(default = "default_shutdown_grace_millis")]
    pub shutdown_grace_millis: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            command: default_monitor_command(),
            settle_delay_millis: default_settle_delay_millis(),
            shutdown_grace_millis: default_shutdown_grace_millis(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TrialsConfig {
    #[serde(default = "default_num_trials")]
    pub num_trials: u32,
    #[serde(default = "default_sleep_time_secs")]
    pub sleep_time_secs: u64,
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
    /// 0 disables the per-trial timeout.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default = "default_echo_console")]
    pub echo_console: bool,
}

impl Default for TrialsConfig {
    fn default() -> Self {
        Self {
            num_trials: default_num_trials(),
            sleep_time_secs: default_sleep_time_secs(),
            log_prefix: default_log_prefix(),
            timeout_secs: 0,
            echo_console: default_echo_console(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReaderConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            poll_interval_millis: default_poll_interval_millis(),
        }
    }
}

/// Marker phrases, as regular expressions.
///
/// ```toml
/// [markers]
/// failure = ["Provisioning was not successful.", "Rebooting..."]
/// tentative_success = "Ffs Wi-Fi provisionee task reached terminal state"
/// success = "Provisioning was successful."
/// strict_two_stage = false
/// ```
#[derive(Debug, Deserialize)]
pub struct MarkersConfig {
    #[serde(default = "default_failure_markers")]
    pub failure: Vec<String>,
    #[serde(default = "default_tentative_marker")]
    pub tentative_success: String,
    #[serde(default = "default_success_marker")]
    pub success: String,
    /// Only count the success phrase after the tentative marker.
    #[serde(default)]
    pub strict_two_stage: bool,
}

impl Default for MarkersConfig {
    fn default() -> Self {
        Self {
            failure: default_failure_markers(),
            tentative_success: default_tentative_marker(),
            success: default_success_marker(),
            strict_two_stage: false,
        }
    }
}

impl MarkersConfig {
    pub fn compile(&self) -> Result<MarkerSet> {
        MarkerSet::new(self.failure.as_slice(), &self.tentative_success, &self.success)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct HarnessConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub trials: TrialsConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub markers: MarkersConfig,
}

impl HarnessConfig {
    /// Search upward from `start` for a `.ffs-harness/config.toml` file and
    /// load it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        match Self::find_config_file(start) {
            Some(path) => Ok((Self::load_file(&path)?, Some(path))),
            None => Ok((HarnessConfig::default(), None)),
        }
    }

    /// Load an explicitly named config file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: HarnessConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        Ok(config)
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.reader.chunk_size == 0 {
            bail!("reader.chunk_size must be at least 1");
        }
        if self.reader.poll_interval_millis == 0 {
            bail!("reader.poll_interval_millis must be at least 1");
        }
        if self.monitor.command.trim().is_empty() {
            bail!("monitor.command must not be empty");
        }
        if self.trials.log_prefix.is_empty() {
            bail!("trials.log_prefix must not be empty");
        }
        self.markers.compile()?;
        Ok(())
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            command: self.monitor.command.clone(),
            chunk_size: self.reader.chunk_size,
            ..MonitorSettings::default()
        }
    }

    pub fn trial_settings(&self) -> TrialSettings {
        TrialSettings {
            num_trials: self.trials.num_trials,
            sleep_time: Duration::from_secs(self.trials.sleep_time_secs),
            settle_delay: Duration::from_millis(self.monitor.settle_delay_millis),
            log_prefix: self.trials.log_prefix.clone(),
            trial_timeout: match self.trials.timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            echo_console: self.trials.echo_console,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.reader.poll_interval_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.monitor.shutdown_grace_millis)
    }
}
