use std::path::PathBuf;

use clap::Parser;

use crate::config::HarnessConfig;

#[derive(Parser, Debug)]
#[command(
    name = "ffs-harness",
    about = "Run repeated provisioning trials against a device through its serial monitor",
    version
)]
pub struct Cli {
    /// Seconds to wait after restarting the device before the next trial (5-10 recommended)
    #[arg(short, long = "sleep-time", value_name = "SECS")]
    pub sleep_time: Option<u64>,

    /// Number of trials to run
    #[arg(short, long = "num-trials", value_name = "N")]
    pub num_trials: Option<u32>,

    /// Logs are written to <PREFIX>_<TRIAL>_<SUCCESS|FAIL>.txt
    #[arg(short = 'p', long = "log-prefix", value_name = "PREFIX")]
    pub log_prefix: Option<String>,

    /// Give up on a trial with no verdict after this many seconds
    #[arg(long = "trial-timeout", value_name = "SECS")]
    pub trial_timeout: Option<u64>,

    /// Monitor command to run inside the PTY
    #[arg(long, value_name = "CMD")]
    pub command: Option<String>,

    /// Config file (default: nearest .ffs-harness/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Do not mirror the device console to stdout
    #[arg(long)]
    pub no_echo: bool,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Overlay command-line flags on top of the loaded config.
    pub fn apply(&self, config: &mut HarnessConfig) {
        if let Some(secs) = self.sleep_time {
            config.trials.sleep_time_secs = secs;
        }
        if let Some(n) = self.num_trials {
            config.trials.num_trials = n;
        }
        if let Some(prefix) = &self.log_prefix {
            config.trials.log_prefix = prefix.clone();
        }
        if let Some(secs) = self.trial_timeout {
            config.trials.timeout_secs = secs;
        }
        if let Some(command) = &self.command {
            config.monitor.command = command.clone();
        }
        if self.no_echo {
            config.trials.echo_console = false;
        }
    }
}
