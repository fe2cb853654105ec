use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use ffs_harness::cli::Cli;
use ffs_harness::config::HarnessConfig;
use ffs_harness::{DeviceSession, OutcomeClassifier, StreamReader, TrialOrchestrator};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "ffs_harness=info",
        1 => "ffs_harness=debug",
        _ => "ffs_harness=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let (mut config, config_path) = match &cli.config {
        Some(path) => (HarnessConfig::load_file(path)?, Some(path.clone())),
        None => {
            let cwd = std::env::current_dir()
                .context("failed to get current directory (was it deleted?)")?;
            HarnessConfig::load(&cwd)?
        }
    };
    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .ffs-harness/config.toml found, using defaults"),
    }

    cli.apply(&mut config);
    config.validate().context("invalid harness settings")?;

    let markers = config.markers.compile()?;
    let classifier =
        OutcomeClassifier::new(markers).with_strict_two_stage(config.markers.strict_two_stage);

    let session = DeviceSession::spawn(&config.monitor_settings())?;
    let reader = StreamReader::with_settings(session, config.reader.chunk_size, config.poll_interval());
    let mut orchestrator = TrialOrchestrator::new(reader, classifier, config.trial_settings());

    let summary = orchestrator.run()?;

    orchestrator.device_mut().shutdown(config.shutdown_grace());

    println!("{summary}");
    Ok(())
}
