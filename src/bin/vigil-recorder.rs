//! Recorder process: accepts frame streams and persists them as segments.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vigil::VigilConfig;
use vigil::recording::FileSegmentStore;
use vigil::stream::StreamServer;

#[derive(Debug, Parser)]
#[command(name = "vigil-recorder", version, about = "Record streamed camera frames into segment files")]
struct Cli {
    /// YAML configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Listen address, overrides server.address
    #[arg(short = 'a', long = "address")]
    address: Option<SocketAddr>,

    /// Segment directory, overrides recording.output_dir
    #[arg(short = 'o', long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// Worker threads, overrides server.workers
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,
}

impl Cli {
    fn resolve_config(&self) -> anyhow::Result<VigilConfig> {
        let mut config = match &self.config {
            Some(path) => VigilConfig::load(path)?,
            None => VigilConfig::default(),
        };
        if let Some(address) = self.address {
            config.server.address = address;
        }
        if let Some(dir) = &self.output_dir {
            config.recording.output_dir = dir.clone();
        }
        if let Some(workers) = self.workers {
            config.server.workers = workers;
        }
        config.validate().map_err(anyhow::Error::msg).context("invalid command line overrides")?;
        config.verify_output_dir()?;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "vigil=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    tracing::info!("Starting vigil-recorder v{}", env!("CARGO_PKG_VERSION"));

    let store = FileSegmentStore::new(&config.recording.output_dir);
    let recorder = StreamServer::start(&config, store).context("starting recorder")?;
    tracing::info!(
        "Recording to {} on {}",
        config.recording.output_dir.display(),
        recorder.local_addr()
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");

    let timeout = config.shutdown_timeout();
    tokio::task::spawn_blocking(move || recorder.shutdown(timeout))
        .await
        .context("shutdown task")??;

    tracing::info!("Recorder stopped");
    Ok(())
}
