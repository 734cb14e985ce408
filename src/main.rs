//! Argus motion capture node

use std::path::PathBuf;
use std::time::Duration;

use argus::capture::FramePool;
use argus::{utils, Config, PipelineMode};
use clap::Parser;
use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "argus", version, about = "Motion-triggered clip capture")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "ARGUS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    mode: Option<PipelineMode>,

    /// Camera document
    #[arg(long)]
    cams: Option<PathBuf>,

    /// Directory of clips for videos mode
    #[arg(long)]
    videos: Option<PathBuf>,

    /// Write motion clips
    #[arg(long)]
    record: bool,

    /// Clip output directory
    #[arg(long)]
    output: Option<PathBuf>,

    /// Pause after every captured frame, in milliseconds
    #[arg(long)]
    frame_delay_ms: Option<u64>,

    /// Seconds to wait for tasks on shutdown
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(mode) = self.mode {
            config.pipeline.mode = mode;
        }
        if let Some(cams) = &self.cams {
            config.pipeline.cams = cams.clone();
        }
        if let Some(videos) = &self.videos {
            config.pipeline.videos = Some(videos.clone());
        }
        if self.record {
            config.record.enabled = true;
        }
        if let Some(output) = &self.output {
            config.record.output = Some(output.clone());
        }
        if let Some(delay) = self.frame_delay_ms {
            config.pipeline.frame_delay_ms = delay;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let cli = Cli::parse();
    info!("Argus launching...");

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    info!(mode = ?config.pipeline.mode, "Configuration loaded");

    let pool = FramePool::new(&config.pool);
    let mut store = utils::build_store(&config, pool)?;

    if let Err(e) = store.open() {
        warn!("{}", e);
    }
    info!("\n{}", store.describe());

    if let Err(e) = store.start() {
        warn!("{}", e);
    }

    if store.is_idle() {
        error!("No stream is running");
    } else {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut tick = tokio::time::interval(Duration::from_millis(500));

        loop {
            tokio::select! {
                res = &mut ctrl_c => {
                    if let Err(e) = res {
                        error!("Failed to listen for ctrl-c: {}", e);
                    }
                    info!("Interrupted");
                    break;
                }
                _ = tick.tick() => {
                    if store.is_idle() {
                        info!("All streams finished");
                        break;
                    }
                }
            }
        }
    }

    let grace = Duration::from_secs(cli.grace_secs);
    let clean = tokio::task::block_in_place(|| store.shutdown(grace));
    info!("\n{}", store.describe());

    if !clean {
        warn!("Exiting with tasks still running");
    }
    info!("Argus shutting down");
    Ok(())
}
