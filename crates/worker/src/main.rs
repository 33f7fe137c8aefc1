// Pixelforge CLI
//
// `run` keeps the workers up until Ctrl-C. Every other subcommand starts the
// workers, submits one operation, prints its result and shuts down.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pixelforge_worker::handlers::Filter;
use pixelforge_worker::{init_logging, LogConfig, LogFormat, Manager, ManagerConfig};

#[derive(Parser)]
#[command(name = "pixelforge")]
#[command(about = "Pixelforge - background image, settings and API workers")]
#[command(version)]
pub struct Cli {
    /// Application data directory
    #[arg(long, env = "PIXELFORGE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Image API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Log format
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    pub log_format: String,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run all workers until interrupted
    Run {
        /// Seconds between stats snapshots
        #[arg(long, default_value = "60")]
        stats_interval: u64,
    },

    /// Generate images from a prompt
    Generate {
        prompt: String,

        /// Number of images
        #[arg(long, short, default_value = "1")]
        n: u32,

        #[arg(long, default_value = "1024x1024")]
        size: String,

        /// Save the results into the gallery
        #[arg(long)]
        save: bool,
    },

    /// Generate images into the gallery and filter each one
    Batch {
        prompt: String,

        #[arg(long, short, default_value = "2")]
        n: u32,

        #[arg(long, default_value = "1024x1024")]
        size: String,

        /// Filter as name[=value], applied to every generated image
        #[arg(long = "filter", short, value_parser = commands::parse_filter)]
        filters: Vec<Filter>,
    },

    /// Create variations of an existing image
    Variation {
        image: PathBuf,

        #[arg(long, short, default_value = "1")]
        n: u32,
    },

    /// Apply filters and resizing to a local image
    Process {
        input: PathBuf,
        output: PathBuf,

        /// Filter as name[=value], e.g. invert, blur=2.5, brightness=-20
        #[arg(long = "filter", short, value_parser = commands::parse_filter)]
        filters: Vec<Filter>,

        /// Resize as WIDTHxHEIGHT
        #[arg(long, value_parser = commands::parse_size)]
        resize: Option<(u32, u32)>,

        /// Ignore aspect ratio when resizing
        #[arg(long)]
        exact: bool,
    },

    /// Export settings, history and favorites
    Export {
        #[arg(long)]
        destination: Option<PathBuf>,

        /// Package gallery images into a zip archive
        #[arg(long)]
        include_images: bool,

        /// Take a backup before exporting
        #[arg(long)]
        backup_first: bool,
    },

    /// Import an export file or archive
    Import { source: PathBuf },

    /// Back up current settings
    Backup {
        #[arg(long, default_value = "manual")]
        reason: String,
    },

    /// Restore a backup (latest when omitted)
    Restore { source: Option<PathBuf> },

    /// Check current settings for problems
    Validate,

    /// Show the last saved worker stats
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_format: LogFormat = cli.log_format.parse().map_err(anyhow::Error::msg)?;
    init_logging(&LogConfig::from_env().with_format(log_format))?;

    let mut config = ManagerConfig::from_env().context("invalid configuration")?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(api_key) = cli.api_key.filter(|k| !k.is_empty()) {
        config = config.with_api_key(api_key);
    }

    let manager = Manager::new(config).context("failed to set up workers")?;

    match cli.command {
        Commands::Run { stats_interval } => commands::run(&manager, stats_interval).await,
        Commands::Stats => commands::show_stats(&manager, cli.json),
        command => commands::one_shot(&manager, command, cli.json).await,
    }
}
