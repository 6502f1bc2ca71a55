use clap::ValueHint;

use std::num::NonZeroUsize;
use std::path::PathBuf;

#[derive(clap::Parser, Debug, Clone)]
#[command(version, about)]
pub struct Args {
    /// Path to the config file.
    ///
    /// By default, rssagg looks for a file named `rssagg.toml` in the following directories
    /// (in order):
    ///
    /// - `./` (the current directory)
    /// - `/etc`
    #[arg(
        short,
        env = "RSSAGG_CONFIG",
        value_hint(ValueHint::FilePath)
    )]
    pub config_path: Option<PathBuf>,

    /// HTTP API address to bind to.
    #[arg(long, env = "RSSAGG_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Path to the database file.
    #[arg(long, env = "RSSAGG_DB", value_hint(ValueHint::FilePath))]
    pub db_path: Option<PathBuf>,

    /// Path to the HTTP cache directory for feed fetches.
    #[arg(long, env = "RSSAGG_CACHE_DIR", value_hint(ValueHint::DirPath))]
    pub cache_dir: Option<PathBuf>,

    /// Number of feeds refreshed per scraper tick.
    #[arg(long, env = "RSSAGG_BATCH_SIZE")]
    pub batch_size: Option<NonZeroUsize>,

    /// Number of feeds refreshed concurrently (defaults to the batch size).
    #[arg(long, env = "RSSAGG_WORKERS")]
    pub workers: Option<NonZeroUsize>,
}

impl Args {
    pub fn parse() -> Self {
        clap::Parser::parse()
    }
}
