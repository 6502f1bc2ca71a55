mod types;

use std::fs::File;
use std::io::{self, Read};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use take_mut::take;
use tracing::{debug, info};

use crate::scraper::FailurePolicy;

pub use self::types::*;

const DEFAULT_BATCH_SIZE: NonZeroUsize = match NonZeroUsize::new(10) {
    Some(n) => n,
    None => unreachable!(),
};

fn default_posts_limit() -> usize {
    Config::default().posts_limit
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub cache_dir: Option<PathBuf>,

    #[serde(default = "default_posts_limit")]
    pub posts_limit: usize,

    #[serde(default)]
    pub scraper: ScraperConfig,
}

impl Config {
    pub fn update(&mut self, args: crate::cli::Args) {
        fn set_if_some<T>(dst: &mut T, v: Option<T>) {
            if let Some(v) = v {
                *dst = v;
            }
        }

        set_if_some(&mut self.bind_addr, args.bind_addr);
        set_if_some(&mut self.db_path, args.db_path);
        set_if_some(&mut self.cache_dir, args.cache_dir.map(Some));
        set_if_some(&mut self.scraper.batch_size, args.batch_size);
        set_if_some(&mut self.scraper.workers, args.workers.map(Some));
    }

    pub fn resolve_relative_paths(&mut self, config_dir: impl AsRef<Path>) {
        let config_dir = config_dir.as_ref();

        // rebuild the whole struct so that new path fields are not forgotten here.
        take(self, |this| Self {
            bind_addr: this.bind_addr,
            db_path: config_dir.join(&this.db_path),
            cache_dir: this.cache_dir.map(|cache_dir| config_dir.join(cache_dir)),
            posts_limit: this.posts_limit,
            scraper: this.scraper,
        })
    }

    /// Enough connections for every worker plus the batch selection and the HTTP API.
    pub fn db_max_connections(&self) -> u32 {
        let workers = u32::try_from(self.scraper.workers().get()).unwrap_or(u32::MAX);

        workers.saturating_add(1).max(10)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "127.0.0.1:8080".into(),
            db_path: "./rssagg.sqlite3".into(),
            cache_dir: None,
            posts_limit: 10,
            scraper: Default::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ScraperConfig {
    /// How many of the stalest feeds are selected per tick.
    pub batch_size: NonZeroUsize,

    /// How many feeds are refreshed concurrently. Defaults to the batch size.
    pub workers: Option<NonZeroUsize>,

    pub interval: Duration,
    pub fetch_timeout: Duration,
    pub on_failure: FailurePolicy,
    pub max_items_per_feed: Option<usize>,

    /// In bytes.
    pub max_feed_size: u64,
}

impl ScraperConfig {
    pub fn workers(&self) -> NonZeroUsize {
        self.workers.unwrap_or(self.batch_size)
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        ScraperConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: None,
            interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
            on_failure: FailurePolicy::default(),
            max_items_per_feed: None,
            max_feed_size: 5 * 1024 * 1024,
        }
    }
}

pub fn load(search_paths: &[PathBuf]) -> Result<Config> {
    for path in search_paths {
        debug!("Trying to load {}", path.display());
        let mut contents = String::new();

        {
            let mut f = match File::open(path) {
                Ok(f) => f,

                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(file = %path.display(), "File not found, skipping");
                    continue;
                }

                Err(e) => {
                    return Err(e)
                        .context(anyhow!("could not load a config file `{}`", path.display()));
                }
            };

            f.read_to_string(&mut contents).with_context(|| {
                anyhow!(
                    "could not read the contents of a config file `{}`",
                    path.display()
                )
            })?;
        }

        let mut cfg: Config = toml::from_str(&contents)
            .with_context(|| anyhow!("could not load the config file `{}`", path.display()))?;

        if let Some(parent) = path.parent() {
            cfg.resolve_relative_paths(parent);
        }

        info!("Loaded a config file `{}`", path.display());

        return Ok(cfg);
    }

    info!("Using the default config");

    Ok(Default::default())
}
