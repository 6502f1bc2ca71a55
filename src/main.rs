mod cli;
mod config;
mod fetch;
mod scraper;
mod server;
mod state;
mod storage;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use cli::Args;
use fetch::Fetcher;
use scraper::Scraper;
use server::Server;
use state::State;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn set_up_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_regex(false)
                .with_default_directive(Level::INFO.into())
                .with_env_var("RSSAGG_LOG")
                .from_env_lossy(),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    set_up_logging();

    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();

        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C; shutting down"),
                Err(e) => error!("Could not listen for Ctrl-C: {e:#}"),
            }

            cancel.cancel();
        }
    });

    let mut tasks = match start(cancel.clone()).await {
        Ok(tasks) => tasks,

        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut exit_code = ExitCode::SUCCESS;

    while let Some(task_result) = tasks.join_next().await {
        cancel.cancel();

        match task_result {
            Ok(Ok(())) => {}

            Ok(Err(e)) => {
                error!("{e:#}");
                exit_code = ExitCode::FAILURE;
            }

            Err(e) => {
                error!("{e:#}");
                exit_code = ExitCode::FAILURE;
            }
        }
    }

    exit_code
}

async fn start(cancel: CancellationToken) -> Result<JoinSet<Result<()>>> {
    let mut args = Args::parse();
    let config_paths = args
        .config_path
        .take()
        .into_iter()
        .chain(["./rssagg.toml".into(), "/etc/rssagg.toml".into()])
        .collect::<Vec<_>>();
    let mut config = config::load(&config_paths)?;
    config.update(args);
    let state = State::new(config).await?;

    let scraper_cfg = &state.cfg.scraper;
    let fetcher = Fetcher::new(
        state.cfg.cache_dir.clone(),
        scraper_cfg.fetch_timeout.into(),
        scraper_cfg.max_feed_size,
    )?;
    let scraper = Scraper::new(state.storage.clone(), Arc::new(fetcher), scraper_cfg);
    let server = Server::new(state).await?;

    let mut tasks = JoinSet::new();
    tasks.spawn(scraper.run(cancel.clone()));
    tasks.spawn(server.serve(cancel.clone()));

    Ok(tasks)
}
