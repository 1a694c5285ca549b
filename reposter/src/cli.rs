//! Command-line surface of `reposter`.
//!
//! Parses the subcommand, loads config and secrets, wires the real adapters into
//! the `reposter-core` engine and drives it until it is told to stop. All
//! orchestration logic lives in `reposter-core`; this module is glue only.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reposter_core::app::{Adapters, AppManager};
use reposter_core::dispatcher::Publishers;

use crate::acquire::MediaAcquirer;
use crate::console::console_loop;
use crate::load_config::{load_config, CliConfig, Secrets};
use crate::publish::{BlogPublisher, TelegramPublisher};
use crate::vk::VkWallFetcher;

/// Repost new wall posts to chat channels and blogs.
#[derive(Parser)]
#[clap(
    name = "reposter",
    version,
    about = "Watch community walls and repost new posts to channels and blogs"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as a service: check periodically until interrupted or `quit` is entered
    Run {
        /// Path to the YAML config file
        #[clap(long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Run one check cycle, wait for it to finish and exit
    Once {
        /// Path to the YAML config file
        #[clap(long, default_value = "config.yaml")]
        config: PathBuf,
    },
}

/// Builds the production adapters from the config and the environment tokens.
pub fn build_adapters(config: &CliConfig, secrets: &Secrets) -> Result<Adapters> {
    let fetcher = VkWallFetcher::new(&config.vk, secrets.vk_service_token.clone())
        .context("building the VK client")?;
    let acquirer = MediaAcquirer::new(&config.downloader).context("building the media client")?;

    let mut publishers = Publishers::new();
    if let Some(token) = &secrets.telegram_bot_token {
        let telegram = TelegramPublisher::new(&config.telegram, token)
            .context("building the Telegram client")?;
        publishers = publishers.with_channel(Arc::new(telegram));
    }
    if let (Some(section), Some(token)) = (&config.blog, &secrets.blog_api_token) {
        let blog =
            BlogPublisher::new(section, token.clone()).context("building the blog client")?;
        publishers = publishers.with_blog(Arc::new(blog));
    }
    tracing::debug!(?publishers, "Adapters built");

    Ok(Adapters {
        fetcher: Arc::new(fetcher),
        acquirer: Arc::new(acquirer),
        publishers,
    })
}

fn prepare(config_path: PathBuf) -> Result<AppManager> {
    let config = load_config(config_path)?;
    let secrets = Secrets::from_env(&config)?;
    let adapters = build_adapters(&config, &secrets)?;
    AppManager::new(config.settings(), adapters).context("validating the bindings")
}

/// Async CLI entrypoint, shared by `main` and the integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Run { config } => {
            let manager = prepare(config)?;
            tracing::info!(command = "run", "Starting service");
            let app = manager.start().await?;
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        tracing::error!(error = %e, "Could not listen for Ctrl-C");
                    } else {
                        tracing::info!("Interrupt received");
                    }
                }
                _ = console_loop(&app) => {}
            }
            let drained = app.shutdown().await;
            tracing::info!(command = "run", drained, "Service stopped");
            Ok(())
        }
        Commands::Once { config } => {
            let manager = prepare(config)?;
            tracing::info!(command = "once", "Running a single check");
            let app = manager.start_once().await?;
            app.settle().await;
            let health = app.health();
            let drained = app.shutdown().await;
            for binding in &health {
                tracing::info!(binding = %binding.binding_id, status = %binding.status, "Binding result");
            }
            if drained {
                Ok(())
            } else {
                anyhow::bail!("shutdown abandoned in-flight work")
            }
        }
    }
}
