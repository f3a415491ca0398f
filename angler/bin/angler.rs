#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use angler::{Angler, Role};
use angler_common::config::{Configuration, ENV_CONFIG, Properties};
use clap::Parser;

const CONFIG_ENV: &str = "ANGLER_CONFIG";
const DEFAULT_CONFIG: &str = "./conf/config.properties";

#[derive(Debug, Parser)]
#[command(name = "angler", version, about = "Message delivery engine")]
struct Args {
    /// Run as the cluster controller
    #[arg(long, conflicts_with = "broker")]
    controller: bool,

    /// Run as a broker for the configured controller
    #[arg(long)]
    broker: bool,

    /// Identifier this broker registers under
    #[arg(long, requires = "broker")]
    broker_id: Option<String>,

    /// Properties file to load
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    const fn role(&self) -> Role {
        if self.controller {
            Role::Controller
        } else if self.broker {
            Role::Broker
        } else {
            Role::Standalone
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let overrides = std::env::var(ENV_CONFIG).ok();

    let config = match find_config_file(args.config.clone())? {
        Some(path) => Configuration::load(&path, overrides.as_deref())
            .map_err(|e| anyhow::anyhow!("Failed to load config from {}: {e}", path.display()))?,
        None => {
            let properties = Properties::parse_inline(
                overrides.as_deref().unwrap_or_default(),
            );
            Configuration::from_properties(&properties)?
        }
    };

    Angler::new(config, args.role(), args.broker_id)?.run().await
}

/// Find the configuration file using the following precedence:
/// 1. `--config`
/// 2. `ANGLER_CONFIG` environment variable
/// 3. ./conf/config.properties
///
/// Without any file the node runs on defaults and `ANGLER_CFG`.
fn find_config_file(flag: Option<PathBuf>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = flag {
        if path.exists() {
            return Ok(Some(path));
        }
        anyhow::bail!("--config points to non-existent file: {}", path.display());
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(Some(path));
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    let path = PathBuf::from(DEFAULT_CONFIG);
    Ok(path.exists().then_some(path))
}
