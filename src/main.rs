// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::PathBuf;

use anyhow::{Context, Result};
use buxton::{cfg::config::Config, daemon::engine};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The buxton configuration-store daemon.
#[derive(Debug, Parser)]
#[command(name = "buxtond", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/buxton/buxtond.yaml")]
    config: PathBuf,
}

// The loop owns all daemon state, so a current-thread runtime is enough;
// session tasks only shuttle bytes.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = Config::load_from_file(&args.config)
        .with_context(|| format!("loading config {:?}", args.config))?;
    let _log_guard = buxton::cfg::logger::init_logger(&cfg.logger)?;

    let shutdown = CancellationToken::new();
    engine::run(cfg, shutdown).await?;

    info!("clean shutdown");
    Ok(())
}
