// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared harness: an in-process daemon on a scratch socket, plus a stub
//! authorization service.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use buxton::{
    auth::proto::{Verdict, encode_check_answer, read_check_request},
    cfg::{
        config::{Config, DaemonConfig, LayerConfig},
        enums::LayerKind,
        logger::{LogConfig, Output},
    },
    daemon::engine,
};
use tokio::{io::AsyncWriteExt, net::UnixListener, time::sleep};
use tokio_util::sync::CancellationToken;

pub fn system_layer(name: &str, priority: i32) -> LayerConfig {
    LayerConfig {
        name: name.into(),
        kind: LayerKind::System,
        priority,
        readonly: false,
        description: None,
    }
}

pub fn user_layer(name: &str, priority: i32) -> LayerConfig {
    LayerConfig {
        name: name.into(),
        kind: LayerKind::User,
        priority,
        readonly: false,
        description: None,
    }
}

/// A fresh scratch directory per test, unique across concurrent runs.
pub fn scratch_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "buxton-it-{tag}-{}-{:08x}",
        std::process::id(),
        rand::random::<u32>()
    ))
}

pub struct TestDaemon {
    pub cfg: Config,
    shutdown: CancellationToken,
    dir: PathBuf,
}

impl TestDaemon {
    /// Start a daemon over the given layers in a scratch directory and
    /// wait until its socket accepts connections.
    pub async fn start(
        tag: &str,
        layers: Vec<LayerConfig>,
        auth_socket: Option<PathBuf>,
    ) -> Result<Self> {
        let dir = scratch_dir(tag);
        std::fs::create_dir_all(&dir)?;

        let cfg = Config {
            daemon: DaemonConfig {
                socket: dir.join("buxtond.sock"),
                db_dir: dir.join("db"),
                auth_socket,
                read_timeout: Duration::from_secs(5),
                batch_limit: 32,
            },
            logger: LogConfig {
                level: "info".into(),
                output: Output::Stderr,
                json: false,
                file: None,
            },
            layers,
        };

        let shutdown = CancellationToken::new();
        tokio::spawn(engine::run(cfg.clone(), shutdown.clone()));

        for _ in 0..200 {
            if cfg.daemon.socket.exists() {
                return Ok(Self { cfg, shutdown, dir });
            }
            sleep(Duration::from_millis(10)).await;
        }
        bail!("daemon did not come up");
    }

    pub fn socket(&self) -> &Path {
        &self.cfg.daemon.socket
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        sleep(Duration::from_millis(50)).await;
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// How the stub authorization service behaves.
#[derive(Debug, Clone, Copy)]
pub enum StubMode {
    /// Answer every check with the given verdict.
    Answer(Verdict),
    /// Read checks and never answer; the daemon keeps them parked.
    Silent,
}

/// Bind a stub authorization service and serve connections in the
/// background for the life of the process.
pub async fn spawn_auth_stub(path: &Path, mode: StubMode) -> Result<()> {
    let listener =
        UnixListener::bind(path).context("binding stub authorization socket")?;

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                while let Ok(request) = read_check_request(&mut reader).await {
                    match mode {
                        StubMode::Answer(verdict) => {
                            let answer =
                                encode_check_answer(request.check_id, verdict);
                            if writer.write_all(&answer).await.is_err() {
                                return;
                            }
                        },
                        StubMode::Silent => {},
                    }
                }
            });
        }
    });
    Ok(())
}

/// Effective uid of the test process, read through /proc.
pub fn effective_uid() -> Option<u32> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status.lines().find_map(|line| {
        let rest = line.strip_prefix("Uid:")?;
        rest.split_whitespace().nth(1)?.parse().ok()
    })
}
