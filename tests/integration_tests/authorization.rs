// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use buxton::{
    auth::proto::Verdict,
    client::connection::ClientConnection,
    store::engine::ROOT_CHECK_ENV,
    wire::{
        frame::encode_frame,
        kind::MessageKind,
        value::{DataType, Value},
    },
};
use serial_test::serial;
use tokio::{io::AsyncWriteExt, net::UnixStream, time::sleep};

use super::common::{StubMode, TestDaemon, effective_uid, scratch_dir, spawn_auth_stub, system_layer};

struct RootCheckOverride;

impl RootCheckOverride {
    fn install() -> Self {
        // Tests rarely run as uid 0; the documented override lifts the
        // label-change restriction for them.
        unsafe { std::env::set_var(ROOT_CHECK_ENV, "0") };
        Self
    }
}

impl Drop for RootCheckOverride {
    fn drop(&mut self) {
        unsafe { std::env::remove_var(ROOT_CHECK_ENV) };
    }
}

/// Provision (G, k) with a read privilege so that reads need the service.
async fn provision_privileged_key(conn: &ClientConnection) -> Result<()> {
    conn.create_group("sys", "G").await?;
    conn.set_value("sys", "G", "k", Value::Int32(1)).await?;
    conn.set_label("sys", "G", Some("k"), "privilege.test.read").await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn denied_read_replies_failure_and_keeps_the_client() -> Result<()> {
    let _root = RootCheckOverride::install();

    let auth_dir = scratch_dir("s5-auth");
    std::fs::create_dir_all(&auth_dir)?;
    let auth_socket = auth_dir.join("auth.sock");
    spawn_auth_stub(&auth_socket, StubMode::Answer(Verdict::Denied)).await?;

    let daemon = TestDaemon::start(
        "s5",
        vec![system_layer("sys", 1)],
        Some(auth_socket),
    )
    .await?;

    let admin = ClientConnection::connect(daemon.socket()).await?;
    provision_privileged_key(&admin).await?;

    let reader = ClientConnection::connect(daemon.socket()).await?;
    // The service denies the key's read privilege: bare failure status.
    assert!(reader.get_value(None, "G", "k", DataType::Unset).await.is_err());
    // A second attempt hits the verdict cache, same answer.
    assert!(reader.get_value(None, "G", "k", DataType::Unset).await.is_err());
    // The socket survives the denial.
    reader.create_group("sys", "G2").await?;

    admin.close();
    reader.close();
    daemon.stop().await;
    let _ = std::fs::remove_dir_all(&auth_dir);
    Ok(())
}

#[tokio::test]
#[serial]
async fn allowed_read_passes_through_the_service() -> Result<()> {
    let _root = RootCheckOverride::install();

    let auth_dir = scratch_dir("allow-auth");
    std::fs::create_dir_all(&auth_dir)?;
    let auth_socket = auth_dir.join("auth.sock");
    spawn_auth_stub(&auth_socket, StubMode::Answer(Verdict::Allowed)).await?;

    let daemon = TestDaemon::start(
        "allow",
        vec![system_layer("sys", 1)],
        Some(auth_socket),
    )
    .await?;

    let admin = ClientConnection::connect(daemon.socket()).await?;
    provision_privileged_key(&admin).await?;

    let reader = ClientConnection::connect(daemon.socket()).await?;
    let value = reader.get_value(None, "G", "k", DataType::Unset).await?;
    assert_eq!(value, Value::Int32(1));

    admin.close();
    reader.close();
    daemon.stop().await;
    let _ = std::fs::remove_dir_all(&auth_dir);
    Ok(())
}

#[tokio::test]
#[serial]
async fn disconnect_with_check_in_flight_leaves_daemon_healthy() -> Result<()> {
    let _root = RootCheckOverride::install();

    let auth_dir = scratch_dir("s6-auth");
    std::fs::create_dir_all(&auth_dir)?;
    let auth_socket = auth_dir.join("auth.sock");
    // The service swallows checks: requests park forever.
    spawn_auth_stub(&auth_socket, StubMode::Silent).await?;

    let daemon = TestDaemon::start(
        "s6",
        vec![system_layer("sys", 1)],
        Some(auth_socket),
    )
    .await?;

    let admin = ClientConnection::connect(daemon.socket()).await?;
    provision_privileged_key(&admin).await?;

    // Raw client: one Get on the privileged key, then vanish while the
    // authorization answer is still outstanding.
    let mut raw = UnixStream::connect(daemon.socket()).await?;
    let frame = encode_frame(
        MessageKind::Get,
        1,
        &[
            Value::String("G".into()),
            Value::String("k".into()),
            Value::UInt32(DataType::Unset as u32),
        ],
    )?;
    raw.write_all(&frame).await?;
    sleep(Duration::from_millis(100)).await;
    drop(raw);
    sleep(Duration::from_millis(100)).await;

    // The daemon purged the pending request and serves on.
    admin.create_group("sys", "After").await?;
    assert_eq!(admin.list_names("sys", None, None).await?, vec!["After", "G"]);

    admin.close();
    daemon.stop().await;
    let _ = std::fs::remove_dir_all(&auth_dir);
    Ok(())
}

#[tokio::test]
#[serial]
async fn label_change_needs_root_without_the_override() -> Result<()> {
    let daemon = TestDaemon::start("rootchk", vec![system_layer("sys", 1)], None).await?;
    let conn = ClientConnection::connect(daemon.socket()).await?;

    conn.create_group("sys", "G").await?;
    conn.set_value("sys", "G", "k", Value::Int32(1)).await?;

    match effective_uid() {
        Some(0) | None => {
            // Running as root (or /proc is unreadable): the restriction
            // cannot be observed here; the unit suite covers the policy.
        },
        Some(_) => {
            assert!(
                conn.set_label("sys", "G", Some("k"), "P").await.is_err(),
                "non-root label change must be refused"
            );
        },
    }

    conn.close();
    daemon.stop().await;
    Ok(())
}
