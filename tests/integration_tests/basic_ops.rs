// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use buxton::{
    client::connection::ClientConnection,
    wire::{
        frame::encode_frame,
        kind::MessageKind,
        value::{DataType, Value},
    },
};
use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

use buxton::cfg::config::LayerConfig;

use super::common::{TestDaemon, system_layer, user_layer};

#[tokio::test]
#[serial]
async fn create_set_get() -> Result<()> {
    let daemon = TestDaemon::start("s1", vec![system_layer("sys", 1)], None).await?;
    let conn = ClientConnection::connect(daemon.socket()).await?;

    conn.create_group("sys", "G").await?;
    conn.set_value("sys", "G", "k", Value::Int32(42)).await?;

    let value = conn.get_value(None, "G", "k", DataType::Unset).await?;
    assert_eq!(value, Value::Int32(42));

    conn.close();
    daemon.stop().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn higher_priority_layer_shadows_lower() -> Result<()> {
    let daemon = TestDaemon::start(
        "s2",
        vec![system_layer("base", 1), system_layer("over", 5)],
        None,
    )
    .await?;
    let conn = ClientConnection::connect(daemon.socket()).await?;

    conn.create_group("base", "G").await?;
    conn.create_group("over", "G").await?;
    conn.set_value("base", "G", "k", Value::String("old".into())).await?;
    conn.set_value("over", "G", "k", Value::String("new".into())).await?;

    let value = conn.get_value(None, "G", "k", DataType::Unset).await?;
    assert_eq!(value, Value::String("new".into()));

    // The shadowed layer still answers when addressed directly.
    let base = conn.get_value(Some("base"), "G", "k", DataType::Unset).await?;
    assert_eq!(base, Value::String("old".into()));

    conn.close();
    daemon.stop().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn system_layer_beats_user_layer() -> Result<()> {
    let daemon = TestDaemon::start(
        "s3",
        vec![system_layer("sys", 1), user_layer("u", 10)],
        None,
    )
    .await?;
    let conn = ClientConnection::connect(daemon.socket()).await?;

    conn.create_group("u", "G").await?;
    conn.set_value("u", "G", "k", Value::Int32(10)).await?;
    let value = conn.get_value(None, "G", "k", DataType::Unset).await?;
    assert_eq!(value, Value::Int32(10));

    conn.create_group("sys", "G").await?;
    conn.set_value("sys", "G", "k", Value::Int32(1)).await?;
    let value = conn.get_value(None, "G", "k", DataType::Unset).await?;
    assert_eq!(value, Value::Int32(1));

    conn.close();
    daemon.stop().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn unset_removes_the_key() -> Result<()> {
    let daemon = TestDaemon::start("unset", vec![system_layer("sys", 1)], None).await?;
    let conn = ClientConnection::connect(daemon.socket()).await?;

    conn.create_group("sys", "G").await?;
    conn.set_value("sys", "G", "k", Value::Boolean(true)).await?;
    conn.unset_value("sys", "G", "k", DataType::Unset).await?;

    assert!(conn.get_value(None, "G", "k", DataType::Unset).await.is_err());
    // Unsetting what is already gone fails, the connection survives.
    assert!(conn.unset_value("sys", "G", "k", DataType::Unset).await.is_err());
    conn.create_group("sys", "H").await?;

    conn.close();
    daemon.stop().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn list_names_over_the_wire() -> Result<()> {
    let daemon = TestDaemon::start("names", vec![system_layer("sys", 1)], None).await?;
    let conn = ClientConnection::connect(daemon.socket()).await?;

    conn.create_group("sys", "Audio").await?;
    conn.create_group("sys", "Video").await?;
    conn.set_value("sys", "Audio", "volume", Value::Int32(3)).await?;
    conn.set_value("sys", "Audio", "balance", Value::Int32(0)).await?;

    assert_eq!(conn.list_names("sys", None, None).await?, vec!["Audio", "Video"]);
    assert_eq!(
        conn.list_names("sys", Some("Audio"), None).await?,
        vec!["balance", "volume"]
    );
    assert_eq!(
        conn.list_names("sys", Some("Audio"), Some("vol")).await?,
        vec!["volume"]
    );

    conn.close();
    daemon.stop().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn fresh_group_has_empty_label() -> Result<()> {
    let daemon = TestDaemon::start("label", vec![system_layer("sys", 1)], None).await?;
    let conn = ClientConnection::connect(daemon.socket()).await?;

    conn.create_group("sys", "G").await?;
    assert_eq!(conn.get_label("sys", "G", None).await?, "");

    conn.close();
    daemon.stop().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn readonly_layer_rejects_writes_over_the_wire() -> Result<()> {
    let frozen = LayerConfig { readonly: true, ..system_layer("frozen", 1) };
    let daemon =
        TestDaemon::start("ro", vec![system_layer("sys", 1), frozen], None).await?;
    let conn = ClientConnection::connect(daemon.socket()).await?;

    assert!(conn.create_group("frozen", "G").await.is_err());
    // The failure is a status reply, not a connection loss.
    conn.create_group("sys", "G").await?;

    conn.close();
    daemon.stop().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn pipelined_requests_each_get_their_reply() -> Result<()> {
    let daemon = TestDaemon::start("pipe", vec![system_layer("sys", 1)], None).await?;
    let conn = ClientConnection::connect(daemon.socket()).await?;
    conn.create_group("sys", "G").await?;

    let mut writes = Vec::new();
    for i in 0..16 {
        let conn = conn.clone();
        writes.push(tokio::spawn(async move {
            conn.set_value("sys", "G", &format!("k{i}"), Value::Int32(i)).await
        }));
    }
    for write in writes {
        write.await??;
    }

    for i in 0..16 {
        let value = conn
            .get_value(None, "G", &format!("k{i}"), DataType::Int32)
            .await?;
        assert_eq!(value, Value::Int32(i));
    }

    conn.close();
    daemon.stop().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn garbage_bytes_terminate_the_client() -> Result<()> {
    let daemon = TestDaemon::start("garbage", vec![system_layer("sys", 1)], None).await?;

    let mut raw = UnixStream::connect(daemon.socket()).await?;
    raw.write_all(&[0xffu8; 64]).await?;

    // The daemon drops us: the next read sees EOF.
    let mut buf = [0u8; 16];
    let n = raw.read(&mut buf).await?;
    assert_eq!(n, 0);

    // And keeps serving everyone else.
    let conn = ClientConnection::connect(daemon.socket()).await?;
    conn.create_group("sys", "G").await?;
    conn.close();
    daemon.stop().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn retired_kind_terminates_the_client() -> Result<()> {
    let daemon = TestDaemon::start("retired", vec![system_layer("sys", 1)], None).await?;

    let mut raw = UnixStream::connect(daemon.socket()).await?;
    // Forge a frame with the dead list-keys kind.
    let mut bytes = encode_frame(MessageKind::Get, 1, &[Value::String("l".into())])?
        .to_vec();
    bytes[2..4].copy_from_slice(&7u16.to_le_bytes());
    raw.write_all(&bytes).await?;

    let mut buf = [0u8; 16];
    assert_eq!(raw.read(&mut buf).await?, 0);

    daemon.stop().await;
    Ok(())
}
