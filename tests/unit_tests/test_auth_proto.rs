// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use buxton::auth::proto::{
    Verdict, encode_check_answer, encode_check_request, read_check_answer,
    read_check_request,
};
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn check_request_round_trip() -> Result<()> {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let frame = encode_check_request(9, "User::App::test", "5001", "priv.read");
    client.write_all(&frame).await?;

    let request = read_check_request(&mut server).await?;
    assert_eq!(request.check_id, 9);
    assert_eq!(request.subject, "User::App::test");
    assert_eq!(request.user, "5001");
    assert_eq!(request.privilege, "priv.read");
    Ok(())
}

#[tokio::test]
async fn empty_subject_round_trip() -> Result<()> {
    let (mut client, mut server) = tokio::io::duplex(4096);

    client.write_all(&encode_check_request(1, "", "0", "p")).await?;
    let request = read_check_request(&mut server).await?;
    assert_eq!(request.subject, "");
    assert_eq!(request.privilege, "p");
    Ok(())
}

#[tokio::test]
async fn answer_round_trip() -> Result<()> {
    let (mut client, mut server) = tokio::io::duplex(64);

    client.write_all(&encode_check_answer(7, Verdict::Allowed)).await?;
    client.write_all(&encode_check_answer(8, Verdict::Denied)).await?;

    assert_eq!(read_check_answer(&mut server).await?, (7, Verdict::Allowed));
    assert_eq!(read_check_answer(&mut server).await?, (8, Verdict::Denied));
    Ok(())
}

#[tokio::test]
async fn unknown_verdict_codes_deny() -> Result<()> {
    let (mut client, mut server) = tokio::io::duplex(64);

    let mut raw = encode_check_answer(3, Verdict::Allowed).to_vec();
    raw[4..8].copy_from_slice(&(-7i32).to_le_bytes());
    client.write_all(&raw).await?;

    assert_eq!(read_check_answer(&mut server).await?, (3, Verdict::Denied));
    Ok(())
}

#[tokio::test]
async fn corrupt_length_is_an_error() -> Result<()> {
    let (mut client, mut server) = tokio::io::duplex(64);

    client.write_all(&3u32.to_le_bytes()).await?;
    client.write_all(&[0, 0, 0]).await?;
    assert!(read_check_request(&mut server).await.is_err());
    Ok(())
}
