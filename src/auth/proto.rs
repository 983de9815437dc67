// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The framed protocol spoken with the authorization service.
//!
//! A check request asks "may `subject` (acting as `user`) exercise
//! `privilege`?":
//!
//! ```text
//! len u32 | check_id u32 | s_len u16 | u_len u16 | p_len u16 | subject | user | privilege
//! ```
//!
//! `len` counts everything after itself. The answer is a fixed eight bytes:
//!
//! ```text
//! check_id u32 | verdict i32     (0 = denied, 1 = allowed)
//! ```
//!
//! Answers may arrive in any order; correlation is by `check_id`.

use anyhow::{Result, bail};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Correlation id of one in-flight check.
pub type CheckId = u32;

/// Outcome of one privilege check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied,
}

/// One decoded check request, as seen by the service side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub check_id: CheckId,
    pub subject: String,
    pub user: String,
    pub privilege: String,
}

/// Upper bound on one check request; anything larger is a corrupt stream.
const MAX_CHECK_LEN: usize = 64 * 1024;

pub fn encode_check_request(
    check_id: CheckId,
    subject: &str,
    user: &str,
    privilege: &str,
) -> Bytes {
    let body_len = 4 + 6 + subject.len() + user.len() + privilege.len();
    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32_le(body_len as u32);
    buf.put_u32_le(check_id);
    buf.put_u16_le(subject.len() as u16);
    buf.put_u16_le(user.len() as u16);
    buf.put_u16_le(privilege.len() as u16);
    buf.put_slice(subject.as_bytes());
    buf.put_slice(user.as_bytes());
    buf.put_slice(privilege.as_bytes());
    buf.freeze()
}

/// Read one check request off the stream. Used by stub services in tests
/// and by out-of-process policy daemons.
pub async fn read_check_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<CheckRequest> {
    let len = r.read_u32_le().await? as usize;
    if !(10..=MAX_CHECK_LEN).contains(&len) {
        bail!("check request length {len} out of range");
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;

    let check_id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let s_len = u16::from_le_bytes([body[4], body[5]]) as usize;
    let u_len = u16::from_le_bytes([body[6], body[7]]) as usize;
    let p_len = u16::from_le_bytes([body[8], body[9]]) as usize;
    if 10 + s_len + u_len + p_len != len {
        bail!("check request lengths disagree with frame length");
    }

    let text = &body[10..];
    let subject = std::str::from_utf8(&text[..s_len])?.to_owned();
    let user = std::str::from_utf8(&text[s_len..s_len + u_len])?.to_owned();
    let privilege = std::str::from_utf8(&text[s_len + u_len..])?.to_owned();
    Ok(CheckRequest { check_id, subject, user, privilege })
}

pub fn encode_check_answer(check_id: CheckId, verdict: Verdict) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(check_id);
    buf.put_i32_le(match verdict {
        Verdict::Allowed => 1,
        Verdict::Denied => 0,
    });
    buf.freeze()
}

/// Read one answer off the stream. Any verdict other than 1 is denial.
pub async fn read_check_answer<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(CheckId, Verdict)> {
    let check_id = r.read_u32_le().await?;
    let raw = r.read_i32_le().await?;
    let verdict = if raw == 1 { Verdict::Allowed } else { Verdict::Denied };
    Ok((check_id, verdict))
}
