// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-client socket handling: identity capture on accept, framed reads
//! with a mid-frame timeout, and the outbox writer.
//!
//! Sessions never touch daemon state. The reader task turns bytes into
//! [`DaemonEvent`]s for the loop; the writer task drains the outbox the
//! loop fills. Both stop when the session's token is cancelled.

use std::time::Duration;

use anyhow::{Result, anyhow};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    daemon::{ClientId, engine::DaemonEvent},
    wire::frame::{FRAME_HEADER_LEN, MAX_FRAME, decode_frame, frame_size},
};

/// The loop's grip on one connected client.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    /// Peer uid from SO_PEERCRED, captured once on accept.
    pub uid: u32,
    /// Peer pid, when the platform reports one.
    pub pid: Option<i32>,
    /// Peer security label; absent when the host provides none.
    pub label: Option<String>,
    outbox: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl ClientHandle {
    /// Queue a frame for writing. `false` means the writer is gone and the
    /// client must be terminated.
    pub fn send(&self, frame: Bytes) -> bool {
        self.outbox.send(frame).is_ok()
    }

    /// The authorization subject for this client: its security label, or
    /// the empty string when none was captured.
    pub fn subject(&self) -> &str {
        self.label.as_deref().unwrap_or("")
    }

    /// Stop both socket tasks.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("{label} cancelled")),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow!("{label} timeout")),
            }
        }
    }
}

/// The peer's security label, read through the label source. Absence is
/// normal on hosts without an LSM that labels processes.
fn peer_label(pid: Option<i32>) -> Option<String> {
    let pid = pid?;
    let raw = std::fs::read(format!("/proc/{pid}/attr/current")).ok()?;
    let text = String::from_utf8_lossy(&raw);
    let label = text.trim_end_matches(['\0', '\n']).to_owned();
    if label.is_empty() { None } else { Some(label) }
}

/// Capture identity, then split the stream into reader and writer tasks.
pub fn spawn_session(
    id: ClientId,
    stream: UnixStream,
    events: mpsc::UnboundedSender<DaemonEvent>,
    read_timeout: Duration,
    batch_limit: usize,
) -> Result<ClientHandle> {
    let cred = stream.peer_cred()?;
    let uid = cred.uid();
    let pid = cred.pid();
    let label = peer_label(pid);
    debug!(id, uid, ?pid, ?label, "client connected");

    let cancel = CancellationToken::new();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Bytes>();
    let (read_half, mut write_half) = stream.into_split();

    let writer_cancel = cancel.clone();
    let writer_events = events.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = outbox_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = write_half.write_all(&frame).await {
                debug!(id, "client write failed: {e}");
                let _ = writer_events.send(DaemonEvent::Disconnected { client: id });
                break;
            }
        }
    });

    let reader_cancel = cancel.clone();
    tokio::spawn(read_loop(id, read_half, events, reader_cancel, read_timeout, batch_limit));

    Ok(ClientHandle { id, uid, pid, label, outbox: outbox_tx, cancel })
}

async fn read_loop(
    id: ClientId,
    mut reader: tokio::net::unix::OwnedReadHalf,
    events: mpsc::UnboundedSender<DaemonEvent>,
    cancel: CancellationToken,
    read_timeout: Duration,
    batch_limit: usize,
) {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut scratch = BytesMut::with_capacity(FRAME_HEADER_LEN);
    let mut handled = 0usize;

    loop {
        // Idle clients are legal: the header read waits without a timeout.
        let got = tokio::select! {
            _ = cancel.cancelled() => return,
            got = reader.read_exact(&mut header) => got,
        };
        if got.is_err() {
            // EOF or read error: orderly disconnect either way.
            let _ = events.send(DaemonEvent::Disconnected { client: id });
            return;
        }

        let total = frame_size(&header) as usize;
        if total == 0 || total > MAX_FRAME {
            warn!(id, total, "frame size out of range");
            let _ = events.send(DaemonEvent::Malformed { client: id });
            return;
        }

        scratch.clear();
        scratch.extend_from_slice(&header);
        if total > FRAME_HEADER_LEN {
            scratch.resize(total, 0);
            // A frame was announced; stalling in the middle of it now
            // counts against the peer.
            if let Err(e) = io_with_timeout(
                "read frame body",
                reader.read_exact(&mut scratch[FRAME_HEADER_LEN..]),
                read_timeout,
                &cancel,
            )
            .await
            {
                debug!(id, "mid-frame read failed: {e}");
                let _ = events.send(DaemonEvent::Disconnected { client: id });
                return;
            }
        }

        match decode_frame(&scratch) {
            Ok(frame) => {
                if events.send(DaemonEvent::Frame { client: id, frame }).is_err() {
                    return;
                }
            },
            Err(e) => {
                warn!(id, "malformed frame: {e}");
                let _ = events.send(DaemonEvent::Malformed { client: id });
                return;
            },
        }

        // Bound head-of-line blocking: after a burst of frames from one
        // client, let the loop service the others.
        handled += 1;
        if handled % batch_limit == 0 {
            tokio::task::yield_now().await;
        }
    }
}
