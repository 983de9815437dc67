// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A client connection to the daemon.
//!
//! One background task reads frames off the socket and routes them by
//! msgid: `Status` replies to the request that is waiting for them,
//! `Changed` messages to the watch registered by the matching `Notify`.
//! Requests allocate their msgid from a connection-local counter, so one
//! connection can keep any number of requests and subscriptions in flight.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use bytes::BytesMut;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixStream, unix::{OwnedReadHalf, OwnedWriteHalf}},
    sync::{Mutex, mpsc},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::wire::{
    frame::{FRAME_HEADER_LEN, Frame, MAX_FRAME, decode_frame, encode_frame, frame_size},
    kind::MessageKind,
    value::{DataType, Value},
};

/// Default time to wait for a reply before giving up on it.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream of change notifications for one subscription.
///
/// Each item is the key's new value, `None` when the key was unset. Dropping
/// the watch stops delivery but leaves the subscription registered; pair it
/// with [`ClientConnection::unnotify`] for a clean deregistration.
#[derive(Debug)]
pub struct Watch {
    /// msgid of the originating Notify; the daemon stamps it on every
    /// Changed message for this subscription.
    pub msgid: u32,
    rx: mpsc::UnboundedReceiver<Option<Value>>,
}

impl Watch {
    /// The next change, or `None` once the connection is gone.
    pub async fn changed(&mut self) -> Option<Option<Value>> {
        self.rx.recv().await
    }
}

/// A connection to the daemon over its Unix stream socket.
#[derive(Debug)]
pub struct ClientConnection {
    writer: Mutex<OwnedWriteHalf>,
    /// Replies in flight, keyed by request msgid.
    pending: DashMap<u32, mpsc::Sender<Frame>>,
    /// Change watches, keyed by the msgid of their Notify.
    watchers: DashMap<u32, mpsc::UnboundedSender<Option<Value>>>,
    next_msgid: AtomicU32,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Connect and start the background read loop.
    pub async fn connect<P: AsRef<Path>>(socket: P) -> Result<Arc<Self>> {
        let stream = UnixStream::connect(socket.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();

        let conn = Arc::new(Self {
            writer: Mutex::new(write_half),
            pending: DashMap::new(),
            watchers: DashMap::new(),
            next_msgid: AtomicU32::new(1),
            cancel: CancellationToken::new(),
        });

        let reader = Arc::clone(&conn);
        tokio::spawn(async move {
            if let Err(e) = reader.read_loop(read_half).await {
                debug!("client read loop exited: {e}");
            }
        });

        Ok(conn)
    }

    /// Tear the connection down; in-flight requests fail promptly.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) -> Result<()> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut scratch = BytesMut::with_capacity(FRAME_HEADER_LEN);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => bail!("cancelled"),
                got = reader.read_exact(&mut header) => { got?; },
            }

            let total = frame_size(&header) as usize;
            if total == 0 || total > MAX_FRAME {
                bail!("daemon sent a frame with size {total}");
            }

            scratch.clear();
            scratch.extend_from_slice(&header);
            scratch.resize(total, 0);
            reader.read_exact(&mut scratch[FRAME_HEADER_LEN..]).await?;

            let frame = decode_frame(&scratch)?;
            match frame.kind {
                MessageKind::Status => {
                    let msgid = frame.msgid;
                    if let Some((_, tx)) = self.pending.remove(&msgid) {
                        let _ = tx.send(frame).await;
                    } else {
                        warn!(msgid, "reply without a pending request");
                    }
                },
                MessageKind::Changed => {
                    let value = frame.params.into_iter().next();
                    if let Some(watch) = self.watchers.get(&frame.msgid) {
                        let _ = watch.send(value);
                    } else {
                        debug!(msgid = frame.msgid, "change for unknown watch");
                    }
                },
                other => bail!("unexpected message kind {other:?} from daemon"),
            }
        }
    }

    fn alloc_msgid(&self) -> u32 {
        self.next_msgid.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_frame(&self, kind: MessageKind, msgid: u32, params: &[Value]) -> Result<()> {
        let bytes = encode_frame(kind, msgid, params)?;
        let mut w = self.writer.lock().await;
        w.write_all(&bytes).await?;
        Ok(())
    }

    /// Send a request and wait for its `Status` reply.
    async fn request(&self, kind: MessageKind, params: &[Value]) -> Result<Frame> {
        let msgid = self.alloc_msgid();
        let (tx, mut rx) = mpsc::channel(1);
        self.pending.insert(msgid, tx);

        if let Err(e) = self.write_frame(kind, msgid, params).await {
            self.pending.remove(&msgid);
            return Err(e);
        }

        let reply = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.remove(&msgid);
                bail!("connection closed");
            },
            reply = timeout(REPLY_TIMEOUT, rx.recv()) => reply,
        };
        match reply {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => bail!("connection closed before reply"),
            Err(_) => {
                self.pending.remove(&msgid);
                bail!("timed out waiting for {} reply", kind.name())
            },
        }
    }

    /// First reply parameter: the status.
    fn status_of(frame: &Frame) -> Result<i32> {
        match frame.params.first() {
            Some(Value::Int32(status)) => Ok(*status),
            _ => Err(anyhow!("reply carries no status")),
        }
    }

    fn expect_ok(frame: &Frame, op: &str) -> Result<()> {
        match Self::status_of(frame)? {
            0 => Ok(()),
            status => Err(anyhow!("{op} failed with status {status}")),
        }
    }

    pub async fn create_group(&self, layer: &str, group: &str) -> Result<()> {
        let reply = self
            .request(
                MessageKind::CreateGroup,
                &[Value::String(layer.into()), Value::String(group.into())],
            )
            .await?;
        Self::expect_ok(&reply, "create-group")
    }

    pub async fn remove_group(&self, layer: &str, group: &str) -> Result<()> {
        let reply = self
            .request(
                MessageKind::RemoveGroup,
                &[Value::String(layer.into()), Value::String(group.into())],
            )
            .await?;
        Self::expect_ok(&reply, "remove-group")
    }

    pub async fn set_value(
        &self,
        layer: &str,
        group: &str,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let reply = self
            .request(
                MessageKind::Set,
                &[
                    Value::String(layer.into()),
                    Value::String(group.into()),
                    Value::String(name.into()),
                    value,
                ],
            )
            .await?;
        Self::expect_ok(&reply, "set")
    }

    /// Read a value; with `layer` `None` the daemon resolves across layers.
    pub async fn get_value(
        &self,
        layer: Option<&str>,
        group: &str,
        name: &str,
        ty: DataType,
    ) -> Result<Value> {
        let mut params = Vec::with_capacity(4);
        if let Some(layer) = layer {
            params.push(Value::String(layer.into()));
        }
        params.push(Value::String(group.into()));
        params.push(Value::String(name.into()));
        params.push(Value::UInt32(ty as u32));

        let reply = self.request(MessageKind::Get, &params).await?;
        Self::expect_ok(&reply, "get")?;
        reply
            .params
            .into_iter()
            .nth(1)
            .ok_or_else(|| anyhow!("get reply carries no value"))
    }

    pub async fn unset_value(
        &self,
        layer: &str,
        group: &str,
        name: &str,
        ty: DataType,
    ) -> Result<()> {
        let reply = self
            .request(
                MessageKind::Unset,
                &[
                    Value::String(layer.into()),
                    Value::String(group.into()),
                    Value::String(name.into()),
                    Value::UInt32(ty as u32),
                ],
            )
            .await?;
        Self::expect_ok(&reply, "unset")
    }

    pub async fn set_label(
        &self,
        layer: &str,
        group: &str,
        name: Option<&str>,
        label: &str,
    ) -> Result<()> {
        let mut params = vec![Value::String(layer.into()), Value::String(group.into())];
        if let Some(name) = name {
            params.push(Value::String(name.into()));
        }
        params.push(Value::String(label.into()));

        let reply = self.request(MessageKind::SetLabel, &params).await?;
        Self::expect_ok(&reply, "set-label")
    }

    pub async fn get_label(
        &self,
        layer: &str,
        group: &str,
        name: Option<&str>,
    ) -> Result<String> {
        let mut params = vec![Value::String(layer.into()), Value::String(group.into())];
        if let Some(name) = name {
            params.push(Value::String(name.into()));
        }

        let reply = self.request(MessageKind::GetLabel, &params).await?;
        Self::expect_ok(&reply, "get-label")?;
        match reply.params.into_iter().nth(1) {
            Some(Value::String(label)) => Ok(label),
            _ => Err(anyhow!("get-label reply carries no label")),
        }
    }

    /// Sorted names in a layer: keys of `group` when given, groups
    /// otherwise.
    pub async fn list_names(
        &self,
        layer: &str,
        group: Option<&str>,
        prefix: Option<&str>,
    ) -> Result<Vec<String>> {
        let reply = self
            .request(
                MessageKind::ListNames,
                &[
                    Value::String(layer.into()),
                    Value::String(group.unwrap_or_default().into()),
                    Value::String(prefix.unwrap_or_default().into()),
                ],
            )
            .await?;
        Self::expect_ok(&reply, "list-names")?;
        reply
            .params
            .into_iter()
            .skip(1)
            .map(|v| match v {
                Value::String(name) => Ok(name),
                other => Err(anyhow!("unexpected {:?} in name listing", other.data_type())),
            })
            .collect()
    }

    /// Subscribe to changes of (group, name). The returned watch yields a
    /// value per observed change, `None` on unset.
    pub async fn notify(
        &self,
        group: &str,
        name: &str,
        ty: DataType,
    ) -> Result<Watch> {
        let msgid = self.alloc_msgid();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        // Register before the request goes out: the first Changed can
        // arrive on the heels of the reply.
        self.watchers.insert(msgid, watch_tx);

        let (tx, mut rx) = mpsc::channel(1);
        self.pending.insert(msgid, tx);
        let params = [
            Value::String(group.into()),
            Value::String(name.into()),
            Value::UInt32(ty as u32),
        ];
        let sent = self.write_frame(MessageKind::Notify, msgid, &params).await;

        let reply = match sent {
            Ok(()) => match timeout(REPLY_TIMEOUT, rx.recv()).await {
                Ok(Some(frame)) => Ok(frame),
                Ok(None) => Err(anyhow!("connection closed before reply")),
                Err(_) => Err(anyhow!("timed out waiting for notify reply")),
            },
            Err(e) => Err(e),
        };

        match reply.and_then(|f| Self::expect_ok(&f, "notify")) {
            Ok(()) => Ok(Watch { msgid, rx: watch_rx }),
            Err(e) => {
                self.pending.remove(&msgid);
                self.watchers.remove(&msgid);
                Err(e)
            },
        }
    }

    /// Drop the subscription on (group, name); returns the msgid of the
    /// original Notify and closes the matching watch.
    pub async fn unnotify(&self, group: &str, name: &str, ty: DataType) -> Result<u32> {
        let reply = self
            .request(
                MessageKind::Unnotify,
                &[
                    Value::String(group.into()),
                    Value::String(name.into()),
                    Value::UInt32(ty as u32),
                ],
            )
            .await?;
        Self::expect_ok(&reply, "unnotify")?;
        match reply.params.into_iter().nth(1) {
            Some(Value::UInt32(orig)) => {
                self.watchers.remove(&orig);
                Ok(orig)
            },
            _ => Err(anyhow!("unnotify reply carries no msgid")),
        }
    }
}
