// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One handler per message kind.
//!
//! Handlers run after authorization has resolved. Each performs the checks
//! that need no authorization (layer existence, read-only, group presence),
//! executes the storage operation and builds the `Status` reply: an `i32`
//! status first, `0` on success and `-1` on failure, then the kind-specific
//! payload. The wire never carries a structured error; the reason only
//! reaches the log.

use bytes::Bytes;
use tracing::debug;

use crate::{
    daemon::{notify::NotifyRegistry, requests::Request, session::ClientHandle},
    store::engine::Store,
    wire::{
        frame::encode_frame,
        kind::MessageKind,
        value::{DataType, Value},
    },
};

/// A mutation the notification registry must fan out: `value` is the new
/// value, `None` for an unset.
#[derive(Debug)]
pub struct Fanout {
    pub group: String,
    pub name: String,
    pub value: Option<Value>,
}

/// What one dispatched request produces.
#[derive(Debug)]
pub struct Outcome {
    pub reply: Bytes,
    pub fanout: Option<Fanout>,
}

fn expected(ty: DataType) -> Option<DataType> {
    match ty {
        DataType::Unset => None,
        other => Some(other),
    }
}

/// Serialize a `Status` reply; falls back to a bare failure status if the
/// payload cannot be framed (e.g. a name listing beyond the param bound).
fn reply(msgid: u32, status: i32, mut payload: Vec<Value>) -> Bytes {
    let mut params = Vec::with_capacity(payload.len() + 1);
    params.push(Value::Int32(status));
    params.append(&mut payload);
    match encode_frame(MessageKind::Status, msgid, &params) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("reply payload dropped: {e}");
            encode_frame(MessageKind::Status, msgid, &[Value::Int32(-1)])
                .expect("status-only reply always fits a frame")
        },
    }
}

/// Dispatch one request through its handler and build the reply.
pub fn handle_request(
    store: &mut Store,
    registry: &mut NotifyRegistry,
    client: &ClientHandle,
    msgid: u32,
    request: Request,
) -> Outcome {
    let mut fanout = None;

    let (status, payload) = match request {
        Request::Set { layer, group, name, value } => {
            match store.set_value(&layer, &group, &name, value.clone()) {
                Ok(()) => {
                    fanout = Some(Fanout { group, name, value: Some(value) });
                    (0, Vec::new())
                },
                Err(e) => {
                    debug!(layer, group, name, "set failed: {e}");
                    (-1, Vec::new())
                },
            }
        },
        Request::SetLabel { layer, group, name, label } => {
            match store.set_label(&layer, &group, name.as_deref(), &label, client.uid)
            {
                Ok(()) => (0, Vec::new()),
                Err(e) => {
                    debug!(layer, group, "set label failed: {e}");
                    (-1, Vec::new())
                },
            }
        },
        Request::CreateGroup { layer, group } => {
            match store.create_group(&layer, &group, None) {
                Ok(()) => (0, Vec::new()),
                Err(e) => {
                    debug!(layer, group, "create group failed: {e}");
                    (-1, Vec::new())
                },
            }
        },
        Request::RemoveGroup { layer, group } => {
            match store.remove_group(&layer, &group) {
                Ok(()) => (0, Vec::new()),
                Err(e) => {
                    debug!(layer, group, "remove group failed: {e}");
                    (-1, Vec::new())
                },
            }
        },
        Request::Get { layer, group, name, ty } => {
            match store.get(layer.as_deref(), &group, Some(&name), expected(ty)) {
                Ok((record, _)) => (0, vec![record.value]),
                Err(e) => {
                    debug!(group, name, "get failed: {e}");
                    (-1, Vec::new())
                },
            }
        },
        Request::GetLabel { layer, group, name } => {
            match store.get_in_layer(&layer, &group, name.as_deref(), None) {
                Ok(record) => (0, vec![Value::String(record.read_priv)]),
                Err(e) => {
                    debug!(layer, group, "get label failed: {e}");
                    (-1, Vec::new())
                },
            }
        },
        Request::Unset { layer, group, name, ty } => {
            match store.unset_value(&layer, &group, &name, expected(ty)) {
                Ok(()) => {
                    fanout = Some(Fanout { group, name, value: None });
                    (0, Vec::new())
                },
                Err(e) => {
                    debug!(layer, group, name, "unset failed: {e}");
                    (-1, Vec::new())
                },
            }
        },
        Request::ListNames { layer, group, prefix } => {
            match store.list_names(&layer, group.as_deref(), prefix.as_deref()) {
                Ok(names) => {
                    (0, names.into_iter().map(Value::String).collect())
                },
                Err(e) => {
                    debug!(layer, "list names failed: {e}");
                    (-1, Vec::new())
                },
            }
        },
        Request::Notify { group, name, ty } => {
            // Subscribing ahead of the first write is legal; the snapshot
            // is simply "absent" and the first Set always notifies.
            let current = store
                .get(None, &group, Some(&name), expected(ty))
                .ok()
                .map(|(record, _)| record.value);
            registry.register(client.id, &group, &name, msgid, current);
            (0, Vec::new())
        },
        Request::Unnotify { group, name, ty: _ } => {
            match registry.unregister(client.id, &group, &name) {
                Some(orig_msgid) => (0, vec![Value::UInt32(orig_msgid)]),
                None => {
                    debug!(group, name, "unnotify without subscription");
                    (-1, Vec::new())
                },
            }
        },
    };

    let fanout = if status == 0 { fanout } else { None };
    Outcome { reply: reply(msgid, status, payload), fanout }
}

/// A bare failure reply, used when authorization denies a request before it
/// reaches a handler.
pub fn denied_reply(msgid: u32) -> Bytes {
    reply(msgid, -1, Vec::new())
}

/// An unsolicited `Changed` message for one subscription.
pub fn changed_message(msgid: u32, value: Option<&Value>) -> Bytes {
    let params: Vec<Value> = value.iter().map(|v| (*v).clone()).collect();
    encode_frame(MessageKind::Changed, msgid, &params)
        .expect("a stored value always fits a frame")
}
