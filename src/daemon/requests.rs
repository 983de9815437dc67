// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed requests and the pending-request queue.
//!
//! A frame becomes a [`Request`] through the per-kind arity and type table;
//! anything that does not fit the table is a protocol violation and costs
//! the client its connection. Requests whose authorization checks are still
//! in flight park in the [`RequestQueue`] as [`PendingRequest`]s until every
//! decision has left the `Required` state.

use std::collections::VecDeque;

use crate::{
    auth::{Access, proto::{CheckId, Verdict}},
    daemon::ClientId,
    wire::{
        error::WireError,
        frame::Frame,
        kind::MessageKind,
        value::{DataType, Value},
    },
};

/// One parsed client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Set { layer: String, group: String, name: String, value: Value },
    SetLabel { layer: String, group: String, name: Option<String>, label: String },
    CreateGroup { layer: String, group: String },
    RemoveGroup { layer: String, group: String },
    Get { layer: Option<String>, group: String, name: String, ty: DataType },
    GetLabel { layer: String, group: String, name: Option<String> },
    Unset { layer: String, group: String, name: String, ty: DataType },
    ListNames { layer: String, group: Option<String>, prefix: Option<String> },
    Notify { group: String, name: String, ty: DataType },
    Unnotify { group: String, name: String, ty: DataType },
}

fn take_string(
    params: &mut Vec<Value>,
    index: usize,
    kind: &'static str,
) -> Result<String, WireError> {
    match params.get_mut(index) {
        Some(Value::String(s)) => Ok(std::mem::take(s)),
        Some(_) => Err(WireError::ParamTypeMismatch { kind, index }),
        None => Err(WireError::ParamArityMismatch { kind, got: params.len() }),
    }
}

fn take_type(
    params: &[Value],
    index: usize,
    kind: &'static str,
) -> Result<DataType, WireError> {
    match params.get(index) {
        Some(Value::UInt32(v)) => DataType::from_u32(*v)
            .map_err(|_| WireError::ParamTypeMismatch { kind, index }),
        Some(_) => Err(WireError::ParamTypeMismatch { kind, index }),
        None => Err(WireError::ParamArityMismatch { kind, got: params.len() }),
    }
}

fn arity(
    params: &[Value],
    allowed: &[usize],
    kind: &'static str,
) -> Result<(), WireError> {
    if allowed.contains(&params.len()) {
        Ok(())
    } else {
        Err(WireError::ParamArityMismatch { kind, got: params.len() })
    }
}

/// Empty strings in optional positions mean "not given".
fn optional(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

impl Request {
    /// Parse a decoded frame against the per-kind parameter table.
    pub fn parse(frame: Frame) -> Result<Request, WireError> {
        let kind = frame.kind;
        let name = kind.name();
        let mut p = frame.params;

        Ok(match kind {
            MessageKind::Set => {
                arity(&p, &[4], name)?;
                // The value is the fourth parameter, of any concrete type.
                let value = p
                    .pop()
                    .expect("arity checked");
                Request::Set {
                    layer: take_string(&mut p, 0, name)?,
                    group: take_string(&mut p, 1, name)?,
                    name: take_string(&mut p, 2, name)?,
                    value,
                }
            },
            MessageKind::SetLabel => {
                arity(&p, &[3, 4], name)?;
                let last = p.len() - 1;
                let label = take_string(&mut p, last, name)?;
                Request::SetLabel {
                    layer: take_string(&mut p, 0, name)?,
                    group: take_string(&mut p, 1, name)?,
                    name: if p.len() == 4 {
                        Some(take_string(&mut p, 2, name)?)
                    } else {
                        None
                    },
                    label,
                }
            },
            MessageKind::CreateGroup => {
                arity(&p, &[2], name)?;
                Request::CreateGroup {
                    layer: take_string(&mut p, 0, name)?,
                    group: take_string(&mut p, 1, name)?,
                }
            },
            MessageKind::RemoveGroup => {
                arity(&p, &[2], name)?;
                Request::RemoveGroup {
                    layer: take_string(&mut p, 0, name)?,
                    group: take_string(&mut p, 1, name)?,
                }
            },
            MessageKind::Get => {
                arity(&p, &[3, 4], name)?;
                let ty = take_type(&p, p.len() - 1, name)?;
                if p.len() == 4 {
                    Request::Get {
                        layer: Some(take_string(&mut p, 0, name)?),
                        group: take_string(&mut p, 1, name)?,
                        name: take_string(&mut p, 2, name)?,
                        ty,
                    }
                } else {
                    Request::Get {
                        layer: None,
                        group: take_string(&mut p, 0, name)?,
                        name: take_string(&mut p, 1, name)?,
                        ty,
                    }
                }
            },
            MessageKind::GetLabel => {
                arity(&p, &[2, 3], name)?;
                Request::GetLabel {
                    layer: take_string(&mut p, 0, name)?,
                    group: take_string(&mut p, 1, name)?,
                    name: if p.len() == 3 {
                        Some(take_string(&mut p, 2, name)?)
                    } else {
                        None
                    },
                }
            },
            MessageKind::Unset => {
                arity(&p, &[4], name)?;
                Request::Unset {
                    layer: take_string(&mut p, 0, name)?,
                    group: take_string(&mut p, 1, name)?,
                    name: take_string(&mut p, 2, name)?,
                    ty: take_type(&p, 3, name)?,
                }
            },
            MessageKind::ListNames => {
                arity(&p, &[3], name)?;
                Request::ListNames {
                    layer: take_string(&mut p, 0, name)?,
                    group: optional(take_string(&mut p, 1, name)?),
                    prefix: optional(take_string(&mut p, 2, name)?),
                }
            },
            MessageKind::Notify => {
                arity(&p, &[3], name)?;
                Request::Notify {
                    group: take_string(&mut p, 0, name)?,
                    name: take_string(&mut p, 1, name)?,
                    ty: take_type(&p, 2, name)?,
                }
            },
            MessageKind::Unnotify => {
                arity(&p, &[3], name)?;
                Request::Unnotify {
                    group: take_string(&mut p, 0, name)?,
                    name: take_string(&mut p, 1, name)?,
                    ty: take_type(&p, 2, name)?,
                }
            },
            MessageKind::Status | MessageKind::Changed => {
                return Err(WireError::UnknownKind(kind as u16));
            },
        })
    }

    /// The access direction authorization asks about, `None` for kinds
    /// that are never checked.
    pub fn access(&self) -> Option<Access> {
        match self {
            Request::Set { .. }
            | Request::SetLabel { .. }
            | Request::Unset { .. }
            | Request::RemoveGroup { .. } => Some(Access::Write),
            Request::Get { .. } | Request::GetLabel { .. } => Some(Access::Read),
            Request::CreateGroup { .. }
            | Request::ListNames { .. }
            | Request::Notify { .. }
            | Request::Unnotify { .. } => None,
        }
    }

    /// The key the request addresses, as (layer, group, name).
    pub fn target(&self) -> (Option<&str>, &str, Option<&str>) {
        match self {
            Request::Set { layer, group, name, .. }
            | Request::Unset { layer, group, name, .. } => {
                (Some(layer), group, Some(name))
            },
            Request::SetLabel { layer, group, name, .. }
            | Request::GetLabel { layer, group, name } => {
                (Some(layer), group, name.as_deref())
            },
            Request::Get { layer, group, name, .. } => {
                (layer.as_deref(), group, Some(name))
            },
            Request::CreateGroup { layer, group }
            | Request::RemoveGroup { layer, group } => (Some(layer), group, None),
            Request::ListNames { layer, group, .. } => {
                (Some(layer), group.as_deref().unwrap_or(""), None)
            },
            Request::Notify { group, name, .. }
            | Request::Unnotify { group, name, .. } => (None, group, Some(name)),
        }
    }
}

/// Authorization state of one scope (group or key) of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decision {
    /// No check applies to this scope.
    #[default]
    None,
    /// A check is in flight; the request must wait.
    Required,
    Granted,
    Denied,
}

impl Decision {
    pub fn from_verdict(v: Verdict) -> Self {
        match v {
            Verdict::Allowed => Decision::Granted,
            Verdict::Denied => Decision::Denied,
        }
    }
}

/// A request parked until its authorization checks resolve.
#[derive(Debug)]
pub struct PendingRequest {
    pub client: ClientId,
    pub msgid: u32,
    pub request: Request,
    pub group_decision: Decision,
    pub key_decision: Decision,
    pub group_check: Option<CheckId>,
    pub key_check: Option<CheckId>,
}

impl PendingRequest {
    pub fn new(client: ClientId, msgid: u32, request: Request) -> Self {
        Self {
            client,
            msgid,
            request,
            group_decision: Decision::None,
            key_decision: Decision::None,
            group_check: None,
            key_check: None,
        }
    }

    /// Eligible for dispatch: nothing still waits on the service.
    pub fn ready(&self) -> bool {
        self.group_decision != Decision::Required
            && self.key_decision != Decision::Required
    }

    /// Dispatchable through the handler, as opposed to a bare `-1` reply.
    pub fn permitted(&self) -> bool {
        self.group_decision != Decision::Denied
            && self.key_decision != Decision::Denied
    }

    /// Apply an answer if `check_id` belongs to this request.
    fn resolve(&mut self, check_id: CheckId, verdict: Verdict) -> bool {
        if self.group_check == Some(check_id) {
            self.group_decision = Decision::from_verdict(verdict);
            self.group_check = None;
            return true;
        }
        if self.key_check == Some(check_id) {
            self.key_decision = Decision::from_verdict(verdict);
            self.key_check = None;
            return true;
        }
        false
    }

    fn outstanding_checks(&self) -> impl Iterator<Item = CheckId> {
        self.group_check.into_iter().chain(self.key_check)
    }
}

/// The parking area for requests awaiting authorization answers.
#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<PendingRequest>,
}

impl RequestQueue {
    pub fn push(&mut self, request: PendingRequest) {
        self.items.push_back(request);
    }

    /// Remove and return the first dispatchable request, if any.
    pub fn pop_ready(&mut self) -> Option<PendingRequest> {
        let pos = self.items.iter().position(PendingRequest::ready)?;
        self.items.remove(pos)
    }

    /// Route an authorization answer to the request waiting on it.
    pub fn resolve(&mut self, check_id: CheckId, verdict: Verdict) -> bool {
        self.items
            .iter_mut()
            .any(|req| req.resolve(check_id, verdict))
    }

    /// Drop every request of a disconnecting client; returns the check ids
    /// that must be cancelled at the bridge.
    pub fn purge_client(&mut self, client: ClientId) -> Vec<CheckId> {
        let mut cancelled = Vec::new();
        self.items.retain(|req| {
            if req.client == client {
                cancelled.extend(req.outstanding_checks());
                false
            } else {
                true
            }
        });
        cancelled
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
