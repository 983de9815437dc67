// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The bridge between the daemon loop and the authorization service.
//!
//! The bridge owns the service connection's write half and a verdict cache;
//! a background task drains answers from the read half into a channel the
//! daemon loop selects on. Checks are identified by a [`CheckId`]; a
//! cancelled id turns its eventual answer into a no-op. A service that is
//! not configured, has gone away, or fails mid-write yields `Unavailable`,
//! which the caller must treat as a denial for that check.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use anyhow::{Context, Result};
use tokio::{
    io::AsyncWriteExt,
    net::{UnixStream, unix::OwnedWriteHalf},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::auth::proto::{
    CheckId, Verdict, encode_check_request, read_check_answer,
};

/// One answer delivered from the service reader task to the daemon loop.
#[derive(Debug, Clone, Copy)]
pub struct AuthAnswer {
    pub check_id: CheckId,
    pub verdict: Verdict,
}

/// Result of the synchronous cache probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAnswer {
    Hit(Verdict),
    Miss,
}

/// Result of issuing an asynchronous check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issue {
    /// The check is in flight; an [`AuthAnswer`] with this id will follow.
    Pending(CheckId),
    /// The service cannot be asked; treat as denied.
    Unavailable,
}

type CacheKey = (String, String, String);

pub struct AuthBridge {
    cache: HashMap<CacheKey, Verdict>,
    /// In-flight checks; an id missing here had its answer cancelled.
    pending: HashMap<CheckId, CacheKey>,
    cancelled: HashSet<CheckId>,
    writer: Option<OwnedWriteHalf>,
    next_id: CheckId,
}

impl AuthBridge {
    /// Connect to the service socket. Returns the bridge and the channel
    /// its answers arrive on.
    pub async fn connect(
        path: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AuthAnswer>)> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting authorization service {path:?}"))?;
        let (mut read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match read_check_answer(&mut read_half).await {
                    Ok((check_id, verdict)) => {
                        if tx.send(AuthAnswer { check_id, verdict }).is_err() {
                            break;
                        }
                    },
                    Err(e) => {
                        debug!("authorization service stream closed: {e}");
                        break;
                    },
                }
            }
        });

        Ok((
            Self {
                cache: HashMap::new(),
                pending: HashMap::new(),
                cancelled: HashSet::new(),
                writer: Some(write_half),
                next_id: 1,
            },
            rx,
        ))
    }

    /// A bridge with no service behind it: every required check is denied.
    pub fn disabled() -> (Self, mpsc::UnboundedReceiver<AuthAnswer>) {
        let (_tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                cache: HashMap::new(),
                pending: HashMap::new(),
                cancelled: HashSet::new(),
                writer: None,
                next_id: 1,
            },
            rx,
        )
    }

    /// Synchronous cache probe; never talks to the service.
    pub fn check(&self, subject: &str, user: &str, privilege: &str) -> CacheAnswer {
        match self
            .cache
            .get(&(subject.to_owned(), user.to_owned(), privilege.to_owned()))
        {
            Some(v) => CacheAnswer::Hit(*v),
            None => CacheAnswer::Miss,
        }
    }

    /// Issue an asynchronous check. The answer arrives on the channel
    /// returned by [`AuthBridge::connect`].
    pub async fn request(
        &mut self,
        subject: &str,
        user: &str,
        privilege: &str,
    ) -> Issue {
        let Some(writer) = self.writer.as_mut() else {
            return Issue::Unavailable;
        };

        let check_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let frame = encode_check_request(check_id, subject, user, privilege);
        if let Err(e) = writer.write_all(&frame).await {
            warn!("authorization service write failed: {e}");
            self.writer = None;
            return Issue::Unavailable;
        }

        debug!(check_id, subject, privilege, "authorization check issued");
        self.pending.insert(
            check_id,
            (subject.to_owned(), user.to_owned(), privilege.to_owned()),
        );
        Issue::Pending(check_id)
    }

    /// Forget an in-flight check; its answer, if it ever comes, is dropped.
    pub fn cancel(&mut self, check_id: CheckId) {
        if self.pending.remove(&check_id).is_some() {
            self.cancelled.insert(check_id);
        }
    }

    /// Account one answer from the service. Returns `false` for answers to
    /// cancelled or unknown checks, which the caller must ignore.
    pub fn on_answer(&mut self, answer: AuthAnswer) -> bool {
        if self.cancelled.remove(&answer.check_id) {
            debug!(check_id = answer.check_id, "dropping cancelled answer");
            return false;
        }
        match self.pending.remove(&answer.check_id) {
            Some(key) => {
                self.cache.insert(key, answer.verdict);
                true
            },
            None => {
                debug!(check_id = answer.check_id, "answer for unknown check");
                false
            },
        }
    }
}
