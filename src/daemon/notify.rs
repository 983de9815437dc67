// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-key change subscriptions with delta suppression.
//!
//! The registry keeps two independent indices over the same subscriptions:
//! by key for fan-out, and by client for one-pass cleanup on disconnect.
//! Neither owns the other; both are corrected together by every mutation.

use std::collections::HashMap;

use tracing::debug;

use crate::{daemon::ClientId, wire::value::Value};

/// Key of a subscription: the (group, name) pair, layer-agnostic.
pub type SubKey = (String, String);

/// One registered subscription.
#[derive(Debug)]
pub struct Subscription {
    pub client: ClientId,
    /// msgid of the original Notify; echoed in every Changed message.
    pub msgid: u32,
    /// Last value this subscriber observed; `None` for "absent".
    pub last: Option<Value>,
}

/// One Changed message to write: to whom, under which msgid, with what.
#[derive(Debug)]
pub struct Delivery {
    pub client: ClientId,
    pub msgid: u32,
    pub value: Option<Value>,
}

#[derive(Debug, Default)]
pub struct NotifyRegistry {
    subs: HashMap<SubKey, Vec<Subscription>>,
    by_client: HashMap<ClientId, Vec<SubKey>>,
}

impl NotifyRegistry {
    /// Insert a subscription, snapshotting the current value (or its
    /// absence) for delta suppression.
    pub fn register(
        &mut self,
        client: ClientId,
        group: &str,
        name: &str,
        msgid: u32,
        current: Option<Value>,
    ) {
        let key = (group.to_owned(), name.to_owned());
        self.subs
            .entry(key.clone())
            .or_default()
            .push(Subscription { client, msgid, last: current });
        self.by_client.entry(client).or_default().push(key);
        debug!(client, group, name, msgid, "subscription registered");
    }

    /// Remove this client's first subscription on the key, returning the
    /// original Notify msgid so the reply can carry it.
    pub fn unregister(
        &mut self,
        client: ClientId,
        group: &str,
        name: &str,
    ) -> Option<u32> {
        let key = (group.to_owned(), name.to_owned());
        let list = self.subs.get_mut(&key)?;
        let pos = list.iter().position(|s| s.client == client)?;
        let sub = list.remove(pos);
        if list.is_empty() {
            self.subs.remove(&key);
        }

        if let Some(keys) = self.by_client.get_mut(&client) {
            if let Some(kpos) = keys.iter().position(|k| *k == key) {
                keys.remove(kpos);
            }
            if keys.is_empty() {
                self.by_client.remove(&client);
            }
        }
        debug!(client, group, name, "subscription removed");
        Some(sub.msgid)
    }

    /// Record a mutation of (group, name) and collect the deliveries it
    /// causes. A subscriber whose last observed value equals the new one
    /// (by raw representation) is skipped and keeps its snapshot.
    pub fn changed(
        &mut self,
        group: &str,
        name: &str,
        new: Option<&Value>,
    ) -> Vec<Delivery> {
        let key = (group.to_owned(), name.to_owned());
        let Some(list) = self.subs.get_mut(&key) else {
            return Vec::new();
        };

        let mut deliveries = Vec::new();
        for sub in list.iter_mut() {
            let unchanged = match (&sub.last, new) {
                (Some(old), Some(new)) => old.same_representation(new),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                continue;
            }
            sub.last = new.cloned();
            deliveries.push(Delivery {
                client: sub.client,
                msgid: sub.msgid,
                value: new.cloned(),
            });
        }
        deliveries
    }

    /// Drop every subscription of a disconnecting client in one pass over
    /// its own index.
    pub fn purge_client(&mut self, client: ClientId) {
        let Some(keys) = self.by_client.remove(&client) else {
            return;
        };
        for key in keys {
            if let Some(list) = self.subs.get_mut(&key) {
                list.retain(|s| s.client != client);
                if list.is_empty() {
                    self.subs.remove(&key);
                }
            }
        }
        debug!(client, "subscriptions purged");
    }

    /// Whether any subscription references the client. Test hook for the
    /// purge invariant.
    pub fn references_client(&self, client: ClientId) -> bool {
        self.by_client.contains_key(&client)
            || self
                .subs
                .values()
                .any(|list| list.iter().any(|s| s.client == client))
    }
}
