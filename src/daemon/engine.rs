// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The daemon event loop.
//!
//! One task owns every piece of daemon state: the store, the authorization
//! bridge, the client table, the pending-request queue and the notification
//! registry. It multiplexes shutdown signals, the listener, the client
//! event channel and the authorization answer channel; after every event it
//! drains the requests whose decisions have all resolved.

use std::{collections::HashMap, fs, os::unix::fs::PermissionsExt};

use anyhow::{Context, Result};
use tokio::{
    net::{UnixListener, UnixStream},
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    auth::{
        Access,
        bridge::{AuthAnswer, AuthBridge, CacheAnswer, Issue},
        proto::Verdict,
    },
    cfg::config::Config,
    daemon::{
        ClientId, handlers,
        notify::NotifyRegistry,
        requests::{Decision, PendingRequest, Request, RequestQueue},
        session::{ClientHandle, spawn_session},
    },
    store::engine::Store,
    wire::{frame::Frame, value::Value},
};

/// Events funneled into the loop by session tasks.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A complete, well-formed frame arrived from a client.
    Frame { client: ClientId, frame: Frame },
    /// A client violated the protocol and must be terminated.
    Malformed { client: ClientId },
    /// A client's socket closed or failed.
    Disconnected { client: ClientId },
}

pub struct Daemon {
    cfg: Config,
    store: Store,
    bridge: AuthBridge,
    clients: HashMap<ClientId, ClientHandle>,
    queue: RequestQueue,
    registry: NotifyRegistry,
    events_tx: mpsc::UnboundedSender<DaemonEvent>,
    next_client: ClientId,
}

/// Run the daemon until a signal arrives or `shutdown` is cancelled.
///
/// Initialization failures (configuration, bind, authorization service)
/// surface as errors and should exit the process non-zero; a signalled
/// shutdown returns `Ok`.
pub async fn run(cfg: Config, shutdown: CancellationToken) -> Result<()> {
    let store = Store::open(&cfg).context("opening layer databases")?;

    let (bridge, mut auth_rx) = match &cfg.daemon.auth_socket {
        Some(path) => AuthBridge::connect(path)
            .await
            .context("initializing authorization bridge")?,
        None => AuthBridge::disabled(),
    };

    // A stale socket from an unclean exit would block the bind.
    match fs::remove_file(&cfg.daemon.socket) {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e).context("unlinking stale socket"),
    }
    let listener = UnixListener::bind(&cfg.daemon.socket)
        .with_context(|| format!("binding {:?}", cfg.daemon.socket))?;
    fs::set_permissions(&cfg.daemon.socket, fs::Permissions::from_mode(0o666))
        .context("setting socket permissions")?;

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM")?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut daemon = Daemon {
        cfg,
        store,
        bridge,
        clients: HashMap::new(),
        queue: RequestQueue::default(),
        registry: NotifyRegistry::default(),
        events_tx,
        next_client: 1,
    };

    info!(socket = ?daemon.cfg.daemon.socket, "buxtond started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => daemon.accept(stream),
                Err(e) => warn!("accept failed: {e}"),
            },
            Some(answer) = auth_rx.recv() => daemon.on_auth_answer(answer),
            Some(event) = events_rx.recv() => daemon.on_event(event).await,
        }
        daemon.drain_ready();
    }

    info!("buxtond shutting down");
    for handle in daemon.clients.values() {
        handle.close();
    }
    let _ = fs::remove_file(&daemon.cfg.daemon.socket);
    Ok(())
}

impl Daemon {
    fn accept(&mut self, stream: UnixStream) {
        let id = self.next_client;
        self.next_client += 1;

        match spawn_session(
            id,
            stream,
            self.events_tx.clone(),
            self.cfg.daemon.read_timeout,
            self.cfg.daemon.batch_limit,
        ) {
            Ok(handle) => {
                self.clients.insert(id, handle);
            },
            Err(e) => warn!("rejecting client without credentials: {e}"),
        }
    }

    async fn on_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::Frame { client, frame } => {
                if !self.clients.contains_key(&client) {
                    return;
                }
                let msgid = frame.msgid;
                match Request::parse(frame) {
                    Ok(request) => self.admit(client, msgid, request).await,
                    Err(e) => {
                        warn!(client, "protocol violation: {e}");
                        self.terminate_client(client);
                    },
                }
            },
            DaemonEvent::Malformed { client } => self.terminate_client(client),
            DaemonEvent::Disconnected { client } => self.terminate_client(client),
        }
    }

    /// Admission: fetch the privileges governing the request, consult the
    /// cache, launch the asynchronous checks that remain, and park the
    /// request. A cached or immediate denial short-circuits to a `-1`
    /// reply without ever reaching the queue.
    async fn admit(&mut self, client: ClientId, msgid: u32, request: Request) {
        let mut pending = PendingRequest::new(client, msgid, request);

        if let Some(access) = pending.request.access() {
            let (group_priv, key_priv) =
                self.governing_privileges(&pending.request, access);

            let Some(handle) = self.clients.get(&client) else {
                return;
            };
            let subject = handle.subject().to_owned();
            let user = handle.uid.to_string();

            for (privilege, is_key) in
                [(group_priv, false), (key_priv, true)]
            {
                // Empty or absent privilege: unconditional allow, no check.
                let Some(privilege) = privilege.filter(|p| !p.is_empty()) else {
                    continue;
                };

                let decision = match self.bridge.check(&subject, &user, &privilege) {
                    CacheAnswer::Hit(Verdict::Allowed) => Decision::Granted,
                    CacheAnswer::Hit(Verdict::Denied) => {
                        debug!(client, privilege, "cached denial");
                        self.reply_denied(client, msgid);
                        return;
                    },
                    CacheAnswer::Miss => {
                        match self.bridge.request(&subject, &user, &privilege).await {
                            Issue::Pending(check_id) => {
                                if is_key {
                                    pending.key_check = Some(check_id);
                                } else {
                                    pending.group_check = Some(check_id);
                                }
                                Decision::Required
                            },
                            Issue::Unavailable => {
                                debug!(client, privilege, "service unavailable");
                                self.reply_denied(client, msgid);
                                return;
                            },
                        }
                    },
                };
                if is_key {
                    pending.key_decision = decision;
                } else {
                    pending.group_decision = decision;
                }
            }
        }

        self.queue.push(pending);
    }

    /// The privilege strings governing a request: the group's, and the
    /// key's own when it carries a distinct non-empty one. Lookups that
    /// fail yield no privileges; the handler will fail the request on its
    /// own terms.
    fn governing_privileges(
        &self,
        request: &Request,
        access: Access,
    ) -> (Option<String>, Option<String>) {
        let (layer, group, name) = request.target();

        let group_priv = match self.store.get(layer, group, None, None) {
            Ok((record, _)) => record.privilege(access.is_write()).to_owned(),
            Err(e) => {
                debug!(group, "no group privilege: {e}");
                return (None, None);
            },
        };

        let key_priv = name
            .and_then(|n| self.store.get(layer, group, Some(n), None).ok())
            .map(|(record, _)| record.privilege(access.is_write()).to_owned())
            .filter(|p| !p.is_empty() && *p != group_priv);

        (Some(group_priv), key_priv)
    }

    fn on_auth_answer(&mut self, answer: AuthAnswer) {
        if !self.bridge.on_answer(answer) {
            return;
        }
        if !self.queue.resolve(answer.check_id, answer.verdict) {
            debug!(check_id = answer.check_id, "answer without pending request");
        }
    }

    /// Dispatch every request whose decisions have all resolved. The reply
    /// is written before any fan-out it triggers, so the originator never
    /// observes its own notification ahead of its reply.
    fn drain_ready(&mut self) {
        while let Some(pending) = self.queue.pop_ready() {
            let Some(handle) = self.clients.get(&pending.client) else {
                // Client left while the request was parked.
                continue;
            };

            if !pending.permitted() {
                debug!(client = pending.client, "request denied");
                if !handle.send(handlers::denied_reply(pending.msgid)) {
                    self.terminate_client(pending.client);
                }
                continue;
            }

            let outcome = handlers::handle_request(
                &mut self.store,
                &mut self.registry,
                handle,
                pending.msgid,
                pending.request,
            );
            if !handle.send(outcome.reply) {
                self.terminate_client(pending.client);
                continue;
            }
            if let Some(fanout) = outcome.fanout {
                self.fan_out(&fanout.group, &fanout.name, fanout.value.as_ref());
            }
        }
    }

    fn fan_out(&mut self, group: &str, name: &str, value: Option<&Value>) {
        let deliveries = self.registry.changed(group, name, value);
        let mut dead = Vec::new();
        for delivery in deliveries {
            let Some(handle) = self.clients.get(&delivery.client) else {
                continue;
            };
            let message =
                handlers::changed_message(delivery.msgid, delivery.value.as_ref());
            if !handle.send(message) {
                dead.push(delivery.client);
            }
        }
        for client in dead {
            self.terminate_client(client);
        }
    }

    fn reply_denied(&mut self, client: ClientId, msgid: u32) {
        let alive = self
            .clients
            .get(&client)
            .is_none_or(|handle| handle.send(handlers::denied_reply(msgid)));
        if !alive {
            self.terminate_client(client);
        }
    }

    /// Full termination cascade: subscriptions, parked requests and their
    /// in-flight checks, then the socket tasks.
    fn terminate_client(&mut self, client: ClientId) {
        let Some(handle) = self.clients.remove(&client) else {
            return;
        };
        self.registry.purge_client(client);
        for check_id in self.queue.purge_client(client) {
            self.bridge.cancel(check_id);
        }
        handle.close();
        debug!(client, "client terminated");
    }
}
