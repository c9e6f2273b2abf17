use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{FleetConfig, NodeConfig};
use crate::link::{AttachError, Link, LinkError, same_link};
use crate::lookup::{LookupError, ServerLookup};
use crate::manager::ServerManager;
use crate::protocol;
use crate::scheduler::{GiveUp, RetryScheduler};
use crate::server::Server;
use crate::temp_server::{Completion, PendingClose, PendingServer, TempServer};
use crate::{FleetError, Settings};

/// Shared services every node needs.
#[derive(Clone)]
pub(crate) struct Context {
    pub(crate) settings: Settings,
    pub(crate) scheduler: Arc<RetryScheduler>,
    pub(crate) lookup: Arc<dyn ServerLookup>,
    pub(crate) manager: Weak<ServerManager>,
}

#[derive(Default)]
struct VpsState {
    link: Option<Arc<dyn Link>>,
    bungee: Option<Arc<Server>>,
    creating_bungee: bool,
    servers: HashMap<String, Arc<Server>>,
    temp_servers: HashMap<Uuid, TempServer>,
}

impl VpsState {
    fn is_linked(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.is_connected() && link.is_authenticated())
    }

    fn live_of(&self, server_type: &str) -> usize {
        self.servers.values().filter(|s| s.is_type(server_type)).count()
    }

    fn pending_of(&self, server_type: &str) -> usize {
        self.temp_servers
            .values()
            .filter(|t| t.is_type(server_type))
            .count()
    }
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, Serialize)]
pub struct VpsStatus {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub max_servers: usize,
    pub linked: bool,
    pub closing: bool,
    pub live: usize,
    pub pending: usize,
    pub proxy: Option<String>,
}

/// One worker machine of the fleet.
///
/// All mutable state sits behind a single per-node lock that is never held
/// across an `.await`, a scheduler call or a call into another node.
pub struct Vps {
    id: String,
    config: NodeConfig,
    fleet: Arc<FleetConfig>,
    ctx: Context,
    state: Mutex<VpsState>,
    closing: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Vps {
    pub(crate) fn new(config: NodeConfig, fleet: Arc<FleetConfig>, ctx: Context) -> Arc<Self> {
        Arc::new(Self {
            id: config.id.clone(),
            config,
            fleet,
            ctx,
            state: Mutex::new(VpsState::default()),
            closing: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Whether an authenticated link is attached and connected.
    pub fn is_linked(&self) -> bool {
        self.state.lock().is_linked()
    }

    // ── Link ────────────────────────────────────────────────────────

    pub fn attach_link(&self, link: Arc<dyn Link>) -> Result<(), AttachError> {
        if self.is_closing() {
            return Err(AttachError::Unloaded(self.id.clone()));
        }
        let mut state = self.state.lock();
        if state.link.as_ref().is_some_and(|l| l.is_connected()) {
            return Err(AttachError::AlreadyLinked(self.id.clone()));
        }
        state.link = Some(link);
        tracing::info!(vps_id = %self.id, "vps linked");
        Ok(())
    }

    /// Detach `link` if it is still the node's current link.
    pub fn detach_link(&self, link: &Arc<dyn Link>) -> bool {
        let mut state = self.state.lock();
        match &state.link {
            Some(current) if same_link(current, link) => {
                state.link = None;
                tracing::info!(vps_id = %self.id, "vps unlinked");
                true
            }
            _ => false,
        }
    }

    // ── Lookups ─────────────────────────────────────────────────────

    pub fn get_server(&self, server_id: &str) -> Option<Arc<Server>> {
        self.state.lock().servers.get(server_id).cloned()
    }

    pub fn bungee(&self) -> Option<Arc<Server>> {
        self.state.lock().bungee.clone()
    }

    /// Whether `server_id` is a live server of this node.
    pub fn has(&self, server_id: &str) -> bool {
        self.state.lock().servers.contains_key(server_id)
    }

    pub fn has_temp(&self, correlation_id: Uuid) -> bool {
        self.state.lock().temp_servers.contains_key(&correlation_id)
    }

    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.state.lock().temp_servers.keys().copied().collect()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().servers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().temp_servers.len()
    }

    /// Live and pending instances of `server_type`.
    pub fn count(&self, server_type: &str) -> usize {
        let state = self.state.lock();
        state.live_of(server_type) + state.pending_of(server_type)
    }

    pub fn status(&self) -> VpsStatus {
        let state = self.state.lock();
        VpsStatus {
            id: self.id.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            max_servers: self.config.max_servers,
            linked: state.is_linked(),
            closing: self.is_closing(),
            live: state.servers.len(),
            pending: state.temp_servers.len(),
            proxy: state.bungee.as_ref().map(|b| b.id.clone()),
        }
    }

    /// Placement score for a new server of `server_type`; `0` means ineligible.
    ///
    /// `1 + live + 2 * pending`; pending creations weigh double. The per-type
    /// cap counts pending creations of that type as well as live ones, so a
    /// burst of requests cannot overshoot it.
    pub fn score(&self, server_type: &str) -> usize {
        let state = self.state.lock();
        let live = state.servers.len();
        let pending = state.temp_servers.len();

        if live + pending >= self.config.max_servers {
            return 0;
        }
        if !state.is_linked() {
            return 0;
        }
        let count = state.live_of(server_type) + state.pending_of(server_type);
        if count >= self.config.max_for(server_type) {
            return 0;
        }
        1 + live + 2 * pending
    }

    pub fn register_server(&self, server: Arc<Server>) {
        self.state.lock().servers.insert(server.id.clone(), server);
    }

    pub fn unregister_server(&self, server_id: &str) -> Option<Arc<Server>> {
        self.state.lock().servers.remove(server_id)
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Ask the node to start a server of `server_type`.
    ///
    /// Without `force` the request fails right away with
    /// [`FleetError::NotConnected`] when the node is not linked. With `force`
    /// it is retried until the node is linked or the scheduler gives up.
    pub fn open_server(
        self: &Arc<Self>,
        server_type: &str,
        force: bool,
    ) -> Result<PendingServer, FleetError> {
        let (completion, rx) = Completion::channel();
        let pending = PendingServer::new(self.id.clone(), server_type, rx);

        if !force {
            self.try_open(server_type, &completion)?;
            return Ok(pending);
        }

        let vps = Arc::clone(self);
        let requested = server_type.to_string();
        let attempt_completion = completion.clone();
        let vps_id = self.id.clone();
        self.ctx.scheduler.add(
            move || match vps.try_open(&requested, &attempt_completion) {
                Ok(_) => true,
                Err(_) if vps.is_closing() => {
                    attempt_completion.complete(Err(FleetError::Unknown));
                    true
                }
                Err(_) => false,
            },
            Some(Box::new(move || {
                completion.complete(Err(FleetError::NotConnected(vps_id)));
            })),
        );
        Ok(pending)
    }

    fn try_open(
        self: &Arc<Self>,
        server_type: &str,
        completion: &Completion<Arc<Server>>,
    ) -> Result<Uuid, FleetError> {
        let correlation_id = {
            let mut state = self.state.lock();
            if self.is_closing() || !state.is_linked() {
                tracing::error!(vps_id = %self.id, "vps is not connected");
                return Err(FleetError::NotConnected(self.id.clone()));
            }

            let mut correlation_id = Uuid::new_v4();
            while state.temp_servers.contains_key(&correlation_id) {
                correlation_id = Uuid::new_v4();
            }
            state.temp_servers.insert(
                correlation_id,
                TempServer::new(correlation_id, server_type, completion.clone()),
            );
            correlation_id
        };

        tracing::debug!(
            vps_id = %self.id,
            server_type,
            %correlation_id,
            "opening server"
        );
        let vps = Arc::clone(self);
        self.queue(
            protocol::START,
            protocol::start_payload(correlation_id, server_type),
            Some(Box::new(move || vps.abandon(correlation_id))),
        );
        Ok(correlation_id)
    }

    /// Drop a creation whose `start` never reached the node.
    fn abandon(&self, correlation_id: Uuid) {
        let temp = self.state.lock().temp_servers.remove(&correlation_id);
        if let Some(temp) = temp {
            tracing::warn!(
                vps_id = %self.id,
                %correlation_id,
                server_type = temp.server_type(),
                "start command was never delivered"
            );
            temp.fail(FleetError::NotConnected(self.id.clone()));
        }
    }

    /// Ask the node to stop `server_id`, retried until the node is linked.
    ///
    /// The server leaves the local registry as soon as the stop command is
    /// queued, without waiting for the node to confirm.
    pub fn close_server(self: &Arc<Self>, server_id: &str) -> PendingClose {
        let (completion, rx) = Completion::channel();
        let pending = PendingClose::new(self.id.clone(), server_id, rx);

        let vps = Arc::clone(self);
        let target = server_id.to_string();
        let attempt_completion = completion.clone();
        let vps_id = self.id.clone();
        self.ctx.scheduler.add(
            move || {
                if vps.is_closing() {
                    attempt_completion.complete(Err(FleetError::Unknown));
                    return true;
                }
                if !vps.is_linked() {
                    tracing::error!(vps_id = %vps.id, server_id = %target, "vps is not connected");
                    return false;
                }
                vps.send_message(protocol::STOP, target.clone());
                vps.state.lock().servers.remove(&target);
                attempt_completion.complete(Ok(()));
                true
            },
            Some(Box::new(move || {
                completion.complete(Err(FleetError::NotConnected(vps_id)));
            })),
        );
        pending
    }

    /// Queue `payload` on `channel` for delivery to the node.
    pub fn send_message(self: &Arc<Self>, channel: &'static str, payload: String) {
        self.queue(channel, payload, None);
    }

    fn queue(
        self: &Arc<Self>,
        channel: &'static str,
        payload: String,
        on_give_up: Option<GiveUp>,
    ) {
        let vps = Arc::clone(self);
        self.ctx
            .scheduler
            .add(move || vps.deliver(channel, &payload), on_give_up);
    }

    fn deliver(&self, channel: &'static str, payload: &str) -> bool {
        if self.is_closing() {
            tracing::debug!(vps_id = %self.id, channel, "vps unloaded, dropping command");
            return true;
        }

        let link = self.state.lock().link.clone();
        let Some(link) = link else {
            return false;
        };
        if !link.is_connected() || !link.is_authenticated() {
            return false;
        }

        match link.send(channel, payload) {
            Ok(()) => {
                tracing::debug!(vps_id = %self.id, channel, payload, "sent command");
                true
            }
            Err(LinkError::Backpressure) => {
                tracing::warn!(vps_id = %self.id, channel, "link queue full, retrying later");
                false
            }
            Err(e) => {
                tracing::error!(
                    vps_id = %self.id,
                    channel,
                    error = %e,
                    "error while sending a message to vps"
                );
                link.disconnect("send failed");
                false
            }
        }
    }

    // ── Node reports ────────────────────────────────────────────────

    /// Handle a `register` report: the node created the server `server_id`
    /// for the request `correlation_id`.
    pub async fn on_register(self: &Arc<Self>, correlation_id: Uuid, server_id: String) {
        tracing::debug!(vps_id = %self.id, %correlation_id, %server_id, "server registering");

        let temp = self.state.lock().temp_servers.remove(&correlation_id);
        let Some(temp) = temp else {
            tracing::error!(
                vps_id = %self.id,
                %correlation_id,
                %server_id,
                "got a new server for an unknown correlation id, stopping it"
            );
            self.stop_unwanted(server_id);
            return;
        };

        let timeout = self.ctx.settings.lookup_timeout;
        let lookup = tokio::time::timeout(timeout, self.ctx.lookup.get_server(&server_id))
            .await
            .unwrap_or(Err(LookupError::Timeout(timeout)));

        let record = match lookup {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    vps_id = %self.id,
                    %server_id,
                    error = %e,
                    "failed to look up registered server, stopping it"
                );
                self.stop_unwanted(server_id);
                return;
            }
        };

        if !record.vps.eq_ignore_ascii_case(&self.id) {
            tracing::error!(
                vps_id = %self.id,
                %server_id,
                owner = %record.vps,
                "registered server belongs to another vps, stopping it"
            );
            self.stop_unwanted(server_id);
            return;
        }

        let server = Arc::new(Server::from_record(record));
        let committed = {
            let mut state = self.state.lock();
            if self.is_closing() {
                false
            } else {
                if self.fleet.is_proxy(temp.server_type()) {
                    state.bungee = Some(Arc::clone(&server));
                } else {
                    state.servers.insert(server.id.clone(), Arc::clone(&server));
                }
                true
            }
        };
        if !committed {
            tracing::warn!(
                vps_id = %self.id,
                %server_id,
                "vps unloaded during registration, stopping server"
            );
            self.stop_unwanted(server_id);
            return;
        }
        tracing::info!(
            vps_id = %self.id,
            server_id = %server.id,
            server_type = %server.server_type,
            "server registered"
        );

        let announce = protocol::announce_payload(&server.id, &server.server_type);
        for peer in self.peers() {
            if peer.id != self.id {
                peer.send_message(protocol::REGISTER, announce.clone());
            }
        }

        temp.succeed(server);
    }

    /// Stop a server the plane will not track.
    ///
    /// Once this node is unloaded the command goes to the node that replaced
    /// it on reload, since an unloaded node drops everything it is asked to send.
    fn stop_unwanted(self: &Arc<Self>, server_id: String) {
        let successor = if self.is_closing() {
            self.peers()
                .into_iter()
                .find(|peer| peer.id == self.id && !peer.is_closing())
        } else {
            None
        };
        match successor {
            Some(successor) => successor.send_message(protocol::STOP, server_id),
            None => self.send_message(protocol::STOP, server_id),
        }
    }

    /// Handle an `error` report. Returns whether the id was pending here.
    pub fn error(&self, correlation_id: Uuid) -> bool {
        let temp = self.state.lock().temp_servers.remove(&correlation_id);
        let Some(temp) = temp else {
            return false;
        };
        tracing::debug!(
            vps_id = %self.id,
            %correlation_id,
            server_type = temp.server_type(),
            "node failed to create server"
        );
        temp.fail(FleetError::Unknown);
        true
    }

    /// Handle an `unregister` report and tell the whole fleet about it.
    pub fn on_unregister(self: &Arc<Self>, server_id: &str, server_type: &str) {
        {
            let mut state = self.state.lock();
            if self.fleet.is_proxy(server_type) {
                if state
                    .bungee
                    .as_ref()
                    .is_some_and(|b| b.id.eq_ignore_ascii_case(server_id))
                {
                    state.bungee = None;
                }
            } else {
                state.servers.remove(server_id);
            }
        }
        tracing::info!(vps_id = %self.id, server_id, server_type, "server unregistered");

        let announce = protocol::announce_payload(server_id, server_type);
        for peer in self.peers() {
            peer.unregister_server(server_id);
            peer.send_message(protocol::UNREGISTER, announce.clone());
        }
    }

    fn peers(&self) -> Vec<Arc<Vps>> {
        self.ctx
            .manager
            .upgrade()
            .map(|manager| manager.get_vps())
            .unwrap_or_default()
    }

    // ── Reconciliation ──────────────────────────────────────────────

    /// Spawn the background loop that keeps the configured minimums running.
    pub fn start(self: &Arc<Self>) {
        let period = self.ctx.settings.reconcile_interval;
        let vps = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(vps) = vps.upgrade() else {
                    break;
                };
                if vps.is_closing() {
                    break;
                }
                vps.reconcile();
            }
        });

        if let Some(previous) = self.worker.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Run one reconciliation pass. Returns how many start requests it issued.
    ///
    /// Requests the proxy if the node has none, then the shortfall of every
    /// configured minimum, issuing at most `max_starts_per_tick` requests.
    pub fn reconcile(self: &Arc<Self>) -> usize {
        if self.is_closing() {
            return 0;
        }
        if !self.is_linked() {
            tracing::warn!(vps_id = %self.id, "vps is not linked");
            return 0;
        }

        let limit = self.ctx.settings.max_starts_per_tick;
        let mut issued = 0;

        let request_proxy = {
            let mut state = self.state.lock();
            let wanted = limit > 0 && state.bungee.is_none() && !state.creating_bungee;
            if wanted {
                state.creating_bungee = true;
            }
            wanted
        };
        if request_proxy {
            issued += 1;
            self.open_proxy();
        }

        let shortfalls: Vec<(String, usize)> = {
            let state = self.state.lock();
            self.fleet
                .server_types
                .iter()
                .filter(|t| !self.fleet.is_proxy(t))
                .filter_map(|t| {
                    let min = self.config.min_for(t);
                    let have = state.live_of(t) + state.pending_of(t);
                    (have < min).then(|| (t.clone(), min - have))
                })
                .collect()
        };

        'types: for (server_type, missing) in shortfalls {
            for _ in 0..missing {
                if issued >= limit {
                    break 'types;
                }
                match self.open_server(&server_type, false) {
                    Ok(pending) => {
                        issued += 1;
                        tokio::spawn(async move {
                            let vps_id = pending.vps_id().to_string();
                            let server_type = pending.target().to_string();
                            match pending.wait().await {
                                Ok(server) => tracing::info!(
                                    %vps_id,
                                    server_id = %server.id,
                                    %server_type,
                                    "server started"
                                ),
                                Err(e) => tracing::error!(
                                    %vps_id,
                                    %server_type,
                                    error = %e,
                                    "error while starting server"
                                ),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(
                            vps_id = %self.id,
                            %server_type,
                            error = %e,
                            "error while starting server"
                        );
                        break 'types;
                    }
                }
            }
        }

        issued
    }

    fn open_proxy(self: &Arc<Self>) {
        let proxy_type = self.fleet.proxy_type.clone();
        match self.open_server(&proxy_type, false) {
            Ok(pending) => {
                let vps = Arc::downgrade(self);
                tokio::spawn(async move {
                    let result = pending.wait().await;
                    let Some(vps) = vps.upgrade() else {
                        return;
                    };
                    vps.state.lock().creating_bungee = false;
                    match result {
                        Ok(_) => tracing::info!(vps_id = %vps.id, "bungee started"),
                        Err(e) => tracing::error!(
                            vps_id = %vps.id,
                            error = %e,
                            "error while starting bungee"
                        ),
                    }
                });
            }
            Err(e) => {
                self.state.lock().creating_bungee = false;
                tracing::error!(vps_id = %self.id, error = %e, "error while starting bungee");
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Detach the link and stop the reconciliation loop. Idempotent.
    pub fn unload(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(vps_id = %self.id, "unloading vps");

        let (link, abandoned) = {
            let mut state = self.state.lock();
            let abandoned: Vec<TempServer> = state.temp_servers.drain().map(|(_, t)| t).collect();
            (state.link.take(), abandoned)
        };
        if let Some(link) = link {
            link.disconnect("Vps unloaded");
        }
        for temp in abandoned {
            temp.fail(FleetError::Unknown);
        }
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }

        tracing::info!(vps_id = %self.id, "vps unloaded");
    }
}

impl Drop for Vps {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}
