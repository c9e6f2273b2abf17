use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::config::{ConfigSource, FleetConfig};
use crate::link::AttachError;
use crate::lookup::ServerLookup;
use crate::scheduler::RetryScheduler;
use crate::server::Server;
use crate::temp_server::{PendingClose, PendingServer};
use crate::vps::{Context, Vps};
use crate::{FleetError, Result, Settings};

/// Owns every node of the fleet and places new servers.
pub struct ServerManager {
    source: Arc<dyn ConfigSource>,
    scheduler: Arc<RetryScheduler>,
    lookup: Arc<dyn ServerLookup>,
    settings: Settings,
    config: RwLock<Arc<FleetConfig>>,
    nodes: RwLock<BTreeMap<String, Arc<Vps>>>,
    this: Weak<ServerManager>,
}

impl ServerManager {
    /// Create an empty manager. Call [`reload`](Self::reload) to load the fleet.
    pub fn new(
        source: Arc<dyn ConfigSource>,
        scheduler: Arc<RetryScheduler>,
        lookup: Arc<dyn ServerLookup>,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            source,
            scheduler,
            lookup,
            settings,
            config: RwLock::new(Arc::new(FleetConfig::default())),
            nodes: RwLock::new(BTreeMap::new()),
            this: this.clone(),
        })
    }

    /// Re-read the configuration and rebuild every node from it.
    ///
    /// Existing nodes are unloaded first; links have to reconnect afterwards.
    /// On a configuration error the current fleet is left untouched.
    pub fn reload(&self) -> Result<()> {
        let config = match self.source.load() {
            Ok(config) => Arc::new(config),
            Err(e) => {
                tracing::error!(error = %e, "failed to load fleet config, keeping current fleet");
                return Err(e);
            }
        };

        let previous = std::mem::take(&mut *self.nodes.write());
        for vps in previous.values() {
            vps.unload();
        }

        let ctx = self.context();
        let mut nodes = BTreeMap::new();
        for node in &config.nodes {
            let vps = Vps::new(node.clone(), Arc::clone(&config), ctx.clone());
            vps.start();
            tracing::info!(
                vps_id = %node.id,
                host = %node.host,
                port = node.port,
                max_servers = node.max_servers,
                "loaded vps"
            );
            nodes.insert(node.id.clone(), vps);
        }

        tracing::info!(
            nodes = nodes.len(),
            unloaded = previous.len(),
            server_types = config.server_types.len(),
            "fleet reloaded"
        );
        *self.config.write() = config;
        *self.nodes.write() = nodes;
        Ok(())
    }

    fn context(&self) -> Context {
        Context {
            settings: self.settings.clone(),
            scheduler: Arc::clone(&self.scheduler),
            lookup: Arc::clone(&self.lookup),
            manager: self.this.clone(),
        }
    }

    pub fn config(&self) -> Arc<FleetConfig> {
        self.config.read().clone()
    }

    /// Every node, ordered by id.
    pub fn get_vps(&self) -> Vec<Arc<Vps>> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn vps(&self, vps_id: &str) -> Option<Arc<Vps>> {
        self.nodes.read().get(vps_id).cloned()
    }

    /// Resolve the node a link token authenticates as.
    pub fn vps_for_token(&self, token: &str) -> std::result::Result<Arc<Vps>, AttachError> {
        let vps_id = self
            .config
            .read()
            .node_for_token(token)
            .ok_or(AttachError::InvalidToken)?
            .to_string();
        self.vps(&vps_id).ok_or(AttachError::UnknownVps(vps_id))
    }

    /// Live server `server_id`, on whichever node runs it.
    pub fn get_server(&self, server_id: &str) -> Option<Arc<Server>> {
        self.nodes
            .read()
            .values()
            .find_map(|vps| vps.get_server(server_id))
    }

    /// Node with the lowest positive score for `server_type`.
    ///
    /// Ties go to the node that sorts first by id.
    pub fn find_optimal_vps(&self, server_type: &str) -> Option<Arc<Vps>> {
        let nodes = self.nodes.read();
        let mut best: Option<(usize, &Arc<Vps>)> = None;
        for vps in nodes.values() {
            let score = vps.score(server_type);
            if score == 0 {
                continue;
            }
            if best.is_none_or(|(lowest, _)| score < lowest) {
                best = Some((score, vps));
            }
        }
        best.map(|(_, vps)| Arc::clone(vps))
    }

    /// Start a server of `server_type` on the least loaded node.
    ///
    /// Fails right away with [`FleetError::TypeNotFound`] or
    /// [`FleetError::Full`]; any later failure resolves the returned pending
    /// request with [`FleetError::Unknown`].
    pub fn open_server(&self, server_type: &str) -> std::result::Result<PendingServer, FleetError> {
        if !self.config.read().has_type(server_type) {
            tracing::error!(server_type, "server type not found");
            return Err(FleetError::TypeNotFound(server_type.to_string()));
        }

        let Some(vps) = self.find_optimal_vps(server_type) else {
            tracing::error!(server_type, "no vps available");
            return Err(FleetError::Full(server_type.to_string()));
        };

        tracing::debug!(vps_id = %vps.id(), server_type, "placing server");
        match vps.open_server(server_type, false) {
            Ok(pending) => Ok(pending.opaque()),
            Err(e) => {
                tracing::info!(
                    vps_id = %vps.id(),
                    server_type,
                    error = %e,
                    "request on vps failed"
                );
                Err(FleetError::Unknown)
            }
        }
    }

    /// Stop `server_id` on the node that runs it.
    ///
    /// Returns `None` when no node knows the server.
    pub fn close_server(&self, server_id: &str) -> Option<PendingClose> {
        let owner = self
            .nodes
            .read()
            .values()
            .find(|vps| vps.has(server_id))
            .cloned();

        match owner {
            Some(vps) => Some(vps.close_server(server_id).opaque()),
            None => {
                tracing::debug!(server_id, "close requested for unknown server");
                None
            }
        }
    }

    /// Unload every node and stop the retry scheduler.
    pub fn shutdown(&self) {
        let nodes = std::mem::take(&mut *self.nodes.write());
        for vps in nodes.values() {
            vps.unload();
        }
        self.scheduler.shutdown();
        tracing::info!(nodes = nodes.len(), "server manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::testing::{Harness, MockLink, MockLookup, fleet, limits, node, record};

    #[tokio::test]
    async fn reload_builds_one_vps_per_node() {
        let harness = Harness::new(fleet(vec![node("vps02", 5), node("vps01", 5)]));

        let ids: Vec<String> = harness
            .manager
            .get_vps()
            .iter()
            .map(|v| v.id().to_string())
            .collect();
        assert_eq!(ids, vec!["vps01", "vps02"]);
        assert_eq!(
            harness.manager.vps_for_token("token-vps02").unwrap().id(),
            "vps02"
        );
        assert_eq!(
            harness.manager.vps_for_token("bogus").err(),
            Some(AttachError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn reload_replaces_and_unloads_previous_nodes() {
        let harness = Harness::new(fleet(vec![node("vps01", 5)]));
        let old = harness.manager.vps("vps01").unwrap();
        let link = MockLink::attach(&old);

        harness
            .source
            .set(fleet(vec![node("vps01", 5), node("vps03", 5)]));
        harness.manager.reload().unwrap();

        assert!(old.is_closing());
        assert_eq!(link.disconnects(), 1);
        let new = harness.manager.vps("vps01").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!new.is_linked());
        assert_eq!(harness.manager.get_vps().len(), 2);
    }

    #[tokio::test]
    async fn token_for_missing_node_is_unknown_vps() {
        let mut config = fleet(vec![node("vps01", 5)]);
        config.tokens.insert("token-vps09".into(), "vps09".into());
        let harness = Harness::new(config);

        assert_eq!(
            harness.manager.vps_for_token("token-vps09").err(),
            Some(AttachError::UnknownVps("vps09".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn server_confirmed_after_reload_is_stopped_by_successor() {
        let lookup = MockLookup::new();
        lookup.delay(record("lobby-1", "vps01", "LOBBY"), Duration::from_secs(1));
        let harness = Harness::with_lookup(fleet(vec![node("vps01", 10)]), lookup);
        let old = harness.manager.vps("vps01").unwrap();
        let _old_link = MockLink::attach(&old);

        let pending = old.open_server("LOBBY", false).unwrap();
        let correlation_id = old.pending_ids()[0];
        let registering = tokio::spawn({
            let old = Arc::clone(&old);
            async move { old.on_register(correlation_id, "lobby-1".into()).await }
        });
        tokio::task::yield_now().await;

        harness.manager.reload().unwrap();
        let current = harness.manager.vps("vps01").unwrap();
        let link = MockLink::attach(&current);
        registering.await.unwrap();
        harness.scheduler.tick();
        harness.scheduler.tick();

        assert_eq!(link.sent_on("stop"), vec!["lobby-1".to_string()]);
        assert!(!old.has("lobby-1"));
        assert!(!current.has("lobby-1"));
        assert_eq!(pending.wait().await.err(), Some(FleetError::Unknown));
    }

    #[tokio::test]
    async fn failed_reload_keeps_current_fleet() {
        let harness = Harness::new(fleet(vec![node("vps01", 5)]));
        let current = harness.manager.vps("vps01").unwrap();

        harness
            .source
            .set(fleet(vec![node("dup", 5), node("dup", 5)]));

        assert!(harness.manager.reload().is_err());
        assert!(!current.is_closing());
        assert!(harness.manager.vps("vps01").is_some());
    }

    #[tokio::test]
    async fn placement_picks_lowest_positive_score() {
        let harness = Harness::new(fleet(vec![
            node("vps01", 10),
            node("vps02", 10),
            node("vps03", 10),
        ]));
        let vps01 = harness.manager.vps("vps01").unwrap();
        let vps02 = harness.manager.vps("vps02").unwrap();
        let _l1 = MockLink::attach(&vps01);
        let _l2 = MockLink::attach(&vps02);
        vps01.register_server(Arc::new(Server::from_record(record("a", "vps01", "LOBBY"))));

        let chosen = harness.manager.find_optimal_vps("LOBBY").unwrap();
        assert_eq!(chosen.id(), "vps02", "vps03 is unlinked and vps01 is busier");

        let pending = harness.manager.open_server("LOBBY").unwrap();
        assert_eq!(pending.vps_id(), "vps02");
        assert_eq!(vps02.pending_count(), 1);
    }

    #[tokio::test]
    async fn ties_go_to_first_node() {
        let harness = Harness::new(fleet(vec![node("vps02", 10), node("vps01", 10)]));
        let _links: Vec<_> = harness
            .manager
            .get_vps()
            .iter()
            .map(MockLink::attach)
            .collect();

        assert_eq!(harness.manager.find_optimal_vps("LOBBY").unwrap().id(), "vps01");
    }

    #[tokio::test]
    async fn unknown_type_sends_nothing() {
        let harness = Harness::new(fleet(vec![node("vps01", 10)]));
        let vps = harness.manager.vps("vps01").unwrap();
        let _link = MockLink::attach(&vps);

        let err = harness.manager.open_server("SKYWARS").err();

        assert_eq!(err, Some(FleetError::TypeNotFound("SKYWARS".into())));
        assert!(harness.scheduler.is_empty());
        assert_eq!(vps.pending_count(), 0);
    }

    #[tokio::test]
    async fn full_when_no_node_is_eligible() {
        let mut capped = node("vps01", 10);
        capped.types.insert("KOTH".into(), limits(0, Some(0)));
        let harness = Harness::new(fleet(vec![capped, node("vps02", 10)]));
        let _link = MockLink::attach(&harness.manager.vps("vps01").unwrap());

        assert_eq!(
            harness.manager.open_server("KOTH").err(),
            Some(FleetError::Full("KOTH".into()))
        );
        assert!(harness.manager.open_server("LOBBY").is_ok());
    }

    #[tokio::test]
    async fn delegated_failures_surface_as_unknown() {
        let harness = Harness::new(fleet(vec![node("vps01", 10)]));
        let vps = harness.manager.vps("vps01").unwrap();
        let _link = MockLink::attach(&vps);

        let pending = harness.manager.open_server("LOBBY").unwrap();
        vps.unload();

        assert_eq!(pending.wait().await.err(), Some(FleetError::Unknown));
    }

    #[tokio::test]
    async fn register_is_announced_to_other_nodes() {
        let lookup = MockLookup::new();
        lookup.insert(record("lobby-1", "vps01", "LOBBY"));
        let harness =
            Harness::with_lookup(fleet(vec![node("vps01", 10), node("vps02", 10)]), lookup);
        let vps01 = harness.manager.vps("vps01").unwrap();
        let vps02 = harness.manager.vps("vps02").unwrap();
        let link01 = MockLink::attach(&vps01);
        let link02 = MockLink::attach(&vps02);

        let pending = harness.manager.open_server("LOBBY").unwrap();
        let correlation_id = vps01.pending_ids()[0];
        vps01.on_register(correlation_id, "lobby-1".into()).await;
        harness.scheduler.tick();
        harness.scheduler.tick();

        assert_eq!(pending.wait().await.unwrap().id, "lobby-1");
        assert_eq!(harness.manager.get_server("lobby-1").unwrap().vps_id, "vps01");
        assert_eq!(link02.sent_on("register"), vec!["lobby-1 LOBBY".to_string()]);
        assert!(link01.sent_on("register").is_empty());
    }

    #[tokio::test]
    async fn unregister_is_announced_to_every_node() {
        let harness = Harness::new(fleet(vec![node("vps01", 10), node("vps02", 10)]));
        let vps01 = harness.manager.vps("vps01").unwrap();
        let vps02 = harness.manager.vps("vps02").unwrap();
        let link01 = MockLink::attach(&vps01);
        let link02 = MockLink::attach(&vps02);
        vps01.register_server(Arc::new(Server::from_record(record("koth-1", "vps01", "KOTH"))));

        vps01.on_unregister("koth-1", "KOTH");
        harness.scheduler.tick();

        assert!(harness.manager.get_server("koth-1").is_none());
        assert_eq!(link01.sent_on("unregister"), vec!["koth-1 KOTH".to_string()]);
        assert_eq!(link02.sent_on("unregister"), vec!["koth-1 KOTH".to_string()]);
    }

    #[tokio::test]
    async fn close_targets_owning_node() {
        let harness = Harness::new(fleet(vec![node("vps01", 10), node("vps02", 10)]));
        let vps02 = harness.manager.vps("vps02").unwrap();
        let link = MockLink::attach(&vps02);
        vps02.register_server(Arc::new(Server::from_record(record("koth-1", "vps02", "KOTH"))));

        let pending = harness.manager.close_server("koth-1").unwrap();
        assert_eq!(pending.vps_id(), "vps02");
        harness.scheduler.tick();
        harness.scheduler.tick();

        assert_eq!(pending.wait().await, Ok(()));
        assert_eq!(link.sent_on("stop"), vec!["koth-1".to_string()]);
        assert!(harness.manager.close_server("koth-1").is_none());
    }

    #[tokio::test]
    async fn shutdown_unloads_everything() {
        let harness = Harness::new(fleet(vec![node("vps01", 10)]));
        let vps = harness.manager.vps("vps01").unwrap();

        harness.manager.shutdown();

        assert!(vps.is_closing());
        assert!(harness.manager.get_vps().is_empty());
        assert!(harness.scheduler.is_stopped());
    }
}
