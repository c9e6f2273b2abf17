//! Fakes and builders shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use registry_api::ServerRecord;

use crate::config::{FleetConfig, NodeConfig, StaticConfigSource, TypeLimits};
use crate::link::{Link, LinkError};
use crate::lookup::{LookupError, ServerLookup};
use crate::manager::ServerManager;
use crate::scheduler::{RetryPolicy, RetryScheduler};
use crate::vps::{Context, Vps};
use crate::Settings;

/// In-memory link that records every message sent through it.
pub(crate) struct MockLink {
    sent: Mutex<Vec<(String, String)>>,
    connected: AtomicBool,
    authenticated: AtomicBool,
    fail_sends: AtomicBool,
    disconnects: AtomicUsize,
}

impl MockLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            authenticated: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
        })
    }

    /// New connected link attached to `vps`.
    pub(crate) fn attach(vps: &Arc<Vps>) -> Arc<Self> {
        let link = Self::new();
        vps.attach_link(link.clone()).unwrap();
        link
    }

    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_on(&self, channel: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl Link for MockLink {
    fn send(&self, channel: &str, payload: &str) -> Result<(), LinkError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.sent.lock().push((channel.to_string(), payload.to_string()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn disconnect(&self, _reason: &str) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
    }
}

enum Answer {
    Record(ServerRecord),
    Delayed(ServerRecord, Duration),
    Fail(LookupError),
    Hang,
}

/// Registry stand-in answering from a fixed table.
pub(crate) struct MockLookup {
    answers: Mutex<HashMap<String, Answer>>,
    calls: AtomicUsize,
}

impl MockLookup {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn insert(&self, record: ServerRecord) {
        self.answers
            .lock()
            .insert(record.id.clone(), Answer::Record(record));
    }

    pub(crate) fn fail(&self, server_id: &str, error: LookupError) {
        self.answers
            .lock()
            .insert(server_id.to_string(), Answer::Fail(error));
    }

    /// Answer with `record` only after `delay`.
    pub(crate) fn delay(&self, record: ServerRecord, delay: Duration) {
        self.answers
            .lock()
            .insert(record.id.clone(), Answer::Delayed(record, delay));
    }

    /// Never answer lookups of `server_id`.
    pub(crate) fn hang(&self, server_id: &str) {
        self.answers.lock().insert(server_id.to_string(), Answer::Hang);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerLookup for MockLookup {
    async fn get_server(&self, server_id: &str) -> Result<ServerRecord, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (delay, answer) = match self.answers.lock().get(server_id) {
            Some(Answer::Record(record)) => (Duration::ZERO, Some(Ok(record.clone()))),
            Some(Answer::Delayed(record, delay)) => (*delay, Some(Ok(record.clone()))),
            Some(Answer::Fail(error)) => (Duration::ZERO, Some(Err(error.clone()))),
            Some(Answer::Hang) => (Duration::ZERO, None),
            None => (
                Duration::ZERO,
                Some(Err(LookupError::NotFound(server_id.to_string()))),
            ),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match answer {
            Some(answer) => answer,
            None => std::future::pending().await,
        }
    }
}

pub(crate) fn node(id: &str, max_servers: usize) -> NodeConfig {
    NodeConfig {
        id: id.to_string(),
        host: "127.0.0.1".into(),
        port: 25000,
        max_servers,
        types: HashMap::new(),
    }
}

/// Fleet with the `BUNGEE`, `LOBBY` and `KOTH` types and a `token-<id>` per node.
pub(crate) fn fleet(nodes: Vec<NodeConfig>) -> FleetConfig {
    FleetConfig {
        server_types: vec!["BUNGEE".into(), "LOBBY".into(), "KOTH".into()],
        tokens: nodes
            .iter()
            .map(|n| (format!("token-{}", n.id), n.id.clone()))
            .collect(),
        nodes,
        ..FleetConfig::default()
    }
}

pub(crate) fn limits(min: usize, max: Option<usize>) -> TypeLimits {
    TypeLimits { min, max }
}

pub(crate) fn record(id: &str, vps: &str, server_type: &str) -> ServerRecord {
    ServerRecord {
        id: id.to_string(),
        name: None,
        server_type: server_type.to_string(),
        port: Some(25565),
        status: Some("running".into()),
        vps: vps.to_string(),
        creation_time: None,
    }
}

fn test_scheduler() -> Arc<RetryScheduler> {
    Arc::new(RetryScheduler::new(RetryPolicy {
        tick: Duration::from_millis(10),
        max_attempts: 60,
    }))
}

/// Node outside any manager, with a scheduler the test ticks by hand.
pub(crate) fn standalone(
    config: NodeConfig,
    lookup: Arc<MockLookup>,
) -> (Arc<Vps>, Arc<RetryScheduler>, Arc<MockLookup>) {
    let scheduler = test_scheduler();
    let fleet = Arc::new(fleet(vec![config.clone()]));
    let ctx = Context {
        settings: Settings::default(),
        scheduler: scheduler.clone(),
        lookup: lookup.clone(),
        manager: Weak::new(),
    };
    (Vps::new(config, fleet, ctx), scheduler, lookup)
}

/// Loaded manager whose scheduler and reconciliation loops stay idle.
pub(crate) struct Harness {
    pub(crate) manager: Arc<ServerManager>,
    pub(crate) scheduler: Arc<RetryScheduler>,
    pub(crate) source: Arc<StaticConfigSource>,
}

impl Harness {
    pub(crate) fn new(config: FleetConfig) -> Self {
        Self::with_lookup(config, MockLookup::new())
    }

    pub(crate) fn with_lookup(config: FleetConfig, lookup: Arc<MockLookup>) -> Self {
        let scheduler = test_scheduler();
        let source = Arc::new(StaticConfigSource::new(config));
        let settings = Settings {
            reconcile_interval: Duration::from_secs(3600),
            ..Settings::default()
        };
        let manager = ServerManager::new(source.clone(), scheduler.clone(), lookup, settings);
        manager.reload().unwrap();
        Self {
            manager,
            scheduler,
            source,
        }
    }
}
