//! The prefix manager event loop.
//!
//! One tokio task owns the prefix map, the persistent store, and the KV
//! client. Requests arrive over an mpsc channel with oneshot reply senders;
//! publication and persistence are gated behind the startup hold deadline,
//! which a single timer wake-up opens permanently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, error, info, warn};

use meshpath_core::stats::{Counters, MonitorClient};

use crate::codec;
use crate::kv::KvClient;
use crate::map::PrefixMap;
use crate::store::ConfigStore;
use crate::types::{
    PerfEvent, PerfEvents, PrefixCommand, PrefixDatabase, PrefixRequest, PrefixResponse,
};

/// Key for the persisted configuration on disk.
pub const CONFIG_STORE_KEY: &str = "prefix-manager-config";

/// Default marker prepended to the node id to form the KV key.
pub const DEFAULT_PREFIX_DB_MARKER: &str = "prefix:";

pub const COUNTER_ADD_PREFIXES: &str = "prefix_manager.add_prefixes";
pub const COUNTER_WITHDRAW_PREFIXES: &str = "prefix_manager.withdraw_prefixes";
pub const COUNTER_QUEUE_SIZE: &str = "prefix_manager.zmq_event_queue_size";

// Standardized error messages.
const ERR_NO_CHANGES: &str = "No changes in prefixes to be advertised";
const ERR_NO_PREFIX_TO_REMOVE: &str = "No prefix to remove";
const ERR_NO_PREFIXES_OF_TYPE: &str = "No prefixes of type";
const ERR_UNKNOWN_COMMAND: &str = "Unknown command";

const PERF_EVENT_DB_UPDATED: &str = "PREFIX_DB_UPDATED";

const DEFAULT_KV_TTL_MS: u64 = 300_000;
const DEFAULT_KV_REFRESH_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MONITOR_SUBMIT_INTERVAL_MS: u64 = 5_000;

/// Depth of the request queue feeding the loop.
const REQUEST_QUEUE: usize = 64;

/// Configuration for the prefix manager.
#[derive(Debug, Clone)]
pub struct PrefixManagerConfig {
    /// This node's identifier; forms the KV key together with the marker.
    pub node_id: String,
    pub prefix_db_marker: String,
    /// Attach a `PREFIX_DB_UPDATED` perf event to persistence writes.
    pub enable_perf_measurement: bool,
    /// Startup grace period before anything is persisted or published.
    pub hold_time_ms: u64,
    pub kv_ttl_ms: u64,
    pub kv_refresh_interval_ms: u64,
    pub monitor_submit_interval_ms: u64,
}

impl PrefixManagerConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            prefix_db_marker: DEFAULT_PREFIX_DB_MARKER.to_string(),
            enable_perf_measurement: false,
            hold_time_ms: 0,
            kv_ttl_ms: DEFAULT_KV_TTL_MS,
            kv_refresh_interval_ms: DEFAULT_KV_REFRESH_INTERVAL_MS,
            monitor_submit_interval_ms: DEFAULT_MONITOR_SUBMIT_INTERVAL_MS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PrefixError {
    #[error("prefix manager channel closed")]
    ChannelClosed,
}

enum ManagerCommand {
    Request(PrefixRequest, oneshot::Sender<PrefixResponse>),
    GetCounters(oneshot::Sender<HashMap<String, i64>>),
}

/// Cloneable handle for posting requests into the manager loop.
#[derive(Clone)]
pub struct PrefixManagerHandle {
    cmd_tx: mpsc::Sender<ManagerCommand>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl PrefixManagerHandle {
    /// Submit a request and await its response.
    pub async fn request(&self, request: PrefixRequest) -> Result<PrefixResponse, PrefixError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::Request(request, tx))
            .await
            .map_err(|_| PrefixError::ChannelClosed)?;
        rx.await.map_err(|_| PrefixError::ChannelClosed)
    }

    /// Snapshot the loop's counters (posted closure, answered in order).
    pub async fn counters(&self) -> Result<HashMap<String, i64>, PrefixError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::GetCounters(tx))
            .await
            .map_err(|_| PrefixError::ChannelClosed)?;
        rx.await.map_err(|_| PrefixError::ChannelClosed)
    }

    /// Signal the loop to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// What a processed request requires beyond the response.
struct Effects {
    publish: bool,
    persist: bool,
}

/// Loop-owned state, separated from the channels so the select handlers
/// can borrow it mutably.
struct ManagerCore<S, K, M> {
    cfg: PrefixManagerConfig,
    map: PrefixMap,
    store: S,
    kv: K,
    monitor: M,
    counters: Counters,
    hold_open: bool,
}

impl<S: ConfigStore, K: KvClient, M: MonitorClient> ManagerCore<S, K, M> {
    /// Pick up persisted prefixes; absent or corrupt data starts empty.
    async fn load_from_disk(&mut self) {
        match self.store.load(CONFIG_STORE_KEY).await {
            Ok(Some(bytes)) => match postcard::from_bytes::<PrefixDatabase>(&bytes) {
                Ok(db) => {
                    info!(
                        count = db.prefix_entries.len(),
                        "successfully loaded prefixes from disk"
                    );
                    for entry in &db.prefix_entries {
                        info!("  > {}", entry.prefix);
                    }
                    self.map = PrefixMap::from_entries(db.prefix_entries);
                }
                Err(e) => {
                    warn!("corrupt persistent prefix database, starting empty: {e}");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!("failed to load persistent prefix database: {e}");
            }
        }
    }

    fn process_request(&mut self, req: &PrefixRequest) -> (PrefixResponse, Effects) {
        let mut persistent_change = false;

        let response = match req.command {
            PrefixCommand::AddPrefixes => {
                self.counters.bump(COUNTER_ADD_PREFIXES);
                persistent_change = PrefixMap::any_input_persistent(&req.prefixes);
                if self.map.add_or_update(&req.prefixes) {
                    PrefixResponse::ok()
                } else {
                    PrefixResponse::fail(ERR_NO_CHANGES)
                }
            }
            PrefixCommand::WithdrawPrefixes => {
                persistent_change = self.map.any_existing_persistent(&req.prefixes);
                if self.map.remove(&req.prefixes) {
                    self.counters.bump(COUNTER_WITHDRAW_PREFIXES);
                    PrefixResponse::ok()
                } else {
                    PrefixResponse::fail(ERR_NO_PREFIX_TO_REMOVE)
                }
            }
            PrefixCommand::WithdrawPrefixesByType => match req.prefix_type {
                Some(prefix_type) => {
                    persistent_change = self.map.any_existing_persistent_by_type(prefix_type);
                    if self.map.remove_by_type(prefix_type) {
                        PrefixResponse::ok()
                    } else {
                        PrefixResponse::fail(ERR_NO_PREFIXES_OF_TYPE)
                    }
                }
                None => PrefixResponse::fail(ERR_NO_PREFIXES_OF_TYPE),
            },
            PrefixCommand::SyncPrefixesByType => match req.prefix_type {
                Some(prefix_type) => {
                    persistent_change = self.map.any_existing_persistent_by_type(prefix_type)
                        || PrefixMap::any_input_persistent(&req.prefixes);
                    if self.map.sync_by_type(prefix_type, &req.prefixes) {
                        PrefixResponse::ok()
                    } else {
                        PrefixResponse::fail(ERR_NO_CHANGES)
                    }
                }
                None => PrefixResponse::fail(ERR_NO_CHANGES),
            },
            PrefixCommand::GetAllPrefixes => PrefixResponse::ok_with(self.map.get_all()),
            PrefixCommand::GetPrefixesByType => PrefixResponse::ok_with(
                req.prefix_type
                    .map(|t| self.map.get_by_type(t))
                    .unwrap_or_default(),
            ),
            PrefixCommand::Unknown(tag) => {
                error!(tag, "unknown command received");
                PrefixResponse::fail(ERR_UNKNOWN_COMMAND)
            }
        };

        let mutating = matches!(
            req.command,
            PrefixCommand::AddPrefixes
                | PrefixCommand::WithdrawPrefixes
                | PrefixCommand::WithdrawPrefixesByType
                | PrefixCommand::SyncPrefixesByType
        );
        let publish = response.success && mutating;
        let effects = Effects {
            publish,
            persist: publish && persistent_change,
        };
        (response, effects)
    }

    /// Write the persistent subset to the config store.
    async fn persist_db(&mut self) {
        if !self.hold_open {
            // Too early; the hold timer performs the initial write.
            debug!("hold gate closed, deferring persist");
            return;
        }

        let mut db = PrefixDatabase {
            this_node_name: self.cfg.node_id.clone(),
            prefix_entries: self.map.persistent_entries(),
            perf_events: None,
        };
        if self.cfg.enable_perf_measurement {
            db.perf_events = Some(PerfEvents {
                events: vec![PerfEvent {
                    node_name: self.cfg.node_id.clone(),
                    event_name: PERF_EVENT_DB_UPDATED.to_string(),
                    unix_ts_ms: unix_now_ms(),
                }],
            });
        }

        match postcard::to_allocvec(&db) {
            Ok(bytes) => {
                if let Err(e) = self.store.store(CONFIG_STORE_KEY, &bytes).await {
                    // In-memory state stays authoritative; the next
                    // successful mutation retries.
                    error!("error saving persistent prefix database: {e}");
                }
            }
            Err(e) => error!("error encoding persistent prefix database: {e}"),
        }
    }

    /// Publish the full map (persistent and ephemeral) to the KV store.
    async fn publish_db(&mut self) {
        if !self.hold_open {
            debug!("hold gate closed, deferring publish");
            return;
        }

        let db = PrefixDatabase {
            this_node_name: self.cfg.node_id.clone(),
            prefix_entries: self.map.get_all(),
            perf_events: None,
        };
        let key = format!("{}{}", self.cfg.prefix_db_marker, self.cfg.node_id);
        info!(%key, "writing prefix database to kv store");

        let value = codec::encode_prefix_db(&db);
        if let Err(e) = self.kv.persist_key(&key, value, self.cfg.kv_ttl_ms).await {
            error!("failed to publish prefix database: {e}");
        }
    }

    fn submit_counters(&mut self, queued: i64) {
        debug!("submitting counters");
        self.counters.set_gauge(COUNTER_QUEUE_SIZE, queued);
        self.monitor.set_counters(&self.counters.snapshot());
    }
}

fn unix_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The prefix manager loop plus its channels.
pub struct PrefixManager<S, K, M> {
    core: ManagerCore<S, K, M>,
    cmd_tx: mpsc::Sender<ManagerCommand>,
    cmd_rx: mpsc::Receiver<ManagerCommand>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<S: ConfigStore, K: KvClient, M: MonitorClient> PrefixManager<S, K, M> {
    pub fn new(cfg: PrefixManagerConfig, store: S, kv: K, monitor: M) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(REQUEST_QUEUE);
        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            core: ManagerCore {
                cfg,
                map: PrefixMap::new(),
                store,
                kv,
                monitor,
                counters: Counters::new(),
                hold_open: false,
            },
            cmd_tx,
            cmd_rx,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    /// A handle for submitting requests and shutting the loop down.
    pub fn handle(&self) -> PrefixManagerHandle {
        PrefixManagerHandle {
            cmd_tx: self.cmd_tx.clone(),
            stop_tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Run the event loop to completion (shutdown signal).
    pub async fn run(self) {
        let Self {
            mut core,
            cmd_tx,
            mut cmd_rx,
            stop_tx: _stop_tx,
            mut stop_rx,
        } = self;
        // Kept for the queue-depth gauge; also keeps an idle queue from
        // reading as closed.
        let queue_tx = cmd_tx;

        core.load_from_disk().await;

        let hold_deadline = Instant::now() + Duration::from_millis(core.cfg.hold_time_ms);
        let mut hold_fired = false;

        let mut kv_refresh = interval(Duration::from_millis(core.cfg.kv_refresh_interval_ms));
        kv_refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut monitor_tick = interval(Duration::from_millis(core.cfg.monitor_submit_interval_ms));
        monitor_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let fired = hold_fired;
            let hold_timer = async move {
                if fired {
                    std::future::pending().await
                } else {
                    sleep_until(hold_deadline).await
                }
            };

            tokio::select! {
                command = cmd_rx.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        ManagerCommand::Request(request, reply) => {
                            let (response, effects) = core.process_request(&request);
                            if effects.publish {
                                core.publish_db().await;
                            }
                            if effects.persist {
                                core.persist_db().await;
                            }
                            let _ = reply.send(response);
                        }
                        ManagerCommand::GetCounters(reply) => {
                            let _ = reply.send(core.counters.snapshot());
                        }
                    }
                }
                _ = hold_timer => {
                    hold_fired = true;
                    core.hold_open = true;
                    info!("prefix hold time expired, advertising");
                    core.persist_db().await;
                    core.publish_db().await;
                }
                _ = kv_refresh.tick() => {
                    core.publish_db().await;
                }
                _ = monitor_tick.tick() => {
                    let queued = (queue_tx.max_capacity() - queue_tx.capacity()) as i64;
                    core.submit_counters(queued);
                }
                _ = stop_rx.changed() => {
                    break;
                }
            }
        }

        info!("prefix manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::kv::MemoryKvStore;
    use crate::store::MemoryConfigStore;
    use crate::types::{PrefixEntry, PrefixType};

    const POLL: Duration = Duration::from_millis(10);
    const DEADLINE: Duration = Duration::from_secs(5);

    /// Monitor that records every submission.
    #[derive(Debug, Clone, Default)]
    struct RecordingMonitor {
        submissions: Arc<Mutex<Vec<HashMap<String, i64>>>>,
    }

    impl MonitorClient for RecordingMonitor {
        fn set_counters(&mut self, counters: &HashMap<String, i64>) {
            self.submissions
                .lock()
                .unwrap()
                .push(counters.clone());
        }
    }

    struct Fixture {
        handle: PrefixManagerHandle,
        store: MemoryConfigStore,
        kv: MemoryKvStore,
        monitor: RecordingMonitor,
    }

    fn spawn_manager(cfg: PrefixManagerConfig) -> Fixture {
        let store = MemoryConfigStore::new();
        let kv = MemoryKvStore::new();
        let monitor = RecordingMonitor::default();

        let manager = PrefixManager::new(cfg, store.clone(), kv.clone(), monitor.clone());
        let handle = manager.handle();
        tokio::spawn(manager.run());

        Fixture {
            handle,
            store,
            kv,
            monitor,
        }
    }

    fn entry(s: &str, t: PrefixType) -> PrefixEntry {
        PrefixEntry::new(s.parse().unwrap(), t)
    }

    fn ephemeral(s: &str, t: PrefixType) -> PrefixEntry {
        PrefixEntry {
            ephemeral: Some(true),
            ..entry(s, t)
        }
    }

    fn add_request(prefixes: Vec<PrefixEntry>) -> PrefixRequest {
        PrefixRequest::with_prefixes(PrefixCommand::AddPrefixes, prefixes)
    }

    fn withdraw_request(prefixes: Vec<PrefixEntry>) -> PrefixRequest {
        PrefixRequest::with_prefixes(PrefixCommand::WithdrawPrefixes, prefixes)
    }

    async fn wait_until(mut check: impl FnMut() -> bool, what: &str) {
        let deadline = tokio::time::Instant::now() + DEADLINE;
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for: {what}"
            );
            tokio::time::sleep(POLL).await;
        }
    }

    fn persisted_db(store: &MemoryConfigStore) -> Option<PrefixDatabase> {
        store
            .get(CONFIG_STORE_KEY)
            .map(|bytes| postcard::from_bytes(&bytes).expect("valid persisted db"))
    }

    #[tokio::test]
    async fn add_then_mismatched_withdraw_then_withdraw() {
        let f = spawn_manager(PrefixManagerConfig::new("node-1"));

        let response = f
            .handle
            .request(add_request(vec![entry("10.0.0.0/8", PrefixType::Loopback)]))
            .await
            .unwrap();
        assert!(response.success);

        // Published and persisted once the hold gate (zero) opens.
        wait_until(|| f.kv.get("prefix:node-1").is_some(), "kv publication").await;
        wait_until(|| f.store.get(CONFIG_STORE_KEY).is_some(), "disk write").await;

        // Wrong type: structured failure, state unchanged.
        let response = f
            .handle
            .request(withdraw_request(vec![entry("10.0.0.0/8", PrefixType::Bgp)]))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("No prefix to remove"));

        let all = f
            .handle
            .request(PrefixRequest::new(PrefixCommand::GetAllPrefixes))
            .await
            .unwrap();
        assert_eq!(all.prefixes.len(), 1);

        // Matching type: removed.
        let response = f
            .handle
            .request(withdraw_request(vec![entry(
                "10.0.0.0/8",
                PrefixType::Loopback,
            )]))
            .await
            .unwrap();
        assert!(response.success);

        let all = f
            .handle
            .request(PrefixRequest::new(PrefixCommand::GetAllPrefixes))
            .await
            .unwrap();
        assert!(all.prefixes.is_empty());
    }

    #[tokio::test]
    async fn duplicate_add_reports_no_changes() {
        let f = spawn_manager(PrefixManagerConfig::new("node-1"));

        let req = add_request(vec![entry("10.0.0.0/8", PrefixType::Loopback)]);
        assert!(f.handle.request(req.clone()).await.unwrap().success);

        let response = f.handle.request(req).await.unwrap();
        assert!(!response.success);
        assert_eq!(
            response.message.as_deref(),
            Some("No changes in prefixes to be advertised")
        );
    }

    #[tokio::test]
    async fn sync_by_type_replaces_subset() {
        let f = spawn_manager(PrefixManagerConfig::new("node-1"));

        f.handle
            .request(add_request(vec![
                entry("10.0.0.1/32", PrefixType::Loopback),
                entry("10.0.0.2/32", PrefixType::Loopback),
                entry("172.16.0.0/12", PrefixType::Bgp),
            ]))
            .await
            .unwrap();

        let mut sync = PrefixRequest::with_type(
            PrefixCommand::SyncPrefixesByType,
            PrefixType::Loopback,
        );
        sync.prefixes = vec![
            entry("10.0.0.1/32", PrefixType::Loopback),
            entry("10.0.0.4/32", PrefixType::Loopback),
        ];
        assert!(f.handle.request(sync).await.unwrap().success);

        let all = f
            .handle
            .request(PrefixRequest::new(PrefixCommand::GetAllPrefixes))
            .await
            .unwrap();
        let mut got: Vec<String> = all.prefixes.iter().map(|e| e.prefix.to_string()).collect();
        got.sort();
        assert_eq!(got, vec!["10.0.0.1/32", "10.0.0.4/32", "172.16.0.0/12"]);
    }

    #[tokio::test]
    async fn withdraw_by_type_and_get_by_type() {
        let f = spawn_manager(PrefixManagerConfig::new("node-1"));

        f.handle
            .request(add_request(vec![
                entry("10.0.0.1/32", PrefixType::Loopback),
                entry("172.16.0.0/12", PrefixType::Bgp),
            ]))
            .await
            .unwrap();

        let by_type = f
            .handle
            .request(PrefixRequest::with_type(
                PrefixCommand::GetPrefixesByType,
                PrefixType::Bgp,
            ))
            .await
            .unwrap();
        assert_eq!(by_type.prefixes.len(), 1);
        assert_eq!(by_type.prefixes[0].prefix_type, PrefixType::Bgp);

        let response = f
            .handle
            .request(PrefixRequest::with_type(
                PrefixCommand::WithdrawPrefixesByType,
                PrefixType::Bgp,
            ))
            .await
            .unwrap();
        assert!(response.success);

        // Second withdraw of the same type finds nothing.
        let response = f
            .handle
            .request(PrefixRequest::with_type(
                PrefixCommand::WithdrawPrefixesByType,
                PrefixType::Bgp,
            ))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("No prefixes of type"));
    }

    #[tokio::test]
    async fn unknown_command_yields_structured_failure() {
        let f = spawn_manager(PrefixManagerConfig::new("node-1"));

        let response = f
            .handle
            .request(PrefixRequest::new(PrefixCommand::Unknown(77)))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("Unknown command"));
    }

    #[tokio::test]
    async fn hold_gate_blocks_all_writes() {
        let mut cfg = PrefixManagerConfig::new("node-1");
        cfg.hold_time_ms = 60_000;
        let f = spawn_manager(cfg);

        let response = f
            .handle
            .request(add_request(vec![entry("10.0.0.0/8", PrefixType::Loopback)]))
            .await
            .unwrap();
        assert!(response.success, "mutations succeed while the gate holds");

        // Give the loop time to misbehave, then verify nothing escaped.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.kv.is_empty(), "no KV writes before the hold deadline");
        assert!(f.store.is_empty(), "no disk writes before the hold deadline");
    }

    #[tokio::test]
    async fn hold_deadline_promotes_pending_state() {
        let mut cfg = PrefixManagerConfig::new("node-1");
        cfg.hold_time_ms = 50;
        let f = spawn_manager(cfg);

        f.handle
            .request(add_request(vec![entry("10.0.0.0/8", PrefixType::Loopback)]))
            .await
            .unwrap();

        wait_until(
            || {
                f.kv.get("prefix:node-1").is_some_and(|record| {
                    codec::decode_prefix_db(&record.value)
                        .is_ok_and(|db| db.prefix_entries.len() == 1)
                })
            },
            "publication after the deadline",
        )
        .await;
        let record = f.kv.get("prefix:node-1").unwrap();
        let db = codec::decode_prefix_db(&record.value).unwrap();
        assert_eq!(db.this_node_name, "node-1");

        wait_until(
            || persisted_db(&f.store).is_some_and(|db| db.prefix_entries.len() == 1),
            "persist after the deadline",
        )
        .await;
    }

    #[tokio::test]
    async fn persisted_snapshot_excludes_ephemeral_entries() {
        let f = spawn_manager(PrefixManagerConfig::new("node-1"));

        f.handle
            .request(add_request(vec![
                entry("10.0.0.1/32", PrefixType::Loopback),
                ephemeral("10.0.0.2/32", PrefixType::Breeze),
            ]))
            .await
            .unwrap();

        wait_until(
            || {
                persisted_db(&f.store)
                    .is_some_and(|db| !db.prefix_entries.is_empty())
            },
            "persist of the mixed add",
        )
        .await;
        wait_until(
            || {
                f.kv.get("prefix:node-1").is_some_and(|record| {
                    codec::decode_prefix_db(&record.value)
                        .is_ok_and(|db| db.prefix_entries.len() == 2)
                })
            },
            "publication of the mixed add",
        )
        .await;

        let db = persisted_db(&f.store).unwrap();
        assert_eq!(db.prefix_entries.len(), 1);
        assert!(db.prefix_entries[0].is_persistent());
        assert_eq!(db.prefix_entries[0].prefix.to_string(), "10.0.0.1/32");

        // The published copy carries both.
        let record = f.kv.get("prefix:node-1").unwrap();
        let published = codec::decode_prefix_db(&record.value).unwrap();
        assert_eq!(published.prefix_entries.len(), 2);
    }

    #[tokio::test]
    async fn ephemeral_only_mutation_publishes_without_persisting() {
        let f = spawn_manager(PrefixManagerConfig::new("node-1"));

        // Let the initial hold write land first so we can diff versions.
        wait_until(|| f.kv.get("prefix:node-1").is_some(), "initial publication").await;
        let baseline = persisted_db(&f.store).unwrap();
        assert!(baseline.prefix_entries.is_empty());
        let version_before = f.kv.get("prefix:node-1").unwrap().version;

        f.handle
            .request(add_request(vec![ephemeral(
                "10.0.0.2/32",
                PrefixType::Breeze,
            )]))
            .await
            .unwrap();

        wait_until(
            || f.kv.get("prefix:node-1").unwrap().version > version_before,
            "republication",
        )
        .await;

        // Persisted snapshot is untouched by the ephemeral-only change.
        assert_eq!(persisted_db(&f.store).unwrap(), baseline);
    }

    #[tokio::test]
    async fn perf_events_attach_to_persisted_db_only() {
        let mut cfg = PrefixManagerConfig::new("node-1");
        cfg.enable_perf_measurement = true;
        let f = spawn_manager(cfg);

        f.handle
            .request(add_request(vec![entry("10.0.0.1/32", PrefixType::Loopback)]))
            .await
            .unwrap();

        wait_until(
            || persisted_db(&f.store).is_some_and(|db| db.perf_events.is_some()),
            "persist with perf events",
        )
        .await;
        wait_until(|| f.kv.get("prefix:node-1").is_some(), "publication").await;

        let db = persisted_db(&f.store).unwrap();
        let perf = db.perf_events.unwrap();
        assert_eq!(perf.events.len(), 1);
        assert_eq!(perf.events[0].event_name, "PREFIX_DB_UPDATED");
        assert_eq!(perf.events[0].node_name, "node-1");

        let record = f.kv.get("prefix:node-1").unwrap();
        let published = codec::decode_prefix_db(&record.value).unwrap();
        assert!(published.perf_events.is_none());
    }

    #[tokio::test]
    async fn loads_persisted_prefixes_at_startup() {
        let store = MemoryConfigStore::new();
        let db = PrefixDatabase {
            this_node_name: "node-1".to_string(),
            prefix_entries: vec![entry("10.9.0.0/16", PrefixType::PrefixAllocator)],
            perf_events: None,
        };
        store.put(CONFIG_STORE_KEY, postcard::to_allocvec(&db).unwrap());

        let manager = PrefixManager::new(
            PrefixManagerConfig::new("node-1"),
            store,
            MemoryKvStore::new(),
            RecordingMonitor::default(),
        );
        let handle = manager.handle();
        tokio::spawn(manager.run());

        let all = handle
            .request(PrefixRequest::new(PrefixCommand::GetAllPrefixes))
            .await
            .unwrap();
        assert_eq!(all.prefixes.len(), 1);
        assert_eq!(all.prefixes[0].prefix.to_string(), "10.9.0.0/16");
    }

    #[tokio::test]
    async fn corrupt_persisted_blob_starts_empty() {
        let store = MemoryConfigStore::new();
        store.put(CONFIG_STORE_KEY, b"definitely not postcard".to_vec());

        let manager = PrefixManager::new(
            PrefixManagerConfig::new("node-1"),
            store,
            MemoryKvStore::new(),
            RecordingMonitor::default(),
        );
        let handle = manager.handle();
        tokio::spawn(manager.run());

        let all = handle
            .request(PrefixRequest::new(PrefixCommand::GetAllPrefixes))
            .await
            .unwrap();
        assert!(all.prefixes.is_empty());
    }

    #[tokio::test]
    async fn counters_track_adds_and_withdraws() {
        let f = spawn_manager(PrefixManagerConfig::new("node-1"));

        f.handle
            .request(add_request(vec![entry("10.0.0.1/32", PrefixType::Loopback)]))
            .await
            .unwrap();
        // Failed withdraw must not count.
        f.handle
            .request(withdraw_request(vec![entry("9.9.9.9/32", PrefixType::Bgp)]))
            .await
            .unwrap();
        f.handle
            .request(withdraw_request(vec![entry(
                "10.0.0.1/32",
                PrefixType::Loopback,
            )]))
            .await
            .unwrap();

        let counters = f.handle.counters().await.unwrap();
        assert_eq!(counters.get(COUNTER_ADD_PREFIXES), Some(&1));
        assert_eq!(counters.get(COUNTER_WITHDRAW_PREFIXES), Some(&1));
    }

    #[tokio::test]
    async fn monitor_receives_queue_gauge() {
        let mut cfg = PrefixManagerConfig::new("node-1");
        cfg.monitor_submit_interval_ms = 20;
        let f = spawn_manager(cfg);

        wait_until(
            || {
                f.monitor
                    .submissions
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|s| s.contains_key(COUNTER_QUEUE_SIZE))
            },
            "counter submission",
        )
        .await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let f = spawn_manager(PrefixManagerConfig::new("node-1"));
        f.handle.shutdown();

        wait_until(
            || {
                // Futures can't run inside the closure; probe with try_send
                // semantics instead: a dropped loop closes the channel.
                f.handle.cmd_tx.is_closed()
            },
            "manager loop exit",
        )
        .await;
    }
}
