//! Assigns change records to per-(node, channel) outgoing batches.
//!
//! One `route()` call reads the change log after the watermark in id order,
//! evaluates the table's routing function per record and appends the record to
//! the open accumulator of every target node. Accumulators close when full and,
//! for transactional channels, only at a transaction boundary. Closed batches
//! and the advanced watermark are committed together.
//!
//! ```text
//! log:  1a 2a 3a | 4b 5b |          (max_batch_size = 3, transactional)
//!                ^ boundary, full → batch {1,2,3}
//!                        ^ end of log → flush {4,5}
//! ```
//!
//! Data ids come from a sequence, so a missing id may belong to a transaction
//! that has not committed yet. A pass stops in front of such a gap and the
//! watermark stays below it until the id shows up or `gap_timeout_ms` passes
//! since the gap was first seen. Expired gaps are skipped with a warning.

mod accumulator;
mod data_router;

pub use data_router::{ColumnTarget, DataRouter, RouteToNodes, RouterRegistry, TriggerRouter};

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::batch::{BatchStatus, NewBatch};
use crate::channel_cache::ChannelCache;
use crate::checkpoint::Watermark;
use crate::config::RouterConfig;
use crate::listener::{BatchEvent, BatchObservers};
use crate::model::{ChangeRecord, DataId, NodeTopology, UNROUTED_NODE_ID};
use crate::store::{ChangeLog, ClusterLock, OutgoingBatchStore};
use crate::Result;
use accumulator::Accumulators;

/// Cluster lock taken for the duration of one routing pass.
pub const ROUTE_LOCK: &str = "routing";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteSummary {
    /// False when another router held the lock and nothing was read.
    pub lock_acquired: bool,
    pub records_read: u64,
    /// Records that matched at least one node.
    pub routed: u64,
    pub unrouted: u64,
    /// Records on disabled, suspended or unknown channels.
    pub skipped: u64,
    pub malformed: u64,
    pub batches_created: u64,
    pub watermark: DataId,
    /// Expired gaps read past during this pass.
    pub gaps_skipped: u64,
    /// First missing id of a fresh gap the pass stopped in front of.
    pub stalled_at: Option<DataId>,
}

/// First time each unfilled gap was seen, keyed by its lowest missing id.
type GapTracker = BTreeMap<DataId, Instant>;

/// Change-log cursor that keeps a bounded window of records ahead of the
/// current one so a transaction boundary is known before a batch is cut.
/// Ends early in front of a gap younger than `gap_timeout`.
struct LookAhead<'a> {
    log: &'a dyn ChangeLog,
    buffer: VecDeque<ChangeRecord>,
    last_fetched: DataId,
    window: usize,
    exhausted: bool,
    gaps: &'a mut GapTracker,
    gap_timeout: Duration,
    gaps_skipped: u64,
    stalled_at: Option<DataId>,
}

impl<'a> LookAhead<'a> {
    fn new(
        log: &'a dyn ChangeLog,
        after: DataId,
        window: usize,
        gaps: &'a mut GapTracker,
        gap_timeout: Duration,
    ) -> Self {
        Self {
            log,
            buffer: VecDeque::new(),
            last_fetched: after,
            window: window.max(1),
            exhausted: false,
            gaps,
            gap_timeout,
            gaps_skipped: 0,
            stalled_at: None,
        }
    }

    async fn fill(&mut self) -> Result<()> {
        if self.exhausted || !self.buffer.is_empty() {
            return Ok(());
        }
        let mut page = self.log.read_after(self.last_fetched, self.window).await?;
        if page.len() < self.window {
            self.exhausted = true;
        }
        if let Some(cut) = self.fresh_gap(&page) {
            page.truncate(cut);
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last_fetched = last.data_id;
        }
        self.buffer.extend(page);
        Ok(())
    }

    /// Index of the first record that follows a gap still within its timeout.
    fn fresh_gap(&mut self, page: &[ChangeRecord]) -> Option<usize> {
        let mut expected = self.last_fetched + 1;
        for (index, record) in page.iter().enumerate() {
            if record.data_id > expected {
                let first_seen = match self.gaps.range(expected..record.data_id).next() {
                    Some((_, seen)) => *seen,
                    None => *self.gaps.entry(expected).or_insert_with(Instant::now),
                };
                let waited = first_seen.elapsed();
                if waited < self.gap_timeout {
                    debug!(
                        missing_from = expected,
                        next = record.data_id,
                        ?waited,
                        "Waiting on change-log gap"
                    );
                    self.stalled_at = Some(expected);
                    return Some(index);
                }
                warn!(
                    missing_from = expected,
                    missing_to = record.data_id - 1,
                    ?waited,
                    "Skipping change-log gap past its timeout"
                );
                self.gaps_skipped += 1;
            }
            expected = record.data_id + 1;
        }
        None
    }

    /// Next record and whether it ends its source transaction.
    async fn next(&mut self) -> Result<Option<(ChangeRecord, bool)>> {
        self.fill().await?;
        let record = match self.buffer.pop_front() {
            Some(record) => record,
            None => return Ok(None),
        };
        self.fill().await?;
        let boundary = record.ends_transaction(self.buffer.front());
        Ok(Some((record, boundary)))
    }
}

pub struct RouterService {
    log: Arc<dyn ChangeLog>,
    store: Arc<dyn OutgoingBatchStore>,
    lock: Arc<dyn ClusterLock>,
    channels: Arc<ChannelCache>,
    registry: RouterRegistry,
    topology: Arc<NodeTopology>,
    config: RouterConfig,
    hostname: String,
    observers: BatchObservers,
    gaps: Mutex<GapTracker>,
}

impl RouterService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: Arc<dyn ChangeLog>,
        store: Arc<dyn OutgoingBatchStore>,
        lock: Arc<dyn ClusterLock>,
        channels: Arc<ChannelCache>,
        registry: RouterRegistry,
        topology: Arc<NodeTopology>,
        config: RouterConfig,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            log,
            store,
            lock,
            channels,
            registry,
            topology,
            config,
            hostname: hostname.into(),
            observers: BatchObservers::default(),
            gaps: Mutex::new(GapTracker::new()),
        }
    }

    pub fn with_observers(mut self, observers: BatchObservers) -> Self {
        self.observers = observers;
        self
    }

    /// Routes everything currently in the change log after the watermark.
    pub async fn route(&self) -> Result<RouteSummary> {
        let acquired = self
            .lock
            .try_lock(ROUTE_LOCK, &self.hostname, self.config.lock_timeout())
            .await?;
        if !acquired {
            debug!("Routing lock held by another router");
            return Ok(RouteSummary::default());
        }

        let result = self.route_locked().await;
        if let Err(e) = self.lock.unlock(ROUTE_LOCK, &self.hostname).await {
            warn!("Failed to release routing lock: {}", e);
        }
        result
    }

    #[instrument(skip(self), name = "route")]
    async fn route_locked(&self) -> Result<RouteSummary> {
        let started = Instant::now();
        let mut watermark = self.store.watermark().await?;
        let mut gaps = self.gaps.lock().await;
        let mut reader = LookAhead::new(
            self.log.as_ref(),
            watermark.last_data_id,
            self.config.lookahead_window,
            &mut *gaps,
            self.config.gap_timeout(),
        );
        let mut open = Accumulators::default();
        let mut closed: Vec<NewBatch> = Vec::new();
        let mut summary = RouteSummary {
            lock_acquired: true,
            watermark: watermark.last_data_id,
            ..RouteSummary::default()
        };
        let mut last_read = watermark.last_data_id;
        let mut uncommitted = 0u64;

        while let Some((record, at_boundary)) = reader.next().await? {
            last_read = record.data_id;
            summary.records_read += 1;
            uncommitted += 1;

            self.route_record(&record, &mut open, &mut summary).await?;
            closed.extend(open.close_ready(at_boundary));

            if uncommitted as usize >= self.config.page_size.max(1) {
                let mark = open.safe_watermark(last_read);
                watermark = self
                    .commit(std::mem::take(&mut closed), &watermark, mark, uncommitted, &mut summary)
                    .await?;
                uncommitted = 0;
            }
        }

        summary.gaps_skipped = reader.gaps_skipped;
        summary.stalled_at = reader.stalled_at;
        drop(reader);

        closed.extend(open.flush());
        watermark = self
            .commit(closed, &watermark, last_read, uncommitted, &mut summary)
            .await?;
        summary.watermark = watermark.last_data_id;
        gaps.retain(|missing, _| *missing > watermark.last_data_id);

        if summary.records_read > 0 {
            info!(
                records = summary.records_read,
                routed = summary.routed,
                unrouted = summary.unrouted,
                skipped = summary.skipped,
                malformed = summary.malformed,
                batches = summary.batches_created,
                watermark = summary.watermark,
                stalled_at = ?summary.stalled_at,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Routing pass complete"
            );
        }
        Ok(summary)
    }

    async fn route_record(
        &self,
        record: &ChangeRecord,
        open: &mut Accumulators,
        summary: &mut RouteSummary,
    ) -> Result<()> {
        let channel = match self.channels.get(&record.channel_id).await? {
            Some(channel) if channel.accepts_routing() => channel,
            Some(_) => {
                debug!(data_id = record.data_id, channel_id = %record.channel_id, "Channel not routing, record skipped");
                summary.skipped += 1;
                return Ok(());
            }
            None => {
                warn!(data_id = record.data_id, channel_id = %record.channel_id, "Unknown channel, record skipped");
                summary.skipped += 1;
                return Ok(());
            }
        };

        let nodes = record.row_values().and_then(|_| {
            self.registry
                .for_table(&record.table_name)
                .route_to_nodes(record, &self.topology)
        });
        let nodes = match nodes {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(
                    target: "rowsync::audit",
                    data_id = record.data_id,
                    table = %record.table_name,
                    error = %e,
                    "Skipping unreadable change record"
                );
                summary.malformed += 1;
                return Ok(());
            }
        };

        if nodes.is_empty() {
            summary.unrouted += 1;
            open.append(UNROUTED_NODE_ID, &channel, record, BatchStatus::Ok);
        } else {
            summary.routed += 1;
            for node_id in &nodes {
                open.append(node_id, &channel, record, BatchStatus::New);
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        closed: Vec<NewBatch>,
        current: &Watermark,
        mark: DataId,
        records: u64,
        summary: &mut RouteSummary,
    ) -> Result<Watermark> {
        let next = current.advance(mark, records);
        if closed.is_empty() && next == *current {
            return Ok(next);
        }

        let created = self
            .store
            .commit_routed(closed, next.clone(), &self.hostname)
            .await?;
        for batch in &created {
            debug!(
                batch_id = batch.batch_id,
                node_id = %batch.node_id,
                channel_id = %batch.channel_id,
                records = batch.data_event_count,
                status = %batch.status,
                "Closed outgoing batch"
            );
            self.observers.notify(&BatchEvent::Routed {
                batch_id: batch.batch_id,
                node_id: batch.node_id.clone(),
                channel_id: batch.channel_id.clone(),
                records: batch.data_event_count,
            });
        }
        summary.batches_created += created.len() as u64;
        summary.watermark = next.last_data_id;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_cache::StaticChannels;
    use crate::model::{BatchAlgorithm, Channel, EventType, Node};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        router: RouterService,
    }

    fn fixture(channels: Vec<Channel>, triggers: Vec<TriggerRouter>) -> Fixture {
        fixture_with(
            channels,
            triggers,
            RouterConfig {
                lookahead_window: 2,
                ..RouterConfig::default()
            },
        )
    }

    fn fixture_with(
        channels: Vec<Channel>,
        triggers: Vec<TriggerRouter>,
        config: RouterConfig,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(ChannelCache::new(
            Arc::new(StaticChannels::new(channels, vec![])),
            Duration::from_secs(60),
        ));
        let topology = Arc::new(NodeTopology::new(
            "corp",
            vec![Node::new("store001"), Node::new("store002")],
        ));
        let router = RouterService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            cache,
            RouterRegistry::new(triggers),
            topology,
            config,
            "corp-01",
        );
        Fixture { store, router }
    }

    fn by_store() -> Vec<TriggerRouter> {
        vec![TriggerRouter {
            table: "sale".into(),
            router: DataRouter::ColumnMatch {
                column: "store_id".into(),
                expected: ColumnTarget::NodeId,
            },
        }]
    }

    async fn append(store: &MemoryStore, channel: &str, store_id: &str, tx: Option<&str>) {
        store
            .append(MemoryStore::record(
                channel,
                "sale",
                EventType::Insert,
                json!({"id": 1, "store_id": store_id}),
                tx,
            ))
            .await;
    }

    async fn memberships(store: &MemoryStore) -> Vec<(String, Vec<DataId>)> {
        let mut out = Vec::new();
        for batch in store.outgoing_batches().await {
            let ids = store.batch_data_ids(batch.batch_id).await.unwrap();
            out.push((batch.node_id, ids));
        }
        out
    }

    #[tokio::test]
    async fn test_transactional_batches_never_split() {
        let f = fixture(vec![Channel::new("sales", 1, 3)], by_store());
        for tx in ["a", "a", "a", "b", "b"] {
            append(&f.store, "sales", "store001", Some(tx)).await;
        }

        let summary = f.router.route().await.unwrap();

        assert_eq!(summary.batches_created, 2);
        assert_eq!(summary.watermark, 5);
        assert_eq!(
            memberships(&f.store).await,
            vec![
                ("store001".to_string(), vec![1, 2, 3]),
                ("store001".to_string(), vec![4, 5])
            ]
        );
    }

    #[tokio::test]
    async fn test_large_transaction_exceeds_max_size() {
        let f = fixture(vec![Channel::new("sales", 1, 2)], by_store());
        for _ in 0..5 {
            append(&f.store, "sales", "store001", Some("big")).await;
        }
        f.router.route().await.unwrap();
        assert_eq!(
            memberships(&f.store).await,
            vec![("store001".to_string(), vec![1, 2, 3, 4, 5])]
        );
    }

    #[tokio::test]
    async fn test_non_transactional_cuts_mid_transaction() {
        let channel =
            Channel::new("sales", 1, 2).with_algorithm(BatchAlgorithm::NonTransactional);
        let f = fixture(vec![channel], by_store());
        for _ in 0..5 {
            append(&f.store, "sales", "store001", Some("big")).await;
        }
        f.router.route().await.unwrap();
        let sizes: Vec<usize> = memberships(&f.store)
            .await
            .into_iter()
            .map(|(_, ids)| ids.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_unrouted_records_are_audited_as_ok() {
        let f = fixture(vec![Channel::new("sales", 1, 10)], by_store());
        append(&f.store, "sales", "store999", None).await;

        let summary = f.router.route().await.unwrap();

        assert_eq!(summary.unrouted, 1);
        let batches = f.store.outgoing_batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].node_id, UNROUTED_NODE_ID);
        assert_eq!(batches[0].status, BatchStatus::Ok);
        assert!(f.store.find_pending(UNROUTED_NODE_ID).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_suspended_channel_skipped_but_watermark_advances() {
        let mut suspended = Channel::new("inventory", 2, 10);
        suspended.suspended = true;
        let f = fixture(vec![Channel::new("sales", 1, 10), suspended], by_store());
        append(&f.store, "inventory", "store001", None).await;
        append(&f.store, "inventory", "store001", None).await;

        let summary = f.router.route().await.unwrap();

        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.watermark, 2);
        assert!(f.store.outgoing_batches().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_record_skipped_with_audit() {
        let f = fixture(vec![Channel::new("sales", 1, 10)], by_store());
        let mut bad = MemoryStore::record("sales", "sale", EventType::Insert, json!({}), None);
        bad.row_data = Some("{truncated".into());
        f.store.append(bad).await;
        append(&f.store, "sales", "store002", None).await;

        let summary = f.router.route().await.unwrap();

        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.routed, 1);
        assert_eq!(
            memberships(&f.store).await,
            vec![("store002".to_string(), vec![2])]
        );
    }

    #[tokio::test]
    async fn test_second_pass_resumes_after_watermark() {
        let f = fixture(vec![Channel::new("sales", 1, 10)], by_store());
        append(&f.store, "sales", "store001", None).await;
        f.router.route().await.unwrap();
        append(&f.store, "sales", "store001", None).await;
        f.router.route().await.unwrap();

        assert_eq!(
            memberships(&f.store).await,
            vec![
                ("store001".to_string(), vec![1]),
                ("store001".to_string(), vec![2])
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_commit_rederives_same_batches() {
        let f = fixture(vec![Channel::new("sales", 1, 3)], by_store());
        for tx in ["a", "a", "a", "b", "b"] {
            append(&f.store, "sales", "store001", Some(tx)).await;
        }
        f.store.fail_next_commits(1);
        assert!(f.router.route().await.is_err());
        assert_eq!(f.store.watermark().await.unwrap().last_data_id, 0);

        f.router.route().await.unwrap();
        assert_eq!(
            memberships(&f.store).await,
            vec![
                ("store001".to_string(), vec![1, 2, 3]),
                ("store001".to_string(), vec![4, 5])
            ]
        );
    }

    fn gap_config(gap_timeout_ms: u64) -> RouterConfig {
        RouterConfig {
            lookahead_window: 2,
            gap_timeout_ms,
            ..RouterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pass_waits_in_front_of_uncommitted_id() {
        let f = fixture_with(
            vec![Channel::new("sales", 1, 10)],
            by_store(),
            gap_config(60_000),
        );
        append(&f.store, "sales", "store001", None).await;
        let pending = f.store.reserve_data_id().await;
        append(&f.store, "sales", "store001", None).await;
        append(&f.store, "sales", "store001", None).await;

        let first = f.router.route().await.unwrap();

        assert_eq!(first.stalled_at, Some(pending));
        assert_eq!(first.watermark, pending - 1);
        assert_eq!(
            memberships(&f.store).await,
            vec![("store001".to_string(), vec![1])]
        );

        f.store
            .append_reserved(
                pending,
                MemoryStore::record(
                    "sales",
                    "sale",
                    EventType::Insert,
                    json!({"id": 1, "store_id": "store001"}),
                    None,
                ),
            )
            .await;
        let second = f.router.route().await.unwrap();

        assert_eq!(second.stalled_at, None);
        assert_eq!(second.watermark, 4);
        assert_eq!(
            memberships(&f.store).await,
            vec![
                ("store001".to_string(), vec![1]),
                ("store001".to_string(), vec![2, 3, 4])
            ]
        );
    }

    #[tokio::test]
    async fn test_expired_gap_is_skipped() {
        let f = fixture_with(vec![Channel::new("sales", 1, 10)], by_store(), gap_config(0));
        append(&f.store, "sales", "store001", None).await;
        f.store.reserve_data_id().await;
        append(&f.store, "sales", "store001", None).await;

        let summary = f.router.route().await.unwrap();

        assert_eq!(summary.gaps_skipped, 1);
        assert_eq!(summary.stalled_at, None);
        assert_eq!(summary.watermark, 3);
        assert_eq!(
            memberships(&f.store).await,
            vec![("store001".to_string(), vec![1, 3])]
        );
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_skips_pass() {
        let f = fixture(vec![Channel::new("sales", 1, 10)], by_store());
        append(&f.store, "sales", "store001", None).await;
        f.store
            .try_lock(ROUTE_LOCK, "other-host", Duration::from_secs(60))
            .await
            .unwrap();

        let summary = f.router.route().await.unwrap();

        assert!(!summary.lock_acquired);
        assert!(f.store.outgoing_batches().await.is_empty());
    }
}
