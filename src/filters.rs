//! Filter store and the `eth_*Filter` method family
//!
//! Filters are server-side polling cursors: each holds its kind, its
//! criteria and the last block height (or mempool snapshot) it reported.
//! IDs are random 64-bit values and are never reused, even after
//! uninstall. A background reaper drops filters idle past the timeout.

use crate::chain_handlers::{eth_hash, GetLogsHandler};
use crate::codec;
use crate::eth::{self, LogFilterCriteria};
use crate::qtum::QtumClient;
use crate::registry::{EthHandler, RequestContext};
use crate::rpc::JsonRpcError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Filters untouched this long are reaped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Reaper scan cadence.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// What a filter watches.
#[derive(Debug, Clone)]
pub enum FilterKind {
    Block,
    PendingTx,
    Log(LogFilterCriteria),
}

struct FilterEntry {
    kind: FilterKind,
    /// Last reported block height (block/log filters)
    cursor: u64,
    /// Mempool txids already reported (pending filters)
    pending_seen: HashSet<String>,
    last_touched: Instant,
}

#[derive(Default)]
struct Inner {
    filters: HashMap<u64, FilterEntry>,
    /// Every ID ever handed out; consulted so IDs are never reused.
    issued: HashSet<u64>,
}

/// The filter table. All operations take the mutex briefly; upstream I/O
/// happens outside it in the handlers.
pub struct FilterStore {
    inner: Mutex<Inner>,
}

impl FilterStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Allocate a filter with its initial cursor and, for pending
    /// filters, the mempool snapshot at creation.
    pub fn install(&self, kind: FilterKind, cursor: u64, pending_seen: HashSet<String>) -> u64 {
        let mut inner = self.inner.lock();
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u64 = rng.gen();
            if candidate != 0 && !inner.issued.contains(&candidate) {
                break candidate;
            }
        };
        inner.issued.insert(id);
        inner.filters.insert(
            id,
            FilterEntry {
                kind,
                cursor,
                pending_seen,
                last_touched: Instant::now(),
            },
        );
        debug!(id, "installed filter");
        id
    }

    /// Read a filter's kind and cursor, marking it touched.
    pub fn snapshot(&self, id: u64) -> Option<(FilterKind, u64)> {
        let mut inner = self.inner.lock();
        let entry = inner.filters.get_mut(&id)?;
        entry.last_touched = Instant::now();
        Some((entry.kind.clone(), entry.cursor))
    }

    /// Advance a cursor monotonically.
    pub fn advance(&self, id: u64, cursor: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.filters.get_mut(&id) {
            entry.cursor = entry.cursor.max(cursor);
        }
    }

    /// Swap the pending-tx snapshot, returning the previous one.
    pub fn swap_pending_seen(&self, id: u64, seen: HashSet<String>) -> Option<HashSet<String>> {
        let mut inner = self.inner.lock();
        let entry = inner.filters.get_mut(&id)?;
        entry.last_touched = Instant::now();
        Some(std::mem::replace(&mut entry.pending_seen, seen))
    }

    /// Remove a filter. True only if it existed. The ID stays burned.
    pub fn uninstall(&self, id: u64) -> bool {
        self.inner.lock().filters.remove(&id).is_some()
    }

    /// Drop filters idle past `timeout`.
    pub fn reap(&self, timeout: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.filters.len();
        inner
            .filters
            .retain(|_, entry| entry.last_touched.elapsed() < timeout);
        before - inner.filters.len()
    }

    /// Spawn the idle reaper task.
    pub fn start_reaper(self: &Arc<Self>) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                interval.tick().await;
                let reaped = store.reap(IDLE_TIMEOUT);
                if reaped > 0 {
                    debug!(reaped, "reaped idle filters");
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn age_filter(&self, id: u64, by: Duration) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.filters.get_mut(&id) {
            entry.last_touched = Instant::now() - by;
        }
    }
}

fn filter_id_param(params: &JsonValue) -> Result<u64, JsonRpcError> {
    codec::decode_hex_u64(&eth::string_param(params, 0)?)
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn filter_id_value(id: u64) -> JsonValue {
    JsonValue::String(codec::encode_hex_u64(id))
}

/// `eth_newFilter`
pub struct NewFilterHandler {
    pub qtum: Arc<QtumClient>,
    pub filters: Arc<FilterStore>,
}

#[async_trait]
impl EthHandler for NewFilterHandler {
    fn method(&self) -> &'static str {
        "eth_newFilter"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let criteria: LogFilterCriteria = eth::object_param(params, 0)?;
        // bad criteria fail here, not at the first poll
        criteria.addresses()?;
        criteria.topic_matchers()?;

        let head = self.qtum.get_block_count(ctx.deadline).await?;
        let id = self
            .filters
            .install(FilterKind::Log(criteria), head, HashSet::new());
        Ok(filter_id_value(id))
    }
}

/// `eth_newBlockFilter`
pub struct NewBlockFilterHandler {
    pub qtum: Arc<QtumClient>,
    pub filters: Arc<FilterStore>,
}

#[async_trait]
impl EthHandler for NewBlockFilterHandler {
    fn method(&self) -> &'static str {
        "eth_newBlockFilter"
    }

    async fn handle(
        &self,
        _params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let head = self.qtum.get_block_count(ctx.deadline).await?;
        let id = self
            .filters
            .install(FilterKind::Block, head, HashSet::new());
        Ok(filter_id_value(id))
    }
}

/// `eth_newPendingTransactionFilter`
pub struct NewPendingTxFilterHandler {
    pub qtum: Arc<QtumClient>,
    pub filters: Arc<FilterStore>,
}

#[async_trait]
impl EthHandler for NewPendingTxFilterHandler {
    fn method(&self) -> &'static str {
        "eth_newPendingTransactionFilter"
    }

    async fn handle(
        &self,
        _params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let head = self.qtum.get_block_count(ctx.deadline).await?;
        let seen: HashSet<String> = self
            .qtum
            .get_raw_mempool(ctx.deadline)
            .await?
            .into_iter()
            .collect();
        let id = self.filters.install(FilterKind::PendingTx, head, seen);
        Ok(filter_id_value(id))
    }
}

/// Collect a log filter's changes over `(cursor, head]`, honoring an
/// explicit `toBlock` bound. Returns the logs and the new cursor.
async fn log_filter_changes(
    qtum: &QtumClient,
    criteria: &LogFilterCriteria,
    cursor: u64,
    ctx: &RequestContext,
) -> Result<(Vec<JsonValue>, u64), JsonRpcError> {
    let head = qtum.get_block_count(ctx.deadline).await?;

    let mut to_height = head;
    if let Some(to_block) = &criteria.to_block {
        if let eth::BlockTag::Number(explicit) = eth::BlockTag::parse(to_block)? {
            to_height = to_height.min(explicit);
        }
    }

    let from_height = cursor + 1;
    if from_height > to_height {
        return Ok((Vec::new(), cursor));
    }

    let logs = GetLogsHandler::search(qtum, criteria, from_height, to_height, ctx.deadline).await?;
    let rendered = logs
        .into_iter()
        .map(|log| serde_json::to_value(log).unwrap_or(JsonValue::Null))
        .collect();
    Ok((rendered, to_height))
}

/// `eth_getFilterChanges`
pub struct GetFilterChangesHandler {
    pub qtum: Arc<QtumClient>,
    pub filters: Arc<FilterStore>,
}

#[async_trait]
impl EthHandler for GetFilterChangesHandler {
    fn method(&self) -> &'static str {
        "eth_getFilterChanges"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let id = filter_id_param(params)?;
        let (kind, cursor) = self
            .filters
            .snapshot(id)
            .ok_or_else(|| JsonRpcError::invalid_params(format!("no such filter: {id:#x}")))?;

        match kind {
            FilterKind::Block => {
                let head = self.qtum.get_block_count(ctx.deadline).await?;
                let mut hashes = Vec::new();
                for height in (cursor + 1)..=head {
                    let hash = self.qtum.get_block_hash(height, ctx.deadline).await?;
                    hashes.push(JsonValue::String(eth_hash(&hash)));
                }
                self.filters.advance(id, head);
                Ok(JsonValue::Array(hashes))
            }
            FilterKind::PendingTx => {
                let current: HashSet<String> = self
                    .qtum
                    .get_raw_mempool(ctx.deadline)
                    .await?
                    .into_iter()
                    .collect();
                let seen = self
                    .filters
                    .swap_pending_seen(id, current.clone())
                    .unwrap_or_default();
                let fresh: Vec<JsonValue> = current
                    .difference(&seen)
                    .map(|txid| JsonValue::String(format!("0x{txid}")))
                    .collect();
                Ok(JsonValue::Array(fresh))
            }
            FilterKind::Log(criteria) => {
                let (logs, new_cursor) =
                    log_filter_changes(&self.qtum, &criteria, cursor, ctx).await?;
                self.filters.advance(id, new_cursor);
                Ok(JsonValue::Array(logs))
            }
        }
    }
}

/// `eth_getFilterLogs`
pub struct GetFilterLogsHandler {
    pub qtum: Arc<QtumClient>,
    pub filters: Arc<FilterStore>,
}

#[async_trait]
impl EthHandler for GetFilterLogsHandler {
    fn method(&self) -> &'static str {
        "eth_getFilterLogs"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let id = filter_id_param(params)?;
        let (kind, cursor) = self
            .filters
            .snapshot(id)
            .ok_or_else(|| JsonRpcError::invalid_params(format!("no such filter: {id:#x}")))?;

        // Idempotent read: same window as getFilterChanges, cursor untouched.
        match kind {
            FilterKind::Log(criteria) => {
                let (logs, _) = log_filter_changes(&self.qtum, &criteria, cursor, ctx).await?;
                Ok(JsonValue::Array(logs))
            }
            _ => Err(JsonRpcError::invalid_params(
                "filter is not a log filter",
            )),
        }
    }
}

/// `eth_uninstallFilter`
pub struct UninstallFilterHandler {
    pub filters: Arc<FilterStore>,
}

#[async_trait]
impl EthHandler for UninstallFilterHandler {
    fn method(&self) -> &'static str {
        "eth_uninstallFilter"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        _ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let id = filter_id_param(params)?;
        Ok(JsonValue::Bool(self.filters.uninstall(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_never_reused() {
        let store = FilterStore::new();
        let mut seen = HashSet::new();
        let mut ids = Vec::new();

        for _ in 0..64 {
            let id = store.install(FilterKind::Block, 0, HashSet::new());
            assert!(seen.insert(id), "duplicate filter id {id}");
            ids.push(id);
        }
        for id in &ids {
            assert!(store.uninstall(*id));
        }
        // fresh installs must avoid every burned id
        for _ in 0..64 {
            let id = store.install(FilterKind::Block, 0, HashSet::new());
            assert!(seen.insert(id), "reused filter id {id}");
        }
    }

    #[test]
    fn uninstall_is_true_once() {
        let store = FilterStore::new();
        let id = store.install(FilterKind::Block, 10, HashSet::new());
        assert!(store.uninstall(id));
        assert!(!store.uninstall(id));
    }

    #[test]
    fn cursor_advances_monotonically() {
        let store = FilterStore::new();
        let id = store.install(FilterKind::Block, 10, HashSet::new());

        store.advance(id, 15);
        assert_eq!(store.snapshot(id).unwrap().1, 15);

        // stale advance must not move the cursor back
        store.advance(id, 12);
        assert_eq!(store.snapshot(id).unwrap().1, 15);
    }

    #[test]
    fn pending_seen_swap_returns_previous() {
        let store = FilterStore::new();
        let initial: HashSet<String> = ["a".to_string()].into();
        let id = store.install(FilterKind::PendingTx, 0, initial.clone());

        let next: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        let previous = store.swap_pending_seen(id, next.clone()).unwrap();
        assert_eq!(previous, initial);
        assert_eq!(store.swap_pending_seen(id, HashSet::new()).unwrap(), next);
    }

    #[test]
    fn reaper_drops_only_idle_filters() {
        let store = FilterStore::new();
        let idle = store.install(FilterKind::Block, 0, HashSet::new());
        let fresh = store.install(FilterKind::Block, 0, HashSet::new());

        store.age_filter(idle, Duration::from_secs(600));
        let reaped = store.reap(IDLE_TIMEOUT);
        assert_eq!(reaped, 1);
        assert!(store.snapshot(idle).is_none());
        assert!(store.snapshot(fresh).is_some());
    }
}
