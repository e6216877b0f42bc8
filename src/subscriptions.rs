//! WebSocket event subscription system
//!
//! Push-style counterpart to the filter store: `eth_subscribe` registers
//! interest on a session, a chain poller publishes head/log/pending-tx
//! events, and a dispatcher fans them out to matching subscribers.
//!
//! Every session owns a bounded mailbox. A session that cannot drain its
//! mailbox is the slowest consumer and gets closed.

use crate::chain_handlers::{eth_block_from_qtum, eth_logs_from_receipt};
use crate::eth::{EthBlock, EthLog, LogFilterCriteria};
use crate::qtum::QtumClient;
use crate::registry::{EthHandler, RequestContext};
use crate::rpc::JsonRpcError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Mailbox bound per session; overflow closes the session.
const MAILBOX_CAPACITY: usize = 64;

/// Chain poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Blocks processed per poll tick at most, to bound catch-up bursts.
const MAX_BLOCKS_PER_POLL: u64 = 16;

/// What a subscription listens for.
#[derive(Debug, Clone)]
pub enum SubKind {
    NewHeads,
    Logs {
        addresses: Vec<String>,
        topics: Vec<Option<Vec<String>>>,
    },
    NewPendingTransactions,
    Syncing,
}

impl SubKind {
    /// Parse the `eth_subscribe` params: kind name plus optional criteria.
    pub fn parse(params: &JsonValue) -> Result<Self, JsonRpcError> {
        let array = params
            .as_array()
            .ok_or_else(|| JsonRpcError::invalid_params("params must be an array"))?;
        let kind = array
            .first()
            .and_then(JsonValue::as_str)
            .ok_or_else(|| JsonRpcError::invalid_params("subscription kind must be a string"))?;

        match kind {
            "newHeads" => Ok(SubKind::NewHeads),
            "newPendingTransactions" => Ok(SubKind::NewPendingTransactions),
            "syncing" => Ok(SubKind::Syncing),
            "logs" => {
                let criteria: LogFilterCriteria = match array.get(1) {
                    Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                        JsonRpcError::invalid_params(format!("log criteria: {e}"))
                    })?,
                    None => LogFilterCriteria::default(),
                };
                Ok(SubKind::Logs {
                    addresses: criteria.addresses()?,
                    topics: criteria.topic_matchers()?,
                })
            }
            other => Err(JsonRpcError::invalid_params(format!(
                "unknown subscription kind: {other}"
            ))),
        }
    }
}

/// Events published by the chain poller.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    NewHead(Box<EthBlock>),
    Logs(Vec<EthLog>),
    PendingTx(String),
}

/// Handle to one WebSocket session, carried in the request context.
pub struct SubscriptionSession {
    pub id: u64,
    subscriptions: Mutex<HashMap<String, SubKind>>,
}

struct SessionEntry {
    session: Arc<SubscriptionSession>,
    mailbox: mpsc::Sender<String>,
}

/// The subscription registry and fan-out hub.
pub struct SubscriptionAgent {
    sessions: DashMap<u64, SessionEntry>,
    next_session_id: AtomicU64,
    events: broadcast::Sender<ChainEvent>,
}

impl SubscriptionAgent {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            events,
        })
    }

    /// Register a new WebSocket session and hand back its mailbox.
    pub fn register_session(&self) -> (Arc<SubscriptionSession>, mpsc::Receiver<String>) {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let session = Arc::new(SubscriptionSession {
            id,
            subscriptions: Mutex::new(HashMap::new()),
        });
        self.sessions.insert(
            id,
            SessionEntry {
                session: session.clone(),
                mailbox: tx,
            },
        );
        (session, rx)
    }

    /// Drop a session and all its subscriptions atomically.
    pub fn remove_session(&self, id: u64) {
        if let Some((_, entry)) = self.sessions.remove(&id) {
            let count = entry.session.subscriptions.lock().len();
            if count > 0 {
                debug!(session = id, count, "dropped subscriptions with session");
            }
        }
    }

    /// Record interest; returns the new subscription ID.
    pub fn subscribe(&self, session: &SubscriptionSession, kind: SubKind) -> String {
        let sub_id = format!("0x{:032x}", rand::thread_rng().gen::<u128>());
        session
            .subscriptions
            .lock()
            .insert(sub_id.clone(), kind);
        info!(session = session.id, subscription = %sub_id, "subscribed");
        sub_id
    }

    /// Remove one subscription from a session.
    pub fn unsubscribe(&self, session: &SubscriptionSession, sub_id: &str) -> bool {
        session.subscriptions.lock().remove(sub_id).is_some()
    }

    /// Total live subscriptions, across sessions.
    pub fn subscription_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.session.subscriptions.lock().len())
            .sum()
    }

    /// Publish an event to all matching subscribers.
    pub fn publish(&self, event: ChainEvent) {
        // best-effort: no receivers is fine
        let _ = self.events.send(event);
    }

    /// Spawn the fan-out dispatcher and the chain poller.
    pub fn start(self: &Arc<Self>, qtum: Arc<QtumClient>) {
        let agent = self.clone();
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => agent.fan_out(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "subscription dispatcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let agent = self.clone();
        tokio::spawn(async move {
            agent.poll_chain(qtum).await;
        });
    }

    fn fan_out(&self, event: &ChainEvent) {
        let mut slow_sessions = Vec::new();

        for entry in self.sessions.iter() {
            let subs = entry.session.subscriptions.lock().clone();
            for (sub_id, kind) in &subs {
                for payload in notifications_for(kind, event) {
                    let message = json!({
                        "jsonrpc": "2.0",
                        "method": "eth_subscription",
                        "params": { "subscription": sub_id, "result": payload },
                    })
                    .to_string();

                    match entry.mailbox.try_send(message) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(session = entry.session.id, "mailbox full, closing slow consumer");
                            slow_sessions.push(entry.session.id);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            slow_sessions.push(entry.session.id);
                        }
                    }
                }
            }
        }

        for id in slow_sessions {
            self.remove_session(id);
        }
    }

    /// Poll the upstream for new heads, their logs and fresh mempool
    /// entries, publishing one event per observation.
    async fn poll_chain(self: Arc<Self>, qtum: Arc<QtumClient>) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        let mut last_height: Option<u64> = None;
        let mut mempool: HashSet<String> = HashSet::new();

        loop {
            interval.tick().await;

            let head = match qtum.get_block_count(None).await {
                Ok(head) => head,
                Err(e) => {
                    debug!("head poll failed: {e}");
                    continue;
                }
            };

            let from = match last_height {
                Some(last) if head > last => last + 1,
                Some(_) => head + 1, // nothing new
                None => {
                    // first tick: only observe the tip going forward
                    last_height = Some(head);
                    head + 1
                }
            };

            let to = head.min(from.saturating_add(MAX_BLOCKS_PER_POLL - 1));
            for height in from..=to {
                match self.publish_block(&qtum, height).await {
                    Ok(()) => last_height = Some(height),
                    Err(e) => {
                        debug!(height, "block poll failed: {e}");
                        break;
                    }
                }
            }

            match qtum.get_raw_mempool(None).await {
                Ok(txids) => {
                    let current: HashSet<String> = txids.into_iter().collect();
                    for txid in current.difference(&mempool) {
                        self.publish(ChainEvent::PendingTx(format!("0x{txid}")));
                    }
                    mempool = current;
                }
                Err(e) => debug!("mempool poll failed: {e}"),
            }
        }
    }

    async fn publish_block(
        &self,
        qtum: &QtumClient,
        height: u64,
    ) -> Result<(), crate::qtum::QtumError> {
        let hash = qtum.get_block_hash(height, None).await?;
        let block = qtum.get_block(&hash, None).await?;
        let header = eth_block_from_qtum(&block);
        self.publish(ChainEvent::NewHead(Box::new(header)));

        let receipts = qtum.search_logs(height, height, &[], &[], None).await?;
        let logs: Vec<EthLog> = receipts.iter().flat_map(eth_logs_from_receipt).collect();
        if !logs.is_empty() {
            self.publish(ChainEvent::Logs(logs));
        }
        Ok(())
    }
}

/// Which payloads `kind` receives for `event`.
fn notifications_for(kind: &SubKind, event: &ChainEvent) -> Vec<JsonValue> {
    match (kind, event) {
        (SubKind::NewHeads, ChainEvent::NewHead(block)) => {
            vec![serde_json::to_value(block.as_ref()).unwrap_or(JsonValue::Null)]
        }
        (SubKind::NewPendingTransactions, ChainEvent::PendingTx(txid)) => {
            vec![JsonValue::String(txid.clone())]
        }
        (SubKind::Logs { addresses, topics }, ChainEvent::Logs(logs)) => logs
            .iter()
            .filter(|log| {
                (addresses.is_empty() || addresses.contains(&log.address.to_lowercase()))
                    && LogFilterCriteria::topics_match(topics, &log.topics)
            })
            .map(|log| serde_json::to_value(log).unwrap_or(JsonValue::Null))
            .collect(),
        // Qtum sync state is not mapped; syncing subscribers get nothing.
        _ => Vec::new(),
    }
}

/// `eth_subscribe`
pub struct SubscribeHandler {
    pub agent: Arc<SubscriptionAgent>,
}

#[async_trait]
impl EthHandler for SubscribeHandler {
    fn method(&self) -> &'static str {
        "eth_subscribe"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let session = ctx.session.as_ref().ok_or_else(|| {
            JsonRpcError::server_error("subscriptions require a websocket connection")
        })?;
        let kind = SubKind::parse(params)?;
        let sub_id = self.agent.subscribe(session, kind);
        Ok(JsonValue::String(sub_id))
    }
}

/// `eth_unsubscribe`
pub struct UnsubscribeHandler {
    pub agent: Arc<SubscriptionAgent>,
}

#[async_trait]
impl EthHandler for UnsubscribeHandler {
    fn method(&self) -> &'static str {
        "eth_unsubscribe"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let session = ctx.session.as_ref().ok_or_else(|| {
            JsonRpcError::server_error("subscriptions require a websocket connection")
        })?;
        let sub_id = crate::eth::string_param(params, 0)?;
        Ok(JsonValue::Bool(self.agent.unsubscribe(session, &sub_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log(address: &str, topics: &[&str]) -> EthLog {
        EthLog {
            address: address.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            data: "0x".to_string(),
            block_hash: "0xbb".to_string(),
            block_number: "0x1".to_string(),
            transaction_hash: "0xcc".to_string(),
            transaction_index: "0x0".to_string(),
            log_index: "0x0".to_string(),
            removed: false,
        }
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        assert!(SubKind::parse(&json!(["newHeads"])).is_ok());
        assert!(SubKind::parse(&json!(["syncing"])).is_ok());
        assert!(SubKind::parse(&json!(["blocks"])).is_err());
        assert!(SubKind::parse(&json!([])).is_err());
    }

    #[test]
    fn logs_subscription_filters_by_address() {
        let kind = SubKind::parse(&json!([
            "logs",
            { "address": "0x7926223070547d2d15b2ef5e7383e541c338ffe9" }
        ]))
        .unwrap();

        let matching = ChainEvent::Logs(vec![log(
            "0x7926223070547d2d15b2ef5e7383e541c338ffe9",
            &["0xaa"],
        )]);
        assert_eq!(notifications_for(&kind, &matching).len(), 1);

        let other = ChainEvent::Logs(vec![log(
            "0x0000000000000000000000000000000000000001",
            &["0xaa"],
        )]);
        assert!(notifications_for(&kind, &other).is_empty());
    }

    #[test]
    fn pending_tx_only_reaches_pending_subscribers() {
        let event = ChainEvent::PendingTx("0xabc".to_string());
        assert_eq!(
            notifications_for(&SubKind::NewPendingTransactions, &event).len(),
            1
        );
        assert!(notifications_for(&SubKind::NewHeads, &event).is_empty());
    }

    #[tokio::test]
    async fn session_close_drops_subscriptions() {
        let agent = SubscriptionAgent::new();
        let (session, _rx) = agent.register_session();

        agent.subscribe(&session, SubKind::NewHeads);
        agent.subscribe(&session, SubKind::NewPendingTransactions);
        assert_eq!(agent.subscription_count(), 2);

        agent.remove_session(session.id);
        assert_eq!(agent.subscription_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_reports_existence() {
        let agent = SubscriptionAgent::new();
        let (session, _rx) = agent.register_session();

        let sub_id = agent.subscribe(&session, SubKind::NewHeads);
        assert!(agent.unsubscribe(&session, &sub_id));
        assert!(!agent.unsubscribe(&session, &sub_id));
    }

    #[tokio::test]
    async fn slow_consumer_is_kicked() {
        let agent = SubscriptionAgent::new();
        let (session, rx) = agent.register_session();
        agent.subscribe(&session, SubKind::NewPendingTransactions);

        // never drain rx; overflow the mailbox
        for i in 0..(MAILBOX_CAPACITY + 8) {
            agent.fan_out(&ChainEvent::PendingTx(format!("0x{i:x}")));
        }

        assert!(agent.sessions.get(&session.id).is_none());
        drop(rx);
    }
}
