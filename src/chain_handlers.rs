//! Block and log handlers
//!
//! `eth_blockNumber`, `eth_getBlockByNumber`, `eth_getBlockByHash` and
//! `eth_getLogs`, plus the block/log shaping shared with the filter store
//! and the subscription poller.

use crate::blockhash::BlockHashIndex;
use crate::codec;
use crate::eth::{
    self, BlockTag, EthBlock, EthLog, LogFilterCriteria, EMPTY_UNCLES_HASH, ZERO_HASH,
};
use crate::qtum::{QtumClient, QtumError};
use crate::qtum_rpc::{QtumBlock, QtumReceipt};
use crate::registry::{EthHandler, RequestContext};
use crate::rpc::JsonRpcError;
use crate::tx_handlers;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;

/// Gas figures synthesized from block weight/size: one gas per weight
/// unit for the limit, one per byte for usage.
fn synthesized_gas(block: &QtumBlock) -> (u64, u64) {
    (block.weight.max(block.size), block.size)
}

/// Prefix a Qtum hash for the Ethereum wire.
pub fn eth_hash(qtum_hash: &str) -> String {
    format!("0x{qtum_hash}")
}

/// Resolve a block tag to an explicit height.
pub async fn resolve_tag(
    qtum: &QtumClient,
    tag: BlockTag,
    deadline: Option<Instant>,
) -> Result<u64, QtumError> {
    match tag {
        BlockTag::Number(height) => Ok(height),
        BlockTag::Earliest => Ok(0),
        // Qtum has no pending block; both tags mean the tip.
        BlockTag::Latest | BlockTag::Pending => qtum.get_block_count(deadline).await,
    }
}

/// Shape a Qtum block as an Ethereum block. Transactions are rendered as
/// hashes; callers wanting full objects substitute them afterwards.
pub fn eth_block_from_qtum(block: &QtumBlock) -> EthBlock {
    let (gas_limit, gas_used) = synthesized_gas(block);

    EthBlock {
        number: codec::encode_hex_u64(block.height),
        hash: eth_hash(&block.hash),
        parent_hash: block
            .previousblockhash
            .as_deref()
            .map(eth_hash)
            .unwrap_or_else(|| ZERO_HASH.to_string()),
        mix_hash: ZERO_HASH.to_string(),
        nonce: "0x0000000000000000".to_string(),
        sha3_uncles: EMPTY_UNCLES_HASH.to_string(),
        logs_bloom: codec::empty_bloom(),
        transactions_root: eth_hash(&block.merkleroot),
        state_root: block
            .state_root()
            .map(eth_hash)
            .unwrap_or_else(|| ZERO_HASH.to_string()),
        receipts_root: eth_hash(&block.merkleroot),
        miner: eth::ZERO_ADDRESS.to_string(),
        difficulty: "0x0".to_string(),
        total_difficulty: "0x0".to_string(),
        extra_data: "0x".to_string(),
        size: codec::encode_hex_u64(block.size),
        gas_limit: codec::encode_hex_u64(gas_limit),
        gas_used: codec::encode_hex_u64(gas_used),
        timestamp: codec::encode_hex_u64(block.time),
        transactions: block
            .tx
            .iter()
            .map(|tx| JsonValue::String(eth_hash(&tx.txid)))
            .collect(),
        uncles: Vec::new(),
    }
}

/// Render every log of one receipt, indexed within the receipt.
pub fn eth_logs_from_receipt(receipt: &QtumReceipt) -> Vec<EthLog> {
    receipt
        .log
        .iter()
        .enumerate()
        .map(|(index, entry)| EthLog {
            address: eth_hash(&entry.address),
            topics: entry.topics.iter().map(|t| eth_hash(t)).collect(),
            data: eth_hash(&entry.data),
            block_hash: eth_hash(&receipt.block_hash),
            block_number: codec::encode_hex_u64(receipt.block_number),
            transaction_hash: eth_hash(&receipt.transaction_hash),
            transaction_index: codec::encode_hex_u64(receipt.transaction_index),
            log_index: codec::encode_hex_u64(index as u64),
            removed: false,
        })
        .collect()
}

/// `eth_blockNumber`
pub struct BlockNumberHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for BlockNumberHandler {
    fn method(&self) -> &'static str {
        "eth_blockNumber"
    }

    async fn handle(
        &self,
        _params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let height = self.qtum.get_block_count(ctx.deadline).await?;
        Ok(JsonValue::String(codec::encode_hex_u64(height)))
    }
}

/// Fetch a block and shape it, filling in full transaction objects when
/// the caller asked for them.
async fn shaped_block(
    qtum: &Arc<QtumClient>,
    index: &Option<Arc<BlockHashIndex>>,
    qtum_hash: &str,
    include_tx: bool,
    deadline: Option<Instant>,
) -> Result<EthBlock, QtumError> {
    let block = qtum.get_block(qtum_hash, deadline).await?;
    let mut shaped = eth_block_from_qtum(&block);

    if let Some(index) = index {
        index.record(&shaped.hash, &block.hash, block.height);
    }

    if include_tx {
        let mut full = Vec::with_capacity(block.tx.len());
        for (position, raw) in block.tx.iter().enumerate() {
            let shaped_tx = tx_handlers::eth_tx_from_raw(
                qtum,
                raw,
                Some(tx_handlers::BlockRef {
                    hash: &block.hash,
                    height: block.height,
                    index: position as u64,
                }),
                deadline,
            )
            .await?;
            full.push(serde_json::to_value(shaped_tx).unwrap_or(JsonValue::Null));
        }
        shaped.transactions = full;
    }

    Ok(shaped)
}

/// `eth_getBlockByNumber`
pub struct GetBlockByNumberHandler {
    pub qtum: Arc<QtumClient>,
    pub index: Option<Arc<BlockHashIndex>>,
}

#[async_trait]
impl EthHandler for GetBlockByNumberHandler {
    fn method(&self) -> &'static str {
        "eth_getBlockByNumber"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let args = eth::expect_params(params, 1)?;
        let tag = BlockTag::parse(&args[0])?;
        let include_tx = eth::bool_param_or(params, 1, false);

        let height = resolve_tag(&self.qtum, tag, ctx.deadline).await?;
        let hash = match self.qtum.get_block_hash(height, ctx.deadline).await {
            Ok(hash) => hash,
            Err(QtumError::UnknownBlock(_)) => return Ok(JsonValue::Null),
            Err(e) => return Err(e.into()),
        };

        let block = shaped_block(&self.qtum, &self.index, &hash, include_tx, ctx.deadline).await?;
        Ok(serde_json::to_value(block).unwrap_or(JsonValue::Null))
    }
}

/// `eth_getBlockByHash`
pub struct GetBlockByHashHandler {
    pub qtum: Arc<QtumClient>,
    pub index: Option<Arc<BlockHashIndex>>,
}

#[async_trait]
impl EthHandler for GetBlockByHashHandler {
    fn method(&self) -> &'static str {
        "eth_getBlockByHash"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let requested = eth::string_param(params, 0)?;
        let include_tx = eth::bool_param_or(params, 1, false);

        let bytes = codec::decode_hex_bytes(&requested)
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(JsonRpcError::invalid_params("block hash must be 32 bytes"));
        }

        // The persisted index maps gateway-issued hashes back to the
        // chain; without it (or on a miss) the hash maps onto itself.
        let qtum_hash = self
            .index
            .as_ref()
            .and_then(|index| index.qtum_for_eth(&requested.to_lowercase()))
            .unwrap_or_else(|| requested.trim_start_matches("0x").to_lowercase());

        match shaped_block(&self.qtum, &self.index, &qtum_hash, include_tx, ctx.deadline).await {
            Ok(block) => Ok(serde_json::to_value(block).unwrap_or(JsonValue::Null)),
            Err(QtumError::UnknownBlock(_)) => Ok(JsonValue::Null),
            Err(e) => Err(e.into()),
        }
    }
}

/// `eth_getLogs`
pub struct GetLogsHandler {
    pub qtum: Arc<QtumClient>,
}

impl GetLogsHandler {
    /// Run a log search over an explicit height range, filtering
    /// client-side by topic. Shared with the filter store.
    pub async fn search(
        qtum: &QtumClient,
        criteria: &LogFilterCriteria,
        from_height: u64,
        to_height: u64,
        deadline: Option<Instant>,
    ) -> Result<Vec<EthLog>, JsonRpcError> {
        let addresses: Vec<String> = criteria
            .addresses()?
            .iter()
            .map(|a| a.trim_start_matches("0x").to_string())
            .collect();
        let matchers = criteria.topic_matchers()?;

        // searchlogs' own topic filter treats positions loosely, so topic
        // matching happens here instead.
        let receipts = qtum
            .search_logs(from_height, to_height, &addresses, &[], deadline)
            .await?;

        let logs = receipts
            .iter()
            .flat_map(eth_logs_from_receipt)
            .filter(|log| LogFilterCriteria::topics_match(&matchers, &log.topics))
            .collect();
        Ok(logs)
    }
}

#[async_trait]
impl EthHandler for GetLogsHandler {
    fn method(&self) -> &'static str {
        "eth_getLogs"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let criteria: LogFilterCriteria = eth::object_param(params, 0)?;

        let from_tag = match &criteria.from_block {
            Some(value) => BlockTag::parse(value)?,
            None => BlockTag::Latest,
        };
        let to_tag = match &criteria.to_block {
            Some(value) => BlockTag::parse(value)?,
            None => BlockTag::Latest,
        };

        let from_height = resolve_tag(&self.qtum, from_tag, ctx.deadline).await?;
        let to_height = resolve_tag(&self.qtum, to_tag, ctx.deadline).await?;
        if from_height > to_height {
            return Err(JsonRpcError::invalid_params("fromBlock is past toBlock"));
        }

        let logs =
            Self::search(&self.qtum, &criteria, from_height, to_height, ctx.deadline).await?;
        Ok(serde_json::to_value(logs).unwrap_or(JsonValue::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qtum_rpc::QtumLogEntry;

    fn sample_block() -> QtumBlock {
        serde_json::from_value(serde_json::json!({
            "hash": "8d5ff3f2d22eb7dbabd8a0c9cc37a781d183e7ea4b0b1c0e5f3a36898e4da478",
            "height": 813,
            "size": 1024,
            "weight": 4096,
            "time": 1694000000,
            "nonce": 0,
            "merkleroot": "aa".repeat(32),
            "previousblockhash": "bb".repeat(32),
            "tx": [{
                "txid": "cc".repeat(32),
                "size": 250,
                "version": 2,
                "vin": [{"coinbase": "01"}],
                "vout": []
            }]
        }))
        .unwrap()
    }

    #[test]
    fn block_shape_has_eth_fields() {
        let shaped = eth_block_from_qtum(&sample_block());
        assert_eq!(shaped.number, "0x32d");
        assert!(shaped.hash.starts_with("0x8d5ff3f2"));
        assert_eq!(shaped.hash.len(), 66);
        assert_eq!(shaped.uncles, Vec::<String>::new());
        assert_eq!(shaped.mix_hash, ZERO_HASH);
        assert_eq!(shaped.gas_limit, "0x1000");
        assert_eq!(shaped.gas_used, "0x400");
        assert_eq!(shaped.transactions.len(), 1);
        assert_eq!(
            shaped.transactions[0],
            JsonValue::String(format!("0x{}", "cc".repeat(32)))
        );
    }

    #[test]
    fn receipt_logs_are_indexed() {
        let receipt = QtumReceipt {
            block_hash: "dd".repeat(32),
            block_number: 5,
            transaction_hash: "ee".repeat(32),
            transaction_index: 2,
            from: None,
            to: None,
            cumulative_gas_used: 30000,
            gas_used: 30000,
            contract_address: None,
            excepted: Some("None".to_string()),
            log: vec![
                QtumLogEntry {
                    address: "7926223070547d2d15b2ef5e7383e541c338ffe9".to_string(),
                    topics: vec!["ff".repeat(32)],
                    data: String::new(),
                },
                QtumLogEntry {
                    address: "7926223070547d2d15b2ef5e7383e541c338ffe9".to_string(),
                    topics: vec![],
                    data: "0001".to_string(),
                },
            ],
        };

        let logs = eth_logs_from_receipt(&receipt);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].log_index, "0x0");
        assert_eq!(logs[1].log_index, "0x1");
        assert_eq!(logs[0].block_number, "0x5");
        assert_eq!(logs[0].transaction_index, "0x2");
        assert!(!logs[0].removed);
        assert!(logs[0].address.starts_with("0x"));
        assert_eq!(logs[0].topics[0].len(), 66);
    }
}
