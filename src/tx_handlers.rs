//! Transaction handlers
//!
//! Lookup (`eth_getTransactionByHash` and the by-block variants,
//! `eth_getTransactionReceipt`), execution (`eth_call`,
//! `eth_estimateGas`) and submission (`eth_sendTransaction`,
//! `eth_sendRawTransaction`, `eth_sign`, `eth_signTransaction`).
//!
//! The hard part is the UTXO-to-account translation: sender and recipient
//! come out of the inputs/outputs, contract calls hide inside output
//! scripts, and amounts need the satoshi-to-wei scale change.

use crate::accounts::Accounts;
use crate::chain_handlers::{eth_hash, eth_logs_from_receipt};
use crate::codec;
use crate::eth::{self, CallRequest, EthReceipt, EthTransaction, TransactionRequest, ZERO_ADDRESS};
use crate::qtum::{QtumClient, QtumError, FLAG_IGNORE_TRANSACTIONS, FLAG_IGNORE_UNKNOWN_TX};
use crate::qtum_rpc::{
    coin_amount_to_satoshi, satoshi_to_coin_string, CallContractResult, QtumRawTx, QtumReceipt,
    ScriptPubKey, DEFAULT_CONTRACT_GAS, DEFAULT_GAS_PRICE_SAT,
};
use crate::registry::{EthHandler, RequestContext};
use crate::rpc::JsonRpcError;
use async_trait::async_trait;
use num_bigint::BigUint;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Gas returned for a plain value transfer.
const TRANSFER_GAS: u64 = 21_000;

/// Estimate floor when `callcontract` cannot answer.
const ESTIMATE_GAS_FLOOR: u64 = 2_500_000;

/// Flat fee reserved when building raw transfer transactions.
const RAW_TX_FEE_SAT: u64 = 400_000;

/// Change below this is left to the miners.
const DUST_SAT: u64 = 1_000;

/// Where a transaction sits in its block.
pub struct BlockRef<'a> {
    pub hash: &'a str,
    pub height: u64,
    pub index: u64,
}

/// A contract operation recovered from an output script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractOp {
    Call {
        gas_limit: u64,
        gas_price_sat: u64,
        data: String,
        contract: String,
    },
    Create {
        gas_limit: u64,
        gas_price_sat: u64,
        data: String,
    },
}

/// Recover an OP_CALL / OP_CREATE payload from a decoded output script.
pub fn parse_contract_script(script: &ScriptPubKey) -> Option<ContractOp> {
    let tokens: Vec<&str> = script.asm.split_whitespace().collect();
    match tokens.last()? {
        &"OP_CALL" => {
            if tokens.len() < 6 {
                return None;
            }
            Some(ContractOp::Call {
                gas_limit: tokens[tokens.len() - 5].parse().ok()?,
                gas_price_sat: tokens[tokens.len() - 4].parse().ok()?,
                data: tokens[tokens.len() - 3].to_string(),
                contract: tokens[tokens.len() - 2].to_string(),
            })
        }
        &"OP_CREATE" => {
            if tokens.len() < 5 {
                return None;
            }
            Some(ContractOp::Create {
                gas_limit: tokens[tokens.len() - 4].parse().ok()?,
                gas_price_sat: tokens[tokens.len() - 3].parse().ok()?,
                data: tokens[tokens.len() - 2].to_string(),
            })
        }
        _ => None,
    }
}

/// Decode a hex wei quantity into whole satoshi, reporting dust loss.
fn wei_param_to_satoshi(hex: &str) -> Result<u64, JsonRpcError> {
    let wei = codec::decode_hex_quantity(hex)
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
    let (sat, lossy) = codec::wei_to_satoshi(&wei);
    if lossy {
        debug!("wei amount {hex} truncated to satoshi precision");
    }
    u64::try_from(&sat)
        .map_err(|_| JsonRpcError::invalid_params(format!("value out of range: {hex}")))
}

/// Gas price in wei, floored to the chain's satoshi granularity.
fn gas_price_to_satoshi(hex: Option<&str>) -> Result<u64, JsonRpcError> {
    match hex {
        None => Ok(DEFAULT_GAS_PRICE_SAT),
        Some(hex) => {
            let sat = wei_param_to_satoshi(hex)?;
            Ok(sat.max(1))
        }
    }
}

fn gas_limit_param(hex: Option<&str>) -> Result<Option<u64>, JsonRpcError> {
    match hex {
        None => Ok(None),
        Some(hex) => codec::decode_hex_u64(hex)
            .map(Some)
            .map_err(|e| JsonRpcError::invalid_params(e.to_string())),
    }
}

fn satoshi_to_wei_hex(satoshi: u64) -> String {
    codec::encode_hex_quantity(&codec::satoshi_to_wei(&BigUint::from(satoshi)))
}

/// Convert an eth hex address to Base58Check on the client's chain.
fn to_qtum_address(qtum: &QtumClient, hex_address: &str) -> Result<String, JsonRpcError> {
    codec::encode_address_to_qtum(hex_address, qtum.chain().version_byte())
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

/// Resolve the address funding a transaction's first input.
async fn resolve_from_address(
    qtum: &QtumClient,
    raw: &QtumRawTx,
    deadline: Option<Instant>,
) -> String {
    let Some(vin) = raw.vin.first() else {
        return ZERO_ADDRESS.to_string();
    };
    if vin.coinbase.is_some() {
        return ZERO_ADDRESS.to_string();
    }
    let (Some(prev_txid), Some(prev_n)) = (vin.txid.as_deref(), vin.vout) else {
        return ZERO_ADDRESS.to_string();
    };

    let Ok(prev) = qtum.get_raw_transaction(prev_txid, deadline).await else {
        return ZERO_ADDRESS.to_string();
    };
    let Some(address) = prev
        .vout
        .get(prev_n as usize)
        .and_then(|out| out.script_pub_key.first_address())
    else {
        return ZERO_ADDRESS.to_string();
    };

    codec::decode_address_from_qtum(address, qtum.chain().version_byte())
        .unwrap_or_else(|_| ZERO_ADDRESS.to_string())
}

/// Shape a raw Qtum transaction as an Ethereum transaction object.
///
/// When `block_ref` is absent and the transaction is mined, the enclosing
/// block is fetched (cached) to recover the height and position.
pub async fn eth_tx_from_raw(
    qtum: &Arc<QtumClient>,
    raw: &QtumRawTx,
    block_ref: Option<BlockRef<'_>>,
    deadline: Option<Instant>,
) -> Result<EthTransaction, QtumError> {
    let from = resolve_from_address(qtum, raw, deadline).await;

    let contract_op = raw
        .vout
        .iter()
        .find_map(|out| parse_contract_script(&out.script_pub_key).map(|op| (out, op)));

    let (to, value_sat, input, gas, gas_price_sat) = match contract_op {
        Some((out, ContractOp::Call { gas_limit, gas_price_sat, data, contract })) => (
            Some(format!("0x{contract}")),
            coin_amount_to_satoshi(out.value),
            format!("0x{data}"),
            gas_limit,
            gas_price_sat,
        ),
        Some((out, ContractOp::Create { gas_limit, gas_price_sat, data })) => (
            None,
            coin_amount_to_satoshi(out.value),
            format!("0x{data}"),
            gas_limit,
            gas_price_sat,
        ),
        None => {
            // Plain transfer: prefer the first output paying someone
            // other than the sender; fall back to any decodable output.
            let chain = qtum.chain();
            let mut first: Option<(String, u64)> = None;
            let mut payment: Option<(String, u64)> = None;
            for out in &raw.vout {
                let Some(address) = out.script_pub_key.first_address() else {
                    continue;
                };
                let Ok(hex) = codec::decode_address_from_qtum(address, chain.version_byte())
                else {
                    continue;
                };
                let entry = (hex.clone(), coin_amount_to_satoshi(out.value));
                if first.is_none() {
                    first = Some(entry.clone());
                }
                if hex != from {
                    payment = Some(entry);
                    break;
                }
            }
            let (to, value) = payment
                .or(first)
                .map(|(a, v)| (Some(a), v))
                .unwrap_or((None, 0));
            (to, value, "0x".to_string(), TRANSFER_GAS, 0)
        }
    };

    let (block_hash, block_number, transaction_index) = match block_ref {
        Some(r) => (
            Some(eth_hash(r.hash)),
            Some(codec::encode_hex_u64(r.height)),
            Some(codec::encode_hex_u64(r.index)),
        ),
        None => match raw.blockhash.as_deref() {
            Some(hash) => {
                let block = qtum.get_block(hash, deadline).await?;
                let index = block
                    .tx
                    .iter()
                    .position(|tx| tx.txid == raw.txid)
                    .unwrap_or(0) as u64;
                (
                    Some(eth_hash(hash)),
                    Some(codec::encode_hex_u64(block.height)),
                    Some(codec::encode_hex_u64(index)),
                )
            }
            None => (None, None, None),
        },
    };

    Ok(EthTransaction {
        hash: eth_hash(&raw.txid),
        nonce: "0x0".to_string(),
        block_hash,
        block_number,
        transaction_index,
        from,
        to,
        value: satoshi_to_wei_hex(value_sat),
        gas_price: satoshi_to_wei_hex(gas_price_sat),
        gas: codec::encode_hex_u64(gas),
        input,
        v: "0x0".to_string(),
        r: "0x0".to_string(),
        s: "0x0".to_string(),
    })
}

/// Shape a Qtum call receipt as an Ethereum receipt.
fn shape_receipt(receipt: &QtumReceipt) -> EthReceipt {
    let logs = eth_logs_from_receipt(receipt);

    let mut bloom_items: Vec<Vec<u8>> = Vec::new();
    for entry in &receipt.log {
        if let Ok(address) = hex::decode(&entry.address) {
            bloom_items.push(address);
        }
        for topic in &entry.topics {
            if let Ok(bytes) = hex::decode(topic) {
                bloom_items.push(bytes);
            }
        }
    }
    let logs_bloom = if bloom_items.is_empty() {
        codec::empty_bloom()
    } else {
        codec::logs_bloom(bloom_items.iter().map(Vec::as_slice))
    };

    EthReceipt {
        transaction_hash: eth_hash(&receipt.transaction_hash),
        transaction_index: codec::encode_hex_u64(receipt.transaction_index),
        block_hash: eth_hash(&receipt.block_hash),
        block_number: codec::encode_hex_u64(receipt.block_number),
        from: receipt.from.as_deref().map(eth_hash),
        to: receipt.to.as_deref().map(eth_hash),
        cumulative_gas_used: codec::encode_hex_u64(receipt.cumulative_gas_used),
        gas_used: codec::encode_hex_u64(receipt.gas_used),
        contract_address: receipt.contract_address.as_deref().map(eth_hash),
        logs,
        logs_bloom,
        status: if receipt.succeeded() { "0x1" } else { "0x0" }.to_string(),
    }
}

fn strip_tx_hash(param: &str) -> Result<String, JsonRpcError> {
    let bytes = codec::decode_hex_bytes(param)
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(JsonRpcError::invalid_params(
            "transaction hash must be 32 bytes",
        ));
    }
    Ok(param.trim_start_matches("0x").to_lowercase())
}

/// `eth_getTransactionByHash`
pub struct GetTransactionByHashHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GetTransactionByHashHandler {
    fn method(&self) -> &'static str {
        "eth_getTransactionByHash"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let txid = strip_tx_hash(&eth::string_param(params, 0)?)?;

        let raw = match self.qtum.get_raw_transaction(&txid, ctx.deadline).await {
            Ok(raw) => raw,
            Err(QtumError::UnknownTransaction(_)) => return Ok(JsonValue::Null),
            Err(e) => return Err(e.into()),
        };

        let shaped = eth_tx_from_raw(&self.qtum, &raw, None, ctx.deadline).await?;
        Ok(serde_json::to_value(shaped).unwrap_or(JsonValue::Null))
    }
}

/// Shared body of the two by-block-and-index lookups.
async fn tx_by_block_and_index(
    qtum: &Arc<QtumClient>,
    qtum_block_hash: &str,
    index: u64,
    deadline: Option<Instant>,
) -> Result<JsonValue, JsonRpcError> {
    let block = match qtum.get_block(qtum_block_hash, deadline).await {
        Ok(block) => block,
        Err(QtumError::UnknownBlock(_)) => return Ok(JsonValue::Null),
        Err(e) => return Err(e.into()),
    };

    let Some(raw) = block.tx.get(index as usize) else {
        return Ok(JsonValue::Null);
    };

    let shaped = eth_tx_from_raw(
        qtum,
        raw,
        Some(BlockRef {
            hash: &block.hash,
            height: block.height,
            index,
        }),
        deadline,
    )
    .await?;
    Ok(serde_json::to_value(shaped).unwrap_or(JsonValue::Null))
}

/// `eth_getTransactionByBlockNumberAndIndex`
pub struct GetTransactionByBlockNumberAndIndexHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GetTransactionByBlockNumberAndIndexHandler {
    fn method(&self) -> &'static str {
        "eth_getTransactionByBlockNumberAndIndex"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let args = eth::expect_params(params, 2)?;
        let tag = eth::BlockTag::parse(&args[0])?;
        let index = codec::decode_hex_u64(&eth::string_param(params, 1)?)
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

        let height = crate::chain_handlers::resolve_tag(&self.qtum, tag, ctx.deadline).await?;
        let hash = match self.qtum.get_block_hash(height, ctx.deadline).await {
            Ok(hash) => hash,
            Err(QtumError::UnknownBlock(_)) => return Ok(JsonValue::Null),
            Err(e) => return Err(e.into()),
        };

        tx_by_block_and_index(&self.qtum, &hash, index, ctx.deadline).await
    }
}

/// `eth_getTransactionByBlockHashAndIndex`
pub struct GetTransactionByBlockHashAndIndexHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GetTransactionByBlockHashAndIndexHandler {
    fn method(&self) -> &'static str {
        "eth_getTransactionByBlockHashAndIndex"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let hash = strip_tx_hash(&eth::string_param(params, 0)?)?;
        let index = codec::decode_hex_u64(&eth::string_param(params, 1)?)
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
        tx_by_block_and_index(&self.qtum, &hash, index, ctx.deadline).await
    }
}

/// `eth_getTransactionReceipt`
pub struct GetTransactionReceiptHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GetTransactionReceiptHandler {
    fn method(&self) -> &'static str {
        "eth_getTransactionReceipt"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let txid = strip_tx_hash(&eth::string_param(params, 0)?)?;

        match self.qtum.get_transaction_receipt(&txid, ctx.deadline).await {
            Ok(receipts) if !receipts.is_empty() => {
                let shaped = shape_receipt(&receipts[0]);
                return Ok(serde_json::to_value(shaped).unwrap_or(JsonValue::Null));
            }
            Ok(_) => {}
            Err(QtumError::UnknownTransaction(_))
                if self.qtum.get_flag_bool(FLAG_IGNORE_UNKNOWN_TX) =>
            {
                return Ok(JsonValue::Null)
            }
            Err(e) => return Err(e.into()),
        }

        // No call receipt: a plain value transfer. Synthesize one once
        // the transaction is mined.
        let raw = match self.qtum.get_raw_transaction(&txid, ctx.deadline).await {
            Ok(raw) => raw,
            Err(QtumError::UnknownTransaction(_)) => return Ok(JsonValue::Null),
            Err(e) => return Err(e.into()),
        };

        let Some(block_hash) = raw.blockhash.clone() else {
            return Ok(JsonValue::Null);
        };

        let shaped_tx = eth_tx_from_raw(&self.qtum, &raw, None, ctx.deadline).await?;
        let receipt = EthReceipt {
            transaction_hash: shaped_tx.hash,
            transaction_index: shaped_tx.transaction_index.unwrap_or_else(|| "0x0".into()),
            block_hash: eth_hash(&block_hash),
            block_number: shaped_tx.block_number.unwrap_or_else(|| "0x0".into()),
            from: Some(shaped_tx.from),
            to: shaped_tx.to,
            cumulative_gas_used: "0x0".to_string(),
            gas_used: "0x0".to_string(),
            contract_address: None,
            logs: Vec::new(),
            logs_bloom: codec::empty_bloom(),
            status: "0x1".to_string(),
        };
        Ok(serde_json::to_value(receipt).unwrap_or(JsonValue::Null))
    }
}

/// `eth_call`
pub struct CallHandler {
    pub qtum: Arc<QtumClient>,
}

impl CallHandler {
    /// Execute a read-only contract call. Shared with `eth_estimateGas`.
    pub async fn execute(
        qtum: &QtumClient,
        call: &CallRequest,
        deadline: Option<Instant>,
    ) -> Result<CallContractResult, JsonRpcError> {
        let to = call
            .to
            .as_deref()
            .ok_or_else(|| JsonRpcError::invalid_params("missing to address"))?;
        let contract = eth::normalize_address(to)?
            .trim_start_matches("0x")
            .to_string();

        let data = call
            .data
            .as_deref()
            .unwrap_or("0x")
            .trim_start_matches("0x")
            .to_string();

        // A zero or absent from address means "no sender context".
        let sender = match call.from.as_deref() {
            None => None,
            Some(from) if from == ZERO_ADDRESS => None,
            Some(from) => Some(to_qtum_address(qtum, from)?),
        };

        let gas_limit = gas_limit_param(call.gas.as_deref())?;

        qtum.call_contract(&contract, &data, sender.as_deref(), gas_limit, deadline)
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl EthHandler for CallHandler {
    fn method(&self) -> &'static str {
        "eth_call"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let call: CallRequest = eth::object_param(params, 0)?;
        let result = Self::execute(&self.qtum, &call, ctx.deadline).await?;

        let execution = &result.execution_result;
        if !execution.excepted.is_empty() && execution.excepted != "None" {
            return Err(JsonRpcError::server_error(format!(
                "contract execution failed: {}",
                execution.excepted
            )));
        }

        Ok(JsonValue::String(format!("0x{}", execution.output)))
    }
}

/// `eth_estimateGas`
pub struct EstimateGasHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for EstimateGasHandler {
    fn method(&self) -> &'static str {
        "eth_estimateGas"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let call: CallRequest = eth::object_param(params, 0)?;

        // Pure value transfer
        let has_data = call.data.as_deref().is_some_and(|d| d != "0x" && !d.is_empty());
        if !has_data && call.to.is_some() {
            return Ok(JsonValue::String(codec::encode_hex_u64(TRANSFER_GAS)));
        }

        // Contract creation has no callable address; report the floor.
        if call.to.is_none() {
            return Ok(JsonValue::String(codec::encode_hex_u64(ESTIMATE_GAS_FLOOR)));
        }

        match CallHandler::execute(&self.qtum, &call, ctx.deadline).await {
            Ok(result) if result.execution_result.gas_used > 0 => Ok(JsonValue::String(
                codec::encode_hex_u64(result.execution_result.gas_used),
            )),
            Ok(_) => Ok(JsonValue::String(codec::encode_hex_u64(ESTIMATE_GAS_FLOOR))),
            Err(_) => Ok(JsonValue::String(codec::encode_hex_u64(ESTIMATE_GAS_FLOOR))),
        }
    }
}

/// `eth_sendTransaction`
pub struct SendTransactionHandler {
    pub qtum: Arc<QtumClient>,
    pub accounts: Arc<Accounts>,
}

#[async_trait]
impl EthHandler for SendTransactionHandler {
    fn method(&self) -> &'static str {
        "eth_sendTransaction"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let request: TransactionRequest = eth::object_param(params, 0)?;
        let from = eth::normalize_address(&request.from)?;

        // With configured accounts the sender must be one of them;
        // otherwise the upstream wallet is trusted to hold the key.
        if !self.accounts.is_empty() && self.accounts.find(&from).is_none() {
            return Err(JsonRpcError::server_error(format!(
                "no funded local account for {from}"
            )));
        }

        let sender = to_qtum_address(&self.qtum, &from)?;
        let value_sat = match request.value.as_deref() {
            Some(hex) => wei_param_to_satoshi(hex)?,
            None => 0,
        };
        let has_data = request.data.as_deref().is_some_and(|d| d != "0x" && !d.is_empty());

        let txid = if has_data {
            let data = request
                .data
                .as_deref()
                .unwrap_or_default()
                .trim_start_matches("0x")
                .to_string();
            let gas_limit =
                gas_limit_param(request.gas.as_deref())?.unwrap_or(DEFAULT_CONTRACT_GAS);
            let gas_price = gas_price_to_satoshi(request.gas_price.as_deref())?;

            match request.to.as_deref() {
                Some(to) => {
                    let contract = eth::normalize_address(to)?
                        .trim_start_matches("0x")
                        .to_string();
                    self.qtum
                        .send_to_contract(
                            &contract,
                            &data,
                            value_sat,
                            gas_limit,
                            gas_price,
                            Some(&sender),
                            ctx.deadline,
                        )
                        .await?
                        .txid
                }
                None => {
                    self.qtum
                        .create_contract(&data, gas_limit, gas_price, Some(&sender), ctx.deadline)
                        .await?
                        .txid
                }
            }
        } else {
            let to = request
                .to
                .as_deref()
                .ok_or_else(|| JsonRpcError::invalid_params("missing to address"))?;
            let recipient = to_qtum_address(&self.qtum, &eth::normalize_address(to)?)?;
            self.qtum
                .send_to_address(&recipient, value_sat, ctx.deadline)
                .await?
        };

        if !self.qtum.get_flag_bool(FLAG_IGNORE_TRANSACTIONS) {
            info!(txid, "transaction submitted");
        }
        Ok(JsonValue::String(eth_hash(&txid)))
    }
}

/// `eth_sendRawTransaction`
pub struct SendRawTransactionHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for SendRawTransactionHandler {
    fn method(&self) -> &'static str {
        "eth_sendRawTransaction"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let raw = eth::string_param(params, 0)?;
        codec::decode_hex_bytes(&raw)
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

        let txid = self
            .qtum
            .send_raw_transaction(raw.trim_start_matches("0x"), ctx.deadline)
            .await?;

        if !self.qtum.get_flag_bool(FLAG_IGNORE_TRANSACTIONS) {
            info!(txid, "raw transaction submitted");
        }
        Ok(JsonValue::String(eth_hash(&txid)))
    }
}

/// `eth_sign`
pub struct SignHandler {
    pub accounts: Arc<Accounts>,
}

#[async_trait]
impl EthHandler for SignHandler {
    fn method(&self) -> &'static str {
        "eth_sign"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        _ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        if self.accounts.is_empty() {
            return Err(JsonRpcError::new(-32601, "method not supported"));
        }

        let address = eth::normalize_address(&eth::string_param(params, 0)?)?;
        let message = codec::decode_hex_bytes(&eth::string_param(params, 1)?)
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

        let account = self
            .accounts
            .find(&address)
            .ok_or_else(|| JsonRpcError::invalid_params(format!("unknown account: {address}")))?;

        let signature = account
            .sign_message(&message)
            .map_err(|e| JsonRpcError::internal_error(e.to_string()))?;
        Ok(JsonValue::String(codec::encode_hex_bytes(&signature)))
    }
}

/// `eth_signTransaction`
///
/// Builds and signs a value-transfer transaction with a configured
/// account, selecting UTXOs through the upstream wallet RPC. Contract
/// transactions need locally-built output scripts and are not offered.
pub struct SignTransactionHandler {
    pub qtum: Arc<QtumClient>,
    pub accounts: Arc<Accounts>,
}

#[async_trait]
impl EthHandler for SignTransactionHandler {
    fn method(&self) -> &'static str {
        "eth_signTransaction"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        if self.accounts.is_empty() {
            return Err(JsonRpcError::new(-32601, "method not supported"));
        }

        let request: TransactionRequest = eth::object_param(params, 0)?;
        if request.data.as_deref().is_some_and(|d| d != "0x" && !d.is_empty()) {
            return Err(JsonRpcError::server_error(
                "signing contract transactions is not supported",
            ));
        }

        let from = eth::normalize_address(&request.from)?;
        let account = self
            .accounts
            .find(&from)
            .ok_or_else(|| JsonRpcError::invalid_params(format!("unknown account: {from}")))?;

        let to = request
            .to
            .as_deref()
            .ok_or_else(|| JsonRpcError::invalid_params("missing to address"))?;
        let recipient = to_qtum_address(&self.qtum, &eth::normalize_address(to)?)?;

        let value_sat = match request.value.as_deref() {
            Some(hex) => wei_param_to_satoshi(hex)?,
            None => 0,
        };
        let target_sat = value_sat + RAW_TX_FEE_SAT;

        let mut unspent = self
            .qtum
            .list_unspent(1, 9_999_999, &[account.qtum_address.clone()], ctx.deadline)
            .await?;
        unspent.sort_by(|a, b| b.amount.total_cmp(&a.amount));

        let mut inputs = Vec::new();
        let mut selected_sat = 0u64;
        for utxo in unspent.iter().filter(|u| u.spendable) {
            inputs.push(json!({ "txid": utxo.txid, "vout": utxo.vout }));
            selected_sat += coin_amount_to_satoshi(utxo.amount);
            if selected_sat >= target_sat {
                break;
            }
        }
        if selected_sat < target_sat {
            return Err(JsonRpcError::server_error(format!(
                "insufficient funds: have {selected_sat} satoshi, need {target_sat}"
            )));
        }

        let mut outputs = serde_json::Map::new();
        outputs.insert(
            recipient.clone(),
            JsonValue::String(satoshi_to_coin_string(value_sat)),
        );
        let change_sat = selected_sat - target_sat;
        if change_sat > DUST_SAT {
            outputs.insert(
                account.qtum_address.clone(),
                JsonValue::String(satoshi_to_coin_string(change_sat)),
            );
        }

        let unsigned = self
            .qtum
            .create_raw_transaction(
                JsonValue::Array(inputs),
                JsonValue::Object(outputs),
                ctx.deadline,
            )
            .await?;

        let signed = self
            .qtum
            .sign_raw_transaction_with_key(&unsigned, &[account.wif.clone()], ctx.deadline)
            .await?;
        if !signed.complete {
            return Err(JsonRpcError::internal_error("incomplete signature set"));
        }

        Ok(JsonValue::String(format!("0x{}", signed.hex)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(asm: &str, kind: &str) -> ScriptPubKey {
        serde_json::from_value(json!({
            "asm": asm, "hex": "", "type": kind
        }))
        .unwrap()
    }

    #[test]
    fn op_call_script_parses() {
        let spk = script(
            "4 2500000 40 a9059cbb0000 8a32d04bbfd24a47577e1fa91d7da1d08c36e042 OP_CALL",
            "call",
        );
        assert_eq!(
            parse_contract_script(&spk),
            Some(ContractOp::Call {
                gas_limit: 2_500_000,
                gas_price_sat: 40,
                data: "a9059cbb0000".to_string(),
                contract: "8a32d04bbfd24a47577e1fa91d7da1d08c36e042".to_string(),
            })
        );
    }

    #[test]
    fn op_create_script_parses() {
        let spk = script("4 6721975 40 6060604052 OP_CREATE", "create");
        assert_eq!(
            parse_contract_script(&spk),
            Some(ContractOp::Create {
                gas_limit: 6_721_975,
                gas_price_sat: 40,
                data: "6060604052".to_string(),
            })
        );
    }

    #[test]
    fn ordinary_scripts_are_not_contract_ops() {
        let spk = script(
            "OP_DUP OP_HASH160 7926223070547d2d15b2ef5e7383e541c338ffe9 OP_EQUALVERIFY OP_CHECKSIG",
            "pubkeyhash",
        );
        assert_eq!(parse_contract_script(&spk), None);
    }

    #[test]
    fn wei_params_truncate_to_satoshi() {
        // 1 QTUM = 1e18 wei
        assert_eq!(wei_param_to_satoshi("0xde0b6b3a7640000").unwrap(), 100_000_000);
        // 40 sat/gas default price
        assert_eq!(gas_price_to_satoshi(Some("0x5d21dba000")).unwrap(), 40);
        assert_eq!(gas_price_to_satoshi(None).unwrap(), DEFAULT_GAS_PRICE_SAT);
        // sub-satoshi prices floor to 1, not 0
        assert_eq!(gas_price_to_satoshi(Some("0x1")).unwrap(), 1);
    }

    #[test]
    fn receipt_shaping_maps_status_and_bloom() {
        let success: QtumReceipt = serde_json::from_value(json!({
            "blockHash": "aa".repeat(32), "blockNumber": 7,
            "transactionHash": "bb".repeat(32), "transactionIndex": 0,
            "from": "7926223070547d2d15b2ef5e7383e541c338ffe9",
            "to": "8a32d04bbfd24a47577e1fa91d7da1d08c36e042",
            "cumulativeGasUsed": 30000, "gasUsed": 30000,
            "excepted": "None",
            "log": [{
                "address": "8a32d04bbfd24a47577e1fa91d7da1d08c36e042",
                "topics": ["cc".repeat(32)],
                "data": "00"
            }]
        }))
        .unwrap();

        let shaped = shape_receipt(&success);
        assert_eq!(shaped.status, "0x1");
        assert_eq!(shaped.logs.len(), 1);
        assert_ne!(shaped.logs_bloom, codec::empty_bloom());
        assert_eq!(shaped.from.as_deref(), Some("0x7926223070547d2d15b2ef5e7383e541c338ffe9"));

        let reverted: QtumReceipt = serde_json::from_value(json!({
            "blockHash": "aa".repeat(32), "blockNumber": 7,
            "transactionHash": "bb".repeat(32), "transactionIndex": 0,
            "cumulativeGasUsed": 30000, "gasUsed": 30000,
            "excepted": "Revert", "log": []
        }))
        .unwrap();
        let shaped = shape_receipt(&reverted);
        assert_eq!(shaped.status, "0x0");
        assert_eq!(shaped.logs_bloom, codec::empty_bloom());
    }

    #[test]
    fn tx_hash_param_is_validated() {
        assert!(strip_tx_hash(&format!("0x{}", "ab".repeat(32))).is_ok());
        assert!(strip_tx_hash("0xabcd").is_err());
        assert!(strip_tx_hash("nothex").is_err());
    }
}
