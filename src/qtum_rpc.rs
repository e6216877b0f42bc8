//! Typed wrappers over the upstream Qtum RPC surface
//!
//! One thin method per upstream call, with serde structs for the response
//! shapes the handlers actually consume. Everything funnels through
//! [`QtumClient::request`], so caching, retry and cancellation apply
//! uniformly.

use crate::qtum::{QtumClient, QtumError};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Instant;

/// Satoshis per QTUM coin.
pub const SATOSHI_PER_QTUM: u64 = 100_000_000;

/// Default gas limit handed to contract calls when the caller names none.
pub const DEFAULT_CONTRACT_GAS: u64 = 2_500_000;

/// Default gas price in satoshi per gas unit (0.00000040 QTUM).
pub const DEFAULT_GAS_PRICE_SAT: u64 = 40;

/// Format satoshi as a decimal coin amount string, the representation
/// qtumd's amount parser accepts without float rounding.
pub fn satoshi_to_coin_string(satoshi: u64) -> String {
    format!(
        "{}.{:08}",
        satoshi / SATOSHI_PER_QTUM,
        satoshi % SATOSHI_PER_QTUM
    )
}

/// Parse a coin amount reported as a JSON float into satoshi.
pub fn coin_amount_to_satoshi(coins: f64) -> u64 {
    (coins * SATOSHI_PER_QTUM as f64).round() as u64
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    pub bestblockhash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfo {
    pub version: u64,
    pub subversion: String,
    pub connections: u64,
    #[serde(default)]
    pub networkactive: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StakingInfo {
    #[serde(default)]
    pub staking: bool,
}

/// `getblock` with verbosity 2: full transaction objects inline.
#[derive(Debug, Clone, Deserialize)]
pub struct QtumBlock {
    pub hash: String,
    pub height: u64,
    pub size: u64,
    pub weight: u64,
    pub time: u64,
    pub nonce: u64,
    pub merkleroot: String,
    #[serde(rename = "hashStateRoot", default)]
    pub hash_state_root: Option<String>,
    #[serde(default)]
    pub previousblockhash: Option<String>,
    #[serde(default)]
    pub nextblockhash: Option<String>,
    pub tx: Vec<QtumRawTx>,
}

impl QtumBlock {
    /// Qtum carries an EVM state root in its block header.
    pub fn state_root(&self) -> Option<&str> {
        self.hash_state_root.as_deref()
    }
}

/// `getrawtransaction` with verbose decoding.
#[derive(Debug, Clone, Deserialize)]
pub struct QtumRawTx {
    pub txid: String,
    pub size: u64,
    pub version: i64,
    pub vin: Vec<QtumVin>,
    pub vout: Vec<QtumVout>,
    #[serde(default)]
    pub blockhash: Option<String>,
    #[serde(default)]
    pub confirmations: Option<i64>,
    #[serde(default)]
    pub blocktime: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QtumVin {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub coinbase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QtumVout {
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub hex: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
}

impl ScriptPubKey {
    /// First address paid by this output, if any.
    pub fn first_address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .or_else(|| self.addresses.as_ref().and_then(|a| a.first().map(String::as_str)))
    }
}

/// One entry of `gettransactionreceipt` / `searchlogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QtumReceipt {
    pub block_hash: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub transaction_index: u64,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    pub cumulative_gas_used: u64,
    pub gas_used: u64,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub excepted: Option<String>,
    #[serde(default)]
    pub log: Vec<QtumLogEntry>,
}

impl QtumReceipt {
    /// Whether contract execution completed without exception.
    pub fn succeeded(&self) -> bool {
        matches!(self.excepted.as_deref(), None | Some("None"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QtumLogEntry {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

/// `callcontract` result.
#[derive(Debug, Clone, Deserialize)]
pub struct CallContractResult {
    pub address: String,
    #[serde(rename = "executionResult")]
    pub execution_result: ExecutionResult,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub gas_used: u64,
    #[serde(default)]
    pub excepted: String,
    #[serde(default)]
    pub output: String,
}

/// `sendtocontract` result.
#[derive(Debug, Clone, Deserialize)]
pub struct SendToContractResult {
    pub txid: String,
    #[serde(default)]
    pub sender: Option<String>,
}

/// `createcontract` result.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateContractResult {
    pub txid: String,
    #[serde(default)]
    pub sender: Option<String>,
    /// hex160 of the contract that the transaction will create
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnspentOutput {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount: f64,
    pub confirmations: u64,
    #[serde(default)]
    pub spendable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddressBalance {
    pub balance: u64,
    #[serde(default)]
    pub received: u64,
}

/// Contract account state from `getaccountinfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    pub address: String,
    pub balance: u64,
    #[serde(default)]
    pub storage: JsonValue,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeEstimate {
    #[serde(default)]
    pub feerate: Option<f64>,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignRawTxResult {
    pub hex: String,
    pub complete: bool,
}

impl QtumClient {
    pub async fn get_blockchain_info(
        &self,
        deadline: Option<Instant>,
    ) -> Result<BlockchainInfo, QtumError> {
        self.request_as("getblockchaininfo", json!([]), deadline).await
    }

    pub async fn get_block_count(&self, deadline: Option<Instant>) -> Result<u64, QtumError> {
        self.request_as("getblockcount", json!([]), deadline).await
    }

    pub async fn get_block_hash(
        &self,
        height: u64,
        deadline: Option<Instant>,
    ) -> Result<String, QtumError> {
        self.request_as("getblockhash", json!([height]), deadline).await
    }

    pub async fn get_block(
        &self,
        hash: &str,
        deadline: Option<Instant>,
    ) -> Result<QtumBlock, QtumError> {
        self.request_as("getblock", json!([hash, 2]), deadline).await
    }

    pub async fn get_raw_transaction(
        &self,
        txid: &str,
        deadline: Option<Instant>,
    ) -> Result<QtumRawTx, QtumError> {
        self.request_as("getrawtransaction", json!([txid, true]), deadline)
            .await
    }

    pub async fn get_raw_transaction_hex(
        &self,
        txid: &str,
        deadline: Option<Instant>,
    ) -> Result<String, QtumError> {
        self.request_as("getrawtransaction", json!([txid, false]), deadline)
            .await
    }

    pub async fn get_transaction_receipt(
        &self,
        txid: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<QtumReceipt>, QtumError> {
        self.request_as("gettransactionreceipt", json!([txid]), deadline)
            .await
    }

    pub async fn call_contract(
        &self,
        contract: &str,
        data: &str,
        sender: Option<&str>,
        gas_limit: Option<u64>,
        deadline: Option<Instant>,
    ) -> Result<CallContractResult, QtumError> {
        let params = match (sender, gas_limit) {
            (Some(sender), Some(gas)) => json!([contract, data, sender, gas]),
            (Some(sender), None) => json!([contract, data, sender]),
            (None, _) => json!([contract, data]),
        };
        self.request_as("callcontract", params, deadline).await
    }

    /// `searchlogs` over an inclusive height range, with optional address
    /// and topic filters in the upstream's `{addresses}` / `{topics}` form.
    pub async fn search_logs(
        &self,
        from_height: u64,
        to_height: u64,
        addresses: &[String],
        topics: &[String],
        deadline: Option<Instant>,
    ) -> Result<Vec<QtumReceipt>, QtumError> {
        let address_filter = json!({ "addresses": addresses });
        let topic_filter = json!({ "topics": topics });
        self.request_as(
            "searchlogs",
            json!([from_height, to_height, address_filter, topic_filter]),
            deadline,
        )
        .await
    }

    pub async fn send_to_address(
        &self,
        address: &str,
        satoshi: u64,
        deadline: Option<Instant>,
    ) -> Result<String, QtumError> {
        self.request_as(
            "sendtoaddress",
            json!([address, satoshi_to_coin_string(satoshi)]),
            deadline,
        )
        .await
    }

    pub async fn send_to_contract(
        &self,
        contract: &str,
        data: &str,
        satoshi: u64,
        gas_limit: u64,
        gas_price_sat: u64,
        sender: Option<&str>,
        deadline: Option<Instant>,
    ) -> Result<SendToContractResult, QtumError> {
        let amount = satoshi_to_coin_string(satoshi);
        let gas_price = satoshi_to_coin_string(gas_price_sat);
        let params = match sender {
            Some(sender) => json!([contract, data, amount, gas_limit, gas_price, sender]),
            None => json!([contract, data, amount, gas_limit, gas_price]),
        };
        self.request_as("sendtocontract", params, deadline).await
    }

    pub async fn create_contract(
        &self,
        bytecode: &str,
        gas_limit: u64,
        gas_price_sat: u64,
        sender: Option<&str>,
        deadline: Option<Instant>,
    ) -> Result<CreateContractResult, QtumError> {
        let gas_price = satoshi_to_coin_string(gas_price_sat);
        let params = match sender {
            Some(sender) => json!([bytecode, gas_limit, gas_price, sender]),
            None => json!([bytecode, gas_limit, gas_price]),
        };
        self.request_as("createcontract", params, deadline).await
    }

    pub async fn send_raw_transaction(
        &self,
        hex_tx: &str,
        deadline: Option<Instant>,
    ) -> Result<String, QtumError> {
        self.request_as("sendrawtransaction", json!([hex_tx]), deadline)
            .await
    }

    pub async fn get_hex_address(
        &self,
        base58: &str,
        deadline: Option<Instant>,
    ) -> Result<String, QtumError> {
        self.request_as("gethexaddress", json!([base58]), deadline).await
    }

    pub async fn from_hex_address(
        &self,
        hex160: &str,
        deadline: Option<Instant>,
    ) -> Result<String, QtumError> {
        self.request_as("fromhexaddress", json!([hex160]), deadline).await
    }

    pub async fn list_unspent(
        &self,
        min_conf: u64,
        max_conf: u64,
        addresses: &[String],
        deadline: Option<Instant>,
    ) -> Result<Vec<UnspentOutput>, QtumError> {
        self.request_as("listunspent", json!([min_conf, max_conf, addresses]), deadline)
            .await
    }

    pub async fn get_address_balance(
        &self,
        addresses: &[String],
        deadline: Option<Instant>,
    ) -> Result<AddressBalance, QtumError> {
        self.request_as(
            "getaddressbalance",
            json!([{ "addresses": addresses }]),
            deadline,
        )
        .await
    }

    pub async fn get_address_tx_ids(
        &self,
        addresses: &[String],
        deadline: Option<Instant>,
    ) -> Result<Vec<String>, QtumError> {
        self.request_as(
            "getaddresstxids",
            json!([{ "addresses": addresses }]),
            deadline,
        )
        .await
    }

    pub async fn get_account_info(
        &self,
        contract_hex: &str,
        deadline: Option<Instant>,
    ) -> Result<AccountInfo, QtumError> {
        self.request_as("getaccountinfo", json!([contract_hex]), deadline)
            .await
    }

    /// Raw `getstorage` for one contract. The result maps storage slots to
    /// `{position: value}` objects; the caller picks its slot out.
    pub async fn get_storage(
        &self,
        contract_hex: &str,
        deadline: Option<Instant>,
    ) -> Result<JsonValue, QtumError> {
        self.request("getstorage", json!([contract_hex]), deadline).await
    }

    pub async fn estimate_smart_fee(
        &self,
        conf_target: u64,
        deadline: Option<Instant>,
    ) -> Result<FeeEstimate, QtumError> {
        self.request_as("estimatesmartfee", json!([conf_target]), deadline)
            .await
    }

    pub async fn generate_to_address(
        &self,
        blocks: u64,
        address: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<String>, QtumError> {
        self.request_as("generatetoaddress", json!([blocks, address]), deadline)
            .await
    }

    pub async fn get_raw_mempool(
        &self,
        deadline: Option<Instant>,
    ) -> Result<Vec<String>, QtumError> {
        self.request_as("getrawmempool", json!([]), deadline).await
    }

    pub async fn get_network_info(
        &self,
        deadline: Option<Instant>,
    ) -> Result<NetworkInfo, QtumError> {
        self.request_as("getnetworkinfo", json!([]), deadline).await
    }

    pub async fn get_staking_info(
        &self,
        deadline: Option<Instant>,
    ) -> Result<StakingInfo, QtumError> {
        self.request_as("getstakinginfo", json!([]), deadline).await
    }

    pub async fn create_raw_transaction(
        &self,
        inputs: JsonValue,
        outputs: JsonValue,
        deadline: Option<Instant>,
    ) -> Result<String, QtumError> {
        self.request_as("createrawtransaction", json!([inputs, outputs]), deadline)
            .await
    }

    pub async fn sign_raw_transaction_with_key(
        &self,
        hex_tx: &str,
        wif_keys: &[String],
        deadline: Option<Instant>,
    ) -> Result<SignRawTxResult, QtumError> {
        self.request_as(
            "signrawtransactionwithkey",
            json!([hex_tx, wif_keys]),
            deadline,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_string_keeps_eight_decimals() {
        assert_eq!(satoshi_to_coin_string(0), "0.00000000");
        assert_eq!(satoshi_to_coin_string(40), "0.00000040");
        assert_eq!(satoshi_to_coin_string(SATOSHI_PER_QTUM), "1.00000000");
        assert_eq!(satoshi_to_coin_string(250_000_000), "2.50000000");
    }

    #[test]
    fn coin_amount_round_trips_through_float() {
        assert_eq!(coin_amount_to_satoshi(2.5), 250_000_000);
        assert_eq!(coin_amount_to_satoshi(0.00000040), 40);
        assert_eq!(coin_amount_to_satoshi(0.1), 10_000_000);
    }

    #[test]
    fn receipt_excepted_field_gates_success() {
        let receipt: QtumReceipt = serde_json::from_value(serde_json::json!({
            "blockHash": "aa", "blockNumber": 5, "transactionHash": "bb",
            "transactionIndex": 1, "cumulativeGasUsed": 21000, "gasUsed": 21000,
            "excepted": "None", "log": []
        }))
        .unwrap();
        assert!(receipt.succeeded());

        let reverted: QtumReceipt = serde_json::from_value(serde_json::json!({
            "blockHash": "aa", "blockNumber": 5, "transactionHash": "bb",
            "transactionIndex": 1, "cumulativeGasUsed": 21000, "gasUsed": 21000,
            "excepted": "Revert", "log": []
        }))
        .unwrap();
        assert!(!reverted.succeeded());
    }

    #[test]
    fn script_pub_key_address_fallback() {
        let single: ScriptPubKey = serde_json::from_value(serde_json::json!({
            "asm": "", "hex": "", "type": "pubkeyhash",
            "address": "qUbxboqjBRp96j3La8D1RYkyqx5uQbJPoW"
        }))
        .unwrap();
        assert_eq!(
            single.first_address(),
            Some("qUbxboqjBRp96j3La8D1RYkyqx5uQbJPoW")
        );

        let legacy: ScriptPubKey = serde_json::from_value(serde_json::json!({
            "asm": "", "hex": "", "type": "pubkeyhash",
            "addresses": ["qUbxboqjBRp96j3La8D1RYkyqx5uQbJPoW"]
        }))
        .unwrap();
        assert_eq!(
            legacy.first_address(),
            Some("qUbxboqjBRp96j3La8D1RYkyqx5uQbJPoW")
        );
    }
}
