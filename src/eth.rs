//! Ethereum-facing wire types
//!
//! The JSON shapes wallets and dapp libraries expect back from the
//! gateway, plus helpers for pulling positional parameters out of a
//! JSON-RPC params array.

use crate::codec;
use crate::rpc::JsonRpcError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// 32 zero bytes, hex encoded. Used for fields Qtum has no analogue for.
pub const ZERO_HASH: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

/// The zero address.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Keccak of the empty uncle list, a constant in every Ethereum block.
pub const EMPTY_UNCLES_HASH: &str =
    "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347";

/// A block selector: explicit height or one of the tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// Explicit block height
    Number(u64),
    /// Chain tip
    Latest,
    /// Genesis
    Earliest,
    /// Treated as the chain tip; Qtum has no pending block
    Pending,
}

impl BlockTag {
    /// Parse a JSON block identifier (hex quantity or tag string).
    pub fn parse(value: &JsonValue) -> Result<Self, JsonRpcError> {
        let text = value
            .as_str()
            .ok_or_else(|| JsonRpcError::invalid_params("block parameter must be a string"))?;
        match text {
            "latest" => Ok(BlockTag::Latest),
            "earliest" => Ok(BlockTag::Earliest),
            "pending" => Ok(BlockTag::Pending),
            other => codec::decode_hex_u64(other)
                .map(BlockTag::Number)
                .map_err(|e| JsonRpcError::invalid_params(e.to_string())),
        }
    }
}

/// A log entry, shaped for `eth_getLogs`, receipts and filter polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_hash: String,
    pub block_number: String,
    pub transaction_hash: String,
    pub transaction_index: String,
    pub log_index: String,
    pub removed: bool,
}

/// A transaction, shaped for `eth_getTransactionByHash` and friends.
///
/// `v`/`r`/`s` carry zero placeholders: Qtum transactions are not
/// ECDSA-signed in the Ethereum sense.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTransaction {
    pub hash: String,
    pub nonce: String,
    pub block_hash: Option<String>,
    pub block_number: Option<String>,
    pub transaction_index: Option<String>,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub gas_price: String,
    pub gas: String,
    pub input: String,
    pub v: String,
    pub r: String,
    pub s: String,
}

/// A transaction receipt, shaped for `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthReceipt {
    pub transaction_hash: String,
    pub transaction_index: String,
    pub block_hash: String,
    pub block_number: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cumulative_gas_used: String,
    pub gas_used: String,
    pub contract_address: Option<String>,
    pub logs: Vec<EthLog>,
    pub logs_bloom: String,
    pub status: String,
}

/// A block, shaped for `eth_getBlockByNumber` / `eth_getBlockByHash`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EthBlock {
    pub number: String,
    pub hash: String,
    pub parent_hash: String,
    pub mix_hash: String,
    pub nonce: String,
    pub sha3_uncles: String,
    pub logs_bloom: String,
    pub transactions_root: String,
    pub state_root: String,
    pub receipts_root: String,
    pub miner: String,
    pub difficulty: String,
    pub total_difficulty: String,
    pub extra_data: String,
    pub size: String,
    pub gas_limit: String,
    pub gas_used: String,
    pub timestamp: String,
    /// Hash strings, or full objects when the caller asked for them
    pub transactions: Vec<JsonValue>,
    pub uncles: Vec<String>,
}

/// Parameters of `eth_call` / `eth_estimateGas`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub from: Option<String>,
    pub to: Option<String>,
    pub gas: Option<String>,
    pub gas_price: Option<String>,
    pub value: Option<String>,
    #[serde(alias = "input")]
    pub data: Option<String>,
}

/// Parameters of `eth_sendTransaction` / `eth_signTransaction`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub from: String,
    pub to: Option<String>,
    pub gas: Option<String>,
    pub gas_price: Option<String>,
    pub value: Option<String>,
    #[serde(alias = "input")]
    pub data: Option<String>,
    pub nonce: Option<String>,
}

/// Log filter criteria, shared by `eth_getLogs`, `eth_newFilter` and the
/// `logs` subscription.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilterCriteria {
    pub from_block: Option<JsonValue>,
    pub to_block: Option<JsonValue>,
    #[serde(default)]
    pub address: Option<JsonValue>,
    #[serde(default)]
    pub topics: Option<Vec<JsonValue>>,
}

impl LogFilterCriteria {
    /// Addresses as a flat list of lowercase `0x…40` strings.
    pub fn addresses(&self) -> Result<Vec<String>, JsonRpcError> {
        let mut out = Vec::new();
        match &self.address {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::String(s)) => out.push(normalize_address(s)?),
            Some(JsonValue::Array(items)) => {
                for item in items {
                    let s = item.as_str().ok_or_else(|| {
                        JsonRpcError::invalid_params("address entries must be strings")
                    })?;
                    out.push(normalize_address(s)?);
                }
            }
            Some(_) => {
                return Err(JsonRpcError::invalid_params(
                    "address must be a string or array of strings",
                ))
            }
        }
        Ok(out)
    }

    /// Topic positions: `None` matches anything, otherwise any-of the set.
    pub fn topic_matchers(&self) -> Result<Vec<Option<Vec<String>>>, JsonRpcError> {
        let mut out = Vec::new();
        if let Some(topics) = &self.topics {
            for entry in topics {
                match entry {
                    JsonValue::Null => out.push(None),
                    JsonValue::String(s) => out.push(Some(vec![s.to_lowercase()])),
                    JsonValue::Array(options) => {
                        let mut set = Vec::new();
                        for option in options {
                            let s = option.as_str().ok_or_else(|| {
                                JsonRpcError::invalid_params("topic entries must be strings")
                            })?;
                            set.push(s.to_lowercase());
                        }
                        out.push(Some(set));
                    }
                    _ => {
                        return Err(JsonRpcError::invalid_params(
                            "topics must be null, a string, or an array",
                        ))
                    }
                }
            }
        }
        Ok(out)
    }

    /// True when `log`'s topics satisfy every positional matcher.
    pub fn topics_match(matchers: &[Option<Vec<String>>], log_topics: &[String]) -> bool {
        for (position, matcher) in matchers.iter().enumerate() {
            if let Some(options) = matcher {
                match log_topics.get(position) {
                    Some(topic) if options.iter().any(|o| o == &topic.to_lowercase()) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

/// Validate and lowercase a `0x…40` address string.
pub fn normalize_address(input: &str) -> Result<String, JsonRpcError> {
    let bytes = codec::decode_hex_bytes(input)
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
    if bytes.len() != 20 {
        return Err(JsonRpcError::invalid_params(format!(
            "address must be 20 bytes: {input}"
        )));
    }
    Ok(input.to_lowercase())
}

/// Require `params` to be an array with at least `min` entries.
pub fn expect_params(params: &JsonValue, min: usize) -> Result<&Vec<JsonValue>, JsonRpcError> {
    let array = params
        .as_array()
        .ok_or_else(|| JsonRpcError::invalid_params("params must be an array"))?;
    if array.len() < min {
        return Err(JsonRpcError::invalid_params(format!(
            "expected at least {min} parameter(s), got {}",
            array.len()
        )));
    }
    Ok(array)
}

/// Pull the string at position `index` out of a params array.
pub fn string_param(params: &JsonValue, index: usize) -> Result<String, JsonRpcError> {
    let array = expect_params(params, index + 1)?;
    array[index]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| JsonRpcError::invalid_params(format!("parameter {index} must be a string")))
}

/// Pull an optional boolean at position `index`, defaulting to `false`.
pub fn bool_param_or(params: &JsonValue, index: usize, default: bool) -> bool {
    params
        .as_array()
        .and_then(|a| a.get(index))
        .and_then(JsonValue::as_bool)
        .unwrap_or(default)
}

/// Deserialize the object at position `index`.
pub fn object_param<T: serde::de::DeserializeOwned>(
    params: &JsonValue,
    index: usize,
) -> Result<T, JsonRpcError> {
    let array = expect_params(params, index + 1)?;
    serde_json::from_value(array[index].clone())
        .map_err(|e| JsonRpcError::invalid_params(format!("parameter {index}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn block_tag_parses_tags_and_numbers() {
        assert_eq!(BlockTag::parse(&json!("latest")).unwrap(), BlockTag::Latest);
        assert_eq!(
            BlockTag::parse(&json!("earliest")).unwrap(),
            BlockTag::Earliest
        );
        assert_eq!(
            BlockTag::parse(&json!("pending")).unwrap(),
            BlockTag::Pending
        );
        assert_eq!(
            BlockTag::parse(&json!("0x32d")).unwrap(),
            BlockTag::Number(813)
        );
        assert!(BlockTag::parse(&json!("813")).is_err());
        assert!(BlockTag::parse(&json!(813)).is_err());
    }

    #[test]
    fn topic_matchers_honor_positions_and_wildcards() {
        let criteria: LogFilterCriteria = serde_json::from_value(json!({
            "topics": [null, "0xAA", ["0xbb", "0xcc"]]
        }))
        .unwrap();
        let matchers = criteria.topic_matchers().unwrap();

        let log = vec!["0x01".to_string(), "0xaa".to_string(), "0xcc".to_string()];
        assert!(LogFilterCriteria::topics_match(&matchers, &log));

        let wrong = vec!["0x01".to_string(), "0xaa".to_string(), "0xdd".to_string()];
        assert!(!LogFilterCriteria::topics_match(&matchers, &wrong));

        let short = vec!["0x01".to_string()];
        assert!(!LogFilterCriteria::topics_match(&matchers, &short));
    }

    #[test]
    fn address_list_accepts_scalar_and_array() {
        let one: LogFilterCriteria = serde_json::from_value(json!({
            "address": "0x7926223070547D2D15b2eF5e7383E541c338FfE9"
        }))
        .unwrap();
        assert_eq!(
            one.addresses().unwrap(),
            vec!["0x7926223070547d2d15b2ef5e7383e541c338ffe9".to_string()]
        );

        let many: LogFilterCriteria = serde_json::from_value(json!({
            "address": ["0x7926223070547d2d15b2ef5e7383e541c338ffe9"]
        }))
        .unwrap();
        assert_eq!(many.addresses().unwrap().len(), 1);
    }

    #[test]
    fn call_request_accepts_input_alias() {
        let req: CallRequest = serde_json::from_value(json!({
            "to": "0x7926223070547d2d15b2ef5e7383e541c338ffe9",
            "input": "0x00aabb"
        }))
        .unwrap();
        assert_eq!(req.data.as_deref(), Some("0x00aabb"));
    }

    #[test]
    fn params_arity_is_enforced() {
        assert!(string_param(&json!(["0xabc"]), 0).is_ok());
        assert!(string_param(&json!([]), 0).is_err());
        assert!(string_param(&json!({"a": 1}), 0).is_err());
    }
}
