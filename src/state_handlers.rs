//! Account state handlers
//!
//! `eth_getBalance`, `eth_getCode`, `eth_getStorageAt`,
//! `eth_getTransactionCount` and `eth_gasPrice`. Contract state comes from
//! the EVM side of the node; plain balances from the address index.

use crate::codec;
use crate::eth::{self, ZERO_HASH};
use crate::qtum::{QtumClient, QtumError};
use crate::qtum_rpc::{coin_amount_to_satoshi, DEFAULT_GAS_PRICE_SAT};
use crate::registry::{EthHandler, RequestContext};
use crate::rpc::JsonRpcError;
use async_trait::async_trait;
use num_bigint::BigUint;
use serde_json::Value as JsonValue;
use std::sync::Arc;

fn satoshi_to_wei_hex(satoshi: u64) -> String {
    codec::encode_hex_quantity(&codec::satoshi_to_wei(&BigUint::from(satoshi)))
}

fn to_base58(qtum: &QtumClient, hex_address: &str) -> Result<String, JsonRpcError> {
    codec::encode_address_to_qtum(hex_address, qtum.chain().version_byte())
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

/// `eth_getBalance`
pub struct GetBalanceHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GetBalanceHandler {
    fn method(&self) -> &'static str {
        "eth_getBalance"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let address = eth::normalize_address(&eth::string_param(params, 0)?)?;
        let bare = address.trim_start_matches("0x");

        // Contract accounts answer through the EVM state.
        if let Ok(info) = self.qtum.get_account_info(bare, ctx.deadline).await {
            return Ok(JsonValue::String(satoshi_to_wei_hex(info.balance)));
        }

        let base58 = to_base58(&self.qtum, &address)?;
        match self
            .qtum
            .get_address_balance(&[base58.clone()], ctx.deadline)
            .await
        {
            Ok(balance) => Ok(JsonValue::String(satoshi_to_wei_hex(balance.balance))),
            // Nodes without -addressindex: sum spendable outputs instead.
            Err(QtumError::Rpc { .. }) => {
                let unspent = self
                    .qtum
                    .list_unspent(0, 9_999_999, &[base58], ctx.deadline)
                    .await?;
                let satoshi: u64 = unspent
                    .iter()
                    .map(|u| coin_amount_to_satoshi(u.amount))
                    .sum();
                Ok(JsonValue::String(satoshi_to_wei_hex(satoshi)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// `eth_getCode`
pub struct GetCodeHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GetCodeHandler {
    fn method(&self) -> &'static str {
        "eth_getCode"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let address = eth::normalize_address(&eth::string_param(params, 0)?)?;
        let bare = address.trim_start_matches("0x");

        // Non-contract addresses have no account info; that is simply
        // "no code" to an Ethereum caller.
        match self.qtum.get_account_info(bare, ctx.deadline).await {
            Ok(info) => Ok(JsonValue::String(format!("0x{}", info.code))),
            Err(_) => Ok(JsonValue::String("0x".to_string())),
        }
    }
}

/// `eth_getStorageAt`
pub struct GetStorageAtHandler {
    pub qtum: Arc<QtumClient>,
}

impl GetStorageAtHandler {
    /// Find `position` in the `getstorage` result: a map of slot hashes to
    /// `{position: value}` objects.
    fn lookup(storage: &JsonValue, position64: &str) -> String {
        if let Some(slots) = storage.as_object() {
            for slot in slots.values() {
                if let Some(entries) = slot.as_object() {
                    for (key, value) in entries {
                        if key.trim_start_matches("0x") == position64 {
                            if let Some(text) = value.as_str() {
                                return format!("0x{:0>64}", text.trim_start_matches("0x"));
                            }
                        }
                    }
                }
            }
        }
        ZERO_HASH.to_string()
    }
}

#[async_trait]
impl EthHandler for GetStorageAtHandler {
    fn method(&self) -> &'static str {
        "eth_getStorageAt"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let address = eth::normalize_address(&eth::string_param(params, 0)?)?;
        let position = codec::decode_hex_quantity(&eth::string_param(params, 1)?)
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
        let position64 = format!("{:0>64}", position.to_str_radix(16));

        let bare = address.trim_start_matches("0x");
        match self.qtum.get_storage(bare, ctx.deadline).await {
            Ok(storage) => Ok(JsonValue::String(Self::lookup(&storage, &position64))),
            // Unknown contract: all storage reads are zero.
            Err(_) => Ok(JsonValue::String(ZERO_HASH.to_string())),
        }
    }
}

/// `eth_getTransactionCount`
pub struct GetTransactionCountHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GetTransactionCountHandler {
    fn method(&self) -> &'static str {
        "eth_getTransactionCount"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let address = eth::normalize_address(&eth::string_param(params, 0)?)?;
        let base58 = to_base58(&self.qtum, &address)?;

        // There is no account nonce in a UTXO chain; the transaction
        // count for the address is the closest honest answer.
        match self.qtum.get_address_tx_ids(&[base58], ctx.deadline).await {
            Ok(txids) => Ok(JsonValue::String(codec::encode_hex_u64(txids.len() as u64))),
            Err(_) => Ok(JsonValue::String("0x0".to_string())),
        }
    }
}

/// `eth_gasPrice`
pub struct GasPriceHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GasPriceHandler {
    fn method(&self) -> &'static str {
        "eth_gasPrice"
    }

    async fn handle(
        &self,
        _params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let sat_per_gas = match self.qtum.estimate_smart_fee(6, ctx.deadline).await {
            Ok(estimate) => match estimate.feerate {
                // feerate is QTUM per kilobyte; a gas unit costs at least
                // the network minimum.
                Some(feerate) => {
                    (coin_amount_to_satoshi(feerate) / 1000).max(DEFAULT_GAS_PRICE_SAT)
                }
                None => DEFAULT_GAS_PRICE_SAT,
            },
            Err(_) => DEFAULT_GAS_PRICE_SAT,
        };

        Ok(JsonValue::String(satoshi_to_wei_hex(sat_per_gas)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn storage_lookup_finds_position() {
        let storage = json!({
            "9a6d5e...slot": {
                "0000000000000000000000000000000000000000000000000000000000000001": "2a"
            }
        });
        let position64 =
            "0000000000000000000000000000000000000000000000000000000000000001";
        let found = GetStorageAtHandler::lookup(&storage, position64);
        assert_eq!(
            found,
            format!("0x{:0>64}", "2a")
        );
    }

    #[test]
    fn storage_lookup_defaults_to_zero() {
        let storage = json!({});
        let position64 =
            "0000000000000000000000000000000000000000000000000000000000000005";
        assert_eq!(GetStorageAtHandler::lookup(&storage, position64), ZERO_HASH);
    }

    #[test]
    fn default_gas_price_is_forty_satoshi_in_wei() {
        assert_eq!(satoshi_to_wei_hex(DEFAULT_GAS_PRICE_SAT), "0x5d21dba000");
    }
}
