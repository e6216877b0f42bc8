//! Dev-only methods, enabled by `--dev`
//!
//! Regtest block generation, raw UTXO inspection and the address
//! conversion helpers. None of these are part of the Ethereum surface;
//! they exist for contract test harnesses running against regtest.

use crate::codec;
use crate::eth;
use crate::qtum::{QtumClient, FLAG_GENERATE_ADDRESS_TO, FLAG_MATURE_BLOCK_HEIGHT_OVERRIDE};
use crate::qtum_rpc::coin_amount_to_satoshi;
use crate::registry::{EthHandler, RequestContext};
use crate::rpc::JsonRpcError;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

/// Coinbase outputs younger than this many blocks are not spendable.
const DEFAULT_MATURITY: u64 = 500;

/// Accept an address as hex (converted for the chain) or Base58 as-is.
fn flexible_address(qtum: &QtumClient, input: &str) -> Result<String, JsonRpcError> {
    if input.starts_with("0x") || input.len() == 40 {
        let normalized = eth::normalize_address(&format!(
            "0x{}",
            input.trim_start_matches("0x")
        ))?;
        codec::encode_address_to_qtum(&normalized, qtum.chain().version_byte())
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
    } else {
        Ok(input.to_string())
    }
}

/// `dev_generatetoaddress`
pub struct GenerateToAddressHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GenerateToAddressHandler {
    fn method(&self) -> &'static str {
        "dev_generatetoaddress"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let args = eth::expect_params(params, 1)?;
        let blocks = match &args[0] {
            JsonValue::Number(n) => n
                .as_u64()
                .ok_or_else(|| JsonRpcError::invalid_params("block count must be unsigned"))?,
            JsonValue::String(s) => codec::decode_hex_u64(s)
                .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?,
            _ => return Err(JsonRpcError::invalid_params("block count must be a number")),
        };

        let address = match args.get(1).and_then(JsonValue::as_str) {
            Some(address) => address.to_string(),
            None => self
                .qtum
                .get_flag_string(FLAG_GENERATE_ADDRESS_TO)
                .ok_or_else(|| {
                    JsonRpcError::invalid_params(
                        "no address given and REGTEST_GENERATE_ADDRESS_TO unset",
                    )
                })?,
        };
        let address = flexible_address(&self.qtum, &address)?;

        let hashes = self
            .qtum
            .generate_to_address(blocks, &address, ctx.deadline)
            .await?;
        Ok(JsonValue::Array(
            hashes
                .iter()
                .map(|h| JsonValue::String(format!("0x{h}")))
                .collect(),
        ))
    }
}

/// `qtum_getUTXOs`
pub struct GetUtxosHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GetUtxosHandler {
    fn method(&self) -> &'static str {
        "qtum_getUTXOs"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let address = flexible_address(&self.qtum, &eth::string_param(params, 0)?)?;

        // Exclude immature coinbase outputs; regtest harnesses override
        // the maturity window through the flag.
        let maturity = self
            .qtum
            .get_flag_u64(FLAG_MATURE_BLOCK_HEIGHT_OVERRIDE)
            .unwrap_or(DEFAULT_MATURITY);
        let head = self.qtum.get_block_count(ctx.deadline).await?;

        let unspent = self
            .qtum
            .list_unspent(1, 9_999_999, &[address], ctx.deadline)
            .await?;

        let utxos: Vec<JsonValue> = unspent
            .iter()
            .filter(|u| u.spendable || u.confirmations >= maturity.min(head))
            .map(|u| {
                json!({
                    "address": u.address,
                    "txid": format!("0x{}", u.txid),
                    "vout": u.vout,
                    "amount": u.amount,
                    "satoshis": coin_amount_to_satoshi(u.amount),
                    "confirmations": u.confirmations,
                })
            })
            .collect();

        Ok(JsonValue::Array(utxos))
    }
}

/// `dev_gethexaddress`
pub struct GetHexAddressHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for GetHexAddressHandler {
    fn method(&self) -> &'static str {
        "dev_gethexaddress"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let base58 = eth::string_param(params, 0)?;
        let hex = self.qtum.get_hex_address(&base58, ctx.deadline).await?;
        Ok(JsonValue::String(format!("0x{hex}")))
    }
}

/// `dev_fromhexaddress`
pub struct FromHexAddressHandler {
    pub qtum: Arc<QtumClient>,
}

#[async_trait]
impl EthHandler for FromHexAddressHandler {
    fn method(&self) -> &'static str {
        "dev_fromhexaddress"
    }

    async fn handle(
        &self,
        params: &JsonValue,
        ctx: &RequestContext,
    ) -> Result<JsonValue, JsonRpcError> {
        let hex = eth::string_param(params, 0)?;
        let base58 = self
            .qtum
            .from_hex_address(hex.trim_start_matches("0x"), ctx.deadline)
            .await?;
        Ok(JsonValue::String(base58))
    }
}
