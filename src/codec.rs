//! Encoding primitives shared by every handler
//!
//! Pure, stateless conversions between the two wire vocabularies:
//! Ethereum hex quantities/byte strings and Qtum Base58Check addresses
//! and satoshi amounts. Nothing in here touches the network.

use num_bigint::BigUint;
use num_traits::{Num, Zero};
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Satoshi-to-wei scale: 1 QTUM = 1e8 satoshi, 1 coin = 1e18 wei.
const WEI_PER_SATOSHI: u64 = 10_000_000_000;

/// Codec failure. Maps to JSON-RPC `-32602` at the handler boundary
/// (malformed caller input) or `-32603` for arithmetic that cannot happen.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input was not a well-formed hex quantity or byte string
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// Input was not a valid address in the expected encoding
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Base58Check payload failed its checksum or version check
    #[error("base58check: {0}")]
    Base58Check(String),
}

/// Encode a nonnegative integer as an Ethereum hex quantity.
///
/// No leading zeros; zero itself encodes as `0x0`.
pub fn encode_hex_quantity(value: &BigUint) -> String {
    if value.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{}", value.to_str_radix(16))
    }
}

/// Encode a `u64` as an Ethereum hex quantity.
pub fn encode_hex_u64(value: u64) -> String {
    encode_hex_quantity(&BigUint::from(value))
}

/// Decode an Ethereum hex quantity into an arbitrary-precision integer.
///
/// Accepts optional leading zeros; rejects a missing `0x` prefix, an empty
/// digit string, and non-hex characters.
pub fn decode_hex_quantity(input: &str) -> Result<BigUint, CodecError> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .ok_or_else(|| CodecError::InvalidHex(format!("missing 0x prefix: {input}")))?;

    if digits.is_empty() {
        return Err(CodecError::InvalidHex("empty quantity".to_string()));
    }

    BigUint::from_str_radix(digits, 16)
        .map_err(|_| CodecError::InvalidHex(format!("not a hex quantity: {input}")))
}

/// Decode a hex quantity that must fit in a `u64` (block numbers, indexes).
pub fn decode_hex_u64(input: &str) -> Result<u64, CodecError> {
    let value = decode_hex_quantity(input)?;
    u64::try_from(&value)
        .map_err(|_| CodecError::InvalidHex(format!("quantity out of range: {input}")))
}

/// Encode raw bytes as a fixed-width `0x…` hex string, preserving zeros.
pub fn encode_hex_bytes(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode a `0x…` hex byte string. Length must be even.
pub fn decode_hex_bytes(input: &str) -> Result<Vec<u8>, CodecError> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .ok_or_else(|| CodecError::InvalidHex(format!("missing 0x prefix: {input}")))?;

    hex::decode(digits).map_err(|_| CodecError::InvalidHex(format!("not hex bytes: {input}")))
}

/// Convert satoshi to wei. Exact: multiplies by 1e10.
pub fn satoshi_to_wei(satoshi: &BigUint) -> BigUint {
    satoshi * BigUint::from(WEI_PER_SATOSHI)
}

/// Convert wei to satoshi, truncating.
///
/// The second element reports whether precision was lost, i.e. whether
/// `wei mod 1e10 != 0`.
pub fn wei_to_satoshi(wei: &BigUint) -> (BigUint, bool) {
    let scale = BigUint::from(WEI_PER_SATOSHI);
    let satoshi = wei / &scale;
    let lossy = wei % &scale != BigUint::zero();
    (satoshi, lossy)
}

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Double SHA-256, as used by Base58Check checksums.
fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Encode a 20-byte Ethereum hex address as a Qtum Base58Check address.
///
/// `version` is the chain's pubkey-hash version byte (0x3a mainnet,
/// 0x78 testnet/regtest).
pub fn encode_address_to_qtum(hex_address: &str, version: u8) -> Result<String, CodecError> {
    let bytes = decode_hex_bytes(hex_address)
        .map_err(|_| CodecError::InvalidAddress(hex_address.to_string()))?;
    if bytes.len() != 20 {
        return Err(CodecError::InvalidAddress(format!(
            "expected 20 bytes, got {}: {hex_address}",
            bytes.len()
        )));
    }

    let mut payload = Vec::with_capacity(25);
    payload.push(version);
    payload.extend_from_slice(&bytes);
    let checksum = sha256d(&payload);
    payload.extend_from_slice(&checksum[..4]);

    Ok(bs58::encode(payload).into_string())
}

/// Decode a Qtum Base58Check address into a 20-byte Ethereum hex address.
///
/// Verifies the four-byte checksum and the expected version byte, making
/// the conversion a bijection with [`encode_address_to_qtum`] per chain.
pub fn decode_address_from_qtum(address: &str, version: u8) -> Result<String, CodecError> {
    let payload = bs58::decode(address)
        .into_vec()
        .map_err(|_| CodecError::InvalidAddress(address.to_string()))?;

    if payload.len() != 25 {
        return Err(CodecError::Base58Check(format!(
            "expected 25 bytes, got {}",
            payload.len()
        )));
    }

    let (body, checksum) = payload.split_at(21);
    let expected = sha256d(body);
    if checksum != &expected[..4] {
        return Err(CodecError::Base58Check("checksum mismatch".to_string()));
    }
    if body[0] != version {
        return Err(CodecError::Base58Check(format!(
            "version byte {:#04x}, expected {version:#04x}",
            body[0]
        )));
    }

    Ok(encode_hex_bytes(&body[1..]))
}

/// Compute the 2048-bit Ethereum logs bloom over a set of logs.
///
/// Each log contributes its address bytes and every topic; every item sets
/// three bits selected from the first six bytes of its keccak hash.
pub fn logs_bloom<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut bloom = [0u8; 256];
    for item in items {
        let hash = keccak256(item);
        for pair in 0..3 {
            let bit = ((hash[pair * 2] as usize) << 8 | hash[pair * 2 + 1] as usize) & 0x7ff;
            bloom[255 - bit / 8] |= 1 << (bit % 8);
        }
    }
    encode_hex_bytes(&bloom)
}

/// An all-zero logs bloom, for receipts without logs.
pub fn empty_bloom() -> String {
    encode_hex_bytes(&[0u8; 256])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_quantity_round_trip() {
        for n in [0u64, 1, 15, 16, 813, u64::MAX] {
            let encoded = encode_hex_u64(n);
            let decoded = decode_hex_quantity(&encoded).unwrap();
            assert_eq!(decoded, BigUint::from(n));
        }
    }

    #[test]
    fn hex_quantity_zero_is_0x0() {
        assert_eq!(encode_hex_quantity(&BigUint::zero()), "0x0");
    }

    #[test]
    fn hex_quantity_has_no_leading_zeros() {
        assert_eq!(encode_hex_u64(813), "0x32d");
        assert_eq!(encode_hex_u64(1), "0x1");
    }

    #[test]
    fn hex_quantity_accepts_leading_zeros_on_decode() {
        assert_eq!(decode_hex_quantity("0x032d").unwrap(), BigUint::from(813u32));
        assert_eq!(decode_hex_quantity("0x00").unwrap(), BigUint::zero());
    }

    #[test]
    fn hex_quantity_rejects_garbage() {
        assert!(decode_hex_quantity("32d").is_err());
        assert!(decode_hex_quantity("0x").is_err());
        assert!(decode_hex_quantity("0xzz").is_err());
    }

    #[test]
    fn hex_bytes_preserve_width() {
        let topic = [0u8; 32];
        let encoded = encode_hex_bytes(&topic);
        assert_eq!(encoded.len(), 2 + 64);
        assert_eq!(decode_hex_bytes(&encoded).unwrap(), topic);
    }

    #[test]
    fn satoshi_wei_scale() {
        let sat = BigUint::from(7u32);
        assert_eq!(satoshi_to_wei(&sat), BigUint::from(70_000_000_000u64));

        let (back, lossy) = wei_to_satoshi(&BigUint::from(70_000_000_000u64));
        assert_eq!(back, sat);
        assert!(!lossy);

        let (truncated, lossy) = wei_to_satoshi(&BigUint::from(70_000_000_001u64));
        assert_eq!(truncated, sat);
        assert!(lossy);
    }

    #[test]
    fn testnet_address_round_trip() {
        // Known pair on the test chain (version byte 0x78).
        let base58 = "qUbxboqjBRp96j3La8D1RYkyqx5uQbJPoW";
        let hex = decode_address_from_qtum(base58, 0x78).unwrap();
        assert_eq!(hex, "0x7926223070547d2d15b2ef5e7383e541c338ffe9");
        assert_eq!(encode_address_to_qtum(&hex, 0x78).unwrap(), base58);
    }

    #[test]
    fn address_rejects_wrong_version() {
        let base58 = "qUbxboqjBRp96j3La8D1RYkyqx5uQbJPoW";
        assert!(decode_address_from_qtum(base58, 0x3a).is_err());
    }

    #[test]
    fn address_rejects_bad_checksum() {
        assert!(decode_address_from_qtum("qUbxboqjBRp96j3La8D1RYkyqx5uQbJPoX", 0x78).is_err());
    }

    #[test]
    fn bloom_sets_three_bits_per_item() {
        let address = hex::decode("7926223070547d2d15b2ef5e7383e541c338ffe9").unwrap();
        let bloom = logs_bloom([address.as_slice()]);
        let bytes = decode_hex_bytes(&bloom).unwrap();
        let set: u32 = bytes.iter().map(|b| b.count_ones()).sum();
        assert!(set >= 1 && set <= 3);
        assert_eq!(bytes.len(), 256);
    }

    #[test]
    fn empty_bloom_is_zero() {
        let bytes = decode_hex_bytes(&empty_bloom()).unwrap();
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
