//! Signing accounts
//!
//! Loads WIF private keys from the `--accounts` file and derives the
//! Ethereum-style hex addresses the gateway advertises through
//! `eth_accounts`. Used by `eth_sign` and `eth_signTransaction`; when no
//! accounts are configured those methods report "method not supported".

use crate::codec;
use crate::qtum::Chain;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::RecoverableSignature, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Prefix mixed into signed messages, Qtum's variant of the Bitcoin
/// message magic.
const MESSAGE_MAGIC: &str = "Qtum Signed Message:\n";

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("failed to read accounts file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {0}: invalid WIF key: {1}")]
    InvalidWif(usize, String),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// One loaded account: the key plus its derived identities.
pub struct Account {
    secret: SecretKey,
    compressed: bool,
    /// The raw WIF line, re-used for upstream `signrawtransactionwithkey`
    pub wif: String,
    /// `0x…40` address, i.e. hex of the pubkey hash160
    pub hex_address: String,
    /// Base58Check form on the configured chain
    pub qtum_address: String,
}

impl Account {
    fn from_wif(wif: &str, chain: Chain) -> Result<Self, String> {
        let payload = bs58::decode(wif)
            .into_vec()
            .map_err(|e| e.to_string())?;

        // version + 32-byte key (+ optional compression marker) + checksum
        if payload.len() != 37 && payload.len() != 38 {
            return Err(format!("unexpected WIF length {}", payload.len()));
        }

        let (body, checksum) = payload.split_at(payload.len() - 4);
        let digest = Sha256::digest(Sha256::digest(body));
        if checksum != &digest[..4] {
            return Err("checksum mismatch".to_string());
        }

        let compressed = body.len() == 34;
        if compressed && body[33] != 0x01 {
            return Err("bad compression marker".to_string());
        }

        let secret = SecretKey::from_slice(&body[1..33]).map_err(|e| e.to_string())?;

        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        let encoded = if compressed {
            pubkey.serialize().to_vec()
        } else {
            pubkey.serialize_uncompressed().to_vec()
        };

        let hash160 = hash160(&encoded);
        let hex_address = codec::encode_hex_bytes(&hash160);
        let qtum_address = codec::encode_address_to_qtum(&hex_address, chain.version_byte())
            .map_err(|e| e.to_string())?;

        Ok(Self {
            secret,
            compressed,
            wif: wif.to_string(),
            hex_address,
            qtum_address,
        })
    }

    /// Sign arbitrary bytes under the Qtum message magic.
    ///
    /// Returns the 65-byte compact signature (header byte then r‖s) that
    /// Qtum's `verifymessage` accepts.
    pub fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, AccountError> {
        let digest = message_digest(message);
        let msg =
            Message::from_digest_slice(&digest).map_err(|e| AccountError::Signing(e.to_string()))?;

        let secp = Secp256k1::new();
        let signature: RecoverableSignature = secp.sign_ecdsa_recoverable(&msg, &self.secret);
        let (recovery_id, body) = signature.serialize_compact();

        let mut out = Vec::with_capacity(65);
        let header = 27 + recovery_id.to_i32() as u8 + if self.compressed { 4 } else { 0 };
        out.push(header);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// The configured account set. Empty when `--accounts` was not given.
#[derive(Default)]
pub struct Accounts {
    accounts: Vec<Account>,
}

impl Accounts {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load one WIF key per line; blank lines and `#` comments skipped.
    pub fn load(path: &Path, chain: Chain) -> Result<Self, AccountError> {
        let contents = std::fs::read_to_string(path)?;
        let mut accounts = Vec::new();

        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let account = Account::from_wif(line, chain)
                .map_err(|e| AccountError::InvalidWif(number + 1, e))?;
            accounts.push(account);
        }

        info!(count = accounts.len(), "loaded signing accounts");
        Ok(Self { accounts })
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Hex addresses in file order, for `eth_accounts`.
    pub fn hex_addresses(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.hex_address.clone()).collect()
    }

    /// Find the account owning a `0x…` address, case-insensitively.
    pub fn find(&self, hex_address: &str) -> Option<&Account> {
        let wanted = hex_address.to_lowercase();
        self.accounts.iter().find(|a| a.hex_address == wanted)
    }

    /// First configured account, used as the default sender.
    pub fn first(&self) -> Option<&Account> {
        self.accounts.first()
    }
}

/// RIPEMD160(SHA256(data)), the pubkey-hash both chains share.
fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// Double-SHA256 over the magic-prefixed, varint-framed message.
fn message_digest(message: &[u8]) -> [u8; 32] {
    let mut framed = Vec::with_capacity(MESSAGE_MAGIC.len() + message.len() + 10);
    write_varint(&mut framed, MESSAGE_MAGIC.len() as u64);
    framed.extend_from_slice(MESSAGE_MAGIC.as_bytes());
    write_varint(&mut framed, message.len() as u64);
    framed.extend_from_slice(message);

    let first = Sha256::digest(&framed);
    Sha256::digest(first).into()
}

fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vector key: sha256("qtum-eth-gateway test key") as raw secret,
    // wrapped into a testnet WIF below.
    fn test_wif() -> String {
        let secret = Sha256::digest(b"qtum-eth-gateway test key");
        let mut body = vec![0xef];
        body.extend_from_slice(&secret);
        body.push(0x01);
        let checksum = Sha256::digest(Sha256::digest(&body));
        body.extend_from_slice(&checksum[..4]);
        bs58::encode(body).into_string()
    }

    #[test]
    fn wif_round_trip_derives_stable_addresses() {
        let account = Account::from_wif(&test_wif(), Chain::Test).unwrap();
        assert!(account.compressed);
        assert_eq!(account.hex_address.len(), 42);
        assert!(account.hex_address.starts_with("0x"));
        assert!(account.qtum_address.starts_with('q'));

        // hex and base58 forms must be the same hash160
        let decoded =
            codec::decode_address_from_qtum(&account.qtum_address, Chain::Test.version_byte())
                .unwrap();
        assert_eq!(decoded, account.hex_address);
    }

    #[test]
    fn wif_rejects_corruption() {
        let mut wif = test_wif();
        wif.pop();
        wif.push('1');
        assert!(Account::from_wif(&wif, Chain::Test).is_err());
        assert!(Account::from_wif("notakey", Chain::Test).is_err());
    }

    #[test]
    fn signature_is_65_bytes_with_recoverable_header() {
        let account = Account::from_wif(&test_wif(), Chain::Test).unwrap();
        let signature = account.sign_message(b"hello qtum").unwrap();
        assert_eq!(signature.len(), 65);
        // compressed key headers land in 31..=34
        assert!((31..=34).contains(&signature[0]));
    }

    #[test]
    fn find_is_case_insensitive() {
        let account = Account::from_wif(&test_wif(), Chain::Test).unwrap();
        let upper = account.hex_address.to_uppercase().replace("0X", "0x");
        let accounts = Accounts {
            accounts: vec![account],
        };
        assert!(accounts.find(&upper).is_some());
        assert!(accounts.find("0x0000000000000000000000000000000000000000").is_none());
    }

    #[test]
    fn varint_framing() {
        let mut out = Vec::new();
        write_varint(&mut out, 21);
        assert_eq!(out, vec![21]);

        let mut out = Vec::new();
        write_varint(&mut out, 0x1234);
        assert_eq!(out, vec![0xfd, 0x34, 0x12]);
    }
}
