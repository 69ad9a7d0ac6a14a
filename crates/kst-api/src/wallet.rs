//! Wallet helpers: v2 address derivation and refund construction.
//!
//! Address derivation follows the node's v2 scheme: a double-SHA-256 hex
//! chain seeds nine "protein" bytes, which are then folded into base-36
//! digits selected by successive hash bytes until the address reaches ten
//! characters (prefix included).

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::meta::RETURN_KEY;
use crate::types::{SendRequest, Transaction};

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn double_sha256_hex(input: &str) -> String {
    sha256_hex(&sha256_hex(input))
}

/// Map a byte to the v2 scheme's base-36 alphabet.
fn hex_to_base36(byte: u8) -> char {
    let mut i = 6u16;
    while i <= 251 {
        if u16::from(byte) <= i {
            if i <= 69 {
                return (b'0' + ((i - 6) / 7) as u8) as char;
            }
            return (b'a' + ((i - 76) / 7) as u8) as char;
        }
        i += 7;
    }
    'e'
}

/// Derive the v2 address of a private key.
pub fn make_v2_address(private_key: &str, prefix: char) -> String {
    let mut protein: [Option<u8>; 9] = [None; 9];
    let mut stick = double_sha256_hex(private_key);

    for slot in protein.iter_mut() {
        *slot = u8::from_str_radix(&stick[..2], 16).ok();
        stick = double_sha256_hex(&stick);
    }

    let mut address = String::new();
    address.push(prefix);
    let mut link_index = 0usize;
    while address.len() < 10 {
        let link = usize::from(
            u8::from_str_radix(&stick[2 * link_index..2 * link_index + 2], 16)
                .unwrap_or(0),
        ) % 9;
        match protein[link].take() {
            Some(byte) => {
                address.push(hex_to_base36(byte));
                link_index += 1;
            }
            None => stick = sha256_hex(&stick),
        }
    }
    address
}

/// Build the outgoing request that refunds an incoming transfer.
///
/// The refund goes to the transfer's `return` meta address when present,
/// otherwise back to the sender. Returns `None` when there is nowhere to
/// send it: no sender (mining rewards) or a target equal to `own_address`
/// (which would bounce the refund straight back into the stream).
pub fn make_refund_for(
    private_key: &str,
    own_address: &str,
    transfer: &Transaction,
    meta: BTreeMap<String, String>,
    user_data: Value,
) -> Option<SendRequest> {
    let target = transfer
        .meta
        .get(RETURN_KEY)
        .cloned()
        .or_else(|| transfer.from.clone())?;
    if target == own_address {
        return None;
    }
    Some(SendRequest {
        to: target,
        amount: transfer.value,
        private_key: private_key.to_string(),
        meta,
        user_data,
    })
}
