//! Transaction types: the wire shape returned by the node and the decoded
//! form handed to user code.
//!
//! Decoding adds a parsed unix-millisecond timestamp and the CommonMeta map,
//! and classifies the node's free-form `type` tag into a closed set of known
//! kinds plus an open `Unknown` variant carrying the raw tag, so new node
//! versions do not break the pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::ApiError;
use crate::meta::parse_meta;

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

/// A transaction exactly as returned by the node's JSON surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTransaction {
    pub id: i64,
    #[serde(default)]
    pub from: Option<String>,
    pub to: String,
    pub value: i64,
    /// ISO-8601 UTC timestamp string.
    pub time: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
}

// ---------------------------------------------------------------------------
// Decoded form
// ---------------------------------------------------------------------------

/// Classified transaction kind.
///
/// The enum is open on purpose: a tag this build does not know about decodes
/// to [`TransactionKind::Unknown`] with the raw tag preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tag", rename_all = "snake_case")]
pub enum TransactionKind {
    Transfer,
    Mined,
    NamePurchase,
    NameTransfer,
    NameARecord,
    Unknown(String),
}

impl TransactionKind {
    fn classify(raw: &str) -> Self {
        match raw {
            "transfer" => Self::Transfer,
            "mined" => Self::Mined,
            "name_purchase" => Self::NamePurchase,
            "name_transfer" => Self::NameTransfer,
            "name_a_record" => Self::NameARecord,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_mined(&self) -> bool {
        matches!(self, Self::Mined)
    }
}

/// A decoded transaction as observed by the stream and delivered to hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    /// Absent for mining rewards.
    pub from: Option<String>,
    pub to: String,
    pub value: i64,
    /// Raw ISO-8601 string as received.
    pub time: String,
    /// `time` parsed to unix milliseconds UTC.
    pub timestamp: i64,
    pub kind: TransactionKind,
    pub name: Option<String>,
    /// Raw metadata string as received.
    pub metadata: Option<String>,
    /// CommonMeta key/value map parsed from `metadata`.
    pub meta: BTreeMap<String, String>,
}

impl Transaction {
    /// Decode a wire transaction, parsing its timestamp and metadata.
    pub fn decode(raw: ApiTransaction) -> Result<Self, ApiError> {
        let timestamp = parse_time(&raw.time)?;
        let meta = raw
            .metadata
            .as_deref()
            .map(parse_meta)
            .unwrap_or_default();
        Ok(Self {
            id: raw.id,
            from: raw.from,
            to: raw.to,
            value: raw.value,
            timestamp,
            kind: TransactionKind::classify(&raw.kind),
            time: raw.time,
            name: raw.name,
            metadata: raw.metadata,
            meta,
        })
    }
}

/// Parse an ISO-8601 UTC timestamp to unix milliseconds.
///
/// The node emits RFC 3339 with a `Z` suffix; older records may lack the
/// fractional part, so a plain `%Y-%m-%dT%H:%M:%S` fallback is kept.
pub fn parse_time(raw: &str) -> Result<i64, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| ApiError::Decode(format!("bad timestamp {raw:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Outgoing payload
// ---------------------------------------------------------------------------

/// The pending outgoing payload carried by an outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub to: String,
    pub amount: i64,
    /// Wallet private key authorizing the send. Never logged.
    pub private_key: String,
    /// CommonMeta key/values to attach. The dedup `ref` tag is appended at
    /// send time, not stored here.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Opaque user data carried alongside the entry; not sent to the node.
    #[serde(default)]
    pub user_data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(id: i64, kind: &str, metadata: Option<&str>) -> ApiTransaction {
        ApiTransaction {
            id,
            from: Some("kfrom00000".into()),
            to: "kto0000000".into(),
            value: 12,
            time: "2021-03-04T05:06:07.000Z".into(),
            kind: kind.into(),
            name: None,
            metadata: metadata.map(String::from),
        }
    }

    #[test]
    fn decode_known_and_unknown_kinds() {
        assert_eq!(
            Transaction::decode(wire(1, "transfer", None)).unwrap().kind,
            TransactionKind::Transfer,
        );
        assert_eq!(
            Transaction::decode(wire(2, "staking_v9", None)).unwrap().kind,
            TransactionKind::Unknown("staking_v9".into()),
        );
    }

    #[test]
    fn decode_parses_meta() {
        let tx = Transaction::decode(wire(3, "transfer", Some("return=kabc;x=1"))).unwrap();
        assert_eq!(tx.meta.get("return").map(String::as_str), Some("kabc"));
        assert_eq!(tx.meta.get("x").map(String::as_str), Some("1"));
    }

    #[test]
    fn parse_time_is_monotone() {
        let samples = [
            "2000-01-01T00:00:00.000Z",
            "2016-02-07T14:18:07.000Z",
            "2199-12-31T23:59:59.000Z",
            "2399-01-01T00:00:00.000Z",
        ];
        let parsed: Vec<i64> = samples.iter().map(|s| parse_time(s).unwrap()).collect();
        assert!(parsed.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn parse_time_fallback_without_fraction() {
        assert!(parse_time("2021-03-04T05:06:07").is_ok());
        assert!(parse_time("not a time").is_err());
    }
}
