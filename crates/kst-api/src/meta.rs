//! CommonMeta, the `k1=v1;k2=v2` metadata encoding carried inside
//! transaction metadata strings.
//!
//! Parsing splits on `;`, then splits each piece on the **first** `=`.
//! Pieces without a `=` and pieces with an empty key are dropped; when a key
//! repeats, the last occurrence wins. Serialization joins pairs with `;` in
//! map order.
//!
//! Round-trip holds for any map whose keys contain neither `;` nor `=` and
//! whose values contain no `;`.

use std::collections::BTreeMap;

use uuid::Uuid;

/// Meta key carrying the server-side deduplication token of outgoing sends.
pub const REF_KEY: &str = "ref";

/// Meta key naming the address a refund should be returned to.
pub const RETURN_KEY: &str = "return";

/// Parse a CommonMeta string into a key/value map.
pub fn parse_meta(raw: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for piece in raw.split(';') {
        let Some((key, value)) = piece.split_once('=') else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        // Last occurrence of a key wins.
        out.insert(key.to_string(), value.to_string());
    }
    out
}

/// Serialize a map back to a CommonMeta string.
pub fn serialize_meta(meta: &BTreeMap<String, String>) -> String {
    let mut pairs: Vec<String> = Vec::with_capacity(meta.len());
    for (key, value) in meta {
        pairs.push(format!("{key}={value}"));
    }
    pairs.join(";")
}

/// Serialize a map and append the outgoing `ref=<uuid>` dedup tag.
///
/// The `ref` tag always comes last so the resolver's extended-search query
/// matches it regardless of what the caller put in the map.
pub fn serialize_meta_with_ref(meta: &BTreeMap<String, String>, dedup_ref: Uuid) -> String {
    let body = serialize_meta(meta);
    if body.is_empty() {
        format!("{REF_KEY}={dedup_ref}")
    } else {
        format!("{body};{REF_KEY}={dedup_ref}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_basic() {
        assert_eq!(
            parse_meta("a=1;b=2"),
            map(&[("a", "1"), ("b", "2")]),
        );
    }

    #[test]
    fn parse_drops_non_kv_pieces() {
        assert_eq!(parse_meta("a=1;junk;=orphan;b=2"), map(&[("a", "1"), ("b", "2")]));
        assert_eq!(parse_meta(""), map(&[]));
        assert_eq!(parse_meta(";;;"), map(&[]));
    }

    #[test]
    fn parse_last_key_wins() {
        assert_eq!(parse_meta("a=1;a=2;a=3"), map(&[("a", "3")]));
    }

    #[test]
    fn parse_splits_on_first_equals() {
        assert_eq!(parse_meta("a=b=c"), map(&[("a", "b=c")]));
    }

    #[test]
    fn round_trip() {
        let m = map(&[("donate", "no"), ("message", "hello there"), ("return", "kabcdefghi")]);
        assert_eq!(parse_meta(&serialize_meta(&m)), m);
    }

    #[test]
    fn ref_tag_appended_last() {
        let id = Uuid::nil();
        assert_eq!(
            serialize_meta_with_ref(&map(&[("a", "1")]), id),
            format!("a=1;ref={id}"),
        );
        assert_eq!(serialize_meta_with_ref(&map(&[]), id), format!("ref={id}"));
    }
}
