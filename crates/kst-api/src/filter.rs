//! Observation filter: which of the node's transactions this stream cares
//! about, both as a value-level predicate and as the lookup-endpoint
//! projection (path segment + query flags).

use serde::{Deserialize, Serialize};

use crate::types::Transaction;

/// The filter a stream observes the node through.
///
/// `address: None` observes every address; `include_mined: false` drops
/// mining rewards. The same record is persisted inside the stored state so
/// a reopened stream keeps observing the same set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Only transactions touching this address are observed.
    pub address: Option<String>,
    /// Whether mining-reward transactions are observed.
    pub include_mined: bool,
}

impl TransactionFilter {
    /// The unfiltered superset: every transaction the node has.
    pub fn superset() -> Self {
        Self {
            address: None,
            include_mined: true,
        }
    }

    /// Value-level predicate mirroring the lookup projection.
    pub fn matches(&self, tx: &Transaction) -> bool {
        if !self.include_mined && tx.kind.is_mined() {
            return false;
        }
        match &self.address {
            None => true,
            Some(addr) => {
                tx.to == *addr || tx.from.as_deref() == Some(addr.as_str())
            }
        }
    }

    /// Path segment for `GET /lookup/transactions/{addr?}`.
    pub fn lookup_path_segment(&self) -> &str {
        self.address.as_deref().unwrap_or("")
    }

    /// Query flags for the lookup endpoint, excluding paging parameters.
    pub fn lookup_query(&self) -> Vec<(&'static str, String)> {
        let mut q = Vec::new();
        if self.include_mined {
            q.push(("includeMined", "true".to_string()));
        }
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApiTransaction, TransactionKind};

    fn tx(from: Option<&str>, to: &str, kind: &str) -> Transaction {
        Transaction::decode(ApiTransaction {
            id: 1,
            from: from.map(String::from),
            to: to.into(),
            value: 1,
            time: "2021-01-01T00:00:00.000Z".into(),
            kind: kind.into(),
            name: None,
            metadata: None,
        })
        .unwrap()
    }

    #[test]
    fn address_predicate_matches_either_side() {
        let f = TransactionFilter {
            address: Some("kme0000000".into()),
            include_mined: true,
        };
        assert!(f.matches(&tx(Some("kme0000000"), "kother0000", "transfer")));
        assert!(f.matches(&tx(Some("kother0000"), "kme0000000", "transfer")));
        assert!(!f.matches(&tx(Some("ka00000000"), "kb00000000", "transfer")));
    }

    #[test]
    fn mined_flag() {
        let drop_mined = TransactionFilter {
            address: None,
            include_mined: false,
        };
        let mined = tx(None, "kminer0000", "mined");
        assert_eq!(mined.kind, TransactionKind::Mined);
        assert!(!drop_mined.matches(&mined));
        assert!(TransactionFilter::superset().matches(&mined));
    }
}
