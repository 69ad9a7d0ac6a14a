//! Tracking/dedup id generation.
//!
//! Ids are drawn from a v5 chain: each draw hashes the previous chain value,
//! and [`RefSource::reseed`] folds external entropy (the websocket URL on
//! every reconnect) into the chain. The generator is injected wherever ids
//! are assigned; there is no process-wide state.

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RefSource {
    chain: Uuid,
}

impl RefSource {
    pub fn new() -> Self {
        Self {
            chain: Uuid::new_v4(),
        }
    }

    /// Start from a fixed seed. Draws are then fully deterministic, which
    /// tests rely on.
    pub fn seeded(seed: Uuid) -> Self {
        Self { chain: seed }
    }

    /// Fold entropy into the chain.
    pub fn reseed(&mut self, entropy: &str) {
        self.chain = Uuid::new_v5(&self.chain, entropy.as_bytes());
    }

    /// Draw the next id, advancing the chain.
    pub fn next_id(&mut self) -> Uuid {
        self.chain = Uuid::new_v5(&self.chain, b"kstream.next");
        self.chain
    }
}

impl Default for RefSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_are_distinct() {
        let mut source = RefSource::new();
        let a = source.next_id();
        let b = source.next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn seeded_chains_are_reproducible() {
        let seed = Uuid::new_v4();
        let mut x = RefSource::seeded(seed);
        let mut y = RefSource::seeded(seed);
        assert_eq!(x.next_id(), y.next_id());
        y.reseed("wss://node.test/ws/abc");
        assert_ne!(x.next_id(), y.next_id());
    }
}
