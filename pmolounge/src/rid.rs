//! Request identifiers and anti-cache nonces
//!
//! Every bind request carries a `RID` (per-session counter) and a `zx`
//! nonce. RIDs only need to be unique inside one session because they are
//! always scoped to that session's bind URL.

use rand::distr::Alphanumeric;
use rand::Rng;
use std::ops::Range;

/// Range the first request id is drawn from
pub const RID_SEED_RANGE: Range<u32> = 10_000..90_000;

/// Length of the `zx` nonce
pub const NONCE_LENGTH: usize = 12;

/// Per-session request id counter
#[derive(Debug, Clone)]
pub struct RequestIds {
    current: u32,
}

impl RequestIds {
    /// Create a counter seeded randomly in [`RID_SEED_RANGE`]
    pub fn new() -> Self {
        Self {
            current: rand::rng().random_range(RID_SEED_RANGE),
        }
    }

    #[cfg(test)]
    pub(crate) fn starting_at(seed: u32) -> Self {
        Self { current: seed }
    }

    /// Reseed the counter for a fresh session
    pub fn restart(&mut self) {
        self.current = rand::rng().random_range(RID_SEED_RANGE);
    }

    /// Return the next request id
    pub fn next_request_id(&mut self) -> u32 {
        self.current = self.current.wrapping_add(1);
        self.current
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Fresh random lowercase alphanumeric string of [`NONCE_LENGTH`] characters
pub fn nonce() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LENGTH)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_increment() {
        let mut ids = RequestIds::starting_at(41);
        assert_eq!(ids.next_request_id(), 42);
        assert_eq!(ids.next_request_id(), 43);
        assert_eq!(ids.next_request_id(), 44);
    }

    #[test]
    fn test_seed_in_range() {
        for _ in 0..100 {
            let mut ids = RequestIds::new();
            let first = ids.next_request_id();
            assert!(first > RID_SEED_RANGE.start && first <= RID_SEED_RANGE.end);
        }
    }

    #[test]
    fn test_restart_reseeds() {
        let mut ids = RequestIds::starting_at(5);
        ids.restart();
        assert!(ids.next_request_id() > RID_SEED_RANGE.start);
    }

    #[test]
    fn test_nonce_shape() {
        let zx = nonce();
        assert_eq!(zx.len(), NONCE_LENGTH);
        assert!(zx
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_nonces_differ() {
        assert_ne!(nonce(), nonce());
    }
}
