use rand::Rng;
use std::time::Duration;

/// Random election timeout in `[min_ms, max_ms]`.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let max_ms = max_ms.max(min_ms);
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}
