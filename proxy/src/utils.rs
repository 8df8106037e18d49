use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Current timestamp in milliseconds, as carried in RakNet pings
pub fn get_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as i64
}

// Derive an independent generator for a spawned task
pub fn fork_rng<R: Rng>(rng: &mut R) -> StdRng {
    StdRng::seed_from_u64(rng.gen())
}
