use std::time::Duration;

pub const DEFAULT_FENCE_POLL_INTERVAL_US: u64 = 100;
pub const DEFAULT_TEXTURE_POOL_MAX_PER_KEY: usize = 8;
/// Timestamp pairs available per timer-query session before the timing unit
/// degrades to wall-clock measurement.
pub const TIMER_QUERY_PAIR_CAPACITY: u32 = 64;
pub const MAX_PARAM_BYTES: usize = 256;

/// Minimum interval between hardware fence polls. `is_passed` answers from the
/// cached watermark inside this window so callers may poll at arbitrarily high
/// frequency. Overridable via env `TEXELFLOW_FENCE_POLL_US` (u64 microseconds).
pub fn fence_poll_interval() -> Duration {
    let micros = match std::env::var("TEXELFLOW_FENCE_POLL_US") {
        Ok(val) => match val.trim().parse::<u64>() {
            Ok(parsed) => parsed,
            Err(_) => DEFAULT_FENCE_POLL_INTERVAL_US,
        },
        Err(_) => DEFAULT_FENCE_POLL_INTERVAL_US,
    };
    Duration::from_micros(micros)
}

/// Retired textures kept per (grid, format) key for reuse. Overridable via env
/// `TEXELFLOW_POOL_MAX` (usize); 0 disables pooling.
pub fn texture_pool_max_per_key() -> usize {
    match std::env::var("TEXELFLOW_POOL_MAX") {
        Ok(val) => match val.trim().parse::<usize>() {
            Ok(parsed) => parsed,
            Err(_) => DEFAULT_TEXTURE_POOL_MAX_PER_KEY,
        },
        Err(_) => DEFAULT_TEXTURE_POOL_MAX_PER_KEY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_poll_interval_parses_env() {
        std::env::set_var("TEXELFLOW_FENCE_POLL_US", "250");
        assert_eq!(fence_poll_interval(), Duration::from_micros(250));
        std::env::set_var("TEXELFLOW_FENCE_POLL_US", "not a number");
        assert_eq!(
            fence_poll_interval(),
            Duration::from_micros(DEFAULT_FENCE_POLL_INTERVAL_US)
        );
        std::env::remove_var("TEXELFLOW_FENCE_POLL_US");
    }

    #[test]
    fn pool_max_parses_env() {
        std::env::set_var("TEXELFLOW_POOL_MAX", "3");
        assert_eq!(texture_pool_max_per_key(), 3);
        std::env::remove_var("TEXELFLOW_POOL_MAX");
        assert_eq!(texture_pool_max_per_key(), DEFAULT_TEXTURE_POOL_MAX_PER_KEY);
    }
}
