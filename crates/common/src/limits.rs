use serde::Serialize;

pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 30;
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize)]
pub struct PreviewLimits {
    pub probe_interval_ms: u64,
    pub probe_attempts: u32,
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitSources {
    pub probe_interval_ms: &'static str, // "param" | "env" | "default"
    pub probe_attempts: &'static str,
    pub stop_timeout_ms: &'static str,
}

fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

fn clamp(v: u64, min: u64, max: u64) -> u64 {
    if v < min {
        return min;
    }
    if v > max {
        return max;
    }
    v
}

fn resolve_one(
    param: Option<u64>,
    env_name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> (u64, &'static str) {
    if let Some(p) = param {
        (clamp(p, min, max), "param")
    } else if let Some(envv) = parse_env_u64(env_name) {
        (clamp(envv, min, max), "env")
    } else {
        (default, "default")
    }
}

/// Resolve dev-server preview timings.
/// - probe_interval_ms: param → env(ATELIER_PROBE_INTERVAL_MS) → default(2000), clamped [100..10000]
/// - probe_attempts: param → env(ATELIER_PROBE_ATTEMPTS) → default(30), clamped [1..300]
/// - stop_timeout_ms: param → env(ATELIER_STOP_TIMEOUT_MS) → default(5000), clamped [100..60000]
pub fn resolve_preview_limits(
    param_interval_ms: Option<u64>,
    param_attempts: Option<u32>,
    param_stop_timeout_ms: Option<u64>,
) -> (PreviewLimits, LimitSources) {
    let (probe_interval_ms, interval_src) = resolve_one(
        param_interval_ms,
        "ATELIER_PROBE_INTERVAL_MS",
        DEFAULT_PROBE_INTERVAL_MS,
        100,
        10_000,
    );
    let (probe_attempts, attempts_src) = resolve_one(
        param_attempts.map(u64::from),
        "ATELIER_PROBE_ATTEMPTS",
        u64::from(DEFAULT_PROBE_ATTEMPTS),
        1,
        300,
    );
    let (stop_timeout_ms, stop_src) = resolve_one(
        param_stop_timeout_ms,
        "ATELIER_STOP_TIMEOUT_MS",
        DEFAULT_STOP_TIMEOUT_MS,
        100,
        60_000,
    );

    let effective = PreviewLimits {
        probe_interval_ms,
        // clamped to 300 above
        probe_attempts: probe_attempts as u32,
        stop_timeout_ms,
    };
    let sources = LimitSources {
        probe_interval_ms: interval_src,
        probe_attempts: attempts_src,
        stop_timeout_ms: stop_src,
    };
    (effective, sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_are_clamped() {
        let (limits, sources) = resolve_preview_limits(Some(5), Some(10_000), Some(1_000_000));
        assert_eq!(limits.probe_interval_ms, 100);
        assert_eq!(limits.probe_attempts, 300);
        assert_eq!(limits.stop_timeout_ms, 60_000);
        assert_eq!(sources.probe_interval_ms, "param");
        assert_eq!(sources.probe_attempts, "param");
    }

    #[test]
    fn test_param_wins_over_defaults() {
        let (limits, sources) = resolve_preview_limits(Some(250), Some(4), Some(750));
        assert_eq!(limits.probe_interval_ms, 250);
        assert_eq!(limits.probe_attempts, 4);
        assert_eq!(limits.stop_timeout_ms, 750);
        assert_eq!(sources.stop_timeout_ms, "param");
    }
}
