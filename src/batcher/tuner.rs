//! Pure adaptive-tuning arithmetic, isolated from the Batcher's locking and
//! timer plumbing so the tuning rules can be tested without a runtime.

/// Load regime classification for a tuning tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadRegime {
    High,
    Medium,
    Low,
}

pub fn classify_load(events_per_sec: f64, high_threshold: f64, low_threshold: f64) -> LoadRegime {
    if events_per_sec > high_threshold {
        LoadRegime::High
    } else if events_per_sec < low_threshold {
        LoadRegime::Low
    } else {
        LoadRegime::Medium
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TunerBounds {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub min_batch_timeout_ms: u64,
    pub max_batch_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunedParams {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
}

fn clamp_usize(v: f64, min: usize, max: usize) -> usize {
    (v.round() as i64).clamp(min as i64, max as i64) as usize
}

fn clamp_u64(v: f64, min: u64, max: u64) -> u64 {
    (v.round() as i64).clamp(min as i64, max as i64) as u64
}

/// Apply one tuning tick's adjustment rules (spec §4.1).
///
/// `aggressive_factor` is F, drawn from [1.2, 1.5] by the caller depending on
/// the `aggressive-tuning` config flag.
#[allow(clippy::too_many_arguments)]
pub fn tune(
    current: TunedParams,
    bounds: TunerBounds,
    regime: LoadRegime,
    avg_latency_ms: f64,
    target_latency_ms: f64,
    queue_depth: usize,
    aggressive_factor: f64,
) -> TunedParams {
    let mut size = current.batch_size;
    let mut timeout_ms = current.batch_timeout_ms;

    match regime {
        LoadRegime::High => {
            if avg_latency_ms > 1.5 * target_latency_ms {
                size = clamp_usize(size as f64 * aggressive_factor, bounds.min_batch_size, bounds.max_batch_size);
                timeout_ms = clamp_u64(
                    timeout_ms as f64 / aggressive_factor,
                    bounds.min_batch_timeout_ms,
                    bounds.max_batch_timeout_ms,
                );
            }
            if queue_depth > 2 * current.batch_size {
                size = clamp_usize((size + 10) as f64, bounds.min_batch_size, bounds.max_batch_size);
            }
        }
        LoadRegime::Low => {
            if avg_latency_ms > target_latency_ms {
                timeout_ms = clamp_u64(timeout_ms as f64 / 1.3, bounds.min_batch_timeout_ms, bounds.max_batch_timeout_ms);
                size = clamp_usize(size as f64 / 1.2, bounds.min_batch_size, bounds.max_batch_size);
            }
        }
        LoadRegime::Medium => {
            if avg_latency_ms > 1.2 * target_latency_ms {
                timeout_ms = clamp_u64(
                    timeout_ms as f64 - 10.0,
                    bounds.min_batch_timeout_ms,
                    bounds.max_batch_timeout_ms,
                );
            } else if avg_latency_ms < 0.5 * target_latency_ms {
                size = clamp_usize((size + 5) as f64, bounds.min_batch_size, bounds.max_batch_size);
            }
        }
    }

    TunedParams {
        batch_size: size,
        batch_timeout_ms: timeout_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: TunerBounds = TunerBounds {
        min_batch_size: 10,
        max_batch_size: 500,
        min_batch_timeout_ms: 10,
        max_batch_timeout_ms: 5_000,
    };

    #[test]
    fn classify_regimes() {
        assert_eq!(classify_load(2000.0, 1000.0, 100.0), LoadRegime::High);
        assert_eq!(classify_load(50.0, 1000.0, 100.0), LoadRegime::Low);
        assert_eq!(classify_load(500.0, 1000.0, 100.0), LoadRegime::Medium);
    }

    #[test]
    fn high_load_scales_size_up_and_timeout_down_when_latency_exceeds_threshold() {
        let current = TunedParams { batch_size: 100, batch_timeout_ms: 100 };
        let tuned = tune(current, BOUNDS, LoadRegime::High, 200.0, 100.0, 0, 1.5);
        assert_eq!(tuned.batch_size, 150);
        assert_eq!(tuned.batch_timeout_ms, 67); // 100/1.5 rounded
    }

    #[test]
    fn high_load_adds_ten_when_queue_deep() {
        let current = TunedParams { batch_size: 100, batch_timeout_ms: 100 };
        // avg_latency below threshold so only the queue-depth rule fires.
        let tuned = tune(current, BOUNDS, LoadRegime::High, 50.0, 100.0, 250, 1.5);
        assert_eq!(tuned.batch_size, 110);
    }

    #[test]
    fn low_load_shrinks_size_and_timeout_when_latency_exceeds_target() {
        let current = TunedParams { batch_size: 120, batch_timeout_ms: 130 };
        let tuned = tune(current, BOUNDS, LoadRegime::Low, 150.0, 100.0, 0, 1.2);
        assert_eq!(tuned.batch_timeout_ms, 100); // 130/1.3
        assert_eq!(tuned.batch_size, 100); // 120/1.2
    }

    #[test]
    fn low_load_no_change_under_target_latency() {
        let current = TunedParams { batch_size: 120, batch_timeout_ms: 130 };
        let tuned = tune(current, BOUNDS, LoadRegime::Low, 50.0, 100.0, 0, 1.2);
        assert_eq!(tuned, current);
    }

    #[test]
    fn medium_load_shaves_timeout_when_latency_moderately_high() {
        let current = TunedParams { batch_size: 100, batch_timeout_ms: 100 };
        let tuned = tune(current, BOUNDS, LoadRegime::Medium, 130.0, 100.0, 0, 1.2);
        assert_eq!(tuned.batch_timeout_ms, 90);
        assert_eq!(tuned.batch_size, 100);
    }

    #[test]
    fn medium_load_grows_size_when_latency_very_low() {
        let current = TunedParams { batch_size: 100, batch_timeout_ms: 100 };
        let tuned = tune(current, BOUNDS, LoadRegime::Medium, 40.0, 100.0, 0, 1.2);
        assert_eq!(tuned.batch_size, 105);
    }

    #[test]
    fn stays_within_bounds_at_extremes() {
        let current = TunedParams { batch_size: BOUNDS.max_batch_size, batch_timeout_ms: BOUNDS.min_batch_timeout_ms };
        let tuned = tune(current, BOUNDS, LoadRegime::High, 1000.0, 1.0, 100_000, 1.5);
        assert!(tuned.batch_size <= BOUNDS.max_batch_size);
        assert!(tuned.batch_timeout_ms >= BOUNDS.min_batch_timeout_ms);
    }
}
