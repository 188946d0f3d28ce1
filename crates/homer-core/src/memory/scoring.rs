//! Confidence arithmetic for the memory store.
//!
//! Two distinct dynamics:
//! - *Solutions* carry an exponential-moving-average Q-value with α = 0.3,
//!   clamped to [0, 1]. Few strong signals suffice; recency dominates.
//! - *Rules* carry a Laplace-smoothed success rate
//!   `(hits + 1) / (hits + misses + 2)`, which stays in (0, 1) for any
//!   finite observation count.

/// EMA learning rate for solution confidence.
pub const EMA_ALPHA: f64 = 0.3;

/// Default confidence assigned to freshly created solutions and rules.
pub const INITIAL_CONFIDENCE: f64 = 0.5;

/// One EMA step toward `reward` (+1 on a confirmed fix, -1 on a failure
/// touching the same files), clamped to [0, 1].
pub fn ema_update(confidence: f64, reward: f64) -> f64 {
    (confidence + EMA_ALPHA * (reward - confidence)).clamp(0.0, 1.0)
}

/// Laplace-smoothed success rate for rules.
pub fn laplace_rate(hits: i64, misses: i64) -> f64 {
    (hits + 1) as f64 / (hits + misses + 2) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_single_positive_step_from_default() {
        // 0.5 + 0.3 * (1 - 0.5) = 0.65
        let c = ema_update(INITIAL_CONFIDENCE, 1.0);
        assert!((c - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_ema_negative_step() {
        // 0.5 + 0.3 * (-1 - 0.5) = 0.05
        let c = ema_update(INITIAL_CONFIDENCE, -1.0);
        assert!((c - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_ema_stays_clamped() {
        let mut c = 0.9;
        for _ in 0..50 {
            c = ema_update(c, 1.0);
        }
        assert!(c <= 1.0);
        for _ in 0..50 {
            c = ema_update(c, -1.0);
        }
        assert!(c >= 0.0);
    }

    #[test]
    fn test_laplace_rate_bounds() {
        assert!((laplace_rate(0, 0) - 0.5).abs() < 1e-9);
        assert!((laplace_rate(1, 0) - 2.0 / 3.0).abs() < 1e-9);
        assert!((laplace_rate(0, 1) - 1.0 / 3.0).abs() < 1e-9);
        // Never collapses to 0 or 1.
        let high = laplace_rate(1000, 0);
        let low = laplace_rate(0, 1000);
        assert!(high < 1.0 && high > 0.99);
        assert!(low > 0.0 && low < 0.01);
    }
}
