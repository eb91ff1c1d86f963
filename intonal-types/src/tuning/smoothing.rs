//! Tempo-adaptive exponential smoothing.

/// Inter-onset interval (ms) treated as "fast playing".
pub const FAST_IOI_MS: f64 = 120.0;
/// Inter-onset interval (ms) treated as "slow playing".
pub const SLOW_IOI_MS: f64 = 600.0;

/// Move `current` toward `target` by `factor` (0.0 = stay, 1.0 = jump).
pub fn smooth_toward(current: f64, target: f64, factor: f64) -> f64 {
    let factor = factor.clamp(0.0, 1.0);
    current + (target - current) * factor
}

/// Where `ioi_ms` sits between fast (0.0) and slow (1.0) playing.
pub fn slowness(ioi_ms: f64) -> f64 {
    if !ioi_ms.is_finite() {
        return 1.0;
    }
    ((ioi_ms - FAST_IOI_MS) / (SLOW_IOI_MS - FAST_IOI_MS)).clamp(0.0, 1.0)
}

/// Linear interpolation between the value used for fast playing and the value
/// used for slow playing.
pub fn by_tempo(ioi_ms: f64, at_fast: f64, at_slow: f64) -> f64 {
    let t = slowness(ioi_ms);
    at_fast + (at_slow - at_fast) * t
}

/// Smoothing factor for the current tempo: faster playing smooths faster.
pub fn tempo_adaptive_factor(ioi_ms: f64, min_factor: f64, max_factor: f64) -> f64 {
    by_tempo(ioi_ms, max_factor, min_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smooth_moves_by_factor() {
        let next = smooth_toward(0.0, 10.0, 0.25);
        assert!((next - 2.5).abs() < 1e-12);
        assert_eq!(smooth_toward(3.0, 3.0, 0.5), 3.0);
    }

    #[test]
    fn smooth_clamps_factor() {
        assert_eq!(smooth_toward(0.0, 10.0, 2.0), 10.0);
        assert_eq!(smooth_toward(0.0, 10.0, -1.0), 0.0);
    }

    #[test]
    fn repeated_smoothing_converges() {
        let mut value = 0.0;
        for _ in 0..100 {
            value = smooth_toward(value, 11.73, 0.2);
        }
        assert!((value - 11.73).abs() < 1e-6);
    }

    #[test]
    fn factor_is_bounded_and_tempo_ordered() {
        let fast = tempo_adaptive_factor(50.0, 0.1, 0.4);
        let mid = tempo_adaptive_factor(360.0, 0.1, 0.4);
        let slow = tempo_adaptive_factor(2000.0, 0.1, 0.4);
        assert!((fast - 0.4).abs() < 1e-12);
        assert!((slow - 0.1).abs() < 1e-12);
        assert!(fast > mid && mid > slow);
    }

    #[test]
    fn slowness_handles_non_finite() {
        assert_eq!(slowness(f64::INFINITY), 1.0);
        assert_eq!(slowness(f64::NAN), 1.0);
        assert_eq!(slowness(0.0), 0.0);
    }
}
