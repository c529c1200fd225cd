/// Capacity scaling policy.
///
/// The busy rating (0-10) selects a fraction of the total capacity budget
/// that new leases may consume. The table is intentionally conservative:
/// above rating 7 almost nothing is admitted, at 10 nothing is.

use rand::Rng;

/// Usable fraction of total capacity, indexed by rounded busy rating.
const PERCENT_BY_BUSY: [f64; 11] = [
    1.00, 1.00, 1.00, 0.80, 0.65, 0.50, 0.35, 0.25, 0.15, 0.10, 0.00,
];

/// Longest retry hint handed to a denied worker.
const RETRY_CAP_MS: u64 = 30_000;

fn busy_index(busy: f64) -> usize {
    busy.round().clamp(0.0, 10.0) as usize
}

/// `floor(total * percent[busy]) - reserve`, floored at zero.
pub fn usable_units(busy: f64, total_units: u32, reserve_units: u32) -> u32 {
    let scaled = (total_units as f64 * PERCENT_BY_BUSY[busy_index(busy)]).floor() as i64;
    (scaled - reserve_units as i64).max(0) as u32
}

/// Deterministic backoff for denied lease requests: `base * 2^max(0, busy-3)`
/// capped at 30s, then jittered by up to ±10% so a denied fleet does not
/// retry in lockstep.
pub fn retry_after_ms(busy: f64, base_ms: u64) -> u64 {
    let exp = busy_index(busy).saturating_sub(3).min(10) as u32;
    let capped = base_ms.saturating_mul(1u64 << exp).min(RETRY_CAP_MS);

    let jitter = capped / 10;
    if jitter == 0 {
        return capped;
    }
    let delta = rand::thread_rng().gen_range(0..=jitter * 2) as i64 - jitter as i64;
    (capped as i64 + delta).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_policy() {
        assert_eq!(usable_units(0.0, 100, 0), 100);
        assert_eq!(usable_units(2.0, 100, 0), 100);
        assert_eq!(usable_units(3.0, 100, 0), 80);
        assert_eq!(usable_units(5.0, 100, 0), 50);
        assert_eq!(usable_units(7.0, 100, 0), 25);
        assert_eq!(usable_units(10.0, 100, 0), 0);
    }

    #[test]
    fn reserve_is_subtracted_and_floored() {
        assert_eq!(usable_units(0.0, 100, 30), 70);
        assert_eq!(usable_units(10.0, 100, 30), 0);
        // Reserve larger than the scaled budget floors at zero rather
        // than going negative.
        assert_eq!(usable_units(9.0, 100, 50), 0);
    }

    #[test]
    fn rating_is_rounded_and_clamped() {
        assert_eq!(usable_units(4.4, 100, 0), 65);
        assert_eq!(usable_units(4.5, 100, 0), 50);
        assert_eq!(usable_units(-3.0, 100, 0), 100);
        assert_eq!(usable_units(42.0, 100, 0), 0);
    }

    #[test]
    fn usable_is_monotonic_in_busy() {
        for total in [1u32, 10, 100, 1000] {
            for reserve in [0u32, 5, 50] {
                let mut prev = u32::MAX;
                for busy in 0..=10 {
                    let usable = usable_units(busy as f64, total, reserve);
                    assert!(
                        usable <= prev,
                        "usable went up at busy={busy} total={total} reserve={reserve}"
                    );
                    prev = usable;
                }
            }
        }
    }

    #[test]
    fn retry_backoff_doubles_above_three() {
        // Jitter is ±10%, so assert on a ±15% envelope.
        let approx = |busy: f64, expected: u64| {
            let v = retry_after_ms(busy, 375);
            let lo = expected - expected * 15 / 100;
            let hi = expected + expected * 15 / 100;
            assert!(
                (lo..=hi).contains(&v),
                "busy={busy}: got {v}, expected ~{expected}"
            );
        };
        approx(0.0, 375);
        approx(3.0, 375);
        approx(4.0, 750);
        approx(5.0, 1500);
        approx(7.0, 6000);
    }

    #[test]
    fn retry_is_capped() {
        for _ in 0..20 {
            assert!(retry_after_ms(10.0, 375) <= RETRY_CAP_MS + RETRY_CAP_MS / 10);
        }
    }
}
