//! Time-based score decay.

use super::context::Scope;

/// Seconds of elapsed time that erase one point, per scope. Account scores
/// cool slowest; IP scores fastest, since IPs are the noisiest identity.
const ACCOUNT_RATE: u64 = 600;
const DEVICE_RATE: u64 = 300;
const IP_RATE: u64 = 180;

/// Result of a decay computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecayOutcome {
    /// Points to subtract from the stored score.
    pub amount: u64,
    /// Elapsed seconds the subtraction accounts for. Callers advance the
    /// stored `last_update` by this much (not to `now`), so the remainder
    /// below one decay step is preserved and decay stays a pure function
    /// of cumulative elapsed time.
    pub consumed_secs: u64,
}

/// Base decay rate for a scope, in seconds per point.
pub fn base_rate(scope: Scope) -> u64 {
    match scope {
        Scope::Account => ACCOUNT_RATE,
        Scope::Device => DEVICE_RATE,
        Scope::Ip => IP_RATE,
    }
}

/// Compute the decay owed for a stored score.
///
/// Post-hard-block state (level >= 2) cools at half speed. Decay never
/// exceeds the current score.
///
/// A referenced "10-minute decay pause after repeated block cycles" policy
/// is intentionally not implemented: no persisted state tracks block-cycle
/// history, and inferring it would guess at semantics.
pub fn owed(score: u64, elapsed_secs: u64, block_level: u8, scope: Scope) -> DecayOutcome {
    if score == 0 || elapsed_secs == 0 {
        return DecayOutcome {
            amount: 0,
            consumed_secs: 0,
        };
    }

    let mut rate = base_rate(scope);
    if block_level >= 2 {
        rate *= 2;
    }

    let amount = (elapsed_secs / rate).min(score);
    DecayOutcome {
        amount,
        consumed_secs: amount * rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_decay_for_zero_score_or_elapsed() {
        assert_eq!(owed(0, 10_000, 0, Scope::Ip).amount, 0);
        assert_eq!(owed(50, 0, 0, Scope::Ip).amount, 0);
    }

    #[test]
    fn test_scope_rates() {
        assert_eq!(owed(100, 600, 0, Scope::Account).amount, 1);
        assert_eq!(owed(100, 600, 0, Scope::Device).amount, 2);
        assert_eq!(owed(100, 540, 0, Scope::Ip).amount, 3);
    }

    #[test]
    fn test_hard_block_halves_decay_speed() {
        assert_eq!(owed(100, 1_200, 0, Scope::Account).amount, 2);
        assert_eq!(owed(100, 1_200, 1, Scope::Account).amount, 2);
        assert_eq!(owed(100, 1_200, 2, Scope::Account).amount, 1);
        assert_eq!(owed(100, 1_200, 3, Scope::Account).amount, 1);
    }

    #[test]
    fn test_decay_capped_at_score() {
        let out = owed(2, 100_000, 0, Scope::Ip);
        assert_eq!(out.amount, 2);
        assert_eq!(out.consumed_secs, 2 * 180);
    }

    #[test]
    fn test_split_decay_equals_single_decay() {
        // Decay applied in two steps over a cumulative elapsed time must
        // equal one application over the whole span, for uneven splits too.
        let total_elapsed = 1_000u64;
        let score = 100u64;

        let single = owed(score, total_elapsed, 0, Scope::Ip);

        for split in [1, 179, 180, 181, 500, 999] {
            let first = owed(score, split, 0, Scope::Ip);
            let remaining_score = score - first.amount;
            let remaining_elapsed = total_elapsed - first.consumed_secs;
            let second = owed(remaining_score, remaining_elapsed, 0, Scope::Ip);
            assert_eq!(
                first.amount + second.amount,
                single.amount,
                "split at {split}"
            );
        }
    }
}
