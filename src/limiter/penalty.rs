//! Block level to lockout duration mapping.

use std::time::Duration;

/// Static penalty ladder: block level (1-6) to lockout duration.
pub struct PenaltyLadder;

impl PenaltyLadder {
    /// Duration for a block level. Levels outside 1-6 map to the level-6
    /// maximum, so a corrupt stored level can only err toward the longer
    /// lockout.
    pub fn duration(level: u8) -> Duration {
        let secs = match level {
            1 => 15,
            2 => 60,
            3 => 300,
            4 => 1_800,
            5 => 21_600,
            _ => 86_400,
        };
        Duration::from_secs(secs)
    }
}
