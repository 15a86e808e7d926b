/// Distance between two milestones, in meters.
pub const MILESTONE_STEP: u64 = 100;

/// One-time rewards (lamports) for the first five milestones.
const MILESTONE_TABLE: [(u64, u64); 5] = [
    (100, 810_000),
    (200, 1_100_000),
    (300, 1_200_000),
    (400, 1_600_000),
    (500, 3_200_000),
];

/// Flat reward for every step past the end of the table: the increment
/// between the last two tiers (500m minus 400m).
pub const EXTRAPOLATED_REWARD: u64 = MILESTONE_TABLE[4].1 - MILESTONE_TABLE[3].1;

/// Reward for reaching `distance`. Zero unless `distance` is a positive
/// multiple of the step.
pub fn milestone_reward(distance: u64) -> u64 {
    if distance == 0 || distance % MILESTONE_STEP != 0 {
        return 0;
    }
    MILESTONE_TABLE
        .iter()
        .find(|(d, _)| *d == distance)
        .map(|(_, r)| *r)
        .unwrap_or(EXTRAPOLATED_REWARD)
}

/// Rows for display: the explicit table followed by the first extrapolated step.
pub fn table_rows() -> Vec<(u64, u64)> {
    let mut rows = MILESTONE_TABLE.to_vec();
    let next = MILESTONE_TABLE[MILESTONE_TABLE.len() - 1].0 + MILESTONE_STEP;
    rows.push((next, milestone_reward(next)));
    rows
}

/// Upper bound on milestones reported by a single `advance`; a jump past that
/// only pays the most recent ones.
pub const MAX_MILESTONES_PER_ADVANCE: u64 = 32;

/// Producer-side bookkeeping: remembers the last milestone fired in the
/// current run so each one is emitted at most once, in increasing order.
#[derive(Clone, Debug, Default)]
pub struct MilestoneTracker {
    last: u64,
}

impl MilestoneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Milestones crossed since the previous call, given the current distance.
    pub fn advance(&mut self, distance: u64) -> Vec<u64> {
        let reached = distance - distance % MILESTONE_STEP;
        if reached <= self.last {
            return Vec::new();
        }
        let skipped = (reached - self.last) / MILESTONE_STEP;
        let first = if skipped > MAX_MILESTONES_PER_ADVANCE {
            reached - (MAX_MILESTONES_PER_ADVANCE - 1) * MILESTONE_STEP
        } else {
            self.last + MILESTONE_STEP
        };
        self.last = reached;
        (0..)
            .map_while(|i: u64| first.checked_add(i * MILESTONE_STEP))
            .take_while(|m| *m <= reached)
            .collect()
    }

    pub fn reset(&mut self) {
        self.last = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_values() {
        assert_eq!(milestone_reward(100), 810_000);
        assert_eq!(milestone_reward(200), 1_100_000);
        assert_eq!(milestone_reward(300), 1_200_000);
        assert_eq!(milestone_reward(400), 1_600_000);
        assert_eq!(milestone_reward(500), 3_200_000);
    }

    #[test]
    fn beyond_table_is_flat() {
        assert_eq!(EXTRAPOLATED_REWARD, 1_600_000);
        assert_eq!(milestone_reward(600), EXTRAPOLATED_REWARD);
        assert_eq!(milestone_reward(1_000), EXTRAPOLATED_REWARD);
        assert_eq!(milestone_reward(12_300), EXTRAPOLATED_REWARD);
    }

    #[test]
    fn off_step_distances_pay_nothing() {
        assert_eq!(milestone_reward(0), 0);
        assert_eq!(milestone_reward(50), 0);
        assert_eq!(milestone_reward(550), 0);
        assert_eq!(milestone_reward(601), 0);
    }

    #[test]
    fn tracker_fires_each_milestone_once() {
        let mut t = MilestoneTracker::new();
        assert!(t.advance(99).is_empty());
        assert_eq!(t.advance(100), vec![100]);
        assert!(t.advance(150).is_empty());
        assert!(t.advance(100).is_empty());
        assert_eq!(t.advance(420), vec![200, 300, 400]);
        assert!(t.advance(380).is_empty());
        assert_eq!(t.advance(500), vec![500]);

        t.reset();
        assert_eq!(t.advance(100), vec![100]);
    }

    #[test]
    fn huge_jump_is_capped_and_does_not_overflow() {
        let mut t = MilestoneTracker::new();
        let out = t.advance(u64::MAX);
        let top = u64::MAX - u64::MAX % MILESTONE_STEP;
        assert_eq!(out.len() as u64, MAX_MILESTONES_PER_ADVANCE);
        assert_eq!(out.last(), Some(&top));
        assert!(out.windows(2).all(|w| w[1] - w[0] == MILESTONE_STEP));
        assert!(t.advance(u64::MAX).is_empty());

        let mut t = MilestoneTracker::new();
        assert_eq!(t.advance(10_000).len() as u64, MAX_MILESTONES_PER_ADVANCE);
        assert_eq!(t.advance(10_100), vec![10_100]);
    }

    #[test]
    fn display_rows_include_first_extrapolated_step() {
        let rows = table_rows();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[5], (600, EXTRAPOLATED_REWARD));
    }
}
