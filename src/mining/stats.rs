use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::mining::milestones::milestone_reward;

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Secondary display denomination: `secondary = primary / SECONDARY_RATE`.
pub const SECONDARY_RATE: f64 = 150.0;

pub const TICK_INTERVAL: Duration = Duration::from_millis(1_500);
pub const TICK_REWARD: u64 = 5_000;
pub const TICK_HASHES: u64 = 63;
pub const BASELINE_HASH_RATE: f64 = 42.0;
pub const HASH_RATE_NUDGE: f64 = 3.5;

pub const SOLVE_REWARD_EASY: u64 = 150_000;
pub const SOLVE_REWARD_MEDIUM: u64 = 300_000;
pub const SOLVE_REWARD_HARD: u64 = 600_000;
pub const SOLVE_REWARD_DEFAULT: u64 = SOLVE_REWARD_EASY;
pub const SOLVE_HASHES: u64 = 1_000;
pub const SOLVE_WINDOW: Duration = Duration::from_secs(10);

pub const MILESTONE_HASH_BUMP: f64 = 5.0;

pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Per-account running statistics. The pending balance is held once, in
/// lamports; both display denominations are computed from it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MiningStats {
    pub hash_rate: f64,
    pub total_hashes: u64,
    pub accepted_shares: u64,
    pub pending_lamports: u64,
    pub uptime_ms: u64,
    pub solve_count: u64,
}

impl MiningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending balance in SOL.
    pub fn pending_primary(&self) -> f64 {
        lamports_to_sol(self.pending_lamports)
    }

    pub fn pending_secondary(&self) -> f64 {
        self.pending_primary() / SECONDARY_RATE
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.uptime_ms as f64 / 1_000.0
    }

    fn credit(&mut self, lamports: u64) {
        self.pending_lamports = self.pending_lamports.saturating_add(lamports);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SolveTier {
    Easy,
    Medium,
    Hard,
}

impl SolveTier {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "easy" => Some(SolveTier::Easy),
            "medium" => Some(SolveTier::Medium),
            "hard" => Some(SolveTier::Hard),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SolveTier::Easy => "easy",
            SolveTier::Medium => "medium",
            SolveTier::Hard => "hard",
        }
    }
}

/// Reward for a solved challenge; unknown tiers fall back to the default.
pub fn solve_reward(tier: &str) -> u64 {
    match SolveTier::parse(tier) {
        Some(SolveTier::Easy) => SOLVE_REWARD_EASY,
        Some(SolveTier::Medium) => SOLVE_REWARD_MEDIUM,
        Some(SolveTier::Hard) => SOLVE_REWARD_HARD,
        None => SOLVE_REWARD_DEFAULT,
    }
}

/// Recent solve instants, used only to estimate a display hash rate.
#[derive(Clone, Debug, Default)]
pub struct SolveWindow {
    stamps: VecDeque<Instant>,
}

impl SolveWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a solve at `now`, drop everything older than the window and
    /// return how many solves remain.
    pub fn record(&mut self, now: Instant) -> usize {
        self.stamps.push_back(now);
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) > SOLVE_WINDOW {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        self.stamps.len()
    }

    pub fn clear(&mut self) {
        self.stamps.clear();
    }
}

/// Passive income tick. Returns the lamports credited.
pub fn apply_tick(stats: &mut MiningStats) -> u64 {
    stats.credit(TICK_REWARD);
    stats.uptime_ms = stats.uptime_ms.saturating_add(TICK_INTERVAL.as_millis() as u64);
    if stats.hash_rate < BASELINE_HASH_RATE {
        stats.hash_rate = (stats.hash_rate + HASH_RATE_NUDGE).min(BASELINE_HASH_RATE);
    }
    stats.total_hashes = stats.total_hashes.saturating_add(TICK_HASHES);
    TICK_REWARD
}

/// Solved challenge. Returns the lamports credited.
pub fn apply_solve(stats: &mut MiningStats, window: &mut SolveWindow, tier: &str, now: Instant) -> u64 {
    let reward = solve_reward(tier);
    let recent = window.record(now);
    stats.hash_rate = recent as f64 * SOLVE_HASHES as f64 / SOLVE_WINDOW.as_secs_f64();
    stats.credit(reward);
    stats.solve_count += 1;
    stats.accepted_shares += 1;
    stats.total_hashes = stats.total_hashes.saturating_add(SOLVE_HASHES);
    reward
}

/// Distance milestone. Distances with no reward leave the record untouched.
pub fn apply_milestone(stats: &mut MiningStats, distance: u64) -> u64 {
    let reward = milestone_reward(distance);
    if reward > 0 {
        stats.credit(reward);
        stats.hash_rate += MILESTONE_HASH_BUMP;
    }
    reward
}
