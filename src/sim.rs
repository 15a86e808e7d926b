use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::mining::milestones::MilestoneTracker;
use crate::mining::stats::SolveTier;
use crate::mining::EngineHandle;
use crate::verify::Verification;

/// Headless stand-in for the runner game: produces the same three events the
/// renderer would (solves, distance milestones, run ends).
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub frame: Duration,
    /// Per-frame probability that a challenge pops up.
    pub challenge_chance: f64,
    /// Per-frame probability that the runner crashes.
    pub crash_chance: f64,
    /// Probability that a challenge answer is mistyped.
    pub typo_chance: f64,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            frame: Duration::from_millis(100),
            challenge_chance: 0.02,
            crash_chance: 0.004,
            typo_chance: 0.2,
            seed: rand::random(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimReport {
    pub frames: u64,
    pub milestones: u64,
    pub challenges: u64,
    pub solves: u64,
    pub rate_limited: u64,
    pub runs: u64,
}

/// Drive the engine until `duration` has elapsed. Challenge verifications run
/// beside the frame loop and are awaited before returning.
pub async fn run_simulation(handle: EngineHandle, cfg: SimConfig, duration: Duration) -> Result<SimReport, EngineError> {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut report = SimReport::default();
    let mut tracker = MilestoneTracker::new();
    let mut distance: u64 = 0;
    let mut checks: JoinSet<Result<Option<Verification>, EngineError>> = JoinSet::new();

    let deadline = Instant::now() + duration;
    let mut frames = tokio::time::interval(cfg.frame);

    while Instant::now() < deadline {
        frames.tick().await;
        report.frames += 1;

        distance += rng.gen_range(2..=6);
        for m in tracker.advance(distance) {
            handle.report_milestone(m).await?;
            report.milestones += 1;
        }

        if rng.gen_bool(cfg.challenge_chance) {
            report.challenges += 1;
            let tier = match rng.gen_range(0..3) {
                0 => SolveTier::Easy,
                1 => SolveTier::Medium,
                _ => SolveTier::Hard,
            };
            let mut code = [0u8; 3];
            rng.fill_bytes(&mut code);
            let expected = hex::encode(code);
            let answer = if rng.gen_bool(cfg.typo_chance) {
                format!("{expected}x")
            } else {
                expected.to_uppercase()
            };

            let h = handle.clone();
            checks.spawn(async move {
                match h.verify(&answer, &expected).await {
                    Ok(Verification::Accepted) => {
                        h.report_solve(tier.as_str()).await?;
                        Ok(Some(Verification::Accepted))
                    }
                    Ok(v) => Ok(Some(v)),
                    Err(EngineError::RateLimited) => Ok(None),
                    Err(e) => Err(e),
                }
            });
        }

        if rng.gen_bool(cfg.crash_chance) {
            debug!(distance, "runner crashed");
            handle.report_session_end(distance).await?;
            report.runs += 1;
            tracker.reset();
            distance = 0;
        }
    }

    while let Some(joined) = checks.join_next().await {
        match joined {
            Ok(Ok(Some(Verification::Accepted))) => report.solves += 1,
            Ok(Ok(Some(Verification::Rejected))) => {}
            Ok(Ok(None)) => report.rate_limited += 1,
            Ok(Err(e)) => return Err(e),
            Err(e) => tracing::warn!("challenge task failed: {e}"),
        }
    }

    if distance > 0 {
        handle.report_session_end(distance).await?;
        report.runs += 1;
    }
    info!(?report, "simulation finished");
    Ok(report)
}
