use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::EngineError;

pub const VERIFY_DELAY: Duration = Duration::from_millis(500);
pub const VERIFY_COOLDOWN: Duration = Duration::from_secs(3);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    Accepted,
    Rejected,
}

/// Single-slot cooldown in front of challenge verification. Only accepted
/// solutions engage the cooldown; it expires on its own.
pub struct VerificationGate {
    expires_at: Mutex<Option<Instant>>,
    delay: Duration,
    cooldown: Duration,
}

impl Default for VerificationGate {
    fn default() -> Self {
        Self::new(VERIFY_DELAY, VERIFY_COOLDOWN)
    }
}

impl VerificationGate {
    pub fn new(delay: Duration, cooldown: Duration) -> Self {
        Self { expires_at: Mutex::new(None), delay, cooldown }
    }

    pub fn cooling_down(&self, now: Instant) -> bool {
        let slot = self.expires_at.lock().unwrap_or_else(|p| p.into_inner());
        matches!(*slot, Some(t) if now < t)
    }

    /// Engage the cooldown unless one is already running.
    fn try_engage(&self, now: Instant) -> bool {
        let mut slot = self.expires_at.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(*slot, Some(t) if now < t) {
            return false;
        }
        *slot = Some(now + self.cooldown);
        true
    }

    pub async fn verify(&self, solution: &str, expected: &str) -> Result<Verification, EngineError> {
        if self.cooling_down(Instant::now()) {
            return Err(EngineError::RateLimited);
        }
        tokio::time::sleep(self.delay).await;

        if solution.to_lowercase() != expected.to_lowercase() {
            return Ok(Verification::Rejected);
        }
        if !self.try_engage(Instant::now()) {
            return Err(EngineError::RateLimited);
        }
        Ok(Verification::Accepted)
    }
}
