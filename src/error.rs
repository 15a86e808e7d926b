use thiserror::Error;

/// Coarse classification used by presentation code to pick a message style.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    RateLimit,
    Network,
    Service,
    Internal,
}

/// Errors surfaced by the engine handle. Every public operation returns these
/// as values; none of them is fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("minimum withdrawal is {minimum:.2} SOL (pending {pending:.6} SOL)")]
    BelowMinimum { pending: f64, minimum: f64 },

    #[error("no payout address configured")]
    MissingAccount,

    #[error("a withdrawal for this account is still in progress")]
    WithdrawalInFlight,

    #[error("please wait before verifying again")]
    RateLimited,

    /// Transport failure or timeout. The detail is kept for logs only.
    #[error("withdrawal failed: payout service unreachable")]
    Network(String),

    #[error("withdrawal failed: {0}")]
    Service(String),

    #[error("engine stopped")]
    Stopped,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::BelowMinimum { .. } | EngineError::MissingAccount | EngineError::WithdrawalInFlight => {
                ErrorKind::Validation
            }
            EngineError::RateLimited => ErrorKind::RateLimit,
            EngineError::Network(_) => ErrorKind::Network,
            EngineError::Service(_) => ErrorKind::Service,
            EngineError::Stopped => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(EngineError::MissingAccount.kind(), ErrorKind::Validation);
        assert_eq!(
            EngineError::BelowMinimum { pending: 0.01, minimum: 0.03 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(EngineError::WithdrawalInFlight.kind(), ErrorKind::Validation);
        assert_eq!(EngineError::RateLimited.kind(), ErrorKind::RateLimit);
        assert_eq!(EngineError::Network("reset".into()).kind(), ErrorKind::Network);
        assert_eq!(EngineError::Service("nope".into()).kind(), ErrorKind::Service);
    }

    #[test]
    fn network_message_hides_transport_detail() {
        let e = EngineError::Network("connection refused (os error 111)".into());
        assert!(!e.to_string().contains("os error"));
        let s = EngineError::Service("insufficient treasury".into());
        assert_eq!(s.to_string(), "withdrawal failed: insufficient treasury");
    }
}
