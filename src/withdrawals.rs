use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::mining::stats::{lamports_to_sol, LAMPORTS_PER_SOL};

/// Smallest pending balance that may be withdrawn (0.03 SOL).
pub const MIN_WITHDRAWAL: u64 = 3 * LAMPORTS_PER_SOL / 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WithdrawalStatus::Pending)
    }
}

/// One entry of the withdrawal history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRecord {
    pub id: String,
    /// RFC3339 timestamp taken when the withdrawal was requested.
    pub timestamp: String,
    pub amount_lamports: u64,
    pub status: WithdrawalStatus,
    /// Empty until the payout is confirmed.
    #[serde(default)]
    pub tx_hash: String,
    pub recipient: String,
}

impl WithdrawalRecord {
    pub fn pending(amount_lamports: u64, recipient: &str) -> Self {
        let now = chrono::Utc::now();
        let mut salt = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            id: format!("wd_{}_{}", now.timestamp_millis(), hex::encode(salt)),
            timestamp: now.to_rfc3339(),
            amount_lamports,
            status: WithdrawalStatus::Pending,
            tx_hash: String::new(),
            recipient: recipient.to_string(),
        }
    }

    pub fn amount_sol(&self) -> f64 {
        lamports_to_sol(self.amount_lamports)
    }
}

/// Terminal outcome applied to a pending record.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Completed { tx_hash: String },
    Failed,
}

/// Newest-first withdrawal log for one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    records: Vec<WithdrawalRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[WithdrawalRecord] {
        &self.records
    }

    pub fn head(&self) -> Option<&WithdrawalRecord> {
        self.records.first()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn prepend(&mut self, rec: WithdrawalRecord) {
        self.records.insert(0, rec);
    }

    /// Move a pending record into its terminal state. Returns false when the
    /// record is unknown or already settled; settled records never change.
    pub fn settle(&mut self, id: &str, outcome: &Settlement) -> bool {
        let Some(rec) = self.records.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        if rec.status.is_terminal() {
            return false;
        }
        match outcome {
            Settlement::Completed { tx_hash } => {
                rec.status = WithdrawalStatus::Completed;
                rec.tx_hash = tx_hash.clone();
            }
            Settlement::Failed => rec.status = WithdrawalStatus::Failed,
        }
        true
    }

    /// Compute totals: (completed_count, completed_lamports, pending_count)
    pub fn totals(&self) -> (u64, u64, u64) {
        let mut completed = 0u64;
        let mut withdrawn = 0u64;
        let mut pending = 0u64;
        for r in &self.records {
            match r.status {
                WithdrawalStatus::Completed => {
                    completed += 1;
                    withdrawn = withdrawn.saturating_add(r.amount_lamports);
                }
                WithdrawalStatus::Pending => pending += 1,
                WithdrawalStatus::Failed => {}
            }
        }
        (completed, withdrawn, pending)
    }

    pub fn log_totals(&self) {
        let (completed, withdrawn, pending) = self.totals();
        tracing::info!(
            "Ledger — withdrawals completed: {} — withdrawn: {:.6} SOL — in flight: {}",
            completed,
            lamports_to_sol(withdrawn),
            pending
        );
    }
}
