use tokio::sync::watch;

use crate::mining::Snapshot;

/// Very simple terminal dashboard.
/// Prints the engine snapshot once per second until the engine stops.
pub async fn launch_dashboard(mut rx: watch::Receiver<Snapshot>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = rx.borrow().clone();
                println!("{}", render(&snap));
            }

            changed = rx.changed() => {
                if changed.is_err() { break; } // engine gone
            }
        }
    }
}

pub fn render(snap: &Snapshot) -> String {
    let st = &snap.stats;
    let last_wd = snap
        .history
        .head()
        .map(|r| format!("{:.6} SOL {:?} {}", r.amount_sol(), r.status, r.tx_hash))
        .unwrap_or_else(|| "-".into());

    let mut out = String::new();
    out.push_str("=== Dash Miner – Session Stats ===\n");
    out.push_str(&format!("Account            : {}\n", snap.account.as_deref().unwrap_or("(none)")));
    out.push_str(&format!("Status             : {}\n", snap.status.label()));
    out.push_str(&format!("Hash rate          : {:.1} H/s\n", st.hash_rate));
    out.push_str(&format!("Total hashes       : {}\n", st.total_hashes));
    out.push_str(&format!("Accepted shares    : {}\n", st.accepted_shares));
    out.push_str(&format!("Solves             : {}\n", st.solve_count));
    out.push_str(&format!("Uptime             : {:.1}s\n", st.uptime_seconds()));
    out.push_str(&format!(
        "Pending            : {:.6} SOL ({:.8} secondary)\n",
        st.pending_primary(),
        st.pending_secondary()
    ));
    out.push_str(&format!(
        "Runs / best score  : {} / {}\n",
        snap.session.sessions_played, snap.session.best_score
    ));
    out.push_str(&format!("Last withdrawal    : {}\n", last_wd));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mining::stats::MiningStats;

    #[test]
    fn render_shows_balance_and_account() {
        let snap = Snapshot {
            account: Some("Dest111".into()),
            stats: MiningStats { pending_lamports: 50_000_000, ..Default::default() },
            ..Default::default()
        };
        let txt = render(&snap);
        assert!(txt.contains("Dest111"));
        assert!(txt.contains("0.050000 SOL"));
        assert!(txt.contains("Last withdrawal    : -"));
    }
}
