use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Passive income producer: sends `make()` every `period` until aborted or
/// the receiving side goes away. The first message arrives one full period
/// after the start.
pub fn spawn_ticker<M, F>(tx: mpsc::WeakSender<M>, period: Duration, make: F) -> JoinHandle<()>
where
    M: Send + 'static,
    F: Fn() -> M + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(tx) = tx.upgrade() else { break };
            if tx.send(make()).await.is_err() {
                break;
            }
        }
        tracing::debug!("passive ticker stopped");
    })
}
