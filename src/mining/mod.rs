pub mod milestones;
pub mod stats;
pub mod status;
pub mod ticker;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::accounts::{run_writer, AccountGuard, AccountRepository, KvStore, PersistJob, PersistPayload};
use crate::api::{PayoutService, WithdrawRequest};
use crate::error::EngineError;
use crate::verify::{Verification, VerificationGate};
use crate::withdrawals::{History, Settlement, WithdrawalRecord, MIN_WITHDRAWAL};

use self::stats::{apply_milestone, apply_solve, apply_tick, lamports_to_sol, MiningStats, SolveWindow, TICK_INTERVAL};
use self::status::{ActivityFlags, MiningStatus};
use self::ticker::spawn_ticker;

const COMMAND_QUEUE: usize = 256;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub payout_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { payout_timeout: Duration::from_secs(30), tick_interval: TICK_INTERVAL }
    }
}

/// Per-process run bookkeeping, fed by `report_session_end`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub sessions_played: u64,
    pub best_score: u64,
    pub last_score: Option<u64>,
}

/// Read-only view published after every command.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub status: MiningStatus,
    pub stats: MiningStats,
    pub history: History,
    pub session: SessionSummary,
    pub account: Option<String>,
}

/// What the payout call came back with.
#[derive(Debug)]
enum PayoutOutcome {
    Confirmed(String),
    Declined(String),
    Unreachable(String),
}

/// A withdrawal that left the engine and is waiting on the payout service.
#[derive(Debug, Clone)]
struct Ticket {
    id: String,
    account: String,
    amount_lamports: u64,
}

type WithdrawReply = oneshot::Sender<Result<WithdrawalRecord, EngineError>>;

/// What a payout task hands back to the engine loop.
struct PayoutDone {
    ticket: Ticket,
    outcome: PayoutOutcome,
    reply: WithdrawReply,
}

enum Command {
    ToggleActive(oneshot::Sender<MiningStatus>),
    TogglePassive(oneshot::Sender<MiningStatus>),
    Tick,
    Solved(String),
    Milestone(u64),
    SessionEnded(u64),
    SelectAccount(Option<String>, oneshot::Sender<()>),
    Withdraw(WithdrawReply),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

/// Owns every piece of mutable session state. Runs as a single task; each
/// command is applied to completion before the next one is read.
struct Engine<S: KvStore, P: PayoutService> {
    repo: Arc<AccountRepository<S>>,
    guard: Arc<AccountGuard>,
    payout: Arc<P>,
    config: EngineConfig,

    flags: ActivityFlags,
    stats: MiningStats,
    history: History,
    window: SolveWindow,
    session: SessionSummary,
    account: Option<String>,
    generation: u64,

    self_tx: mpsc::WeakSender<Command>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    snapshots: watch::Sender<Snapshot>,
    ticker: Option<JoinHandle<()>>,
    payouts: JoinSet<PayoutDone>,
    /// Accounts with a payout call in flight.
    paying: HashSet<String>,
}

enum Event {
    Command(Option<Command>),
    Payout(Result<PayoutDone, JoinError>),
}

impl<S: KvStore, P: PayoutService> Engine<S, P> {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, writer: JoinHandle<()>) {
        loop {
            let event = tokio::select! {
                cmd = rx.recv() => Event::Command(cmd),
                Some(done) = self.payouts.join_next() => Event::Payout(done),
            };
            match event {
                Event::Command(Some(cmd)) => {
                    if !self.handle(cmd) {
                        break;
                    }
                }
                Event::Command(None) => break,
                Event::Payout(done) => self.finish_payout(done),
            }
            self.snapshots.send_replace(self.snapshot());
        }

        rx.close();
        self.stop_ticker();
        // every payout call is bounded by the payout timeout
        if !self.payouts.is_empty() {
            info!(in_flight = self.payouts.len(), "waiting for payout calls before stopping");
        }
        while let Some(done) = self.payouts.join_next().await {
            self.finish_payout(done);
            self.snapshots.send_replace(self.snapshot());
        }

        self.retire_generation();
        self.snapshots.send_replace(self.snapshot());
        drop(self.persist_tx);
        let _ = writer.await;
        info!("reward engine stopped");
    }

    /// Returns false when the loop should end.
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::ToggleActive(reply) => {
                let status = self.flags.toggle_active();
                self.on_status_change(status);
                let _ = reply.send(status);
            }
            Command::TogglePassive(reply) => {
                let status = self.flags.toggle_passive();
                if self.flags.passive {
                    self.start_ticker();
                } else {
                    self.stop_ticker();
                }
                self.on_status_change(status);
                let _ = reply.send(status);
            }
            Command::Tick => {
                // a tick already queued when passive was switched off
                if self.flags.passive {
                    apply_tick(&mut self.stats);
                    self.persist_stats();
                }
            }
            Command::Solved(tier) => {
                let reward = apply_solve(&mut self.stats, &mut self.window, &tier, tokio::time::Instant::now());
                debug!(%tier, reward, "challenge solved");
                self.persist_stats();
            }
            Command::Milestone(distance) => {
                let reward = apply_milestone(&mut self.stats, distance);
                if reward > 0 {
                    info!(distance, reward_sol = lamports_to_sol(reward), "distance milestone");
                    self.persist_stats();
                }
            }
            Command::SessionEnded(score) => {
                self.session.sessions_played += 1;
                self.session.best_score = self.session.best_score.max(score);
                self.session.last_score = Some(score);
                self.window.clear();
                info!(score, best = self.session.best_score, "run ended");
            }
            Command::SelectAccount(account, reply) => {
                self.select_account(account);
                let _ = reply.send(());
            }
            Command::Withdraw(reply) => self.begin_withdrawal(reply),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            status: self.flags.status(),
            stats: self.stats.clone(),
            history: self.history.clone(),
            session: self.session.clone(),
            account: self.account.clone(),
        }
    }

    fn on_status_change(&mut self, status: MiningStatus) {
        info!(status = status.label(), "mining status");
        if status == MiningStatus::Idle && self.stats.hash_rate != 0.0 {
            self.stats.hash_rate = 0.0;
            self.persist_stats();
        }
    }

    fn start_ticker(&mut self) {
        self.stop_ticker();
        self.ticker = Some(spawn_ticker(self.self_tx.clone(), self.config.tick_interval, || Command::Tick));
    }

    fn stop_ticker(&mut self) {
        if let Some(t) = self.ticker.take() {
            t.abort();
        }
    }

    fn persist(&self, payload: PersistPayload) {
        let Some(account) = &self.account else { return };
        let job = PersistJob { generation: self.generation, account: account.clone(), payload };
        if self.persist_tx.send(job).is_err() {
            warn!("persistence writer is gone");
        }
    }

    fn persist_stats(&self) {
        self.persist(PersistPayload::Stats(self.stats.clone()));
    }

    fn persist_history(&self) {
        self.persist(PersistPayload::History(self.history.clone()));
    }

    /// Write the in-memory records of the current account (if it was loaded)
    /// and start a new generation in one step. Writes still queued for the
    /// old generation are dropped by the writer.
    fn retire_generation(&mut self) {
        let account = self.account.as_deref();
        let (next, flushed) = self.guard.switch_with(self.generation, || {
            let Some(account) = account else { return Ok(()) };
            self.repo.save_stats(Some(account), &self.stats)?;
            self.repo.save_history(Some(account), &self.history)
        });
        if let Err(e) = flushed {
            warn!(account, "flushing account records failed: {e:#}");
        }
        self.generation = next;
    }

    fn select_account(&mut self, account: Option<String>) {
        self.retire_generation();
        self.window.clear();

        let Some(acc) = account else {
            info!("account cleared; persistence suspended");
            self.account = None;
            return;
        };

        match self.repo.load(Some(&acc)) {
            Ok(loaded) => {
                self.stats = loaded.stats;
                self.history = loaded.history;
                self.guard.mark_loaded(self.generation);
                info!(account=%acc, pending_sol = self.stats.pending_primary(), withdrawals = self.history.len(), "account loaded");
            }
            Err(e) => {
                self.stats = MiningStats::default();
                self.history = History::default();
                error!(account=%acc, "loading account failed, persistence suspended: {e:#}");
            }
        }
        if self.flags.status() == MiningStatus::Idle {
            self.stats.hash_rate = 0.0;
        }
        self.account = Some(acc);
    }

    fn begin_withdrawal(&mut self, reply: WithdrawReply) {
        let amount = self.stats.pending_lamports;
        if amount < MIN_WITHDRAWAL {
            let _ = reply.send(Err(EngineError::BelowMinimum {
                pending: lamports_to_sol(amount),
                minimum: lamports_to_sol(MIN_WITHDRAWAL),
            }));
            return;
        }
        let Some(account) = self.account.clone() else {
            let _ = reply.send(Err(EngineError::MissingAccount));
            return;
        };
        if self.paying.contains(&account) {
            let _ = reply.send(Err(EngineError::WithdrawalInFlight));
            return;
        }

        let record = WithdrawalRecord::pending(amount, &account);
        info!(id=%record.id, amount_sol = record.amount_sol(), recipient=%account, "withdrawal requested");
        let ticket = Ticket { id: record.id.clone(), account: account.clone(), amount_lamports: amount };
        self.history.prepend(record);
        self.persist_history();
        self.paying.insert(account.clone());

        let payout = self.payout.clone();
        let timeout = self.config.payout_timeout;
        let req = WithdrawRequest { recipient_address: account, amount_sol: lamports_to_sol(amount) };

        self.payouts.spawn(async move {
            let outcome = match tokio::time::timeout(timeout, payout.withdraw(req)).await {
                Err(_) => PayoutOutcome::Unreachable(format!("no answer within {timeout:?}")),
                Ok(Err(e)) => PayoutOutcome::Unreachable(format!("{e:#}")),
                Ok(Ok(resp)) if resp.success => match resp.tx_hash.filter(|h| !h.is_empty()) {
                    Some(tx) => PayoutOutcome::Confirmed(tx),
                    None => PayoutOutcome::Declined("payout service returned no transaction reference".into()),
                },
                Ok(Ok(resp)) => PayoutOutcome::Declined(
                    resp.error.unwrap_or_else(|| "payout service declined the withdrawal".into()),
                ),
            };
            PayoutDone { ticket, outcome, reply }
        });
    }

    fn finish_payout(&mut self, done: Result<PayoutDone, JoinError>) {
        match done {
            Ok(PayoutDone { ticket, outcome, reply }) => {
                self.paying.remove(&ticket.account);
                let _ = reply.send(self.settle(ticket, outcome));
            }
            // the reply sender went down with the task; the record stays pending
            Err(e) => error!("payout task failed: {e}"),
        }
    }

    fn settle(&mut self, ticket: Ticket, outcome: PayoutOutcome) -> Result<WithdrawalRecord, EngineError> {
        let (settlement, result) = match outcome {
            PayoutOutcome::Confirmed(tx_hash) => (Settlement::Completed { tx_hash }, Ok(())),
            PayoutOutcome::Declined(msg) => (Settlement::Failed, Err(EngineError::Service(msg))),
            PayoutOutcome::Unreachable(detail) => (Settlement::Failed, Err(EngineError::Network(detail))),
        };
        match &result {
            Ok(()) => info!(id=%ticket.id, "withdrawal completed"),
            Err(e) => warn!(id=%ticket.id, "withdrawal failed: {e:?}"),
        }

        let record = if self.account.as_deref() == Some(ticket.account.as_str()) {
            if self.history.settle(&ticket.id, &settlement) && matches!(settlement, Settlement::Completed { .. }) {
                self.stats.pending_lamports = self.stats.pending_lamports.saturating_sub(ticket.amount_lamports);
                self.persist_stats();
            }
            self.persist_history();
            self.history.records().iter().find(|r| r.id == ticket.id).cloned()
        } else {
            self.settle_detached(&ticket, &settlement)
        };

        result?;
        record.ok_or(EngineError::Stopped)
    }

    /// The account changed while the payout was in flight: patch the
    /// originating account's stored records instead of the live ones.
    fn settle_detached(&self, ticket: &Ticket, settlement: &Settlement) -> Option<WithdrawalRecord> {
        let account = Some(ticket.account.as_str());
        let mut loaded = match self.repo.load(account) {
            Ok(l) => l,
            Err(e) => {
                error!(account=%ticket.account, id=%ticket.id, "cannot reconcile withdrawal: {e:#}");
                return None;
            }
        };
        if loaded.history.settle(&ticket.id, settlement) {
            if matches!(settlement, Settlement::Completed { .. }) {
                loaded.stats.pending_lamports = loaded.stats.pending_lamports.saturating_sub(ticket.amount_lamports);
            }
            let saved = self
                .repo
                .save_stats(account, &loaded.stats)
                .and_then(|_| self.repo.save_history(account, &loaded.history));
            if let Err(e) = saved {
                error!(account=%ticket.account, id=%ticket.id, "saving reconciled withdrawal failed: {e:#}");
            }
        }
        loaded.history.records().iter().find(|r| r.id == ticket.id).cloned()
    }
}

/// Cloneable front door to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Snapshot>,
    gate: Arc<VerificationGate>,
}

/// Start the engine and its persistence writer. The returned join handle
/// completes once the engine has stopped and every pending write landed.
pub fn spawn_engine<S: KvStore, P: PayoutService>(
    repo: Arc<AccountRepository<S>>,
    payout: Arc<P>,
    config: EngineConfig,
) -> (EngineHandle, JoinHandle<()>) {
    let guard = Arc::new(AccountGuard::new());
    let (persist_tx, persist_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(run_writer(repo.clone(), guard.clone(), persist_rx));

    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let (snap_tx, snap_rx) = watch::channel(Snapshot::default());

    let engine = Engine {
        repo,
        guard,
        payout,
        config,
        flags: ActivityFlags::default(),
        stats: MiningStats::default(),
        history: History::default(),
        window: SolveWindow::new(),
        session: SessionSummary::default(),
        account: None,
        generation: 0,
        self_tx: tx.downgrade(),
        persist_tx,
        snapshots: snap_tx,
        ticker: None,
        payouts: JoinSet::new(),
        paying: HashSet::new(),
    };
    let task = tokio::spawn(engine.run(rx, writer));

    let handle = EngineHandle { tx, snapshots: snap_rx, gate: Arc::new(VerificationGate::default()) };
    (handle, task)
}

impl EngineHandle {
    async fn send(&self, cmd: Command) -> Result<(), EngineError> {
        self.tx.send(cmd).await.map_err(|_| EngineError::Stopped)
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Latest published view; may lag commands that are still queued.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// View taken after every previously sent command was applied.
    pub async fn refresh(&self) -> Result<Snapshot, EngineError> {
        self.ask(Command::Snapshot).await
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub async fn toggle_active(&self) -> Result<MiningStatus, EngineError> {
        self.ask(Command::ToggleActive).await
    }

    pub async fn toggle_passive(&self) -> Result<MiningStatus, EngineError> {
        self.ask(Command::TogglePassive).await
    }

    pub async fn verify(&self, solution: &str, expected: &str) -> Result<Verification, EngineError> {
        self.gate.verify(solution, expected).await
    }

    pub async fn report_solve(&self, tier: &str) -> Result<(), EngineError> {
        self.send(Command::Solved(tier.to_string())).await
    }

    pub async fn report_milestone(&self, distance: u64) -> Result<(), EngineError> {
        self.send(Command::Milestone(distance)).await
    }

    pub async fn report_session_end(&self, final_score: u64) -> Result<(), EngineError> {
        self.send(Command::SessionEnded(final_score)).await
    }

    pub async fn select_account(&self, account: Option<String>) -> Result<(), EngineError> {
        self.ask(|reply| Command::SelectAccount(account, reply)).await
    }

    /// Withdraw the whole pending balance. Resolves once the payout service
    /// answered (or timed out) and the history entry was settled.
    pub async fn request_withdrawal(&self) -> Result<WithdrawalRecord, EngineError> {
        self.ask(Command::Withdraw).await?
    }

    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::MemoryStore;
    use crate::api::WithdrawResponse;
    use crate::error::ErrorKind;
    use crate::mining::milestones::milestone_reward;
    use crate::mining::stats::{solve_reward, TICK_REWARD};
    use crate::withdrawals::WithdrawalStatus;

    fn head_status(snapshot: &Snapshot) -> Option<WithdrawalStatus> {
        snapshot.history.head().map(|r| r.status)
    }

    #[derive(Clone)]
    enum Mode {
        Pay(&'static str),
        Decline(&'static str),
        Unreachable,
        Hang,
        Slow(Duration, &'static str),
    }

    struct FakePayout {
        mode: Mode,
    }

    impl PayoutService for FakePayout {
        async fn withdraw(&self, _req: WithdrawRequest) -> anyhow::Result<WithdrawResponse> {
            match self.mode.clone() {
                Mode::Pay(tx) => Ok(WithdrawResponse { success: true, tx_hash: Some(tx.into()), error: None }),
                Mode::Decline(msg) => Ok(WithdrawResponse { success: false, tx_hash: None, error: Some(msg.into()) }),
                Mode::Unreachable => anyhow::bail!("connection refused"),
                Mode::Hang => std::future::pending().await,
                Mode::Slow(d, tx) => {
                    tokio::time::sleep(d).await;
                    Ok(WithdrawResponse { success: true, tx_hash: Some(tx.into()), error: None })
                }
            }
        }
    }

    type Repo = Arc<AccountRepository<Arc<MemoryStore>>>;

    fn seeded(accounts: &[(&str, u64)]) -> Repo {
        let repo = Arc::new(AccountRepository::new(Arc::new(MemoryStore::new()), "solminer"));
        for (acc, lamports) in accounts {
            let stats = MiningStats { pending_lamports: *lamports, ..Default::default() };
            repo.save_stats(Some(acc), &stats).unwrap();
        }
        repo
    }

    fn start(repo: &Repo, mode: Mode) -> (EngineHandle, JoinHandle<()>) {
        spawn_engine(repo.clone(), Arc::new(FakePayout { mode }), EngineConfig::default())
    }

    #[tokio::test]
    async fn successful_withdrawal_completes_and_resets_balance() {
        let repo = seeded(&[("A", 50_000_000)]);
        let (h, task) = start(&repo, Mode::Pay("abc"));
        h.select_account(Some("A".into())).await.unwrap();

        let rec = h.request_withdrawal().await.unwrap();
        assert_eq!(rec.status, WithdrawalStatus::Completed);
        assert_eq!(rec.tx_hash, "abc");
        assert_eq!(rec.amount_lamports, 50_000_000);

        let snap = h.refresh().await.unwrap();
        assert_eq!(head_status(&snap), Some(WithdrawalStatus::Completed));
        assert_eq!(snap.history.head().unwrap().tx_hash, "abc");
        assert_eq!(snap.stats.pending_lamports, 0);
        assert_eq!(snap.stats.pending_secondary(), 0.0);

        h.shutdown().await;
        task.await.unwrap();
        let stored = repo.load(Some("A")).unwrap();
        assert_eq!(stored.stats.pending_lamports, 0);
        assert_eq!(stored.history.head().unwrap().status, WithdrawalStatus::Completed);
    }

    #[tokio::test]
    async fn failed_withdrawal_keeps_balance() {
        let repo = seeded(&[("A", 100_000_000)]);
        let (h, _task) = start(&repo, Mode::Unreachable);
        h.select_account(Some("A".into())).await.unwrap();

        let err = h.request_withdrawal().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);

        let snap = h.refresh().await.unwrap();
        assert_eq!(head_status(&snap), Some(WithdrawalStatus::Failed));
        assert!(snap.history.head().unwrap().tx_hash.is_empty());
        assert_eq!(snap.stats.pending_lamports, 100_000_000);

        // retryable: a second attempt creates a second record
        assert!(h.request_withdrawal().await.is_err());
        assert_eq!(h.refresh().await.unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn declined_withdrawal_surfaces_service_message() {
        let repo = seeded(&[("A", 100_000_000)]);
        let (h, _task) = start(&repo, Mode::Decline("treasury empty"));
        h.select_account(Some("A".into())).await.unwrap();

        let err = h.request_withdrawal().await.unwrap_err();
        assert_eq!(err, EngineError::Service("treasury empty".into()));
        let snap = h.refresh().await.unwrap();
        assert_eq!(head_status(&snap), Some(WithdrawalStatus::Failed));
        assert_eq!(snap.stats.pending_lamports, 100_000_000);
    }

    #[tokio::test]
    async fn below_minimum_is_rejected_without_record() {
        let repo = seeded(&[("A", 10_000_000)]);
        let (h, _task) = start(&repo, Mode::Pay("never"));
        h.select_account(Some("A".into())).await.unwrap();

        let err = h.request_withdrawal().await.unwrap_err();
        assert!(matches!(err, EngineError::BelowMinimum { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
        let snap = h.refresh().await.unwrap();
        assert!(snap.history.is_empty());
        assert_eq!(snap.stats.pending_lamports, 10_000_000);
    }

    #[tokio::test]
    async fn missing_account_is_rejected_after_balance_check() {
        let repo = seeded(&[("A", 50_000_000)]);
        let (h, _task) = start(&repo, Mode::Pay("never"));
        h.select_account(Some("A".into())).await.unwrap();
        h.select_account(None).await.unwrap();

        assert_eq!(h.request_withdrawal().await.unwrap_err(), EngineError::MissingAccount);
        assert!(h.refresh().await.unwrap().history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_payout_times_out_as_failed() {
        let repo = seeded(&[("A", 50_000_000)]);
        let (h, _task) = start(&repo, Mode::Hang);
        h.select_account(Some("A".into())).await.unwrap();

        let err = h.request_withdrawal().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        let snap = h.refresh().await.unwrap();
        assert_eq!(head_status(&snap), Some(WithdrawalStatus::Failed));
        assert_eq!(snap.stats.pending_lamports, 50_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_record_is_visible_while_in_flight() {
        let repo = seeded(&[("A", 50_000_000)]);
        let (h, _task) = start(&repo, Mode::Slow(Duration::from_secs(5), "slow"));
        h.select_account(Some("A".into())).await.unwrap();

        let h2 = h.clone();
        let inflight = tokio::spawn(async move { h2.request_withdrawal().await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let snap = h.refresh().await.unwrap();
        assert_eq!(head_status(&snap), Some(WithdrawalStatus::Pending));
        assert_eq!(snap.stats.pending_lamports, 50_000_000);

        let rec = inflight.await.unwrap().unwrap();
        assert_eq!(rec.status, WithdrawalStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn withdrawal_settles_on_originating_account_after_switch() {
        let repo = seeded(&[("A", 50_000_000)]);
        let (h, task) = start(&repo, Mode::Slow(Duration::from_secs(5), "tx-a"));
        h.select_account(Some("A".into())).await.unwrap();

        let h2 = h.clone();
        let inflight = tokio::spawn(async move { h2.request_withdrawal().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.select_account(Some("B".into())).await.unwrap();

        let rec = inflight.await.unwrap().unwrap();
        assert_eq!(rec.tx_hash, "tx-a");

        let snap = h.refresh().await.unwrap();
        assert_eq!(snap.account.as_deref(), Some("B"));
        assert!(snap.history.is_empty());
        assert_eq!(snap.stats.pending_lamports, 0);

        h.shutdown().await;
        task.await.unwrap();
        let a = repo.load(Some("A")).unwrap();
        assert_eq!(a.history.head().unwrap().status, WithdrawalStatus::Completed);
        assert_eq!(a.stats.pending_lamports, 0);
        assert!(repo.load(Some("B")).unwrap().history.is_empty());
    }

    #[tokio::test]
    async fn events_accumulate_additively() {
        let repo = seeded(&[]);
        let (h, _task) = start(&repo, Mode::Pay("x"));
        h.select_account(Some("A".into())).await.unwrap();

        h.report_solve("hard").await.unwrap();
        h.report_milestone(100).await.unwrap();
        h.report_solve("mystery").await.unwrap();
        h.report_milestone(550).await.unwrap();
        h.report_milestone(600).await.unwrap();

        let snap = h.refresh().await.unwrap();
        let expected =
            solve_reward("hard") + milestone_reward(100) + solve_reward("mystery") + milestone_reward(600);
        assert_eq!(snap.stats.pending_lamports, expected);
        assert_eq!(snap.stats.solve_count, 2);
        assert_eq!(snap.stats.accepted_shares, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn passive_ticker_runs_only_while_enabled() {
        let repo = seeded(&[]);
        let (h, _task) = start(&repo, Mode::Pay("x"));
        h.select_account(Some("A".into())).await.unwrap();

        assert_eq!(h.toggle_passive().await.unwrap(), MiningStatus::PassiveOnly);
        tokio::time::sleep(Duration::from_millis(4_600)).await;
        let snap = h.refresh().await.unwrap();
        assert_eq!(snap.stats.pending_lamports, 3 * TICK_REWARD);
        assert_eq!(snap.stats.uptime_ms, 4_500);
        assert!(snap.stats.hash_rate > 0.0);

        assert_eq!(h.toggle_passive().await.unwrap(), MiningStatus::Idle);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let snap = h.refresh().await.unwrap();
        assert_eq!(snap.stats.pending_lamports, 3 * TICK_REWARD);
        assert_eq!(snap.stats.hash_rate, 0.0);
        assert_eq!(snap.status, MiningStatus::Idle);
    }

    #[tokio::test]
    async fn status_follows_both_toggles() {
        let repo = seeded(&[]);
        let (h, _task) = start(&repo, Mode::Pay("x"));
        assert_eq!(h.toggle_active().await.unwrap(), MiningStatus::ActiveOnly);
        assert_eq!(h.toggle_passive().await.unwrap(), MiningStatus::Both);
        assert_eq!(h.toggle_active().await.unwrap(), MiningStatus::PassiveOnly);
        assert_eq!(h.refresh().await.unwrap().status, MiningStatus::PassiveOnly);
    }

    #[tokio::test]
    async fn switching_accounts_never_leaks_records() {
        let repo = seeded(&[("A", 50_000_000)]);
        let (h, task) = start(&repo, Mode::Pay("x"));
        h.select_account(Some("A".into())).await.unwrap();
        h.report_solve("easy").await.unwrap();
        // mutation queued right before the switch
        h.report_milestone(200).await.unwrap();
        h.select_account(Some("B".into())).await.unwrap();

        let snap = h.refresh().await.unwrap();
        assert_eq!(snap.stats, MiningStats::default());

        h.shutdown().await;
        task.await.unwrap();
        let a = repo.load(Some("A")).unwrap();
        assert_eq!(a.stats.pending_lamports, 50_000_000 + solve_reward("easy") + milestone_reward(200));
        assert_eq!(repo.load(Some("B")).unwrap().stats.pending_lamports, 0);
    }

    #[tokio::test]
    async fn reloading_same_account_is_idempotent() {
        let repo = seeded(&[("A", 70_000_000)]);
        let (h, _task) = start(&repo, Mode::Pay("x"));
        h.select_account(Some("A".into())).await.unwrap();
        let first = h.refresh().await.unwrap();
        h.select_account(Some("A".into())).await.unwrap();
        let second = h.refresh().await.unwrap();
        assert_eq!(first.stats, second.stats);
        assert_eq!(first.history, second.history);
    }

    #[tokio::test]
    async fn no_account_means_no_writes() {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(AccountRepository::new(store.clone(), "solminer"));
        let (h, task) = start(&repo, Mode::Pay("x"));
        h.report_solve("hard").await.unwrap();
        h.shutdown().await;
        task.await.unwrap();
        assert!(store.get("solminer_stats").unwrap().is_none());
    }

    #[tokio::test]
    async fn session_end_updates_summary() {
        let repo = seeded(&[]);
        let (h, _task) = start(&repo, Mode::Pay("x"));
        h.report_session_end(420).await.unwrap();
        h.report_session_end(180).await.unwrap();
        let s = h.refresh().await.unwrap().session;
        assert_eq!(s.sessions_played, 2);
        assert_eq!(s.best_score, 420);
        assert_eq!(s.last_score, Some(180));
    }

    #[tokio::test(start_paused = true)]
    async fn verify_goes_through_shared_gate() {
        let repo = seeded(&[]);
        let (h, _task) = start(&repo, Mode::Pay("x"));
        let other = h.clone();
        assert_eq!(h.verify("ab12", "AB12").await, Ok(Verification::Accepted));
        assert_eq!(other.verify("ab12", "AB12").await, Err(EngineError::RateLimited));
    }

    #[tokio::test(start_paused = true)]
    async fn second_withdrawal_is_refused_while_first_is_in_flight() {
        let repo = seeded(&[("A", 50_000_000)]);
        let (h, task) = start(&repo, Mode::Slow(Duration::from_secs(5), "only-once"));
        h.select_account(Some("A".into())).await.unwrap();

        let h2 = h.clone();
        let first = tokio::spawn(async move { h2.request_withdrawal().await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let err = h.request_withdrawal().await.unwrap_err();
        assert_eq!(err, EngineError::WithdrawalInFlight);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(h.refresh().await.unwrap().history.len(), 1);

        let rec = first.await.unwrap().unwrap();
        assert_eq!(rec.tx_hash, "only-once");
        let snap = h.refresh().await.unwrap();
        assert_eq!(snap.history.totals(), (1, 50_000_000, 0));
        assert_eq!(snap.stats.pending_lamports, 0);

        // settled: the account may withdraw again once it has earned enough
        assert!(matches!(h.request_withdrawal().await, Err(EngineError::BelowMinimum { .. })));
        h.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_block_survives_switching_back() {
        let repo = seeded(&[("A", 50_000_000)]);
        let (h, _task) = start(&repo, Mode::Slow(Duration::from_secs(5), "tx-a"));
        h.select_account(Some("A".into())).await.unwrap();

        let h2 = h.clone();
        let first = tokio::spawn(async move { h2.request_withdrawal().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.select_account(Some("B".into())).await.unwrap();
        h.select_account(Some("A".into())).await.unwrap();

        assert_eq!(h.request_withdrawal().await.unwrap_err(), EngineError::WithdrawalInFlight);
        assert_eq!(first.await.unwrap().unwrap().status, WithdrawalStatus::Completed);
        let snap = h.refresh().await.unwrap();
        assert_eq!(snap.stats.pending_lamports, 0);
        assert_eq!(snap.history.totals(), (1, 50_000_000, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_payout() {
        let repo = seeded(&[("A", 50_000_000)]);
        let (h, task) = start(&repo, Mode::Slow(Duration::from_secs(5), "late"));
        h.select_account(Some("A".into())).await.unwrap();

        let h2 = h.clone();
        let inflight = tokio::spawn(async move { h2.request_withdrawal().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.shutdown().await;

        let rec = inflight.await.unwrap().unwrap();
        assert_eq!(rec.status, WithdrawalStatus::Completed);
        task.await.unwrap();

        let stored = repo.load(Some("A")).unwrap();
        assert_eq!(stored.history.head().unwrap().status, WithdrawalStatus::Completed);
        assert_eq!(stored.history.head().unwrap().tx_hash, "late");
        assert_eq!(stored.stats.pending_lamports, 0);
        assert_eq!(h.toggle_active().await, Err(EngineError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_with_hanging_payout_ends_failed_after_timeout() {
        let repo = seeded(&[("A", 50_000_000)]);
        let (h, task) = start(&repo, Mode::Hang);
        h.select_account(Some("A".into())).await.unwrap();

        let h2 = h.clone();
        let inflight = tokio::spawn(async move { h2.request_withdrawal().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.shutdown().await;

        assert_eq!(inflight.await.unwrap().unwrap_err().kind(), ErrorKind::Network);
        task.await.unwrap();
        let stored = repo.load(Some("A")).unwrap();
        assert_eq!(stored.history.head().unwrap().status, WithdrawalStatus::Failed);
        assert_eq!(stored.stats.pending_lamports, 50_000_000);
    }

    /// Store whose writes take long enough for the writer task to overlap
    /// with the engine on another worker thread.
    struct SlowStore {
        inner: MemoryStore,
    }

    impl KvStore for SlowStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_micros(200));
            self.inner.set(key, value)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn switch_keeps_latest_state_under_parallel_writer() {
        for round in 0..25 {
            let store = Arc::new(SlowStore { inner: MemoryStore::new() });
            let repo = Arc::new(AccountRepository::new(store, "solminer"));
            let (h, task) = spawn_engine(repo.clone(), Arc::new(FakePayout { mode: Mode::Pay("x") }), EngineConfig::default());
            h.select_account(Some("A".into())).await.unwrap();

            for _ in 0..20 {
                h.report_solve("easy").await.unwrap();
            }
            h.select_account(Some("B".into())).await.unwrap();
            h.report_solve("hard").await.unwrap();
            h.shutdown().await;
            task.await.unwrap();

            let a = repo.load(Some("A")).unwrap().stats;
            assert_eq!(a.solve_count, 20, "round {round}");
            assert_eq!(a.pending_lamports, 20 * solve_reward("easy"), "round {round}");
            let b = repo.load(Some("B")).unwrap().stats;
            assert_eq!(b.solve_count, 1, "round {round}");
        }
    }

    #[tokio::test]
    async fn handle_reports_stopped_engine() {
        let repo = seeded(&[]);
        let (h, task) = start(&repo, Mode::Pay("x"));
        h.shutdown().await;
        task.await.unwrap();
        assert_eq!(h.toggle_active().await, Err(EngineError::Stopped));
    }
}
