//! Transaction manager: the service object applications talk to

use crate::config::CoordinatorConfig;
use crate::driver::TwoPhaseCommitDriver;
use crate::enlistment::ResourceEnlistmentManager;
use crate::error::{CoordinatorError, Result};
use crate::in_flight::InFlightTransactions;
use crate::recovery::{Recoverer, RecoveryReport};
use crate::registrar::ResourceRegistrar;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tandem_common::{IdGenerator, ResourceProducer, XaResource};
use tandem_journal::{DiskJournal, Journal};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Begins transactions, routes enlistments to the registrar, and owns the
/// journal, the recoverer and the background tasks.
pub struct TransactionManager {
    config: Arc<CoordinatorConfig>,
    ids: IdGenerator,
    journal: Arc<dyn Journal>,
    registrar: Arc<ResourceRegistrar>,
    in_flight: Arc<InFlightTransactions>,
    driver: Arc<TwoPhaseCommitDriver>,
    recoverer: Arc<Recoverer>,
    lifecycle: Mutex<Lifecycle>,

    /// Recovery loop and timeout watchdog
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionManager {
    pub fn new(
        config: CoordinatorConfig,
        journal: Arc<dyn Journal>,
        registrar: Arc<ResourceRegistrar>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let in_flight = Arc::new(InFlightTransactions::new());
        let driver = Arc::new(TwoPhaseCommitDriver::new(journal.clone(), config.clone()));
        let recoverer = Arc::new(Recoverer::new(
            config.clone(),
            journal.clone(),
            registrar.clone(),
            in_flight.clone(),
        ));

        Arc::new(Self {
            ids: IdGenerator::new(config.node()),
            config,
            journal,
            registrar,
            in_flight,
            driver,
            recoverer,
            lifecycle: Mutex::new(Lifecycle::NotStarted),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Create a manager journaling to the directory named in the config.
    pub fn with_disk_journal(
        config: CoordinatorConfig,
        registrar: Arc<ResourceRegistrar>,
    ) -> Result<Arc<Self>> {
        let journal = DiskJournal::open(config.journal.clone())?;
        Ok(Self::new(config, Arc::new(journal), registrar))
    }

    /// Run full recovery, then start the recovery loop and the timeout
    /// watchdog. Fails if the journal cannot be read; the manager is then
    /// back in its initial state.
    pub async fn start(self: &Arc<Self>) -> Result<RecoveryReport> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::NotStarted {
                return Err(CoordinatorError::WrongState(format!(
                    "manager cannot start while {:?}",
                    *lifecycle
                )));
            }
            *lifecycle = Lifecycle::Starting;
        }

        let report = match self.recover_on_start().await {
            Ok(report) => report,
            Err(e) => {
                self.registrar.detach_recoverer();
                let mut lifecycle = self.lifecycle.lock();
                if *lifecycle == Lifecycle::Starting {
                    *lifecycle = Lifecycle::NotStarted;
                }
                tracing::error!("Startup recovery failed: {}", e);
                return Err(e);
            }
        };

        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Starting {
                return Err(CoordinatorError::WrongState(format!(
                    "manager became {:?} while starting",
                    *lifecycle
                )));
            }
            let mut tasks = self.tasks.lock();
            tasks.push(self.spawn_recovery_loop());
            tasks.push(self.spawn_watchdog());
            *lifecycle = Lifecycle::Running;
        }

        tracing::info!(
            "Transaction manager {} started: {} recovered, {} unresolved",
            self.config.node_id,
            report.committed.len() + report.rolled_back.len(),
            report.unresolved().len()
        );
        Ok(report)
    }

    async fn recover_on_start(&self) -> Result<RecoveryReport> {
        for record in self.journal.collect_dangling_records()? {
            self.ids.observe(&record.txn_id);
        }
        self.registrar.attach_recoverer(&self.recoverer);
        self.recoverer.recover_all().await
    }

    fn spawn_recovery_loop(&self) -> JoinHandle<()> {
        let recoverer = self.recoverer.clone();
        let period = self.config.recovery_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; startup already recovered.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = recoverer.recover_due().await {
                    tracing::error!("Background recovery failed: {}", e);
                }
            }
        })
    }

    fn spawn_watchdog(&self) -> JoinHandle<()> {
        let in_flight = self.in_flight.clone();
        let period = self.config.timeout_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for txn in in_flight.live() {
                    txn.check_deadline();
                }
            }
        })
    }

    pub fn begin(&self) -> Result<Arc<Transaction>> {
        self.begin_with_timeout(self.config.default_transaction_timeout)
    }

    pub fn begin_with_timeout(&self, timeout: Duration) -> Result<Arc<Transaction>> {
        let lifecycle = *self.lifecycle.lock();
        if lifecycle != Lifecycle::Running {
            return Err(CoordinatorError::WrongState(format!(
                "cannot begin a transaction while {:?}",
                lifecycle
            )));
        }

        let id = self.ids.next_id();
        let enlistment = ResourceEnlistmentManager::new(id, self.config.clone());
        let txn = Transaction::new(
            id,
            timeout,
            enlistment,
            self.driver.clone(),
            self.in_flight.clone(),
        );
        tracing::debug!("Began transaction {} (timeout {:?})", id, timeout);
        Ok(txn)
    }

    /// Enlist a live resource instance handed out by a registered producer.
    pub async fn enlist(&self, txn: &Transaction, resource: &Arc<dyn XaResource>) -> Result<()> {
        let handle = self.registrar.find_branch_handle(resource).ok_or_else(|| {
            CoordinatorError::InvalidResource(format!(
                "resource of {} does not belong to a registered producer",
                resource.resource_manager()
            ))
        })?;
        txn.enlist(handle).await
    }

    pub async fn commit(&self, txn: &Transaction) -> Result<()> {
        let result = txn.commit().await;
        self.maybe_rotate_journal().await;
        result
    }

    pub async fn rollback(&self, txn: &Transaction) -> Result<()> {
        let result = txn.rollback().await;
        self.maybe_rotate_journal().await;
        result
    }

    /// Compact the journal once the active segment passes its threshold.
    async fn maybe_rotate_journal(&self) {
        if !self.journal.needs_rotation() {
            return;
        }
        if let Err(e) = self.recoverer.recover_all().await {
            tracing::warn!("Recovery before journal rotation failed: {}", e);
            return;
        }
        if let Err(e) = self.journal.rotate() {
            tracing::error!("Journal rotation failed: {}", e);
        }
    }

    /// Register a producer; while running, its in-doubt branches are
    /// recovered first.
    pub async fn register_resource(&self, producer: Arc<dyn ResourceProducer>) -> Result<()> {
        self.registrar.register(producer).await
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.live().len()
    }

    pub fn registrar(&self) -> &Arc<ResourceRegistrar> {
        &self.registrar
    }

    pub fn recoverer(&self) -> &Arc<Recoverer> {
        &self.recoverer
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Stop accepting transactions, wait for in-flight ones up to the
    /// graceful interval, stop background tasks and close the journal.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Stopped | Lifecycle::ShuttingDown => return Ok(()),
                _ => *lifecycle = Lifecycle::ShuttingDown,
            }
        }

        let deadline = Instant::now() + self.config.graceful_shutdown_interval;
        while !self.in_flight.live().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.in_flight.live().len();
        if remaining > 0 {
            tracing::warn!(
                "Shutting down with {} transactions still in flight",
                remaining
            );
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        self.registrar.detach_recoverer();
        let closed = self.journal.close();
        *self.lifecycle.lock() = Lifecycle::Stopped;
        tracing::info!("Transaction manager {} stopped", self.config.node_id);
        closed.map_err(CoordinatorError::from)
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
