//! Transaction context handed to applications
//!
//! A [`Transaction`] is the explicit context object of one global
//! transaction: callers enlist resources through it and finally commit or
//! roll it back. Completion is driven by the [`TwoPhaseCommitDriver`]; the
//! transaction only guards against concurrent or repeated completion and
//! runs synchronization callbacks around it.

use crate::branch::BranchState;
use crate::driver::TwoPhaseCommitDriver;
use crate::enlistment::ResourceEnlistmentManager;
use crate::error::{CoordinatorError, Result};
use crate::in_flight::InFlightTransactions;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tandem_common::{BranchHandle, EndFlag, TransactionId, XaResource, Xid};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Accepting enlistments
    Active,
    /// Will be rolled back whatever the caller asks for
    MarkedRollback,
    Preparing,
    Prepared,
    /// Commit decision is durable
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    /// Completed with a heuristic or unknown outcome
    Unknown,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack | TransactionStatus::Unknown
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Active => "active",
            TransactionStatus::MarkedRollback => "marked rollback",
            TransactionStatus::Preparing => "preparing",
            TransactionStatus::Prepared => "prepared",
            TransactionStatus::Committing => "committing",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RollingBack => "rolling back",
            TransactionStatus::RolledBack => "rolled back",
            TransactionStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Callbacks around transaction completion
pub trait Synchronization: Send + Sync {
    /// Runs before commit starts; an error dooms the transaction.
    fn before_completion(&self) -> std::result::Result<(), String>;

    /// Runs once the transaction reached its final status.
    fn after_completion(&self, status: TransactionStatus);
}

/// One global transaction
pub struct Transaction {
    id: TransactionId,
    status: Mutex<TransactionStatus>,
    rollback_reason: Mutex<Option<String>>,

    /// Set by the first commit or rollback call
    completing: AtomicBool,

    timeout: Duration,
    deadline: Instant,
    deadline_reported: AtomicBool,

    enlistment: AsyncMutex<ResourceEnlistmentManager>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,

    driver: Arc<TwoPhaseCommitDriver>,
    in_flight: Arc<InFlightTransactions>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        timeout: Duration,
        enlistment: ResourceEnlistmentManager,
        driver: Arc<TwoPhaseCommitDriver>,
        in_flight: Arc<InFlightTransactions>,
    ) -> Arc<Self> {
        let txn = Arc::new(Self {
            id,
            status: Mutex::new(TransactionStatus::Active),
            rollback_reason: Mutex::new(None),
            completing: AtomicBool::new(false),
            timeout,
            deadline: Instant::now() + timeout,
            deadline_reported: AtomicBool::new(false),
            enlistment: AsyncMutex::new(enlistment),
            synchronizations: Mutex::new(Vec::new()),
            driver,
            in_flight,
        });
        txn.in_flight.insert(&txn);
        txn
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_reason.lock().is_some()
    }

    /// Why the transaction was marked rollback-only, if it was.
    pub fn rollback_reason(&self) -> Option<String> {
        self.rollback_reason.lock().clone()
    }

    /// Doom the transaction; a later commit rolls it back instead.
    pub fn set_rollback_only(&self, reason: impl Into<String>) -> Result<()> {
        let status = self.status();
        if !matches!(
            status,
            TransactionStatus::Active | TransactionStatus::MarkedRollback
        ) {
            return Err(CoordinatorError::WrongState(format!(
                "cannot mark {} rollback-only while {}",
                self.id, status
            )));
        }
        self.mark_rollback_only(reason.into());
        Ok(())
    }

    pub fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> Result<()> {
        self.require_active("register a synchronization")?;
        self.synchronizations.lock().push(synchronization);
        Ok(())
    }

    /// Enlist the branch handle of a live resource instance.
    pub async fn enlist(&self, handle: BranchHandle) -> Result<()> {
        self.check_deadline();
        self.require_active("enlist")
            .map_err(|e| CoordinatorError::Enlistment(e.to_string()))?;
        self.enlistment.lock().await.enlist(handle).await
    }

    /// End the branch of a resource instance. Ending with `Fail` dooms the
    /// transaction.
    pub async fn delist(&self, resource: &Arc<dyn XaResource>, flag: EndFlag) -> Result<()> {
        self.enlistment.lock().await.delist(resource, flag).await?;
        if flag == EndFlag::Fail {
            self.mark_rollback_only(format!(
                "{} delisted with failure",
                resource.resource_manager()
            ));
        }
        Ok(())
    }

    /// Detach every active branch from the caller's work.
    pub async fn suspend(&self) -> Result<()> {
        self.require_active("suspend")?;
        self.enlistment.lock().await.suspend().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.require_active("resume")?;
        self.enlistment.lock().await.resume().await
    }

    /// Snapshot of the branches in enlistment order.
    pub async fn branch_states(&self) -> Vec<(String, Xid, BranchState)> {
        self.enlistment
            .lock()
            .await
            .all_resources()
            .iter()
            .map(|b| (b.unique_name().to_string(), *b.xid(), b.state().clone()))
            .collect()
    }

    /// Commit the transaction.
    ///
    /// Only the first completion call proceeds; any concurrent or later one
    /// fails immediately with a wrong-state error.
    pub async fn commit(&self) -> Result<()> {
        self.begin_completion()?;

        if Instant::now() >= self.deadline {
            self.mark_rollback_only(format!("timed out after {:?}", self.timeout));
        }

        let synchronizations = self.synchronizations.lock().clone();
        for synchronization in &synchronizations {
            if let Err(reason) = synchronization.before_completion() {
                tracing::warn!("Synchronization of {} failed: {}", self.id, reason);
                self.mark_rollback_only(format!("before completion failed: {}", reason));
            }
        }

        let result = self.driver.commit(self).await;
        self.end_completion(&synchronizations);
        result
    }

    /// Roll the transaction back.
    pub async fn rollback(&self) -> Result<()> {
        self.begin_completion()?;
        let synchronizations = self.synchronizations.lock().clone();
        let result = self.driver.rollback(self).await;
        self.end_completion(&synchronizations);
        result
    }

    fn begin_completion(&self) -> Result<()> {
        let status = self.status();
        if !matches!(
            status,
            TransactionStatus::Active | TransactionStatus::MarkedRollback
        ) {
            return Err(CoordinatorError::WrongState(format!(
                "transaction {} is {}",
                self.id, status
            )));
        }
        if self
            .completing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoordinatorError::WrongState(format!(
                "transaction {} is already completing",
                self.id
            )));
        }
        Ok(())
    }

    fn end_completion(&self, synchronizations: &[Arc<dyn Synchronization>]) {
        let status = self.status();
        for synchronization in synchronizations {
            synchronization.after_completion(status);
        }
        self.in_flight.remove(&self.id);
    }

    fn require_active(&self, action: &str) -> Result<()> {
        let status = self.status();
        if status != TransactionStatus::Active || self.completing.load(Ordering::Acquire) {
            return Err(CoordinatorError::WrongState(format!(
                "cannot {} in transaction {} while {}",
                action, self.id, status
            )));
        }
        Ok(())
    }

    fn mark_rollback_only(&self, reason: String) {
        {
            let mut current = self.rollback_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        let mut status = self.status.lock();
        if *status == TransactionStatus::Active {
            *status = TransactionStatus::MarkedRollback;
        }
    }

    pub(crate) fn set_status(&self, status: TransactionStatus) {
        let mut current = self.status.lock();
        tracing::debug!("Transaction {}: {} -> {}", self.id, *current, status);
        *current = status;
    }

    pub(crate) fn enlistment(&self) -> &AsyncMutex<ResourceEnlistmentManager> {
        &self.enlistment
    }

    /// Apply the overall timeout. Returns whether the deadline has passed.
    ///
    /// Before completion starts, expiry dooms the transaction; during a
    /// phase it is only reported.
    pub(crate) fn check_deadline(&self) -> bool {
        if Instant::now() < self.deadline {
            return false;
        }

        let status = self.status();
        if status == TransactionStatus::Active && !self.completing.load(Ordering::Acquire) {
            tracing::warn!(
                "Transaction {} timed out after {:?}, marking rollback-only",
                self.id,
                self.timeout
            );
            self.mark_rollback_only(format!("timed out after {:?}", self.timeout));
        } else if !status.is_terminal()
            && status != TransactionStatus::MarkedRollback
            && !self.deadline_reported.swap(true, Ordering::AcqRel)
        {
            tracing::warn!(
                "Transaction {} passed its deadline while {}, letting the phase finish",
                self.id,
                status
            );
        }
        true
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use tandem_common::{NodeId, ResourceProducer};
    use tandem_journal::MemoryJournal;
    use tandem_mock_resource::{MockProducer, MockResourceManager};

    struct Recorder {
        fail: bool,
        seen: Mutex<Vec<TransactionStatus>>,
    }

    impl Synchronization for Recorder {
        fn before_completion(&self) -> std::result::Result<(), String> {
            if self.fail {
                Err("validation failed".to_string())
            } else {
                Ok(())
            }
        }

        fn after_completion(&self, status: TransactionStatus) {
            self.seen.lock().push(status);
        }
    }

    fn transaction(timeout: Duration) -> (Arc<Transaction>, Arc<InFlightTransactions>) {
        let config = Arc::new(CoordinatorConfig::default());
        let driver = Arc::new(TwoPhaseCommitDriver::new(
            Arc::new(MemoryJournal::new()),
            config.clone(),
        ));
        let in_flight = Arc::new(InFlightTransactions::new());
        let id = TransactionId::new(5_000, 0, NodeId::new(1));
        let txn = Transaction::new(
            id,
            timeout,
            ResourceEnlistmentManager::new(id, config),
            driver,
            in_flight.clone(),
        );
        (txn, in_flight)
    }

    #[tokio::test]
    async fn test_commit_removes_from_in_flight() {
        let (txn, in_flight) = transaction(Duration::from_secs(60));
        assert!(in_flight.contains(&txn.id()));

        txn.commit().await.unwrap();
        assert_eq!(txn.status(), TransactionStatus::Committed);
        assert!(!in_flight.contains(&txn.id()));
    }

    #[tokio::test]
    async fn test_second_completion_fails() {
        let (txn, _) = transaction(Duration::from_secs(60));
        txn.commit().await.unwrap();

        assert!(matches!(
            txn.commit().await,
            Err(CoordinatorError::WrongState(_))
        ));
        assert!(matches!(
            txn.rollback().await,
            Err(CoordinatorError::WrongState(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_synchronization_dooms_commit() {
        let (txn, _) = transaction(Duration::from_secs(60));
        let recorder = Arc::new(Recorder {
            fail: true,
            seen: Mutex::new(Vec::new()),
        });
        txn.register_synchronization(recorder.clone()).unwrap();

        let result = txn.commit().await;
        assert!(matches!(result, Err(CoordinatorError::Rollback { .. })));
        assert_eq!(*recorder.seen.lock(), [TransactionStatus::RolledBack]);
    }

    #[tokio::test]
    async fn test_expired_transaction_is_marked_rollback_only() {
        let (txn, _) = transaction(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(txn.check_deadline());
        assert_eq!(txn.status(), TransactionStatus::MarkedRollback);
        assert!(txn.rollback_reason().unwrap().contains("timed out"));

        let producer = MockProducer::new("orders", MockResourceManager::new("db"));
        let connection = producer.connection();
        let handle = producer.find_branch_handle(&connection).unwrap();
        assert!(matches!(
            txn.enlist(handle).await,
            Err(CoordinatorError::Enlistment(_))
        ));
    }

    #[tokio::test]
    async fn test_set_rollback_only_after_completion_fails() {
        let (txn, _) = transaction(Duration::from_secs(60));
        txn.rollback().await.unwrap();
        assert!(txn.set_rollback_only("late").is_err());
    }
}
