//! Crash recovery
//!
//! A recovery pass reconciles the journal with what resource managers still
//! hold in doubt. For every registered producer it lists the prepared
//! branches, delivers the journaled decision (commit when a "committing"
//! record exists, rollback otherwise), and finally journals which resources
//! no longer hold anything for each dangling transaction.
//!
//! Producers are isolated from each other: a failing scan only delays the
//! resolution of that producer's branches and puts it on its own backoff
//! schedule.

mod report;

pub use report::{Decision, HeuristicBranch, RecoveryReport};

use crate::branch::{BranchFailure, bounded};
use crate::config::CoordinatorConfig;
use crate::driver::heuristic_of;
use crate::error::{CoordinatorError, Result};
use crate::in_flight::InFlightTransactions;
use crate::registrar::ResourceRegistrar;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tandem_common::{
    HeuristicOutcome, NodeId, ResourceProducer, TransactionId, XaError, XaResource, Xid,
};
use tandem_journal::{Journal, JournalRecord, RecordStatus};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

/// Longest backoff, in recovery intervals
const MAX_BACKOFF_INTERVALS: u32 = 10;

struct ProducerHealth {
    failures: u32,
    retry_at: Instant,
}

/// What happened to one in-doubt branch
enum Delivery {
    /// The decision was applied by this pass
    Applied,
    /// The resource manager had already completed the branch
    AlreadyResolved,
    Heuristic(HeuristicOutcome),
    Failed(String),
}

/// Result of scanning one producer
struct Scan {
    /// Dangling transactions this producer still holds branches of
    held: BTreeSet<TransactionId>,
}

pub struct Recoverer {
    node_id: NodeId,
    journal: Arc<dyn Journal>,
    registrar: Arc<ResourceRegistrar>,
    in_flight: Arc<InFlightTransactions>,
    config: Arc<CoordinatorConfig>,

    /// Serializes passes
    pass_lock: AsyncMutex<()>,

    health: Mutex<HashMap<String, ProducerHealth>>,

    /// Heuristic branches waiting for an operator, by (producer, xid)
    heuristics: Mutex<BTreeMap<(String, Xid), HeuristicBranch>>,
}

impl Recoverer {
    pub fn new(
        config: Arc<CoordinatorConfig>,
        journal: Arc<dyn Journal>,
        registrar: Arc<ResourceRegistrar>,
        in_flight: Arc<InFlightTransactions>,
    ) -> Self {
        Self {
            node_id: config.node(),
            journal,
            registrar,
            in_flight,
            config,
            pass_lock: AsyncMutex::new(()),
            health: Mutex::new(HashMap::new()),
            heuristics: Mutex::new(BTreeMap::new()),
        }
    }

    /// Recover every registered producer, ignoring backoff.
    pub async fn recover_all(&self) -> Result<RecoveryReport> {
        let producers = self.registrar.producers();
        self.run_pass(producers).await
    }

    /// Recover the producers whose retry deadline has passed.
    pub async fn recover_due(&self) -> Result<RecoveryReport> {
        let now = Instant::now();
        let producers: Vec<_> = {
            let health = self.health.lock();
            self.registrar
                .producers()
                .into_iter()
                .filter(|p| {
                    health
                        .get(p.unique_name())
                        .is_none_or(|h| h.retry_at <= now)
                })
                .collect()
        };
        self.run_pass(producers).await
    }

    /// Incremental recovery of a single producer.
    pub async fn recover_producer(
        &self,
        producer: Arc<dyn ResourceProducer>,
    ) -> Result<RecoveryReport> {
        let name = producer.unique_name().to_string();
        let report = self.run_pass(vec![producer]).await?;
        if let Some(reason) = report.failed.get(&name) {
            return Err(CoordinatorError::Recovery {
                producer: name,
                reason: reason.clone(),
            });
        }
        Ok(report)
    }

    /// Heuristic branches waiting for [`forget`](Self::forget).
    pub fn heuristic_branches(&self) -> Vec<HeuristicBranch> {
        self.heuristics.lock().values().cloned().collect()
    }

    /// Operator action: tell the resource manager to discard a heuristic
    /// branch, and let recovery finish its transaction.
    pub async fn forget(&self, producer_name: &str, xid: Xid) -> Result<()> {
        let producer = self
            .registrar
            .get(producer_name)
            .ok_or_else(|| CoordinatorError::NotRegistered(producer_name.to_string()))?;
        let _pass = self.pass_lock.lock().await;
        let timeout = self.config.branch_timeout(producer_name);

        let resource = bounded(timeout, producer.start_recovery())
            .await
            .map_err(|e| CoordinatorError::Recovery {
                producer: producer_name.to_string(),
                reason: format!("cannot start recovery: {}", e),
            })?;
        let result = bounded(timeout, resource.forget(&xid)).await;
        self.end_recovery(producer.as_ref(), timeout).await;

        match result {
            Ok(()) | Err(BranchFailure::Xa(XaError::NotFound)) => {
                self.heuristics
                    .lock()
                    .remove(&(producer_name.to_string(), xid));
                tracing::info!("Forgot heuristic branch {} on {}", xid, producer_name);
                Ok(())
            }
            Err(e) => Err(CoordinatorError::Recovery {
                producer: producer_name.to_string(),
                reason: format!("cannot forget {}: {}", xid, e),
            }),
        }
    }

    async fn run_pass(&self, producers: Vec<Arc<dyn ResourceProducer>>) -> Result<RecoveryReport> {
        let _pass = self.pass_lock.lock().await;
        let mut report = RecoveryReport::default();

        let dangling: BTreeMap<TransactionId, JournalRecord> = self
            .journal
            .collect_dangling_records()?
            .filter(|record| !self.in_flight.contains(&record.txn_id))
            .map(|record| (record.txn_id, record))
            .collect();

        let mut resolved: BTreeMap<TransactionId, BTreeSet<String>> = BTreeMap::new();

        for producer in producers {
            let name = producer.unique_name().to_string();
            match self.recover_one(producer.as_ref(), &dangling, &mut report).await {
                Ok(scan) => {
                    for record in dangling.values() {
                        if record.unique_names.contains(&name) && !scan.held.contains(&record.txn_id) {
                            resolved
                                .entry(record.txn_id)
                                .or_default()
                                .insert(name.clone());
                        }
                    }
                    self.health.lock().remove(&name);
                }
                Err(reason) => {
                    let delay = self.back_off(&name);
                    tracing::warn!(
                        "Recovery of {} failed, retrying in {:?}: {}",
                        name,
                        delay,
                        reason
                    );
                    report.failed.insert(name, reason);
                }
            }
        }

        for (txn_id, names) in &resolved {
            self.journal.log(RecordStatus::Done, *txn_id, names)?;

            let record = &dangling[txn_id];
            if record.unique_names.is_subset(names)
                && !report.committed.contains(txn_id)
                && !report.rolled_back.contains(txn_id)
            {
                report.finalized.insert(*txn_id);
            }
        }

        report.unresolved = self
            .journal
            .collect_dangling_records()?
            .map(|record| record.txn_id)
            .filter(|id| !self.in_flight.contains(id))
            .collect();

        if !report.committed.is_empty()
            || !report.rolled_back.is_empty()
            || !report.heuristics.is_empty()
            || !report.failed.is_empty()
        {
            tracing::info!(
                "Recovery pass: {} committed, {} rolled back, {} finalized, {} heuristic, {} producers failed, {} unresolved",
                report.committed.len(),
                report.rolled_back.len(),
                report.finalized.len(),
                report.heuristics.len(),
                report.failed.len(),
                report.unresolved.len()
            );
        } else {
            tracing::debug!(
                "Recovery pass: {} finalized, {} unresolved",
                report.finalized.len(),
                report.unresolved.len()
            );
        }

        Ok(report)
    }

    /// Scan one producer. `end_recovery` runs whenever `start_recovery` succeeded.
    async fn recover_one(
        &self,
        producer: &dyn ResourceProducer,
        dangling: &BTreeMap<TransactionId, JournalRecord>,
        report: &mut RecoveryReport,
    ) -> std::result::Result<Scan, String> {
        let timeout = self.config.branch_timeout(producer.unique_name());
        let resource = bounded(timeout, producer.start_recovery())
            .await
            .map_err(|e| format!("cannot start recovery: {}", e))?;

        let result = self
            .scan(producer.unique_name(), resource.as_ref(), timeout, dangling, report)
            .await;
        self.end_recovery(producer, timeout).await;
        result
    }

    async fn scan(
        &self,
        name: &str,
        resource: &dyn XaResource,
        timeout: Duration,
        dangling: &BTreeMap<TransactionId, JournalRecord>,
        report: &mut RecoveryReport,
    ) -> std::result::Result<Scan, String> {
        let xids = bounded(timeout, resource.recover())
            .await
            .map_err(|e| format!("recover scan failed: {}", e))?;

        let mut held = BTreeSet::new();
        let mut in_doubt = Vec::new();

        for xid in xids {
            if !xid.belongs_to(self.node_id) {
                continue;
            }
            let txn_id = xid.global_id();
            if self.in_flight.contains(&txn_id)
                || self.heuristics.lock().contains_key(&(name.to_string(), xid))
            {
                held.insert(txn_id);
                continue;
            }
            in_doubt.push(xid);
        }

        // A transaction may have completed after the pass read the journal.
        // Its decision is durable by the time it leaves the in-flight set, so
        // reading again after the checks above cannot miss it.
        let mut late: Option<BTreeMap<TransactionId, JournalRecord>> = None;
        if in_doubt.iter().any(|xid| !dangling.contains_key(&xid.global_id())) {
            let records = self
                .journal
                .collect_dangling_records()
                .map_err(|e| format!("cannot read journal: {}", e))?;
            late = Some(records.map(|record| (record.txn_id, record)).collect());
        }

        let mut failure = None;
        for xid in in_doubt {
            let txn_id = xid.global_id();
            let record = dangling
                .get(&txn_id)
                .or_else(|| late.as_ref().and_then(|records| records.get(&txn_id)));
            let decision = match record {
                Some(record) if record.status == RecordStatus::Committing => Decision::Commit,
                _ => Decision::Rollback,
            };

            match self.deliver(resource, xid, decision, timeout).await {
                Delivery::Applied => {
                    tracing::info!("Recovered branch {} on {}: {}", xid, name, decision);
                    match decision {
                        Decision::Commit => report.committed.insert(txn_id),
                        Decision::Rollback => report.rolled_back.insert(txn_id),
                    };
                }
                Delivery::AlreadyResolved => {
                    tracing::debug!("Branch {} on {} was already resolved", xid, name);
                }
                Delivery::Heuristic(outcome) => {
                    let branch = HeuristicBranch {
                        producer: name.to_string(),
                        xid,
                        decision,
                        outcome,
                    };
                    tracing::error!("Heuristic branch needs an operator: {}", branch);
                    self.heuristics
                        .lock()
                        .insert((name.to_string(), xid), branch.clone());
                    report.heuristics.push(branch);
                    held.insert(txn_id);
                }
                Delivery::Failed(reason) => {
                    held.insert(txn_id);
                    failure.get_or_insert(format!("{} of {} failed: {}", decision, xid, reason));
                }
            }
        }

        match failure {
            Some(reason) => Err(reason),
            None => Ok(Scan { held }),
        }
    }

    async fn deliver(
        &self,
        resource: &dyn XaResource,
        xid: Xid,
        decision: Decision,
        timeout: Duration,
    ) -> Delivery {
        let result = match decision {
            Decision::Commit => bounded(timeout, resource.commit(&xid, false)).await,
            Decision::Rollback => bounded(timeout, resource.rollback(&xid)).await,
        };

        let failure = match result {
            Ok(()) => return Delivery::Applied,
            Err(failure) => failure,
        };

        match (&failure, decision) {
            (BranchFailure::Xa(XaError::NotFound), _) => return Delivery::AlreadyResolved,
            (BranchFailure::Xa(XaError::RolledBack(_)), Decision::Rollback) => {
                return Delivery::Applied;
            }
            (BranchFailure::Xa(XaError::RolledBack(_)), Decision::Commit) => {
                return Delivery::Heuristic(HeuristicOutcome::Rollback);
            }
            _ => {}
        }

        match heuristic_of(&failure) {
            Some(outcome) if agrees(outcome, decision) => {
                match bounded(timeout, resource.forget(&xid)).await {
                    Ok(()) | Err(BranchFailure::Xa(XaError::NotFound)) => Delivery::Applied,
                    Err(e) => Delivery::Failed(format!("cannot forget {}: {}", outcome, e)),
                }
            }
            Some(outcome) => Delivery::Heuristic(outcome),
            None => Delivery::Failed(failure.to_string()),
        }
    }

    async fn end_recovery(&self, producer: &dyn ResourceProducer, timeout: Duration) {
        if let Err(e) = bounded(timeout, producer.end_recovery()).await {
            tracing::warn!("Cannot end recovery of {}: {}", producer.unique_name(), e);
        }
    }

    /// Record a failure and return the delay before the next attempt.
    fn back_off(&self, name: &str) -> Duration {
        let interval = self.config.recovery_interval;
        let mut health = self.health.lock();
        let entry = health.entry(name.to_string()).or_insert(ProducerHealth {
            failures: 0,
            retry_at: Instant::now(),
        });
        entry.failures += 1;

        let exponent = (entry.failures - 1).min(16);
        let delay = interval
            .saturating_mul(1u32 << exponent)
            .min(interval.saturating_mul(MAX_BACKOFF_INTERVALS));
        entry.retry_at = Instant::now() + delay;
        delay
    }
}

fn agrees(outcome: HeuristicOutcome, decision: Decision) -> bool {
    matches!(
        (outcome, decision),
        (HeuristicOutcome::Commit, Decision::Commit) | (HeuristicOutcome::Rollback, Decision::Rollback)
    )
}
