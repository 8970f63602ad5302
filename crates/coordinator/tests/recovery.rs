//! Crash recovery against scripted resource managers and an on-disk journal

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_common::{BranchQualifier, HeuristicOutcome, NodeId, TransactionId, XaError, Xid};
use tandem_coordinator::{
    CoordinatorConfig, CoordinatorError, Decision, ResourceRegistrar, RetryPolicy,
    TransactionManager,
};
use tandem_journal::{DiskJournal, Journal, JournalConfig, MemoryJournal, RecordStatus};
use tandem_mock_resource::{Behaviour, BranchStatus, MockProducer, MockResourceManager, Operation};
use tokio::sync::Notify;
use uuid::Uuid;

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        branch_call_timeout: Duration::from_millis(500),
        commit_retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        },
        recovery_interval: Duration::from_secs(3600),
        graceful_shutdown_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

fn temp_dir() -> PathBuf {
    env::temp_dir().join(format!("tandem-recovery-{}", Uuid::new_v4()))
}

fn names(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// A transaction id as this coordinator would have generated it.
fn txn_id(config: &CoordinatorConfig, sequence: u32) -> TransactionId {
    TransactionId::new(1_700_000_000_000_000, sequence, config.node())
}

fn xid(txn_id: TransactionId, branch: u32) -> Xid {
    Xid::new(txn_id, BranchQualifier::new(branch))
}

async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

async fn manager_with(
    config: CoordinatorConfig,
    journal: Arc<dyn Journal>,
    producers: &[&Arc<MockProducer>],
) -> Arc<TransactionManager> {
    let registrar = Arc::new(ResourceRegistrar::new());
    for producer in producers {
        registrar.register((*producer).clone()).await.unwrap();
    }
    TransactionManager::new(config, journal, registrar)
}

#[tokio::test]
async fn test_decision_is_replayed_after_restart() {
    let dir = temp_dir();
    let config = CoordinatorConfig {
        journal: JournalConfig::new(dir.clone()),
        ..test_config()
    };
    let id = txn_id(&config, 7);
    let (xid_a, xid_b) = (xid(id, 1), xid(id, 2));

    // The process died after journaling the decision, before any commit.
    {
        let journal = DiskJournal::open(config.journal.clone()).unwrap();
        journal
            .log(RecordStatus::Committing, id, &names(&["a", "b"]))
            .unwrap();
    }
    let rm_a = MockResourceManager::new("a");
    let rm_b = MockResourceManager::new("b");
    rm_a.seed(xid_a, BranchStatus::Prepared);
    rm_b.seed(xid_b, BranchStatus::Prepared);
    rm_a.script(
        Operation::Commit,
        Behaviour::Fail(XaError::Unavailable("connection reset".to_string())),
    );

    let a = Arc::new(MockProducer::new("a", rm_a.clone()));
    let b = Arc::new(MockProducer::new("b", rm_b.clone()));
    let registrar = Arc::new(ResourceRegistrar::new());
    registrar.register(a.clone()).await.unwrap();
    registrar.register(b.clone()).await.unwrap();
    let manager = TransactionManager::with_disk_journal(config.clone(), registrar).unwrap();

    let report = manager.start().await.unwrap();
    assert!(report.failed.contains_key("a"));
    assert!(report.committed.contains(&id));
    assert!(report.unresolved().contains(&id));
    assert_eq!(rm_b.committed(), [xid_b]);
    assert!(rm_a.committed().is_empty());

    let report = manager.recoverer().recover_all().await.unwrap();
    assert!(report.committed.contains(&id));
    assert!(report.is_clean());
    assert_eq!(rm_a.committed(), [xid_a]);
    assert_eq!(rm_a.commit_calls(), 2);
    assert_eq!(rm_b.commit_calls(), 1);

    let report = manager.recoverer().recover_all().await.unwrap();
    assert!(report.committed.is_empty());
    assert_eq!(rm_a.commit_calls(), 2);
    manager.shutdown().await.unwrap();

    let reopened = DiskJournal::open(config.journal.clone()).unwrap();
    assert_eq!(reopened.collect_dangling_records().unwrap().count(), 0);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_failed_commit_finishes_after_restart() {
    let dir = temp_dir();
    let config = CoordinatorConfig {
        journal: JournalConfig::new(dir.clone()),
        ..test_config()
    };
    let rm = MockResourceManager::new("orders");
    rm.script_times(
        Operation::Commit,
        Behaviour::Fail(XaError::Unavailable("network partition".to_string())),
        3,
    );

    let id = {
        let producer = Arc::new(MockProducer::new("orders", rm.clone()));
        let registrar = Arc::new(ResourceRegistrar::new());
        registrar.register(producer.clone()).await.unwrap();
        let manager = TransactionManager::with_disk_journal(config.clone(), registrar).unwrap();
        manager.start().await.unwrap();

        let txn = manager.begin().unwrap();
        manager.enlist(&txn, &producer.connection()).await.unwrap();
        let result = manager.commit(&txn).await;
        assert!(matches!(result, Err(CoordinatorError::HeuristicMixed { .. })));
        assert_eq!(rm.in_doubt().len(), 1);
        manager.shutdown().await.unwrap();
        txn.id()
    };

    let producer = Arc::new(MockProducer::new("orders", rm.clone()));
    let registrar = Arc::new(ResourceRegistrar::new());
    registrar.register(producer).await.unwrap();
    let manager = TransactionManager::with_disk_journal(config, registrar).unwrap();
    let report = manager.start().await.unwrap();

    assert!(report.committed.contains(&id));
    assert!(report.is_clean());
    assert_eq!(rm.committed().len(), 1);
    assert_eq!(rm.commit_calls(), 4);

    // New ids sort after the journaled one.
    let txn = manager.begin().unwrap();
    assert!(txn.id() > id);
    manager.shutdown().await.unwrap();

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_recovery_over_done_records_changes_nothing() {
    let config = test_config();
    let id = txn_id(&config, 1);
    let journal = Arc::new(MemoryJournal::new());
    journal
        .log(RecordStatus::Committing, id, &names(&["a"]))
        .unwrap();
    journal.log(RecordStatus::Done, id, &names(&["a"])).unwrap();

    let rm = MockResourceManager::new("a");
    let producer = Arc::new(MockProducer::new("a", rm.clone()));
    let manager = manager_with(config, journal.clone(), &[&producer]).await;

    let first = manager.start().await.unwrap();
    let second = manager.recoverer().recover_all().await.unwrap();

    for report in [first, second] {
        assert!(report.is_clean());
        assert!(report.committed.is_empty());
        assert!(report.rolled_back.is_empty());
        assert!(report.finalized.is_empty());
    }
    assert_eq!(journal.records().len(), 2);
    assert_eq!(rm.commit_calls(), 0);
    assert_eq!(rm.rollback_calls(), 0);
}

#[tokio::test]
async fn test_presumed_abort_ignores_foreign_xids() {
    let config = test_config();
    let ours = xid(txn_id(&config, 3), 1);
    let other_node = xid(TransactionId::new(1_700_000_000_000_000, 3, NodeId::new(99)), 1);
    let foreign = Xid::with_format(0x0123, txn_id(&config, 4), BranchQualifier::new(1));

    let rm = MockResourceManager::new("a");
    for xid in [ours, other_node, foreign] {
        rm.seed(xid, BranchStatus::Prepared);
    }
    let producer = Arc::new(MockProducer::new("a", rm.clone()));
    let manager = manager_with(config, Arc::new(MemoryJournal::new()), &[&producer]).await;

    let report = manager.start().await.unwrap();

    assert!(report.rolled_back.contains(&ours.global_id()));
    assert_eq!(rm.rolled_back(), [ours]);
    assert_eq!(rm.status(&other_node), Some(BranchStatus::Prepared));
    assert_eq!(rm.status(&foreign), Some(BranchStatus::Prepared));
}

#[tokio::test]
async fn test_already_resolved_branches_are_finalized() {
    let config = test_config();
    let id = txn_id(&config, 5);
    let journal = Arc::new(MemoryJournal::new());
    journal
        .log(RecordStatus::Committing, id, &names(&["a"]))
        .unwrap();

    let rm = MockResourceManager::new("a");
    let producer = Arc::new(MockProducer::new("a", rm.clone()));
    let manager = manager_with(config, journal.clone(), &[&producer]).await;

    let report = manager.start().await.unwrap();
    assert!(report.finalized.contains(&id));
    assert!(report.is_clean());
    assert_eq!(rm.commit_calls(), 0);
    assert_eq!(journal.records().last().unwrap().status, RecordStatus::Done);
}

#[tokio::test]
async fn test_late_registration_recovers_its_branches() {
    let config = test_config();
    let id = txn_id(&config, 9);
    let journal = Arc::new(MemoryJournal::new());
    journal
        .log(RecordStatus::Committing, id, &names(&["a", "b"]))
        .unwrap();

    let rm_b = MockResourceManager::new("b");
    rm_b.seed(xid(id, 2), BranchStatus::Prepared);
    let a = Arc::new(MockProducer::new("a", MockResourceManager::new("a")));
    let manager = manager_with(config, journal.clone(), &[&a]).await;

    let report = manager.start().await.unwrap();
    assert!(report.unresolved().contains(&id));
    let dangling: Vec<_> = journal.collect_dangling_records().unwrap().collect();
    assert_eq!(dangling[0].unique_names, names(&["b"]));

    let b = Arc::new(MockProducer::new("b", rm_b.clone()));
    manager.register_resource(b).await.unwrap();

    assert_eq!(rm_b.committed(), [xid(id, 2)]);
    assert_eq!(journal.collect_dangling_records().unwrap().count(), 0);
}

#[tokio::test]
async fn test_registration_fails_when_recovery_fails() {
    let manager = manager_with(test_config(), Arc::new(MemoryJournal::new()), &[]).await;
    manager.start().await.unwrap();

    let producer = Arc::new(MockProducer::new("flaky", MockResourceManager::new("flaky")));
    producer.fail_recovery(Some(XaError::Unavailable("down".to_string())));

    let result = manager.register_resource(producer.clone()).await;
    assert!(matches!(result, Err(CoordinatorError::Recovery { ref producer, .. }) if producer == "flaky"));
    assert!(manager.registrar().get("flaky").is_none());

    producer.fail_recovery(None);
    manager.register_resource(producer.clone()).await.unwrap();
    assert!(manager.registrar().get("flaky").is_some());
    assert_eq!(producer.recoveries_started(), 2);
    assert_eq!(producer.recoveries_ended(), 1);
}

#[tokio::test]
async fn test_failing_producer_does_not_block_others() {
    let config = test_config();
    let id = txn_id(&config, 11);
    let journal = Arc::new(MemoryJournal::new());
    journal
        .log(RecordStatus::Committing, id, &names(&["a", "b"]))
        .unwrap();

    let rm_a = MockResourceManager::new("a");
    let rm_b = MockResourceManager::new("b");
    rm_a.seed(xid(id, 1), BranchStatus::Prepared);
    rm_b.seed(xid(id, 2), BranchStatus::Prepared);
    rm_a.script(
        Operation::Recover,
        Behaviour::Fail(XaError::Unavailable("down".to_string())),
    );

    let a = Arc::new(MockProducer::new("a", rm_a.clone()));
    let b = Arc::new(MockProducer::new("b", rm_b.clone()));
    let manager = manager_with(config, journal.clone(), &[&a, &b]).await;

    let report = manager.start().await.unwrap();
    assert!(report.failed.contains_key("a"));
    assert_eq!(rm_b.committed(), [xid(id, 2)]);
    assert!(report.unresolved().contains(&id));
    assert_eq!(a.recoveries_ended(), 1);

    // "a" is backing off for a whole recovery interval.
    manager.recoverer().recover_due().await.unwrap();
    assert_eq!(rm_a.count(Operation::Recover), 1);

    let report = manager.recoverer().recover_all().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(rm_a.committed(), [xid(id, 1)]);
}

#[tokio::test]
async fn test_mismatching_heuristic_waits_for_forget() {
    let config = test_config();
    let id = txn_id(&config, 13);
    let branch = xid(id, 1);
    let journal = Arc::new(MemoryJournal::new());
    journal
        .log(RecordStatus::Committing, id, &names(&["a"]))
        .unwrap();

    let rm = MockResourceManager::new("a");
    rm.seed(branch, BranchStatus::Heuristic(HeuristicOutcome::Rollback));
    let producer = Arc::new(MockProducer::new("a", rm.clone()));
    let manager = manager_with(config, journal.clone(), &[&producer]).await;

    let report = manager.start().await.unwrap();
    assert_eq!(report.heuristics.len(), 1);
    let heuristic = &report.heuristics[0];
    assert_eq!(heuristic.xid, branch);
    assert_eq!(heuristic.decision, Decision::Commit);
    assert_eq!(heuristic.outcome, HeuristicOutcome::Rollback);
    assert!(report.unresolved().contains(&id));

    let report = manager.recoverer().recover_all().await.unwrap();
    assert!(report.heuristics.is_empty());
    assert!(report.unresolved().contains(&id));
    assert_eq!(rm.commit_calls(), 1);
    assert_eq!(manager.recoverer().heuristic_branches().len(), 1);

    manager.recoverer().forget("a", branch).await.unwrap();
    assert_eq!(rm.status(&branch), None);
    assert!(manager.recoverer().heuristic_branches().is_empty());

    let report = manager.recoverer().recover_all().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(journal.collect_dangling_records().unwrap().count(), 0);
}

#[tokio::test]
async fn test_matching_heuristic_is_forgotten() {
    let config = test_config();
    let id = txn_id(&config, 15);
    let branch = xid(id, 1);
    let journal = Arc::new(MemoryJournal::new());
    journal
        .log(RecordStatus::Committing, id, &names(&["a"]))
        .unwrap();

    let rm = MockResourceManager::new("a");
    rm.seed(branch, BranchStatus::Heuristic(HeuristicOutcome::Commit));
    let producer = Arc::new(MockProducer::new("a", rm.clone()));
    let manager = manager_with(config, journal.clone(), &[&producer]).await;

    let report = manager.start().await.unwrap();
    assert!(report.is_clean());
    assert!(report.committed.contains(&id));
    assert_eq!(rm.count(Operation::Forget), 1);
    assert_eq!(rm.status(&branch), None);
}

#[tokio::test]
async fn test_rotation_keeps_journal_bounded() {
    let dir = temp_dir();
    let mut journal = JournalConfig::new(dir.clone()).with_segment_capacity(4096);
    journal.rotation_threshold = 0.5;
    let config = CoordinatorConfig {
        journal,
        ..test_config()
    };

    let rm = MockResourceManager::new("orders");
    let producer = Arc::new(MockProducer::new("orders", rm.clone()));
    let registrar = Arc::new(ResourceRegistrar::new());
    registrar.register(producer.clone()).await.unwrap();
    let manager = TransactionManager::with_disk_journal(config.clone(), registrar).unwrap();
    manager.start().await.unwrap();

    for _ in 0..100 {
        let txn = manager.begin().unwrap();
        manager.enlist(&txn, &producer.connection()).await.unwrap();
        manager.commit(&txn).await.unwrap();
    }
    manager.shutdown().await.unwrap();

    assert_eq!(rm.committed().len(), 100);
    let reopened = DiskJournal::open(config.journal.clone()).unwrap();
    assert_eq!(reopened.collect_dangling_records().unwrap().count(), 0);
    for entry in std::fs::read_dir(&dir).unwrap() {
        let len = entry.unwrap().metadata().unwrap().len();
        assert!(len <= 4096);
    }

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_pass_overlapping_a_commit_keeps_its_decision() {
    let config = CoordinatorConfig {
        commit_retry: RetryPolicy {
            max_attempts: 1,
            ..test_config().commit_retry
        },
        ..test_config()
    };
    let journal = Arc::new(MemoryJournal::new());
    let rm_a = MockResourceManager::new("a");
    let rm_b = MockResourceManager::new("b");
    let a = Arc::new(MockProducer::new("a", rm_a.clone()));
    let b = Arc::new(MockProducer::new("b", rm_b.clone()));
    let manager = manager_with(config, journal.clone(), &[&a, &b]).await;
    manager.start().await.unwrap();
    assert_eq!(rm_a.count(Operation::Recover), 1);

    // Stall the next pass after it has read the journal.
    let gate = Arc::new(Notify::new());
    rm_a.script(Operation::Recover, Behaviour::Gate(gate.clone()));
    let pass = {
        let recoverer = manager.recoverer().clone();
        tokio::spawn(async move { recoverer.recover_all().await })
    };
    wait_until(|| rm_a.count(Operation::Recover) == 2).await;

    rm_a.script(
        Operation::Commit,
        Behaviour::Fail(XaError::Unavailable("connection reset".to_string())),
    );
    let txn = manager.begin().unwrap();
    manager.enlist(&txn, &a.connection()).await.unwrap();
    manager.enlist(&txn, &b.connection()).await.unwrap();
    let result = manager.commit(&txn).await;
    assert!(matches!(result, Err(CoordinatorError::HeuristicMixed { .. })));

    let xid_a = txn
        .branch_states()
        .await
        .into_iter()
        .find(|(name, _, _)| name == "a")
        .unwrap()
        .1;
    assert_eq!(rm_a.status(&xid_a), Some(BranchStatus::Prepared));

    gate.notify_one();
    let report = pass.await.unwrap().unwrap();
    assert!(report.committed.contains(&txn.id()));
    assert!(report.rolled_back.is_empty());
    assert_eq!(rm_a.status(&xid_a), Some(BranchStatus::Committed));
    assert_eq!(rm_a.rollback_calls(), 0);

    let report = manager.recoverer().recover_all().await.unwrap();
    assert!(report.finalized.contains(&txn.id()));
    assert_eq!(journal.collect_dangling_records().unwrap().count(), 0);
}
