//! Per-transaction bookkeeping of enlisted resources
//!
//! The enlistment manager owns the branches of one transaction. It decides
//! whether an enlisted resource starts a new branch, joins an existing one or
//! is a duplicate, issues the matching `start`/`end` calls, and keeps the
//! branches in the order the driver must walk them.

use crate::branch::{BranchState, ResourceBranch, bounded};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tandem_common::{
    BranchHandle, BranchQualifier, EndFlag, StartFlag, TransactionId, XaResource, Xid,
    same_instance,
};

pub struct ResourceEnlistmentManager {
    txn_id: TransactionId,
    config: Arc<CoordinatorConfig>,
    /// Sorted by ordering position, then enlistment order
    branches: Vec<ResourceBranch>,
    next_qualifier: u32,
    sealed: bool,
}

impl ResourceEnlistmentManager {
    pub fn new(txn_id: TransactionId, config: Arc<CoordinatorConfig>) -> Self {
        Self {
            txn_id,
            config,
            branches: Vec::new(),
            next_qualifier: 0,
            sealed: false,
        }
    }

    /// Enlist a resource instance.
    ///
    /// A live instance that is already enlisted and not ended is ignored.
    /// With TMJOIN allowed, the instance takes over a normally ended branch
    /// of the same resource manager; otherwise it gets a branch of its own.
    pub async fn enlist(&mut self, handle: BranchHandle) -> Result<()> {
        if self.sealed {
            return Err(CoordinatorError::Enlistment(format!(
                "transaction {} is already completing",
                self.txn_id
            )));
        }

        let resource = handle.resource().clone();
        if let Some(branch) = self.branches.iter().find(|b| {
            same_instance(b.resource(), &resource)
                && matches!(b.state(), BranchState::Active | BranchState::Suspended)
        }) {
            tracing::warn!(
                "Resource of {} is already enlisted in {} as {}, ignoring",
                handle.unique_name(),
                self.txn_id,
                branch.xid()
            );
            return Ok(());
        }

        let timeout = self.config.branch_timeout(handle.unique_name());

        if handle.use_tm_join()
            && let Some(index) = self.branches.iter().position(|b| {
                *b.state() == BranchState::Ended && b.resource().is_same_rm(resource.as_ref())
            })
        {
            let xid = *self.branches[index].xid();
            bounded(timeout, resource.start(&xid, StartFlag::Join))
                .await
                .map_err(|e| {
                    CoordinatorError::Enlistment(format!(
                        "cannot join branch {} on {}: {}",
                        xid,
                        handle.unique_name(),
                        e
                    ))
                })?;

            tracing::debug!("Joined branch {} on {}", xid, handle.unique_name());
            let branch = &mut self.branches[index];
            branch.replace_handle(handle);
            branch.set_state(BranchState::Active);
            return Ok(());
        }

        self.next_qualifier += 1;
        let xid = Xid::new(self.txn_id, BranchQualifier::new(self.next_qualifier));
        bounded(timeout, resource.start(&xid, StartFlag::NoFlags))
            .await
            .map_err(|e| {
                CoordinatorError::Enlistment(format!(
                    "cannot start branch {} on {}: {}",
                    xid,
                    handle.unique_name(),
                    e
                ))
            })?;

        tracing::debug!("Started branch {} on {}", xid, handle.unique_name());
        let branch = ResourceBranch::new(handle, xid);
        let position = self
            .branches
            .iter()
            .position(|b| b.ordering_position() > branch.ordering_position())
            .unwrap_or(self.branches.len());
        self.branches.insert(position, branch);
        Ok(())
    }

    /// End the branch of a live resource instance.
    pub async fn delist(&mut self, resource: &Arc<dyn XaResource>, flag: EndFlag) -> Result<()> {
        let index = self
            .branches
            .iter()
            .position(|b| {
                same_instance(b.resource(), resource)
                    && matches!(b.state(), BranchState::Active | BranchState::Suspended)
            })
            .ok_or_else(|| {
                CoordinatorError::Enlistment(format!(
                    "resource of {} is not enlisted in {}",
                    resource.resource_manager(),
                    self.txn_id
                ))
            })?;

        if flag == EndFlag::Suspend && *self.branches[index].state() != BranchState::Active {
            return Err(CoordinatorError::WrongState(format!(
                "branch {} is not active",
                self.branches[index].xid()
            )));
        }

        self.end_branch(index, flag).await
    }

    /// Suspend every active branch.
    pub async fn suspend(&mut self) -> Result<()> {
        for index in 0..self.branches.len() {
            if *self.branches[index].state() == BranchState::Active {
                self.end_branch(index, EndFlag::Suspend).await?;
            }
        }
        Ok(())
    }

    /// Resume every suspended branch.
    pub async fn resume(&mut self) -> Result<()> {
        for branch in self.branches.iter_mut() {
            if *branch.state() != BranchState::Suspended {
                continue;
            }
            let timeout = self.config.branch_timeout(branch.unique_name());
            let xid = *branch.xid();
            bounded(timeout, branch.resource().start(&xid, StartFlag::Resume))
                .await
                .map_err(|e| {
                    CoordinatorError::Enlistment(format!("cannot resume branch {}: {}", xid, e))
                })?;
            branch.set_state(BranchState::Active);
        }
        Ok(())
    }

    /// End every branch still associated with work, with TMSUCCESS.
    pub async fn delist_unended(&mut self) -> Result<()> {
        for index in 0..self.branches.len() {
            if matches!(
                self.branches[index].state(),
                BranchState::Active | BranchState::Suspended
            ) {
                self.end_branch(index, EndFlag::Success).await?;
            }
        }
        Ok(())
    }

    async fn end_branch(&mut self, index: usize, flag: EndFlag) -> Result<()> {
        let branch = &mut self.branches[index];
        let timeout = self.config.branch_timeout(branch.unique_name());
        let xid = *branch.xid();

        bounded(timeout, branch.resource().end(&xid, flag))
            .await
            .map_err(|e| {
                CoordinatorError::Enlistment(format!(
                    "cannot end branch {} on {}: {}",
                    xid,
                    branch.unique_name(),
                    e
                ))
            })?;

        let state = match flag {
            EndFlag::Suspend => BranchState::Suspended,
            EndFlag::Success | EndFlag::Fail => BranchState::Ended,
        };
        branch.set_state(state);
        Ok(())
    }

    /// Refuse further enlistments; called when completion begins.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Every branch, in the order prepare and commit visit them.
    pub fn all_resources(&self) -> &[ResourceBranch] {
        &self.branches
    }

    pub(crate) fn branches_mut(&mut self) -> &mut [ResourceBranch] {
        &mut self.branches
    }

    pub fn unique_names(&self) -> BTreeSet<String> {
        self.branches
            .iter()
            .map(|b| b.unique_name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_common::{NodeId, ResourceProducer};
    use tandem_mock_resource::{Call, MockProducer, MockResourceManager, Operation};

    fn manager() -> ResourceEnlistmentManager {
        ResourceEnlistmentManager::new(
            TransactionId::new(1_000, 0, NodeId::new(1)),
            Arc::new(CoordinatorConfig::default()),
        )
    }

    fn handle(producer: &MockProducer, resource: &Arc<dyn XaResource>) -> BranchHandle {
        producer.find_branch_handle(resource).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_enlistment_is_ignored() {
        let producer = MockProducer::new("orders", MockResourceManager::new("db"));
        let connection = producer.connection();
        let mut enlistment = manager();

        enlistment.enlist(handle(&producer, &connection)).await.unwrap();
        enlistment.enlist(handle(&producer, &connection)).await.unwrap();

        assert_eq!(enlistment.len(), 1);
        assert_eq!(producer.manager().count(Operation::Start), 1);
    }

    #[tokio::test]
    async fn test_join_reuses_ended_branch() {
        let rm = MockResourceManager::new("db");
        let producer = MockProducer::new("orders", rm.clone()).with_tm_join(true);
        let first = producer.connection();
        let second = producer.connection();
        let mut enlistment = manager();

        enlistment.enlist(handle(&producer, &first)).await.unwrap();
        enlistment.delist(&first, EndFlag::Success).await.unwrap();
        enlistment.enlist(handle(&producer, &second)).await.unwrap();

        assert_eq!(enlistment.len(), 1);
        let xid = *enlistment.all_resources()[0].xid();
        assert!(rm.calls().contains(&Call::Start(xid, StartFlag::Join)));
        assert!(same_instance(enlistment.all_resources()[0].resource(), &second));
    }

    #[tokio::test]
    async fn test_without_join_each_instance_gets_a_branch() {
        let producer = MockProducer::new("orders", MockResourceManager::new("db"));
        let first = producer.connection();
        let second = producer.connection();
        let mut enlistment = manager();

        enlistment.enlist(handle(&producer, &first)).await.unwrap();
        enlistment.delist(&first, EndFlag::Success).await.unwrap();
        enlistment.enlist(handle(&producer, &second)).await.unwrap();

        assert_eq!(enlistment.len(), 2);
        let branches = enlistment.all_resources();
        assert_ne!(branches[0].xid(), branches[1].xid());
    }

    #[tokio::test]
    async fn test_ordering_position_then_enlistment_order() {
        let late =
            MockProducer::new("late", MockResourceManager::new("a")).with_ordering_position(5);
        let early = MockProducer::new("early", MockResourceManager::new("b"))
            .with_ordering_position(-1);
        let plain = MockProducer::new("plain", MockResourceManager::new("c"));
        let plain_too = MockProducer::new("plain-too", MockResourceManager::new("d"));
        let mut enlistment = manager();

        for producer in [&late, &plain, &early, &plain_too] {
            let connection = producer.connection();
            enlistment.enlist(handle(producer, &connection)).await.unwrap();
        }

        let order: Vec<_> = enlistment
            .all_resources()
            .iter()
            .map(|b| b.unique_name().to_string())
            .collect();
        assert_eq!(order, ["early", "plain", "plain-too", "late"]);
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let rm = MockResourceManager::new("db");
        let producer = MockProducer::new("orders", rm.clone());
        let connection = producer.connection();
        let mut enlistment = manager();

        enlistment.enlist(handle(&producer, &connection)).await.unwrap();
        enlistment.suspend().await.unwrap();
        assert_eq!(
            *enlistment.all_resources()[0].state(),
            BranchState::Suspended
        );

        enlistment.resume().await.unwrap();
        assert_eq!(*enlistment.all_resources()[0].state(), BranchState::Active);

        let xid = *enlistment.all_resources()[0].xid();
        assert!(rm.calls().contains(&Call::Start(xid, StartFlag::Resume)));
    }

    #[tokio::test]
    async fn test_sealed_manager_rejects_enlistment() {
        let producer = MockProducer::new("orders", MockResourceManager::new("db"));
        let connection = producer.connection();
        let mut enlistment = manager();
        enlistment.seal();

        let result = enlistment.enlist(handle(&producer, &connection)).await;
        assert!(matches!(result, Err(CoordinatorError::Enlistment(_))));
    }

    #[tokio::test]
    async fn test_delist_unknown_resource_fails() {
        let producer = MockProducer::new("orders", MockResourceManager::new("db"));
        let connection = producer.connection();
        let mut enlistment = manager();

        let result = enlistment.delist(&connection, EndFlag::Success).await;
        assert!(matches!(result, Err(CoordinatorError::Enlistment(_))));
    }
}
