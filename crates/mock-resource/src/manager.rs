//! Scriptable in-memory resource manager

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tandem_common::{EndFlag, HeuristicOutcome, StartFlag, Vote, XaError, XaResource, Xid};
use tokio::sync::Notify;

use crate::resource::MockXaResource;

/// State of one branch as the resource manager sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStatus {
    Active,
    Suspended,
    Ended,
    Prepared,
    /// Prepared with a read-only vote; nothing left to do
    ReadOnly,
    Committed,
    RolledBack,
    /// Completed on the resource manager's own initiative, remembered until forgotten
    Heuristic(HeuristicOutcome),
}

/// XA operations, used to script behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    End,
    Prepare,
    Commit,
    Rollback,
    Forget,
    Recover,
}

/// A call received by the resource manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(Xid, StartFlag),
    End(Xid, EndFlag),
    Prepare(Xid),
    Commit(Xid, bool),
    Rollback(Xid),
    Forget(Xid),
    Recover,
}

impl Call {
    pub fn operation(&self) -> Operation {
        match self {
            Call::Start(..) => Operation::Start,
            Call::End(..) => Operation::End,
            Call::Prepare(_) => Operation::Prepare,
            Call::Commit(..) => Operation::Commit,
            Call::Rollback(_) => Operation::Rollback,
            Call::Forget(_) => Operation::Forget,
            Call::Recover => Operation::Recover,
        }
    }

    pub fn xid(&self) -> Option<&Xid> {
        match self {
            Call::Start(xid, _)
            | Call::End(xid, _)
            | Call::Prepare(xid)
            | Call::Commit(xid, _)
            | Call::Rollback(xid)
            | Call::Forget(xid) => Some(xid),
            Call::Recover => None,
        }
    }
}

/// How the next call of an operation behaves
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Normal XA semantics
    Succeed,
    /// Fail with the given error. Heuristic errors on commit or rollback
    /// leave the branch heuristically completed.
    Fail(XaError),
    /// Never return
    Hang,
    /// Wait for a notification, then behave normally
    Gate(Arc<Notify>),
}

struct ManagerState {
    branches: BTreeMap<Xid, BranchStatus>,
    calls: Vec<Call>,
    scripts: HashMap<Operation, VecDeque<Behaviour>>,
    vote: Vote,
}

/// In-memory resource manager shared by all of its connections
pub struct MockResourceManager {
    name: String,
    state: Mutex<ManagerState>,
}

impl MockResourceManager {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(ManagerState {
                branches: BTreeMap::new(),
                calls: Vec::new(),
                scripts: HashMap::new(),
                vote: Vote::Ok,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a new connection (a distinct resource instance).
    pub fn resource(self: &Arc<Self>) -> Arc<dyn XaResource> {
        Arc::new(MockXaResource::new(self.clone()))
    }

    /// Queue a behaviour for the next unscripted call of `operation`.
    pub fn script(&self, operation: Operation, behaviour: Behaviour) {
        self.script_times(operation, behaviour, 1);
    }

    pub fn script_times(&self, operation: Operation, behaviour: Behaviour, times: usize) {
        let mut state = self.state.lock();
        let queue = state.scripts.entry(operation).or_default();
        for _ in 0..times {
            queue.push_back(behaviour.clone());
        }
    }

    /// Vote returned by successful prepares.
    pub fn set_vote(&self, vote: Vote) {
        self.state.lock().vote = vote;
    }

    /// Put a branch directly into the given state, as if left over from
    /// an earlier run.
    pub fn seed(&self, xid: Xid, status: BranchStatus) {
        self.state.lock().branches.insert(xid, status);
    }

    pub fn status(&self, xid: &Xid) -> Option<BranchStatus> {
        self.state.lock().branches.get(xid).copied()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `operation` received, failed ones included.
    pub fn count(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    pub fn commit_calls(&self) -> usize {
        self.count(Operation::Commit)
    }

    pub fn rollback_calls(&self) -> usize {
        self.count(Operation::Rollback)
    }

    pub fn prepare_calls(&self) -> usize {
        self.count(Operation::Prepare)
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn committed(&self) -> Vec<Xid> {
        self.with_status(|s| s == BranchStatus::Committed)
    }

    pub fn rolled_back(&self) -> Vec<Xid> {
        self.with_status(|s| s == BranchStatus::RolledBack)
    }

    /// Branches `recover` would report: prepared or heuristically completed.
    pub fn in_doubt(&self) -> Vec<Xid> {
        self.with_status(|s| {
            matches!(s, BranchStatus::Prepared | BranchStatus::Heuristic(_))
        })
    }

    fn with_status(&self, predicate: impl Fn(BranchStatus) -> bool) -> Vec<Xid> {
        self.state
            .lock()
            .branches
            .iter()
            .filter(|(_, status)| predicate(**status))
            .map(|(xid, _)| *xid)
            .collect()
    }

    /// Record the call and apply any scripted behaviour.
    async fn intercept(&self, call: Call) -> Result<(), XaError> {
        let behaviour = {
            let mut state = self.state.lock();
            state.calls.push(call.clone());
            state
                .scripts
                .get_mut(&call.operation())
                .and_then(|queue| queue.pop_front())
                .unwrap_or(Behaviour::Succeed)
        };

        match behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Behaviour::Gate(gate) => {
                gate.notified().await;
                Ok(())
            }
            Behaviour::Fail(error) => {
                self.apply_failure(&call, &error);
                Err(error)
            }
        }
    }

    fn apply_failure(&self, call: &Call, error: &XaError) {
        let mut state = self.state.lock();
        match (call, error) {
            (Call::Commit(xid, _) | Call::Rollback(xid), error) if error.heuristic().is_some() => {
                if let Some(outcome) = error.heuristic() {
                    state.branches.insert(*xid, BranchStatus::Heuristic(outcome));
                }
            }
            (Call::Prepare(xid) | Call::Commit(xid, _), XaError::RolledBack(_)) => {
                state.branches.insert(*xid, BranchStatus::RolledBack);
            }
            _ => {}
        }
    }

    pub(crate) async fn start(&self, xid: &Xid, flag: StartFlag) -> Result<(), XaError> {
        self.intercept(Call::Start(*xid, flag)).await?;
        let mut state = self.state.lock();
        let current = state.branches.get(xid).copied();
        let next = match (flag, current) {
            (StartFlag::NoFlags, None) => BranchStatus::Active,
            (StartFlag::NoFlags, Some(_)) => {
                return Err(XaError::Protocol(format!("duplicate xid {}", xid)));
            }
            (StartFlag::Join, Some(BranchStatus::Ended | BranchStatus::Active)) => {
                BranchStatus::Active
            }
            (StartFlag::Resume, Some(BranchStatus::Suspended)) => BranchStatus::Active,
            (flag, current) => {
                return Err(XaError::Protocol(format!(
                    "cannot start {} with {:?} in state {:?}",
                    xid, flag, current
                )));
            }
        };
        state.branches.insert(*xid, next);
        Ok(())
    }

    pub(crate) async fn end(&self, xid: &Xid, flag: EndFlag) -> Result<(), XaError> {
        self.intercept(Call::End(*xid, flag)).await?;
        let mut state = self.state.lock();
        let next = match (state.branches.get(xid).copied(), flag) {
            (None, _) => return Err(XaError::NotFound),
            (Some(BranchStatus::Active), EndFlag::Suspend) => BranchStatus::Suspended,
            (Some(BranchStatus::Active | BranchStatus::Suspended), _) => BranchStatus::Ended,
            (Some(status), flag) => {
                return Err(XaError::Protocol(format!(
                    "cannot end {} with {:?} in state {:?}",
                    xid, flag, status
                )));
            }
        };
        state.branches.insert(*xid, next);
        Ok(())
    }

    pub(crate) async fn prepare(&self, xid: &Xid) -> Result<Vote, XaError> {
        self.intercept(Call::Prepare(*xid)).await?;
        let mut state = self.state.lock();
        match state.branches.get(xid).copied() {
            None => Err(XaError::NotFound),
            Some(BranchStatus::Ended) => {
                let vote = state.vote;
                let next = match vote {
                    Vote::Ok => BranchStatus::Prepared,
                    Vote::ReadOnly => BranchStatus::ReadOnly,
                };
                state.branches.insert(*xid, next);
                Ok(vote)
            }
            Some(status) => Err(XaError::Protocol(format!(
                "cannot prepare {} in state {:?}",
                xid, status
            ))),
        }
    }

    pub(crate) async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        self.intercept(Call::Commit(*xid, one_phase)).await?;
        let mut state = self.state.lock();
        match state.branches.get(xid).copied() {
            Some(BranchStatus::Prepared) if !one_phase => {
                state.branches.insert(*xid, BranchStatus::Committed);
                Ok(())
            }
            Some(BranchStatus::Ended) if one_phase => {
                state.branches.insert(*xid, BranchStatus::Committed);
                Ok(())
            }
            Some(BranchStatus::Heuristic(outcome)) => Err(heuristic_error(outcome)),
            None
            | Some(BranchStatus::Committed)
            | Some(BranchStatus::RolledBack)
            | Some(BranchStatus::ReadOnly) => Err(XaError::NotFound),
            Some(status) => Err(XaError::Protocol(format!(
                "cannot commit {} in state {:?}",
                xid, status
            ))),
        }
    }

    pub(crate) async fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.intercept(Call::Rollback(*xid)).await?;
        let mut state = self.state.lock();
        match state.branches.get(xid).copied() {
            Some(
                BranchStatus::Active
                | BranchStatus::Suspended
                | BranchStatus::Ended
                | BranchStatus::Prepared,
            ) => {
                state.branches.insert(*xid, BranchStatus::RolledBack);
                Ok(())
            }
            Some(BranchStatus::Heuristic(outcome)) => Err(heuristic_error(outcome)),
            _ => Err(XaError::NotFound),
        }
    }

    pub(crate) async fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        self.intercept(Call::Forget(*xid)).await?;
        let mut state = self.state.lock();
        match state.branches.get(xid).copied() {
            Some(BranchStatus::Heuristic(_)) => {
                state.branches.remove(xid);
                Ok(())
            }
            _ => Err(XaError::NotFound),
        }
    }

    pub(crate) async fn recover(&self) -> Result<Vec<Xid>, XaError> {
        self.intercept(Call::Recover).await?;
        Ok(self.in_doubt())
    }
}

fn heuristic_error(outcome: HeuristicOutcome) -> XaError {
    match outcome {
        HeuristicOutcome::Commit => XaError::HeuristicCommit,
        HeuristicOutcome::Rollback => XaError::HeuristicRollback,
        HeuristicOutcome::Mixed => XaError::HeuristicMixed,
        HeuristicOutcome::Hazard => XaError::HeuristicHazard,
    }
}
