//! XA two-phase commit coordinator
//!
//! This crate coordinates global transactions across XA resource managers:
//! - [`ResourceEnlistmentManager`] tracks the branches of one transaction
//! - [`TwoPhaseCommitDriver`] runs prepare, the durable decision and phase two
//! - [`Recoverer`] finishes in-doubt branches after a crash
//! - [`ResourceRegistrar`] maps producer names to resource producers
//! - [`TransactionManager`] ties them together behind `begin`/`commit`/`rollback`
//!
//! Decisions are journaled through [`tandem_journal::Journal`] before any
//! branch is told to commit.

pub mod branch;
pub mod config;
pub mod driver;
pub mod enlistment;
pub mod error;
pub mod in_flight;
pub mod manager;
pub mod recovery;
pub mod registrar;
pub mod transaction;

pub use branch::{BranchFailure, BranchState, ResourceBranch};
pub use config::{CoordinatorConfig, RetryPolicy};
pub use driver::{PrepareOutcome, TwoPhaseCommitDriver};
pub use enlistment::ResourceEnlistmentManager;
pub use error::{CoordinatorError, Result};
pub use in_flight::InFlightTransactions;
pub use manager::TransactionManager;
pub use recovery::{Decision, HeuristicBranch, Recoverer, RecoveryReport};
pub use registrar::ResourceRegistrar;
pub use transaction::{Synchronization, Transaction, TransactionStatus};
