//! Common types for the Tandem transaction coordinator
//!
//! This crate defines:
//! - Transaction ids (node identity + physical time + sequence)
//! - XA branch identifiers, flags, votes and error codes
//! - The resource traits every XA adapter implements

mod resource;
mod transaction_id;
mod xa;
mod xid;

pub use resource::{BranchHandle, ResourceProducer, XaResource, same_instance};
pub use transaction_id::{IdGenerator, NodeId, TRANSACTION_ID_LEN, TransactionId};
pub use xa::{EndFlag, HeuristicOutcome, StartFlag, Vote, XaError};
pub use xid::{BranchQualifier, Xid};
