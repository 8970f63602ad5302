//! XA transaction branch identifiers

use crate::transaction_id::{NodeId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Qualifier distinguishing the branches of one global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchQualifier(u32);

impl BranchQualifier {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for BranchQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// XA transaction identifier: format, global transaction id and branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    global: TransactionId,
    branch: BranchQualifier,
}

impl Xid {
    /// Format id stamped on every xid created by this coordinator ("TDM1").
    pub const FORMAT_ID: i32 = 0x5444_4d31;

    pub fn new(global: TransactionId, branch: BranchQualifier) -> Self {
        Self {
            format_id: Self::FORMAT_ID,
            global,
            branch,
        }
    }

    /// Build an xid with an arbitrary format id (xids of other transaction managers).
    pub fn with_format(format_id: i32, global: TransactionId, branch: BranchQualifier) -> Self {
        Self {
            format_id,
            global,
            branch,
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_id(&self) -> TransactionId {
        self.global
    }

    pub fn branch(&self) -> BranchQualifier {
        self.branch
    }

    /// Whether this xid was generated by the coordinator running as `node`.
    pub fn belongs_to(&self, node: NodeId) -> bool {
        self.format_id == Self::FORMAT_ID && self.global.node_id() == node
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{}:{}", self.format_id, self.global, self.branch)
    }
}
