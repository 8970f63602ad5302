//! In-memory XA resource manager for testing the coordinator
//!
//! A [`MockResourceManager`] plays the part of a database or broker: it keeps
//! branch state across connections and "crashes" of the coordinator, records
//! every call it receives, and can be scripted to fail, hang, hold a call
//! until released or vote read-only. [`MockProducer`] hands out connections
//! to it the way a pool would.

pub mod manager;
pub mod producer;
pub mod resource;

pub use manager::{Behaviour, BranchStatus, Call, MockResourceManager, Operation};
pub use producer::MockProducer;
pub use resource::MockXaResource;
