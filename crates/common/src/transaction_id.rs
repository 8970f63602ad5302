//! Transaction identifiers generated from a hybrid logical clock
//!
//! A transaction id packs the physical time in microseconds, a logical
//! sequence and the generating node into 20 bytes. The byte encoding is
//! big-endian, so lexicographic byte order, `Ord` and generation order agree.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Encoded length of a [`TransactionId`].
pub const TRANSACTION_ID_LEN: usize = 20;

/// Identity of the coordinator node that generated a transaction id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Derive a stable node id from a textual node name (FNV-1a).
    pub fn from_name(name: &str) -> Self {
        let hash = name.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
            (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        });
        NodeId(hash)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_hex(hex: &str) -> Result<Self, String> {
        u64::from_str_radix(hex, 16)
            .map(NodeId)
            .map_err(|e| e.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Globally unique, immutable transaction identifier.
///
/// Field order matters: the derived ordering compares physical time, then
/// sequence, then node, which is exactly the order of the encoded bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TransactionId {
    physical: u64,
    sequence: u32,
    node_id: NodeId,
}

impl TransactionId {
    pub const fn new(physical: u64, sequence: u32, node_id: NodeId) -> Self {
        Self {
            physical,
            sequence,
            node_id,
        }
    }

    /// Physical component (microseconds since the Unix epoch)
    pub fn physical(&self) -> u64 {
        self.physical
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Encode as 20 big-endian bytes.
    pub fn to_bytes(&self) -> [u8; TRANSACTION_ID_LEN] {
        let mut buf = [0u8; TRANSACTION_ID_LEN];
        buf[0..8].copy_from_slice(&self.physical.to_be_bytes());
        buf[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        buf[12..20].copy_from_slice(&self.node_id.0.to_be_bytes());
        buf
    }

    /// Decode from the 20-byte encoding produced by [`TransactionId::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != TRANSACTION_ID_LEN {
            return Err(format!(
                "Invalid transaction ID length: {} (expected {})",
                bytes.len(),
                TRANSACTION_ID_LEN
            ));
        }

        let mut physical = [0u8; 8];
        let mut sequence = [0u8; 4];
        let mut node = [0u8; 8];
        physical.copy_from_slice(&bytes[0..8]);
        sequence.copy_from_slice(&bytes[8..12]);
        node.copy_from_slice(&bytes[12..20]);

        Ok(Self::new(
            u64::from_be_bytes(physical),
            u32::from_be_bytes(sequence),
            NodeId(u64::from_be_bytes(node)),
        ))
    }

    /// Parse from string format: "physical_sequence_nodeid"
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() != 3 {
            return Err(format!(
                "Invalid transaction ID format: {} (expected physical_sequence_nodeid)",
                s
            ));
        }

        let physical = parts[0]
            .parse()
            .map_err(|_| format!("Invalid physical component: {}", parts[0]))?;
        let sequence = parts[1]
            .parse()
            .map_err(|_| format!("Invalid sequence component: {}", parts[1]))?;
        let node_id =
            NodeId::from_hex(parts[2]).map_err(|_| format!("Invalid node ID: {}", parts[2]))?;

        Ok(Self::new(physical, sequence, node_id))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.physical, self.sequence, self.node_id)
    }
}

/// Generator of transaction ids for one node.
///
/// The sequence resets whenever physical time moves forward and increments
/// otherwise, so ids stay unique when the wall clock stalls or goes back.
pub struct IdGenerator {
    node_id: NodeId,
    /// (last physical time handed out, last sequence)
    state: Mutex<(u64, u32)>,
}

impl IdGenerator {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: Mutex::new((0, 0)),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Generate the next transaction id.
    pub fn next_id(&self) -> TransactionId {
        let physical = now_micros();
        let mut state = self.state.lock();
        let (last, sequence) = *state;

        *state = if physical > last {
            (physical, 0)
        } else if sequence == u32::MAX {
            (last + 1, 0)
        } else {
            (last, sequence + 1)
        };

        TransactionId::new(state.0, state.1, self.node_id)
    }

    /// Move the clock past an id read back from durable storage, so that ids
    /// generated after a restart never collide with journaled ones.
    pub fn observe(&self, id: &TransactionId) {
        let mut state = self.state.lock();
        if (id.physical, id.sequence) > *state {
            *state = (id.physical, id.sequence);
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_matches_bytes() {
        let node1 = NodeId::new(1);
        let node2 = NodeId::new(2);

        let ids = [
            TransactionId::new(100, 0, node2),
            TransactionId::new(100, 1, node1),
            TransactionId::new(101, 0, node1),
            TransactionId::new(100, 0, node1),
        ];

        for a in &ids {
            for b in &ids {
                assert_eq!(a.cmp(b), a.to_bytes().cmp(&b.to_bytes()));
            }
        }
    }

    #[test]
    fn test_string_roundtrip() {
        let id = TransactionId::new(123_456_789, 10, NodeId::new(42));
        let parsed = TransactionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(TransactionId::from_bytes(&[0u8; 19]).is_err());
    }

    #[test]
    fn test_generator_is_monotonic() {
        let generator = IdGenerator::new(NodeId::new(7));

        let mut previous = generator.next_id();
        for _ in 0..1_000 {
            let next = generator.next_id();
            assert!(previous < next);
            assert_eq!(next.node_id(), NodeId::new(7));
            previous = next;
        }
    }

    #[test]
    fn test_observe_moves_clock_forward() {
        let generator = IdGenerator::new(NodeId::new(1));
        let future = TransactionId::new(u64::MAX / 2, 5, NodeId::new(1));

        generator.observe(&future);
        let next = generator.next_id();

        assert!(next > future);
    }

    #[test]
    fn test_node_id_from_name_is_stable() {
        assert_eq!(NodeId::from_name("node-a"), NodeId::from_name("node-a"));
        assert_ne!(NodeId::from_name("node-a"), NodeId::from_name("node-b"));
    }
}
