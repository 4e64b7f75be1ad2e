//! Consistent key-to-partition routing.
//!
//! Routing is a pure function of key bytes, so the same key lands on the
//! same partition across both streams, across repeated invocations, and
//! across process restarts. This is the ownership rule that lets each
//! partition run a single writer with no cross-partition locks.

use crate::key::{Key, PartitionId};

/// Deterministic hash used to select a partition for a given key.
///
/// 64-bit FNV-1a keeps the hash stable across toolchains without extra
/// dependencies. Do not change the constants: stored data is partitioned by
/// this function's output.
#[must_use]
pub fn hash_key(key: impl AsRef<[u8]>) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    key.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Maps keys to partitions.
///
/// The router is stateless; two routers constructed with the same partition
/// count agree on every key.
///
/// # Examples
///
/// ```
/// use settlematch_core::key::Key;
/// use settlematch_core::route::PartitionRouter;
///
/// let router = PartitionRouter::new(8);
/// let key = Key::new("INV-17");
/// assert_eq!(router.route(&key), router.route(&key));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRouter {
    partitions: u32,
}

impl PartitionRouter {
    /// Create a router over `partitions` partitions.
    ///
    /// # Panics
    ///
    /// Panics if `partitions` is zero; a zero-partition topology has no
    /// owner for any key.
    #[must_use]
    pub fn new(partitions: u32) -> Self {
        assert!(partitions > 0, "partition count must be non-zero");
        Self { partitions }
    }

    /// Number of partitions this router spreads keys over.
    #[must_use]
    pub const fn partitions(self) -> u32 {
        self.partitions
    }

    /// Route a key to its owning partition.
    #[must_use]
    pub fn route(self, key: &Key) -> PartitionId {
        #[allow(clippy::cast_possible_truncation)] // Modulo of u32 count fits in u32
        PartitionId::new((hash_key(key.as_bytes()) % u64::from(self.partitions)) as u32)
    }
}
