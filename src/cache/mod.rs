//! Packet batch cache
//!
//! Buffers captured packets between flush ticks so several packets can
//! share one chat message. The capture loop appends, the flush loop
//! drains; both sides go through one mutex and never hold it across a
//! send.

use std::sync::Mutex;

use bytes::Bytes;

/// Unbounded buffer of captured packets awaiting a batch flush
#[derive(Debug, Default)]
pub struct PacketCache {
    pending: Mutex<Vec<Bytes>>,
}

impl PacketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a captured packet, preserving arrival order.
    pub fn append(&self, packet: Bytes) {
        self.pending.lock().unwrap().push(packet);
    }

    /// Take every pending packet, leaving the cache empty.
    pub fn drain_all(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}
