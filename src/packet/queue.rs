//! Sequence-ordered packet queue
//!
//! The meeting point of the network thread (push) and the audio thread
//! (pull). Packets are kept sorted by sequence number with wraparound
//! handled, duplicates and late arrivals are dropped, and the queue is
//! bounded so a fast sender cannot grow memory without limit.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{PacketHandle, PacketReader, PacketWriter};
use crate::units::{seqnum_le, seqnum_lt, Seqnum, StreamTimestamp};

/// Bounded priority queue ordered by RTP sequence number.
pub struct SortedQueue {
    packets: VecDeque<PacketHandle>,
    capacity: usize,
    /// Seqnum of the last packet handed out; packets at or before it
    /// arrive too late to be useful and are dropped.
    last_read: Option<Seqnum>,
    /// Most recent (highest-seqnum) packet ever written. Retained after
    /// it is read so the latency monitor can always see the stream tail.
    latest: Option<PacketHandle>,
    n_late: u64,
    n_duplicate: u64,
    n_overflow: u64,
}

impl SortedQueue {
    /// New queue holding at most `capacity` packets.
    pub fn new(capacity: usize) -> Self {
        SortedQueue {
            packets: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            last_read: None,
            latest: None,
            n_late: 0,
            n_duplicate: 0,
            n_overflow: 0,
        }
    }

    /// Number of buffered packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Highest-seqnum packet seen so far. Not removed by `read`.
    pub fn latest(&self) -> Option<&PacketHandle> {
        self.latest.as_ref()
    }

    /// Stream timestamp right after the newest buffered sample.
    pub fn latest_end(&self) -> Option<StreamTimestamp> {
        self.latest.as_ref().map(|p| p.rtp().end())
    }

    /// Dropped-packet counters: (late, duplicate, overflow).
    pub fn drop_counts(&self) -> (u64, u64, u64) {
        (self.n_late, self.n_duplicate, self.n_overflow)
    }

    /// Insert a packet in seqnum order.
    pub fn push(&mut self, packet: PacketHandle) {
        let seqnum = packet.rtp().seqnum;

        // Late: its position has already been consumed.
        if let Some(last) = self.last_read {
            if seqnum_le(seqnum, last) {
                self.n_late += 1;
                debug!("sorted queue: dropping late packet: sn={} last={}", seqnum, last);
                return;
            }
        }

        // Find the insert position scanning from the tail; packets
        // mostly arrive in order so this is O(1) in the common case.
        let mut pos = self.packets.len();
        while pos > 0 {
            let prev = self.packets[pos - 1].rtp().seqnum;
            if prev == seqnum {
                self.n_duplicate += 1;
                debug!("sorted queue: dropping duplicate packet: sn={}", seqnum);
                return;
            }
            if seqnum_lt(prev, seqnum) {
                break;
            }
            pos -= 1;
        }
        self.packets.insert(pos, packet.clone());

        match &self.latest {
            Some(l) if seqnum_le(seqnum, l.rtp().seqnum) => {}
            _ => self.latest = Some(packet),
        }

        if self.packets.len() > self.capacity {
            // Overflow: drop the oldest so fresher audio survives.
            self.packets.pop_front();
            self.n_overflow += 1;
            debug!("sorted queue: overflow, dropping oldest: len={}", self.packets.len());
        }
    }

    /// Pop the lowest-seqnum packet.
    pub fn pop(&mut self) -> Option<PacketHandle> {
        let packet = self.packets.pop_front()?;
        self.last_read = Some(packet.rtp().seqnum);
        Some(packet)
    }
}

/// Thread-shared handle to a [`SortedQueue`].
///
/// The network thread writes, the audio thread reads; the lock is held
/// only for the queue operation itself.
#[derive(Clone)]
pub struct SharedQueue {
    inner: Arc<Mutex<SortedQueue>>,
}

impl SharedQueue {
    /// New shared queue with the given packet capacity.
    pub fn new(capacity: usize) -> Self {
        SharedQueue {
            inner: Arc::new(Mutex::new(SortedQueue::new(capacity))),
        }
    }

    /// Number of buffered packets.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Stream timestamp right after the newest sample ever enqueued.
    pub fn latest_end(&self) -> Option<StreamTimestamp> {
        self.inner.lock().latest_end()
    }
}

impl PacketWriter for SharedQueue {
    fn write(&mut self, packet: PacketHandle) {
        self.inner.lock().push(packet);
    }
}

impl PacketReader for SharedQueue {
    fn read(&mut self) -> Option<PacketHandle> {
        self.inner.lock().pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, Rtp, FLAG_AUDIO, FLAG_RTP};

    fn packet(seqnum: Seqnum, timestamp: u32) -> PacketHandle {
        let mut p = Packet::new(FLAG_RTP | FLAG_AUDIO);
        p.rtp = Some(Rtp {
            seqnum,
            stream_timestamp: timestamp,
            duration: 320,
            ..Default::default()
        });
        p.into_handle()
    }

    #[test]
    fn test_in_order() {
        let mut q = SortedQueue::new(16);
        for sn in 0..4 {
            q.push(packet(sn, sn as u32 * 320));
        }
        for sn in 0..4 {
            assert_eq!(q.pop().unwrap().rtp().seqnum, sn);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_reorder() {
        let mut q = SortedQueue::new(16);
        for sn in [0u16, 1, 2, 4, 3, 5] {
            q.push(packet(sn, sn as u32 * 320));
        }
        let order: Vec<Seqnum> = std::iter::from_fn(|| q.pop())
            .map(|p| p.rtp().seqnum)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut q = SortedQueue::new(16);
        q.push(packet(7, 0));
        q.push(packet(7, 0));
        assert_eq!(q.len(), 1);
        assert_eq!(q.drop_counts().1, 1);
    }

    #[test]
    fn test_late_dropped() {
        let mut q = SortedQueue::new(16);
        q.push(packet(10, 0));
        assert!(q.pop().is_some());
        // Position 10 has been consumed; 9 and 10 are late now.
        q.push(packet(9, 0));
        q.push(packet(10, 0));
        assert!(q.is_empty());
        assert_eq!(q.drop_counts().0, 2);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut q = SortedQueue::new(3);
        for sn in 0..5 {
            q.push(packet(sn, 0));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop().unwrap().rtp().seqnum, 2);
    }

    #[test]
    fn test_seqnum_wraparound_order() {
        let mut q = SortedQueue::new(16);
        q.push(packet(65534, 0));
        q.push(packet(65535, 0));
        q.push(packet(0, 0));
        q.push(packet(1, 0));
        let order: Vec<Seqnum> = std::iter::from_fn(|| q.pop())
            .map(|p| p.rtp().seqnum)
            .collect();
        assert_eq!(order, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_latest_survives_read() {
        let mut q = SortedQueue::new(16);
        q.push(packet(1, 320));
        assert!(q.pop().is_some());
        assert_eq!(q.latest_end(), Some(640));
    }
}
