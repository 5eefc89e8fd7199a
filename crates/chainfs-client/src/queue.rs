//! Bounded packet queue
//!
//! A fixed ring of pre-allocated [`Packet`] slots shared by exactly one
//! producer thread and exactly one consumer thread. Positions are tracked
//! with atomics; the mutex/condvar pair is only taken to sleep when the
//! ring is full or empty and to wake the other side.
//!
//! One slot always stays free to tell "full" from "empty", so a queue of
//! capacity `N` holds at most `N - 1` packets.
//!
//! The single-producer/single-consumer contract is not checked here; the
//! owning stream's API has to make concurrent producers impossible.

use crate::packet::Packet;
use chainfs_common::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Exclusive handle to one queue slot
pub type SlotGuard<'a> = MutexGuard<'a, Packet>;

/// Fixed-capacity single-producer/single-consumer packet ring
pub struct PacketQueue {
    /// Packet slots, reused in place
    slots: Box<[Mutex<Packet>]>,
    /// Next slot the consumer reads
    read_pos: AtomicUsize,
    /// Next slot the producer fills
    write_pos: AtomicUsize,
    /// Sticky cancellation flag
    cancelled: AtomicBool,
    /// Guards the condvar waits only
    lock: Mutex<()>,
    /// Signalled when a slot frees up
    not_full: Condvar,
    /// Signalled when a packet is committed
    not_empty: Condvar,
}

impl PacketQueue {
    /// Create a queue with `capacity` slots of `max_packet_size` bytes each
    pub fn new(capacity: usize, max_packet_size: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(Error::Configuration(format!(
                "packet queue capacity must be at least 2, got {capacity}"
            )));
        }

        let slots = (0..capacity)
            .map(|_| Mutex::new(Packet::new(max_packet_size)))
            .collect();

        Ok(Self {
            slots,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            lock: Mutex::new(()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        })
    }

    /// Number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of committed packets not yet read
    #[must_use]
    pub fn len(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        (write + self.capacity() - read) % self.capacity()
    }

    /// Check if no packets are waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the queue has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Wait for a free slot and return it for filling
    ///
    /// Returns `None` once the queue is cancelled. The slot only becomes
    /// visible to the consumer after [`commit_write`](Self::commit_write).
    pub fn acquire_write_slot(&self) -> Option<SlotGuard<'_>> {
        let write = self.write_pos.load(Ordering::Acquire);
        let next = self.advance(write);

        if next == self.read_pos.load(Ordering::Acquire) {
            let mut guard = self.lock.lock();
            while !self.is_cancelled() && next == self.read_pos.load(Ordering::Acquire) {
                self.not_full.wait(&mut guard);
            }
        }

        if self.is_cancelled() {
            return None;
        }
        Some(self.slots[write].lock())
    }

    /// Publish the slot returned by the last `acquire_write_slot`
    pub fn commit_write(&self) {
        let write = self.write_pos.load(Ordering::Acquire);
        self.write_pos.store(self.advance(write), Ordering::Release);

        let _guard = self.lock.lock();
        self.not_empty.notify_one();
    }

    /// Wait for the oldest committed packet
    ///
    /// Returns `None` once the queue is cancelled. Acquiring again without
    /// [`commit_read`](Self::commit_read) yields the same packet.
    pub fn acquire_read_slot(&self) -> Option<SlotGuard<'_>> {
        let read = self.read_pos.load(Ordering::Acquire);

        if read == self.write_pos.load(Ordering::Acquire) {
            let mut guard = self.lock.lock();
            while !self.is_cancelled() && read == self.write_pos.load(Ordering::Acquire) {
                self.not_empty.wait(&mut guard);
            }
        }

        if self.is_cancelled() {
            return None;
        }
        Some(self.slots[read].lock())
    }

    /// Release the slot returned by the last `acquire_read_slot`
    pub fn commit_read(&self) {
        let read = self.read_pos.load(Ordering::Acquire);
        self.read_pos.store(self.advance(read), Ordering::Release);

        let _guard = self.lock.lock();
        self.not_full.notify_one();
    }

    /// Wake both sides and make every acquire return `None` until reset
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);

        let _guard = self.lock.lock();
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Empty the queue and clear the cancellation flag
    ///
    /// Only valid once neither side can be blocked inside an acquire call.
    pub fn reset(&self) {
        let _guard = self.lock.lock();
        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
        self.cancelled.store(false, Ordering::Release);
    }

    fn advance(&self, pos: usize) -> usize {
        (pos + 1) % self.slots.len()
    }
}

impl std::fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketQueue")
            .field("capacity", &self.capacity())
            .field("read_pos", &self.read_pos.load(Ordering::Relaxed))
            .field("write_pos", &self.write_pos.load(Ordering::Relaxed))
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn push(queue: &PacketQueue, value: u32) -> bool {
        let Some(mut slot) = queue.acquire_write_slot() else {
            return false;
        };
        slot.fill(&value.to_le_bytes(), false).unwrap();
        drop(slot);
        queue.commit_write();
        true
    }

    fn pop(queue: &PacketQueue) -> Option<u32> {
        let slot = queue.acquire_read_slot()?;
        let value = u32::from_le_bytes(slot.payload().try_into().unwrap());
        drop(slot);
        queue.commit_read();
        Some(value)
    }

    #[test]
    fn test_rejects_capacity_below_two() {
        assert!(PacketQueue::new(1, 16).is_err());
        assert!(PacketQueue::new(2, 16).is_ok());
    }

    #[test]
    fn test_fifo_single_thread() {
        let queue = PacketQueue::new(4, 8).unwrap();
        for round in 0..5u32 {
            for i in 0..3 {
                assert!(push(&queue, round * 10 + i));
            }
            assert_eq!(queue.len(), 3);
            for i in 0..3 {
                assert_eq!(pop(&queue), Some(round * 10 + i));
            }
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_order_preserved_across_threads() {
        let queue = Arc::new(PacketQueue::new(3, 8).unwrap());
        let producer_queue = Arc::clone(&queue);

        let producer = thread::spawn(move || {
            for i in 0..10_000u32 {
                assert!(push(&producer_queue, i));
            }
        });

        for expected in 0..10_000u32 {
            assert_eq!(pop(&queue), Some(expected));
        }
        producer.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_blocks_producer() {
        let capacity = 4;
        let queue = Arc::new(PacketQueue::new(capacity, 8).unwrap());
        let committed = Arc::new(AtomicUsize::new(0));

        let producer = {
            let queue = Arc::clone(&queue);
            let committed = Arc::clone(&committed);
            thread::spawn(move || {
                for i in 0..capacity as u32 {
                    assert!(push(&queue, i));
                    committed.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        thread::sleep(Duration::from_millis(200));
        assert_eq!(committed.load(Ordering::SeqCst), capacity - 1);

        assert_eq!(pop(&queue), Some(0));
        producer.join().unwrap();
        assert_eq!(committed.load(Ordering::SeqCst), capacity);

        for expected in 1..capacity as u32 {
            assert_eq!(pop(&queue), Some(expected));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_unblocks_reader_and_writer() {
        let queue = Arc::new(PacketQueue::new(2, 8).unwrap());

        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.acquire_read_slot().is_none())
        };
        thread::sleep(Duration::from_millis(50));
        queue.cancel();
        assert!(reader.join().unwrap());

        queue.reset();
        assert!(push(&queue, 1));
        let writer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || push(&queue, 2))
        };
        thread::sleep(Duration::from_millis(50));
        queue.cancel();
        assert!(!writer.join().unwrap());
    }

    #[test]
    fn test_cancel_is_sticky_until_reset() {
        let queue = PacketQueue::new(4, 8).unwrap();
        assert!(push(&queue, 7));
        queue.cancel();
        queue.cancel();

        assert!(queue.acquire_write_slot().is_none());
        assert!(queue.acquire_read_slot().is_none());
        assert!(queue.acquire_read_slot().is_none());

        queue.reset();
        assert!(!queue.is_cancelled());
        assert!(queue.is_empty());
        assert!(push(&queue, 8));
        assert_eq!(pop(&queue), Some(8));
    }
}
