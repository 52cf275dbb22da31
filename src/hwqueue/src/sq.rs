/*
Copyright 2026 The hwqueue Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Submission Queue
//!
//! The host is the only producer. Posting a buffer writes one entry, records
//! the buffer as pending in the same slot, and notifies the device:
//!
//! ```text
//!   write entry (flags last) ─> barrier
//!        ─> [linked: patch predecessor's link ─> barrier]
//!        ─> record pending ─> advance producer ─> doorbell record ─> doorbell
//! ```
//!
//! A post that fails before the producer advances hands the buffer back and
//! leaves the queue as it was.
//!
//! A slot may not be reused while its pending record is still occupied, so
//! at most `capacity` buffers are ever outstanding. A full queue rejects the
//! post with [`QueueError::Busy`] and hands the buffer back.
//!
//! In a linked queue each entry also carries a link to its successor, which
//! is only published after the successor itself is fully written. The device
//! therefore never follows a link into a half-written entry.

use alloc::vec::Vec;

use crate::doorbell::{Doorbell, DoorbellRecord};
use crate::entry::{SqFlags, SubmissionEntry};
use crate::error::{PostError, QueueError};
use crate::platform::{DmaBuffer, DmaRegion, Platform};
use crate::ring::RingIndex;

/// Layout of a submission ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqShape {
    /// Entries are found by slot index; completions echo the slot.
    Flat,
    /// Entries form a chain; completions carry the entry's device address.
    Linked,
}

#[derive(Debug)]
pub struct SubmissionQueue<B> {
    ring: DmaRegion,
    shape: SqShape,
    producer: RingIndex,
    consumer: RingIndex,
    /// Buffer posted in each slot, `None` once reclaimed.
    pending: Vec<Option<B>>,
    /// Slot of the most recently posted entry of a linked ring.
    tail: Option<u32>,
    flags: SqFlags,
    doorbell: Option<Doorbell>,
    record: Option<DoorbellRecord>,
}

impl<B: DmaBuffer> SubmissionQueue<B> {
    /// Wrap `ring` as a queue of `capacity` entries. `device_writes` marks
    /// receive queues whose buffers the device fills.
    pub fn new(ring: DmaRegion, capacity: u32, shape: SqShape, device_writes: bool) -> Option<Self> {
        let producer = RingIndex::new(capacity)?;
        if ring.len < capacity as usize * SubmissionEntry::SIZE {
            return None;
        }

        let mut flags = SqFlags::FIRST | SqFlags::LAST;
        flags.set(SqFlags::WRITE, device_writes);
        Some(Self {
            ring,
            shape,
            producer,
            consumer: producer,
            pending: (0..capacity).map(|_| None).collect(),
            tail: None,
            flags,
            doorbell: None,
            record: None,
        })
    }

    pub(crate) fn bind(&mut self, doorbell: Option<Doorbell>, record: Option<DoorbellRecord>) {
        self.doorbell = doorbell;
        self.record = record;
    }

    /// Post `buffer`, returning the slot it occupies.
    pub fn post<P: Platform>(&mut self, platform: &P, buffer: B) -> Result<u32, PostError<B>> {
        let slot = self.producer.slot();
        if RingIndex::is_full(&self.producer, &self.consumer) || self.pending[slot as usize].is_some() {
            return Err(PostError::new(QueueError::Busy, buffer));
        }
        let Some(addr) = self.slot_addr(slot) else {
            return Err(PostError::new(QueueError::InvalidState, buffer));
        };

        let entry = SubmissionEntry::new(
            buffer.device_addr(),
            buffer.len(),
            slot as u16,
            self.flags,
            self.producer.phase(),
        );
        if entry.write_release(platform, addr).is_err() {
            return Err(PostError::new(QueueError::Mem, buffer));
        }
        platform.barrier();

        if self.shape == SqShape::Linked {
            if let Some(prev) = self.tail
                && let Some(prev_addr) = self.slot_addr(prev)
                && SubmissionEntry::publish_link(platform, prev_addr, slot).is_err()
            {
                // unreachable by the device; the slot is rewritten by the next post
                log::error!("failed to link submission slot {} to {}", prev, slot);
                return Err(PostError::new(QueueError::Mem, buffer));
            }
            self.tail = Some(slot);
            platform.barrier();
        }
        self.pending[slot as usize] = Some(buffer);

        self.producer.advance();
        if let Some(record) = self.record
            && let Err(e) = record.write(platform, self.producer.counter())
        {
            log::error!("failed to update producer record: {}", e);
        }
        if let Some(doorbell) = self.doorbell {
            doorbell.ring(platform, self.producer.counter());
        }
        Ok(slot)
    }

    /// Take back the buffer posted in `slot`, or `None` if it holds none.
    pub fn reclaim(&mut self, slot: u32) -> Option<B> {
        let buffer = self.pending.get_mut(slot as usize)?.take()?;
        self.consumer.advance();
        Some(buffer)
    }

    /// Remove every pending buffer in posting order.
    pub fn drain_pending(&mut self) -> Vec<B> {
        let mut drained = Vec::with_capacity(self.in_flight() as usize);
        let mut idx = self.consumer;
        for _ in 0..self.capacity() {
            if let Some(buffer) = self.pending[idx.slot() as usize].take() {
                drained.push(buffer);
            }
            idx.advance();
        }
        self.consumer = self.producer;
        drained
    }

    /// Whether completions can name every entry. Linked completions carry
    /// only the low 32 bits of an entry's device address, so a linked ring
    /// must lie within one 4 GiB window.
    pub fn completions_can_address<P: Platform>(&self, platform: &P) -> bool {
        match self.shape {
            SqShape::Flat => true,
            SqShape::Linked => within_completion_window(
                self.ring.device_addr(platform),
                self.capacity() as usize * SubmissionEntry::SIZE,
            ),
        }
    }

    /// Slot referenced by a completion's work-entry field. Linked rings
    /// must pass [`completions_can_address`](Self::completions_can_address).
    pub fn slot_for_completion<P: Platform>(&self, platform: &P, wqe: u32) -> Option<u32> {
        match self.shape {
            SqShape::Flat => (wqe < self.capacity()).then_some(wqe),
            SqShape::Linked => {
                // completions only carry the low 32 bits of the address
                let base = self.ring.device_addr(platform);
                let device = (base & !0xffff_ffff) | u64::from(wqe);
                let offset = platform.to_host_pointer(device).checked_sub(self.ring.addr)?;
                let stride = SubmissionEntry::SIZE as u64;
                if offset % stride != 0 || offset >= u64::from(self.capacity()) * stride {
                    return None;
                }
                Some((offset / stride) as u32)
            }
        }
    }
}

/// Whether `len` bytes from `device_start` share their upper 32 address bits.
pub(crate) fn within_completion_window(device_start: u64, len: usize) -> bool {
    let Some(span) = (len as u64).checked_sub(1) else {
        return true;
    };
    device_start
        .checked_add(span)
        .is_some_and(|last| last >> 32 == device_start >> 32)
}

impl<B> SubmissionQueue<B> {
    pub fn shape(&self) -> SqShape {
        self.shape
    }

    pub fn ring(&self) -> DmaRegion {
        self.ring
    }

    pub fn capacity(&self) -> u32 {
        self.producer.capacity()
    }

    /// Host address of the entry in `slot`.
    pub fn slot_addr(&self, slot: u32) -> Option<u64> {
        if slot >= self.capacity() {
            return None;
        }
        self.ring.offset(slot as usize * SubmissionEntry::SIZE)
    }

    pub fn producer(&self) -> RingIndex {
        self.producer
    }

    pub fn in_flight(&self) -> u32 {
        self.consumer.distance_to(&self.producer)
    }

    pub fn is_full(&self) -> bool {
        RingIndex::is_full(&self.producer, &self.consumer)
    }

    pub fn doorbell(&self) -> Option<Doorbell> {
        self.doorbell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;
    use crate::entry::LINK_VALID;
    use crate::platform::DmaOps;
    use crate::testing::{MockDevice, TestBuffer};

    fn queue(dev: &MockDevice, cap: u32, shape: SqShape) -> SubmissionQueue<TestBuffer> {
        let ring = dev
            .allocate_zeroed(cap as usize * SubmissionEntry::SIZE, PAGE_SIZE)
            .unwrap();
        let mut sq = SubmissionQueue::new(ring, cap, shape, false).unwrap();
        sq.bind(Some(Doorbell::new(0x1000)), None);
        sq
    }

    #[test]
    fn full_queue_returns_buffer_in_order() {
        let dev = MockDevice::new();
        let mut sq = queue(&dev, 8, SqShape::Flat);

        for id in 0..8 {
            assert_eq!(sq.post(&dev, TestBuffer::new(id, 64)).unwrap(), id);
        }
        let err = sq.post(&dev, TestBuffer::new(8, 64)).unwrap_err();
        assert_eq!(err.error, QueueError::Busy);
        assert_eq!(err.into_buffer().id, 8);
        assert_eq!(sq.in_flight(), 8);

        let ids: Vec<u32> = sq.drain_pending().iter().map(|b| b.id).collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
        assert_eq!(sq.in_flight(), 0);
    }

    #[test]
    fn entry_then_barrier_then_doorbell() {
        let dev = MockDevice::new();
        let mut sq = queue(&dev, 4, SqShape::Flat);

        dev.clear_mmio_log();
        sq.post(&dev, TestBuffer::new(1, 100)).unwrap();

        let entry = SubmissionEntry::read_acquire(&dev, sq.slot_addr(0).unwrap()).unwrap();
        assert_eq!(entry.addr, TestBuffer::new(1, 100).device_addr());
        assert_eq!(entry.len, 100);
        assert!(entry.flags().contains(SqFlags::PHASE));

        let log = dev.mmio_log();
        let bell = log.iter().position(|op| op.write_value().is_some()).unwrap();
        assert!(bell > 0 && log[..bell].iter().all(|op| op.is_barrier()));
        assert_eq!(log[bell].write_value(), Some((0x1000, 1)));
    }

    #[test]
    fn occupied_slot_blocks_reuse() {
        let dev = MockDevice::new();
        let mut sq = queue(&dev, 2, SqShape::Flat);

        sq.post(&dev, TestBuffer::new(0, 1)).unwrap();
        sq.post(&dev, TestBuffer::new(1, 1)).unwrap();
        // slot 1 completes before slot 0: space frees up, but slot 0 is
        // still owned by the device
        assert_eq!(sq.reclaim(1).unwrap().id, 1);
        let err = sq.post(&dev, TestBuffer::new(2, 1)).unwrap_err();
        assert_eq!(err.error, QueueError::Busy);

        assert_eq!(sq.reclaim(0).unwrap().id, 0);
        assert_eq!(sq.post(&dev, TestBuffer::new(2, 1)).unwrap(), 0);
        assert!(sq.reclaim(0).is_some());
        assert!(sq.reclaim(0).is_none());
    }

    #[test]
    fn linked_entries_are_chained_after_write() {
        let dev = MockDevice::new();
        let mut sq = queue(&dev, 4, SqShape::Linked);

        for id in 0..3 {
            sq.post(&dev, TestBuffer::new(id, 32)).unwrap();
        }
        for slot in 0..2 {
            let e = SubmissionEntry::read_acquire(&dev, sq.slot_addr(slot).unwrap()).unwrap();
            assert_eq!(e.next, LINK_VALID | (slot + 1));
        }
        let tail = SubmissionEntry::read_acquire(&dev, sq.slot_addr(2).unwrap()).unwrap();
        assert_eq!(tail.linked_slot(), None);
    }

    #[test]
    fn failed_link_hands_buffer_back() {
        let dev = MockDevice::new();
        let mut sq = queue(&dev, 4, SqShape::Linked);
        sq.post(&dev, TestBuffer::new(0, 32)).unwrap();
        let link = sq.slot_addr(0).unwrap() + SubmissionEntry::NEXT_OFFSET as u64;
        dev.fail_writes_at(link);
        dev.clear_mmio_log();

        let err = sq.post(&dev, TestBuffer::new(1, 32)).unwrap_err();
        assert_eq!(err.error, QueueError::Mem);
        assert_eq!(err.into_buffer().id, 1);
        assert_eq!(sq.in_flight(), 1);
        assert_eq!(sq.producer().counter(), 1);
        assert!(dev.writes_to(0x1000).is_empty());

        dev.clear_write_faults();
        assert_eq!(sq.post(&dev, TestBuffer::new(1, 32)).unwrap(), 1);
        let head = SubmissionEntry::read_acquire(&dev, sq.slot_addr(0).unwrap()).unwrap();
        assert_eq!(head.linked_slot(), Some(1));
        let ids: Vec<u32> = sq.drain_pending().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn linked_completion_address_maps_to_slot() {
        let dev = MockDevice::new();
        let sq = queue(&dev, 8, SqShape::Linked);

        for slot in 0..8 {
            let wqe = dev.to_device_address(sq.slot_addr(slot).unwrap()) as u32;
            assert_eq!(sq.slot_for_completion(&dev, wqe), Some(slot));
        }
        let base = dev.to_device_address(sq.ring().addr) as u32;
        assert_eq!(sq.slot_for_completion(&dev, base + 3), None);
        assert_eq!(
            sq.slot_for_completion(&dev, base + 8 * SubmissionEntry::SIZE as u32),
            None
        );
        assert_eq!(sq.slot_for_completion(&dev, base.wrapping_sub(24)), None);
    }

    #[test]
    fn completion_window_bounds() {
        assert!(within_completion_window(0x7_0000_0000, 0x1000));
        assert!(within_completion_window(0x7_ffff_f000, 0x1000));
        assert!(!within_completion_window(0x7_ffff_f000, 0x1001));
        assert!(within_completion_window(0x7_ffff_ffff, 1));
        assert!(within_completion_window(0x7_ffff_ffff, 0));
        assert!(!within_completion_window(u64::MAX, 2));
    }

    #[test]
    fn linked_ring_across_4g_is_not_addressable() {
        let dev = MockDevice::new();
        let flat = queue(&dev, 8, SqShape::Flat);
        let linked = queue(&dev, 8, SqShape::Linked);
        assert!(linked.completions_can_address(&dev));

        // a 4 GiB boundary right after the first entry of the linked ring
        let boundary = linked.ring().addr + SubmissionEntry::SIZE as u64;
        dev.set_device_offset(0x8_0000_0000 - boundary);
        assert!(!linked.completions_can_address(&dev));
        assert!(flat.completions_can_address(&dev));
    }

    #[test]
    fn flat_completion_slot_is_range_checked() {
        let dev = MockDevice::new();
        let sq = queue(&dev, 8, SqShape::Flat);
        assert_eq!(sq.slot_for_completion(&dev, 7), Some(7));
        assert_eq!(sq.slot_for_completion(&dev, 8), None);
    }
}
