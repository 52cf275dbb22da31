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

//! Completion Queue
//!
//! The device is the only producer. The host consumes an entry in two steps:
//! [`CompletionQueue::peek`] acquires the ownership word and reads the body
//! without changing anything; [`CompletionQueue::consume`] hands the entry
//! back to the device, advances the consumer and publishes it. An empty
//! queue is never modified.

use crate::doorbell::{Doorbell, DoorbellRecord};
use crate::entry::CompletionEntry;
use crate::error::{QueueError, Result};
use crate::platform::{DmaRegion, MemOps, Platform};
use crate::qp::QueueKind;
use crate::ring::{Ownership, OwnershipMode, RingIndex};

/// A finished or cancelled submission, handed back with its buffer.
#[derive(Debug)]
pub struct CompletionEvent<B> {
    pub kind: QueueKind,
    pub buffer: B,
    /// Bytes transferred, or why the submission failed.
    pub result: core::result::Result<u32, QueueError>,
}

impl<B> CompletionEvent<B> {
    pub fn cancelled(kind: QueueKind, buffer: B) -> Self {
        Self {
            kind,
            buffer,
            result: Err(QueueError::Cancelled),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug)]
pub struct CompletionQueue {
    ring: DmaRegion,
    consumer: RingIndex,
    mode: OwnershipMode,
    doorbell: Option<Doorbell>,
    record: Option<DoorbellRecord>,
}

impl CompletionQueue {
    pub fn new(ring: DmaRegion, capacity: u32, mode: OwnershipMode) -> Option<Self> {
        let consumer = RingIndex::new(capacity)?;
        if ring.len < capacity as usize * CompletionEntry::SIZE {
            return None;
        }
        Some(Self {
            ring,
            consumer,
            mode,
            doorbell: None,
            record: None,
        })
    }

    pub(crate) fn bind(&mut self, doorbell: Option<Doorbell>, record: Option<DoorbellRecord>) {
        self.doorbell = doorbell;
        self.record = record;
    }

    /// Give every entry to the device. Must run before the ring is handed
    /// to firmware.
    pub fn initialize<M: MemOps>(&mut self, mem: &M) -> Result<()> {
        let word = self.mode.initial_word();
        for slot in 0..self.capacity() {
            CompletionEntry::store_owner(mem, self.slot_addr(slot), word)
                .map_err(|_| QueueError::Mem)?;
        }
        self.consumer = RingIndex::new(self.capacity()).ok_or(QueueError::InvalidState)?;
        Ok(())
    }

    fn slot_addr(&self, slot: u32) -> u64 {
        self.ring.addr + u64::from(slot) * CompletionEntry::SIZE as u64
    }

    /// The entry at the consumer if the device has handed it over.
    pub fn peek<M: MemOps>(&self, mem: &M) -> Result<Option<CompletionEntry>> {
        let addr = self.slot_addr(self.consumer.slot());
        let owner = CompletionEntry::load_owner(mem, addr).map_err(|_| QueueError::Mem)?;
        if self.mode.decode(owner, self.consumer.phase()) == Ownership::Device {
            return Ok(None);
        }
        CompletionEntry::read_body(mem, addr, owner)
            .map(Some)
            .map_err(|_| QueueError::Mem)
    }

    /// Return the entry at the consumer to the device and advance.
    pub fn consume<P: Platform>(&mut self, platform: &P) -> Result<()> {
        let addr = self.slot_addr(self.consumer.slot());
        CompletionEntry::store_owner(platform, addr, self.mode.device_word(self.consumer.phase()))
            .map_err(|_| QueueError::Mem)?;
        self.consumer.advance();

        if let Some(record) = self.record {
            record.write(platform, self.consumer.counter())?;
        }
        if let Some(doorbell) = self.doorbell {
            doorbell.ring(platform, self.consumer.counter());
        }
        Ok(())
    }

    pub fn ring(&self) -> DmaRegion {
        self.ring
    }

    pub fn capacity(&self) -> u32 {
        self.consumer.capacity()
    }

    pub fn mode(&self) -> OwnershipMode {
        self.mode
    }

    pub fn consumer(&self) -> RingIndex {
        self.consumer
    }

    pub fn doorbell(&self) -> Option<Doorbell> {
        self.doorbell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;
    use crate::entry::CqeOpcode;
    use crate::ring::Phase;
    use crate::testing::MockDevice;

    fn cq(dev: &MockDevice, cap: u32, mode: OwnershipMode) -> CompletionQueue {
        let ring = dev
            .allocate_zeroed(cap as usize * CompletionEntry::SIZE, PAGE_SIZE)
            .unwrap();
        let mut cq = CompletionQueue::new(ring, cap, mode).unwrap();
        cq.initialize(dev).unwrap();
        cq
    }

    fn publish(dev: &MockDevice, cq: &CompletionQueue, counter: u32, wqe: u32) {
        let shift = cq.capacity().trailing_zeros();
        let entry = CompletionEntry {
            qpn: 1,
            wqe,
            byte_count: 60,
            opcode: CqeOpcode::RECV,
            _rsvd: 0,
            owner: cq.mode().host_word(Phase::of_lap(counter >> shift)),
        };
        let slot = counter & (cq.capacity() - 1);
        entry
            .write_release(dev, cq.ring().addr + u64::from(slot) * CompletionEntry::SIZE as u64)
            .unwrap();
    }

    #[test]
    fn empty_peek_changes_nothing() {
        for mode in [OwnershipMode::OwnerBit, OwnershipMode::Phase] {
            let dev = MockDevice::new();
            let cq = cq(&dev, 4, mode);
            let mut before = vec![0u8; cq.ring().len];
            dev.read(cq.ring().addr, &mut before).unwrap();
            dev.clear_mmio_log();

            assert!(cq.peek(&dev).unwrap().is_none());
            assert!(cq.peek(&dev).unwrap().is_none());

            let mut after = vec![0u8; cq.ring().len];
            dev.read(cq.ring().addr, &mut after).unwrap();
            assert_eq!(before, after);
            assert_eq!(cq.consumer().counter(), 0);
            assert!(dev.mmio_log().is_empty());
        }
    }

    #[test]
    fn consume_hands_entry_back_for_every_lap() {
        for mode in [OwnershipMode::OwnerBit, OwnershipMode::Phase] {
            let dev = MockDevice::new();
            let mut cq = cq(&dev, 4, mode);

            for counter in 0..12 {
                publish(&dev, &cq, counter, counter);
                let entry = cq.peek(&dev).unwrap().unwrap();
                assert_eq!(entry.wqe, counter);
                cq.consume(&dev).unwrap();
                // the consumed entry must not be seen again
                assert!(cq.peek(&dev).unwrap().is_none());
            }
            assert_eq!(cq.consumer().counter(), 12);
        }
    }

    #[test]
    fn owner_bit_initialized_to_device() {
        let dev = MockDevice::new();
        let cq = cq(&dev, 8, OwnershipMode::OwnerBit);
        for slot in 0..8 {
            let owner = CompletionEntry::load_owner(&dev, cq.slot_addr(slot)).unwrap();
            assert_eq!(
                OwnershipMode::OwnerBit.decode(owner, Phase::INITIAL),
                Ownership::Device
            );
        }
    }

    #[test]
    fn consumer_published_through_record_and_doorbell() {
        let dev = MockDevice::new();
        let arena = crate::doorbell::DoorbellArena::new(&dev, 1).unwrap();
        let record = arena
            .record(0, crate::doorbell::RecordKind::Consumer)
            .unwrap();
        let mut cq = cq(&dev, 4, OwnershipMode::OwnerBit);
        cq.bind(Some(Doorbell::new(0x2000)), Some(record));

        publish(&dev, &cq, 0, 0);
        cq.peek(&dev).unwrap().unwrap();
        cq.consume(&dev).unwrap();

        assert_eq!(record.read(&dev).unwrap(), 1);
        assert_eq!(dev.writes_to(0x2000), vec![1]);
    }
}
