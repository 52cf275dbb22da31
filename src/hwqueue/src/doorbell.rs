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

//! Doorbells and Doorbell Records
//!
//! A doorbell is an MMIO register write telling the device that a producer or
//! consumer counter moved. Some devices additionally read the counters from
//! host memory ("doorbell records"); those live in a [`DoorbellArena`], one
//! pair of records per queue-number offset.
//!
//! ```text
//!  arena offset:   0            1            2
//!               ┌──────┬──────┬──────┬──────┬──────┬──────┐
//!               │ prod │ cons │ prod │ cons │ prod │ cons │ ...
//!               └──────┴──────┴──────┴──────┴──────┴──────┘
//! ```

use crate::error::{QueueError, Result};
use crate::platform::{DmaRegion, MemOps, Mmio, Platform};

/// An MMIO doorbell register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Doorbell {
    offset: u64,
}

impl Doorbell {
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Notify the device of a new counter value.
    ///
    /// Issues a barrier first so that the counter update and every entry it
    /// exposes are visible before the device observes the doorbell.
    #[inline]
    pub fn ring<M: Mmio + ?Sized>(&self, mmio: &M, value: u32) {
        mmio.barrier();
        log::trace!("doorbell {:#x} <- {:#x}", self.offset, value);
        mmio.write32(self.offset, value);
    }
}

/// Which of the two records of a queue-number offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Submission counter, read by the device to find new work
    Producer,
    /// Completion consumer index, read by the device to reclaim space
    Consumer,
}

/// Handle to one doorbell record inside an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellRecord {
    addr: u64,
}

impl DoorbellRecord {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn write<M: MemOps + ?Sized>(&self, mem: &M, value: u32) -> Result<()> {
        mem.write_val(self.addr, value).map_err(|_| QueueError::Mem)
    }

    pub fn read<M: MemOps + ?Sized>(&self, mem: &M) -> Result<u32> {
        mem.read_val(self.addr).map_err(|_| QueueError::Mem)
    }
}

/// Bounds-checked arena of doorbell records indexed by queue-number offset.
#[derive(Debug)]
pub struct DoorbellArena {
    region: DmaRegion,
    slots: u32,
}

impl DoorbellArena {
    const RECORD_SIZE: usize = core::mem::size_of::<u32>();
    const SLOT_SIZE: usize = 2 * Self::RECORD_SIZE;

    /// Allocate a zeroed arena for `slots` queue-number offsets.
    pub fn new<P: Platform + ?Sized>(platform: &P, slots: u32) -> Result<Self> {
        let len = slots as usize * Self::SLOT_SIZE;
        let region = platform.allocate_zeroed(len, crate::PAGE_SIZE)?;
        Ok(Self { region, slots })
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Record of `kind` for queue-number `offset`, or `None` if the offset is
    /// outside the arena.
    pub fn record(&self, offset: u32, kind: RecordKind) -> Option<DoorbellRecord> {
        if offset >= self.slots {
            return None;
        }

        let within = match kind {
            RecordKind::Producer => 0,
            RecordKind::Consumer => Self::RECORD_SIZE,
        };
        let addr = self
            .region
            .offset(offset as usize * Self::SLOT_SIZE + within)?;
        Some(DoorbellRecord { addr })
    }

    /// Zero both records of `offset`.
    pub fn clear<M: MemOps + ?Sized>(&self, mem: &M, offset: u32) -> Result<()> {
        for kind in [RecordKind::Producer, RecordKind::Consumer] {
            self.record(offset, kind)
                .ok_or(QueueError::InvalidState)?
                .write(mem, 0)?;
        }
        Ok(())
    }

    /// Return the arena's memory to the platform.
    pub fn release<P: Platform + ?Sized>(self, platform: &P) {
        platform.free_dma(self.region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    #[test]
    fn records_are_bounds_checked() {
        let dev = MockDevice::new();
        let arena = DoorbellArena::new(&dev, 4).unwrap();

        let prod = arena.record(3, RecordKind::Producer).unwrap();
        let cons = arena.record(3, RecordKind::Consumer).unwrap();
        assert_eq!(cons.addr() - prod.addr(), 4);
        assert!(arena.record(4, RecordKind::Producer).is_none());

        prod.write(&dev, 17).unwrap();
        cons.write(&dev, 9).unwrap();
        assert_eq!(prod.read(&dev).unwrap(), 17);

        arena.clear(&dev, 3).unwrap();
        assert_eq!(prod.read(&dev).unwrap(), 0);
        assert_eq!(cons.read(&dev).unwrap(), 0);
        assert!(arena.clear(&dev, 4).is_err());
        arena.release(&dev);
    }

    #[test]
    fn doorbell_barrier_precedes_write() {
        let dev = MockDevice::new();
        Doorbell::new(0x800).ring(&dev, 5);

        let log = dev.mmio_log();
        assert_eq!(log.len(), 2);
        assert!(log[0].is_barrier());
        assert_eq!(log[1].write_value(), Some((0x800, 5)));
    }
}
