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

//! Event Queue
//!
//! Asynchronous device events arrive on an owner-bit ring. Every entry starts
//! out owned by the device; the host drains the entries the device has handed
//! over, gives each one back, and then reports its consumer counter through
//! the event queue's doorbell:
//!
//! ```text
//!   acquire owner ─> read entry ─> owner = device ─> advance
//!        ... ─> barrier ─> doorbell(consumer)
//! ```

use crate::doorbell::Doorbell;
use crate::entry::{EventEntry, EventType, PORT_ACTIVE};
use crate::error::{QueueError, Result};
use crate::platform::{DmaRegion, MemOps, Platform};
use crate::ring::{Ownership, OwnershipMode, RingIndex};

/// A decoded device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    PortStateChange { port: u8, up: bool },
    Other { event_type: u8, sub_type: u8 },
}

impl From<&EventEntry> for Event {
    fn from(entry: &EventEntry) -> Self {
        match entry.event_type {
            EventType::PORT_STATE_CHANGE => Event::PortStateChange {
                port: entry.port,
                up: entry.sub_type & PORT_ACTIVE != 0,
            },
            event_type => Event::Other {
                event_type,
                sub_type: entry.sub_type,
            },
        }
    }
}

#[derive(Debug)]
pub struct EventQueue {
    ring: DmaRegion,
    consumer: RingIndex,
    number: u32,
    doorbell: Option<Doorbell>,
}

impl EventQueue {
    const MODE: OwnershipMode = OwnershipMode::OwnerBit;

    pub fn new(ring: DmaRegion, capacity: u32, number: u32) -> Option<Self> {
        let consumer = RingIndex::new(capacity)?;
        if ring.len < capacity as usize * EventEntry::SIZE {
            return None;
        }
        Some(Self {
            ring,
            consumer,
            number,
            doorbell: None,
        })
    }

    pub(crate) fn bind(&mut self, doorbell: Option<Doorbell>) {
        self.doorbell = doorbell;
    }

    /// Give every entry to the device and restart the consumer.
    pub fn initialize<M: MemOps>(&mut self, mem: &M) -> Result<()> {
        for slot in 0..self.capacity() {
            EventEntry::store_owner(mem, self.slot_addr(slot), Self::MODE.initial_word())
                .map_err(|_| QueueError::Mem)?;
        }
        self.consumer = RingIndex::new(self.capacity()).ok_or(QueueError::InvalidState)?;
        Ok(())
    }

    fn slot_addr(&self, slot: u32) -> u64 {
        self.ring.addr + u64::from(slot) * EventEntry::SIZE as u64
    }

    /// Hand every event the device has published to `sink`, at most one
    /// ring's worth per call. Returns the number of events drained.
    pub fn drain<P: Platform>(
        &mut self,
        platform: &P,
        sink: &mut impl FnMut(Event),
    ) -> Result<usize> {
        let mut drained = 0;
        while drained < self.capacity() as usize {
            let addr = self.slot_addr(self.consumer.slot());
            let owner = EventEntry::load_owner(platform, addr).map_err(|_| QueueError::Mem)?;
            if Self::MODE.decode(owner, self.consumer.phase()) == Ownership::Device {
                break;
            }
            let entry = EventEntry::read_body(platform, addr, owner).map_err(|_| QueueError::Mem)?;
            log::trace!(
                "event queue {:#x}: type {:#04x} sub {:#04x}",
                self.number,
                entry.event_type,
                entry.sub_type
            );

            EventEntry::store_owner(platform, addr, Self::MODE.device_word(self.consumer.phase()))
                .map_err(|_| QueueError::Mem)?;
            self.consumer.advance();
            drained += 1;
            sink(Event::from(&entry));
        }

        if drained != 0
            && let Some(doorbell) = self.doorbell
        {
            doorbell.ring(platform, self.consumer.counter());
        }
        Ok(drained)
    }

    pub fn ring(&self) -> DmaRegion {
        self.ring
    }

    pub fn capacity(&self) -> u32 {
        self.consumer.capacity()
    }

    /// Number the device knows the queue by.
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn consumer(&self) -> RingIndex {
        self.consumer
    }

    pub fn doorbell(&self) -> Option<Doorbell> {
        self.doorbell
    }
}
