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

//! Queue-number allocation.
//!
//! Hardware queue numbers start at a base reserved by firmware; the bitmap
//! tracks offsets from that base. The search is `FixedBitSet::zeroes()`,
//! which skips fully used words at a time, so the lowest free number is
//! always handed out first.

use fixedbitset::FixedBitSet;

use crate::error::{QueueError, Result};

/// An allocated queue number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueNumber {
    offset: u32,
    base: u32,
    /// Allocator generation the number was handed out in.
    generation: u32,
}

impl QueueNumber {
    /// Index into per-queue host arrays such as the doorbell-record arena.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Number the device knows the queue by.
    pub fn hw(&self) -> u32 {
        self.base + self.offset
    }
}

/// Bitmap allocator over one contiguous range of queue numbers.
///
/// Every [`clear`](Self::clear) or [`reconfigure`](Self::reconfigure) starts
/// a new generation. Numbers from an earlier generation are rejected by
/// [`free`](Self::free) even when the base is unchanged and their offset has
/// been handed out again.
#[derive(Debug)]
pub struct QueueNumberAllocator {
    used: FixedBitSet,
    base: u32,
    generation: u32,
}

impl QueueNumberAllocator {
    pub fn new(count: u32, reserved_base: u32) -> Self {
        Self {
            used: FixedBitSet::with_capacity(count as usize),
            base: reserved_base,
            generation: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.used.len() as u32
    }

    pub fn reserved_base(&self) -> u32 {
        self.base
    }

    pub fn in_use(&self) -> u32 {
        self.used.count_ones(..) as u32
    }

    pub fn allocate(&mut self) -> Result<QueueNumber> {
        let Some(offset) = self.used.zeroes().next() else {
            log::warn!("all {} queue numbers in use", self.capacity());
            return Err(QueueError::Exhausted);
        };

        self.used.insert(offset);
        Ok(QueueNumber {
            offset: offset as u32,
            base: self.base,
            generation: self.generation,
        })
    }

    pub fn free(&mut self, qn: QueueNumber) -> Result<()> {
        let idx = qn.offset as usize;
        if qn.generation != self.generation
            || qn.base != self.base
            || idx >= self.used.len()
            || !self.used.contains(idx)
        {
            return Err(QueueError::InvalidState);
        }
        self.used.set(idx, false);
        Ok(())
    }

    /// Forget every allocation. Used once the device has reset and no
    /// longer knows any queue.
    pub fn clear(&mut self) {
        let held = self.in_use();
        if held != 0 {
            log::debug!("forgetting {} queue numbers", held);
        }
        self.used.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Re-size the number space, e.g. once firmware has reported its
    /// reservation. Only allowed while nothing is allocated; numbers handed
    /// out before the call are stale afterwards, whatever the new base.
    pub fn reconfigure(&mut self, count: u32, reserved_base: u32) -> Result<()> {
        if self.in_use() != 0 {
            return Err(QueueError::InvalidState);
        }
        self.used = FixedBitSet::with_capacity(count as usize);
        self.base = reserved_base;
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_number_first() {
        let mut alloc = QueueNumberAllocator::new(4, 0x40);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!((a.offset(), a.hw()), (0, 0x40));
        assert_eq!((b.offset(), b.hw()), (1, 0x41));

        alloc.free(a).unwrap();
        assert_eq!(alloc.allocate().unwrap().offset(), 0);
    }

    #[test]
    fn exhaustion_and_double_free() {
        let mut alloc = QueueNumberAllocator::new(2, 0);
        let a = alloc.allocate().unwrap();
        alloc.allocate().unwrap();
        assert_eq!(alloc.allocate().unwrap_err(), QueueError::Exhausted);

        alloc.free(a).unwrap();
        assert_eq!(alloc.free(a).unwrap_err(), QueueError::InvalidState);
        assert_eq!(alloc.in_use(), 1);
    }

    #[test]
    fn reconfigure_requires_idle() {
        let mut alloc = QueueNumberAllocator::new(2, 0);
        let a = alloc.allocate().unwrap();
        assert!(alloc.reconfigure(8, 16).is_err());

        alloc.free(a).unwrap();
        alloc.reconfigure(8, 16).unwrap();
        assert_eq!(alloc.capacity(), 8);
        assert_eq!(alloc.allocate().unwrap().hw(), 16);
        // numbers from before the reconfiguration are rejected
        assert!(alloc.free(a).is_err());
    }

    #[test]
    fn same_base_reconfigure_rejects_stale_numbers() {
        let mut alloc = QueueNumberAllocator::new(4, 16);
        let stale = alloc.allocate().unwrap();
        alloc.free(stale).unwrap();

        alloc.reconfigure(4, 16).unwrap();
        let fresh = alloc.allocate().unwrap();
        assert_eq!(fresh.hw(), stale.hw());
        assert_ne!(fresh, stale);

        assert_eq!(alloc.free(stale).unwrap_err(), QueueError::InvalidState);
        assert_eq!(alloc.in_use(), 1);
        alloc.free(fresh).unwrap();
    }

    #[test]
    fn clear_forgets_everything() {
        let mut alloc = QueueNumberAllocator::new(2, 0);
        let a = alloc.allocate().unwrap();
        alloc.allocate().unwrap();

        alloc.clear();
        assert_eq!(alloc.in_use(), 0);
        assert_eq!(alloc.capacity(), 2);
        assert!(alloc.free(a).is_err());
        assert_eq!(alloc.allocate().unwrap().offset(), 0);
        // a cleared allocator can be re-sized again
        alloc.clear();
        alloc.reconfigure(4, 8).unwrap();
    }
}

#[cfg(test)]
mod fuzz {
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    const COUNT: u32 = 8;
    const MAX_OPS: usize = 64;

    #[derive(Clone, Debug)]
    enum Op {
        Allocate,
        /// free the n-th held number, modulo the number held
        Free(u8),
        Clear,
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            match u8::arbitrary(g) % 8 {
                0..=3 => Op::Allocate,
                4..=6 => Op::Free(u8::arbitrary(g)),
                _ => Op::Clear,
            }
        }
    }

    #[derive(Clone, Debug)]
    struct Scenario {
        base: u32,
        ops: Vec<Op>,
    }

    impl Arbitrary for Scenario {
        fn arbitrary(g: &mut Gen) -> Self {
            let base = u32::arbitrary(g) % 64;
            let num_ops = usize::arbitrary(g) % MAX_OPS + 1;
            let ops = (0..num_ops).map(|_| Op::arbitrary(g)).collect();
            Scenario { base, ops }
        }
    }

    fn run_scenario(scenario: Scenario) -> bool {
        let mut alloc = QueueNumberAllocator::new(COUNT, scenario.base);
        let mut held: Vec<QueueNumber> = Vec::new();
        let mut forgotten: Vec<QueueNumber> = Vec::new();

        for op in scenario.ops {
            match op {
                Op::Allocate => match alloc.allocate() {
                    Ok(qn) => {
                        if held.iter().any(|h| h.hw() == qn.hw()) || qn.hw() < scenario.base {
                            return false;
                        }
                        held.push(qn);
                    }
                    Err(e) => {
                        if e != QueueError::Exhausted || held.len() != COUNT as usize {
                            return false;
                        }
                    }
                },
                Op::Free(n) if !held.is_empty() => {
                    let qn = held.remove(n as usize % held.len());
                    if alloc.free(qn).is_err() {
                        return false;
                    }
                }
                Op::Free(_) => {}
                Op::Clear => {
                    alloc.clear();
                    forgotten.append(&mut held);
                }
            }
            if alloc.in_use() as usize != held.len() {
                return false;
            }
        }

        // nothing from before a clear may be freed again
        forgotten.into_iter().all(|qn| alloc.free(qn).is_err())
    }

    #[test]
    fn prop_never_hands_out_a_number_twice() {
        #[cfg(miri)]
        let tests = 1;
        #[cfg(not(miri))]
        let tests = 100;

        QuickCheck::new()
            .tests(tests)
            .quickcheck(run_scenario as fn(Scenario) -> bool);
    }
}
