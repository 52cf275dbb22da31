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

//! Ring Index Arithmetic
//!
//! Every queue the engine drives is a power-of-two ring addressed by
//! free-running 32-bit counters. The slot is the low bits of the counter and
//! the phase is the next bit up, so the phase flips exactly once per lap:
//!
//! ```text
//!  counter:  0  1 .. 15 | 16 17 .. 31 | 32 33 .. 47
//!  slot:     0  1 .. 15 |  0  1 .. 15 |  0  1 .. 15
//!  phase:    1  1 ..  1 |  0  0 ..  0 |  1  1 ..  1
//! ```
//!
//! Entries written on lap `n` carry `phase(n)`, so an entry left over from
//! the previous lap never looks valid and the host never has to clear a slot
//! between laps.
//!
//! # Ownership
//!
//! Completion entries carry an ownership word decoded into [`Ownership`].
//! Two wire encodings exist, selected by [`OwnershipMode`]:
//!
//! - **OwnerBit**: bit set means the device owns the entry. The host sets it
//!   again after consuming an entry.
//! - **Phase**: the entry belongs to the host when its phase bit matches the
//!   consumer's phase for the current lap.

/// Bit carrying the owner or phase flag in ownership words.
pub const OWNERSHIP_BIT: u16 = 1 << 0;

/// Lap parity of a ring counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Zero,
    One,
}

impl Phase {
    /// Phase of the first lap.
    pub const INITIAL: Phase = Phase::One;

    /// Phase of lap number `lap`.
    #[inline]
    pub fn of_lap(lap: u32) -> Self {
        if lap & 1 == 0 { Phase::One } else { Phase::Zero }
    }

    #[inline]
    pub fn flipped(self) -> Self {
        match self {
            Phase::Zero => Phase::One,
            Phase::One => Phase::Zero,
        }
    }

    /// Wire encoding in an ownership or flags word.
    #[inline]
    pub fn bit(self) -> u16 {
        match self {
            Phase::Zero => 0,
            Phase::One => OWNERSHIP_BIT,
        }
    }

    #[inline]
    pub fn from_bit(word: u16) -> Self {
        if word & OWNERSHIP_BIT != 0 {
            Phase::One
        } else {
            Phase::Zero
        }
    }
}

/// Which side may currently use a completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// The device may write the entry; the host must not read it.
    Device,
    /// The device has written the entry and handed it to the host.
    Host,
}

/// Wire encoding of [`Ownership`] used by a completion ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnershipMode {
    /// Explicit owner bit: set = device, clear = host.
    OwnerBit,
    /// Phase bit compared against the consumer's lap phase.
    Phase,
}

impl OwnershipMode {
    /// Decode the ownership word of an entry read while the consumer is on a
    /// lap with phase `expected`.
    #[inline]
    pub fn decode(self, word: u16, expected: Phase) -> Ownership {
        match self {
            OwnershipMode::OwnerBit => {
                if word & OWNERSHIP_BIT != 0 {
                    Ownership::Device
                } else {
                    Ownership::Host
                }
            }
            OwnershipMode::Phase => {
                if Phase::from_bit(word) == expected {
                    Ownership::Host
                } else {
                    Ownership::Device
                }
            }
        }
    }

    /// Ownership word handing an entry consumed on a lap with phase `current`
    /// back to the device. The entry reads as [`Ownership::Device`] on every
    /// later lap until the device rewrites it.
    #[inline]
    pub fn device_word(self, current: Phase) -> u16 {
        match self {
            OwnershipMode::OwnerBit => OWNERSHIP_BIT,
            OwnershipMode::Phase => current.bit(),
        }
    }

    /// Ownership word of a freshly created ring entry.
    #[inline]
    pub fn initial_word(self) -> u16 {
        match self {
            OwnershipMode::OwnerBit => OWNERSHIP_BIT,
            OwnershipMode::Phase => Phase::INITIAL.flipped().bit(),
        }
    }

    /// Ownership word the device writes when completing an entry on a lap
    /// with phase `current`.
    #[inline]
    pub fn host_word(self, current: Phase) -> u16 {
        match self {
            OwnershipMode::OwnerBit => 0,
            OwnershipMode::Phase => current.bit(),
        }
    }
}

/// A free-running ring counter.
///
/// The counter only ever increments; slot and phase are derived from it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingIndex {
    counter: u32,
    shift: u32,
}

impl RingIndex {
    /// Create a counter at zero for a ring of `capacity` entries.
    ///
    /// Returns `None` unless `capacity` is a non-zero power of two.
    pub fn new(capacity: u32) -> Option<Self> {
        if !capacity.is_power_of_two() {
            return None;
        }

        Some(Self {
            counter: 0,
            shift: capacity.trailing_zeros(),
        })
    }

    /// Number of entries in the ring.
    #[inline]
    pub fn capacity(&self) -> u32 {
        1 << self.shift
    }

    /// Raw counter value.
    #[inline]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Ring slot addressed by the counter.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.counter & (self.capacity() - 1)
    }

    /// Phase of the lap the counter is on.
    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::of_lap(self.counter >> self.shift)
    }

    /// Advance by one entry, flipping the phase when the slot wraps to zero.
    #[inline]
    pub fn advance(&mut self) {
        self.counter = self.counter.wrapping_add(1);
    }

    /// Entries between this consumer counter and `producer`.
    #[inline]
    pub fn distance_to(&self, producer: &RingIndex) -> u32 {
        producer.counter.wrapping_sub(self.counter)
    }

    /// Whether a producer at `producer` may not post more entries over a
    /// consumer at `consumer`.
    #[inline]
    pub fn is_full(producer: &RingIndex, consumer: &RingIndex) -> bool {
        consumer.distance_to(producer) >= producer.capacity()
    }
}
