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

//! Data Path Entry Layouts
//!
//! Wire formats of submission, completion and event ring entries. The word
//! that hands an entry to the other side (`flags` for submissions, `owner`
//! for completions and events) is always written last with release semantics
//! and read first with acquire semantics.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::platform::MemOps;
use crate::ring::Phase;

bitflags! {
    /// Submission entry control flags.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SqFlags: u16 {
        /// Lap phase of the producer when the entry was written.
        const PHASE = 1 << 0;
        /// Device writes into the buffer (receive).
        const WRITE = 1 << 1;
        /// First entry of a packet.
        const FIRST = 1 << 2;
        /// Last entry of a packet.
        const LAST  = 1 << 3;
    }
}

/// `next` value marking a linked entry as pointing at a valid successor.
pub const LINK_VALID: u32 = 1 << 31;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct SubmissionEntry {
    /// Device address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Link to the successor entry in linked rings, `LINK_VALID | slot`.
    /// Zero while the entry is the tail of the chain.
    pub next: u32,
    /// Slot index echoed back by completions of flat rings.
    pub tag: u16,
    /// [`SqFlags`].
    pub flags: u16,
    pub _rsvd: u32,
}

const _: () = assert!(core::mem::size_of::<SubmissionEntry>() == 24);
const _: () = assert!(SubmissionEntry::ADDR_OFFSET == 0);
const _: () = assert!(SubmissionEntry::LEN_OFFSET == 8);
const _: () = assert!(SubmissionEntry::NEXT_OFFSET == 12);
const _: () = assert!(SubmissionEntry::TAG_OFFSET == 16);
const _: () = assert!(SubmissionEntry::FLAGS_OFFSET == 18);

impl SubmissionEntry {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = core::mem::align_of::<Self>();

    pub const ADDR_OFFSET: usize = core::mem::offset_of!(Self, addr);
    pub const LEN_OFFSET: usize = core::mem::offset_of!(Self, len);
    pub const NEXT_OFFSET: usize = core::mem::offset_of!(Self, next);
    pub const TAG_OFFSET: usize = core::mem::offset_of!(Self, tag);
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);

    pub fn new(addr: u64, len: u32, tag: u16, flags: SqFlags, phase: Phase) -> Self {
        let mut flags = flags;
        flags.set(SqFlags::PHASE, phase == Phase::One);
        Self {
            addr,
            len,
            next: 0,
            tag,
            flags: flags.bits(),
            _rsvd: 0,
        }
    }

    #[inline]
    pub fn flags(&self) -> SqFlags {
        SqFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_bit(self.flags)
    }

    /// Slot of the successor entry if the link has been published.
    #[inline]
    pub fn linked_slot(&self) -> Option<u32> {
        if self.next & LINK_VALID == 0 {
            return None;
        }
        Some(self.next & !LINK_VALID)
    }

    /// Write the entry, publishing `flags` last with release semantics.
    pub fn write_release<M: MemOps>(&self, mem: &M, addr: u64) -> Result<(), M::Error> {
        mem.write_val(addr + Self::ADDR_OFFSET as u64, self.addr)?;
        mem.write_val(addr + Self::LEN_OFFSET as u64, self.len)?;
        mem.write_val(addr + Self::NEXT_OFFSET as u64, self.next)?;
        mem.write_val(addr + Self::TAG_OFFSET as u64, self.tag)?;
        mem.store_release(addr + Self::FLAGS_OFFSET as u64, self.flags)?;
        Ok(())
    }

    /// Read an entry, loading `flags` first with acquire semantics.
    pub fn read_acquire<M: MemOps>(mem: &M, addr: u64) -> Result<Self, M::Error> {
        let flags = mem.load_acquire(addr + Self::FLAGS_OFFSET as u64)?;
        Ok(Self {
            addr: mem.read_val(addr + Self::ADDR_OFFSET as u64)?,
            len: mem.read_val(addr + Self::LEN_OFFSET as u64)?,
            next: mem.read_val(addr + Self::NEXT_OFFSET as u64)?,
            tag: mem.read_val(addr + Self::TAG_OFFSET as u64)?,
            flags,
            _rsvd: 0,
        })
    }

    /// Point the entry at `addr` to its successor in `slot`.
    pub fn publish_link<M: MemOps>(mem: &M, addr: u64, slot: u32) -> Result<(), M::Error> {
        mem.write_val(addr + Self::NEXT_OFFSET as u64, LINK_VALID | slot)
    }
}

/// Completion opcodes. Values at or above [`RECV_ERROR`](Self::RECV_ERROR)
/// use the error layout.
pub struct CqeOpcode;

impl CqeOpcode {
    pub const SEND: u8 = 0x00;
    pub const RECV: u8 = 0x01;
    pub const RECV_ERROR: u8 = 0xfe;
    pub const SEND_ERROR: u8 = 0xff;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub struct CompletionEntry {
    /// Hardware queue number the completion belongs to.
    pub qpn: u32,
    /// Reference to the work entry: its slot in flat rings, the low 32 bits
    /// of its device address in linked rings.
    pub wqe: u32,
    /// Bytes transferred. Error completions carry `vendor << 8 | syndrome`.
    pub byte_count: u32,
    /// [`CqeOpcode`].
    pub opcode: u8,
    pub _rsvd: u8,
    /// Ownership word, see [`OwnershipMode`](crate::ring::OwnershipMode).
    pub owner: u16,
}

const _: () = assert!(core::mem::size_of::<CompletionEntry>() == 16);
const _: () = assert!(CompletionEntry::QPN_OFFSET == 0);
const _: () = assert!(CompletionEntry::WQE_OFFSET == 4);
const _: () = assert!(CompletionEntry::BYTE_COUNT_OFFSET == 8);
const _: () = assert!(CompletionEntry::OPCODE_OFFSET == 12);
const _: () = assert!(CompletionEntry::OWNER_OFFSET == 14);

/// Failure details carried by error completions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionSyndrome {
    pub syndrome: u8,
    pub vendor: u8,
}

impl CompletionEntry {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = core::mem::align_of::<Self>();

    pub const QPN_OFFSET: usize = core::mem::offset_of!(Self, qpn);
    pub const WQE_OFFSET: usize = core::mem::offset_of!(Self, wqe);
    pub const BYTE_COUNT_OFFSET: usize = core::mem::offset_of!(Self, byte_count);
    pub const OPCODE_OFFSET: usize = core::mem::offset_of!(Self, opcode);
    pub const OWNER_OFFSET: usize = core::mem::offset_of!(Self, owner);

    /// Error completions have a different layout and must be recognised
    /// before any other field is interpreted.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.opcode >= CqeOpcode::RECV_ERROR
    }

    /// Whether the completion answers a send. `None` for unknown opcodes.
    pub fn is_send(&self) -> Option<bool> {
        match self.opcode {
            CqeOpcode::SEND | CqeOpcode::SEND_ERROR => Some(true),
            CqeOpcode::RECV | CqeOpcode::RECV_ERROR => Some(false),
            _ => None,
        }
    }

    #[inline]
    pub fn syndrome(&self) -> CompletionSyndrome {
        CompletionSyndrome {
            syndrome: (self.byte_count & 0xff) as u8,
            vendor: ((self.byte_count >> 8) & 0xff) as u8,
        }
    }

    /// Acquire-load the ownership word of the entry at `addr`.
    #[inline]
    pub fn load_owner<M: MemOps>(mem: &M, addr: u64) -> Result<u16, M::Error> {
        mem.load_acquire(addr + Self::OWNER_OFFSET as u64)
    }

    /// Read the remaining fields of an entry whose ownership word was already
    /// acquired.
    pub fn read_body<M: MemOps>(mem: &M, addr: u64, owner: u16) -> Result<Self, M::Error> {
        Ok(Self {
            qpn: mem.read_val(addr + Self::QPN_OFFSET as u64)?,
            wqe: mem.read_val(addr + Self::WQE_OFFSET as u64)?,
            byte_count: mem.read_val(addr + Self::BYTE_COUNT_OFFSET as u64)?,
            opcode: mem.read_val(addr + Self::OPCODE_OFFSET as u64)?,
            _rsvd: 0,
            owner,
        })
    }

    /// Write the entry, publishing `owner` last with release semantics.
    pub fn write_release<M: MemOps>(&self, mem: &M, addr: u64) -> Result<(), M::Error> {
        mem.write_val(addr + Self::QPN_OFFSET as u64, self.qpn)?;
        mem.write_val(addr + Self::WQE_OFFSET as u64, self.wqe)?;
        mem.write_val(addr + Self::BYTE_COUNT_OFFSET as u64, self.byte_count)?;
        mem.write_val(addr + Self::OPCODE_OFFSET as u64, self.opcode)?;
        mem.store_release(addr + Self::OWNER_OFFSET as u64, self.owner)?;
        Ok(())
    }

    /// Hand the entry at `addr` back to the device.
    #[inline]
    pub fn store_owner<M: MemOps>(mem: &M, addr: u64, owner: u16) -> Result<(), M::Error> {
        mem.store_release(addr + Self::OWNER_OFFSET as u64, owner)
    }
}

/// Asynchronous event types.
pub struct EventType;

impl EventType {
    pub const PORT_STATE_CHANGE: u8 = 0x09;
}

/// `sub_type` bit of a port state change reporting the link as up.
pub const PORT_ACTIVE: u8 = 0x04;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct EventEntry {
    /// [`EventType`].
    pub event_type: u8,
    pub sub_type: u8,
    /// Port the event refers to, counting from 1.
    pub port: u8,
    pub _rsvd0: u8,
    pub data: [u32; 2],
    pub _rsvd1: u16,
    /// Owner bit: set while the device owns the entry.
    pub owner: u16,
}

const _: () = assert!(core::mem::size_of::<EventEntry>() == 16);
const _: () = assert!(EventEntry::OWNER_OFFSET == 14);

impl EventEntry {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const OWNER_OFFSET: usize = core::mem::offset_of!(Self, owner);

    #[inline]
    pub fn load_owner<M: MemOps>(mem: &M, addr: u64) -> Result<u16, M::Error> {
        mem.load_acquire(addr + Self::OWNER_OFFSET as u64)
    }

    /// Read the entry whose ownership word was already acquired.
    pub fn read_body<M: MemOps>(mem: &M, addr: u64, owner: u16) -> Result<Self, M::Error> {
        let mut entry: Self = mem.read_val(addr)?;
        entry.owner = owner;
        Ok(entry)
    }

    /// Write the entry, publishing `owner` last with release semantics.
    pub fn write_release<M: MemOps>(&self, mem: &M, addr: u64) -> Result<(), M::Error> {
        mem.write(addr, &bytemuck::bytes_of(self)[..Self::OWNER_OFFSET])?;
        mem.store_release(addr + Self::OWNER_OFFSET as u64, self.owner)
    }

    #[inline]
    pub fn store_owner<M: MemOps>(mem: &M, addr: u64, owner: u16) -> Result<(), M::Error> {
        mem.store_release(addr + Self::OWNER_OFFSET as u64, owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_phase_follows_lap() {
        let e = SubmissionEntry::new(0x1000, 64, 3, SqFlags::FIRST | SqFlags::LAST, Phase::One);
        assert!(e.flags().contains(SqFlags::PHASE));
        assert!(e.flags().contains(SqFlags::FIRST | SqFlags::LAST));
        assert_eq!(e.phase(), Phase::One);

        let e = SubmissionEntry::new(0x1000, 64, 3, SqFlags::WRITE | SqFlags::PHASE, Phase::Zero);
        assert!(!e.flags().contains(SqFlags::PHASE));
        assert!(e.flags().contains(SqFlags::WRITE));
    }

    #[test]
    fn link_is_invalid_until_published() {
        let mut e = SubmissionEntry::zeroed();
        assert_eq!(e.linked_slot(), None);
        e.next = LINK_VALID | 5;
        assert_eq!(e.linked_slot(), Some(5));
    }

    #[test]
    fn error_opcodes_are_recognised_first() {
        let mut c = CompletionEntry::zeroed();
        c.opcode = CqeOpcode::SEND_ERROR;
        c.byte_count = 0x0204;
        assert!(c.is_error());
        assert_eq!(c.is_send(), Some(true));
        assert_eq!(
            c.syndrome(),
            CompletionSyndrome {
                syndrome: 0x04,
                vendor: 0x02
            }
        );

        c.opcode = CqeOpcode::RECV_ERROR;
        assert!(c.is_error());
        assert_eq!(c.is_send(), Some(false));

        c.opcode = CqeOpcode::RECV;
        assert!(!c.is_error());
        assert_eq!(c.is_send(), Some(false));

        c.opcode = 0x42;
        assert!(!c.is_error());
        assert_eq!(c.is_send(), None);
    }
}
