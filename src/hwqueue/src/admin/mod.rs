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

//! Admin Queue
//!
//! The control-plane channel to device firmware. Commands are synchronous:
//! [`AdminQueue::submit`] issues one command and busy-waits, bounded by the
//! configured timeout, for its completion.
//!
//! Three handshakes are supported, one per [`AdminQueue`] variant:
//!
//! - [`PhaseRing`](AdminQueue::PhaseRing): a request ring and a response
//!   ring. Each request's phase flag flips per lap to mark it ready; the
//!   response is ready once its phase flag matches the consumer lap.
//! - [`EventCounter`](AdminQueue::EventCounter): a command ring and a device
//!   event-counter register. A command has completed once the counter has
//!   caught up with the producer; status is written back into the slot.
//! - [`GoBit`](AdminQueue::GoBit): a single command register block. The
//!   host sets the go bit to issue; the device clears it on completion.
//!
//! # Outcomes
//!
//! ```text
//!   submit ──> Busy          previous command still owns the interface
//!          ──> Timeout       no completion within the admin timeout
//!          ──> Reset         the device reset while we were waiting
//!          ──> DeviceError   firmware reported a failure status
//!          ──> Corrupted     response does not match the request
//!          ──> Ok(response)
//! ```
//!
//! A command that timed out may still complete later. The queue remembers
//! this and the next `submit` re-synchronizes first, failing with `Busy`
//! until the interface is idle again. Nothing here retries on its own.

mod event_counter;
mod go_bit;
mod phase_ring;

use bytemuck::{Pod, Zeroable};
pub use event_counter::{EventCounterAdmin, EventCounterRegisters};
pub use go_bit::{
    GoBitAdmin, HCR_GO, HCR_IN_MODIFIER, HCR_IN_PARAM, HCR_OPCODE_MASK, HCR_OPMOD_SHIFT,
    HCR_OUT_PARAM, HCR_STATUS, HCR_STATUS_SHIFT, HCR_TOGGLE, HCR_TOKEN, HcrRegisters,
    OUT_MAILBOX_OFFSET,
};
pub use phase_ring::{PhaseRingAdmin, PhaseRingRegisters};
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::config::DriverConfig;
use crate::error::Result;
use crate::platform::{MemOps, Mmio, Platform};
use crate::wait::ResetSignal;

/// Number of 32-bit parameter words carried by a command.
pub const ADMIN_PARAM_WORDS: usize = 12;

/// A control-plane command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminCommand {
    pub opcode: u16,
    pub modifier: u8,
    pub input_modifier: u32,
    pub params: [u32; ADMIN_PARAM_WORDS],
}

impl AdminCommand {
    pub fn new(opcode: u16) -> Self {
        Self {
            opcode,
            modifier: 0,
            input_modifier: 0,
            params: [0; ADMIN_PARAM_WORDS],
        }
    }

    pub fn with_modifier(mut self, modifier: u8) -> Self {
        self.modifier = modifier;
        self
    }

    pub fn with_input_modifier(mut self, input_modifier: u32) -> Self {
        self.input_modifier = input_modifier;
        self
    }

    /// Set parameter word `idx`. Out-of-range indices are ignored.
    pub fn with_param(mut self, idx: usize, value: u32) -> Self {
        if let Some(word) = self.params.get_mut(idx) {
            *word = value;
        }
        self
    }

    /// Set a 64-bit parameter as two words, low word at `idx`.
    pub fn with_param64(self, idx: usize, value: u64) -> Self {
        self.with_param(idx, value as u32)
            .with_param(idx + 1, (value >> 32) as u32)
    }
}

/// Result of a successful command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminResponse {
    /// Correlation id stamped on the command.
    pub id: u16,
    /// Output words written by the firmware.
    pub output: [u32; ADMIN_PARAM_WORDS],
    /// Immediate output register value (go-bit protocol only, zero otherwise).
    pub immediate: u64,
}

impl AdminResponse {
    /// Output word `idx`, zero if out of range.
    pub fn word(&self, idx: usize) -> u32 {
        self.output.get(idx).copied().unwrap_or(0)
    }
}

/// Ring slot layout shared by the phase-ring and event-counter protocols.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct AdminRequest {
    pub opcode: u16,
    pub id: u16,
    /// Phase flag, published last.
    pub flags: u16,
    pub modifier: u8,
    pub _rsvd: u8,
    pub input_modifier: u32,
    /// Written back by event-counter firmware on completion.
    pub status: u32,
    /// Input parameters; event-counter firmware overwrites them with output.
    pub params: [u32; ADMIN_PARAM_WORDS],
}

const _: () = assert!(core::mem::size_of::<AdminRequest>() == 64);
const _: () = assert!(AdminRequest::FLAGS_OFFSET == 4);
const _: () = assert!(AdminRequest::STATUS_OFFSET == 12);
const _: () = assert!(AdminRequest::PARAMS_OFFSET == 16);

impl AdminRequest {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);
    pub const STATUS_OFFSET: usize = core::mem::offset_of!(Self, status);
    pub const PARAMS_OFFSET: usize = core::mem::offset_of!(Self, params);

    fn from_command(cmd: &AdminCommand, id: u16, flags: u16) -> Self {
        Self {
            opcode: cmd.opcode,
            id,
            flags,
            modifier: cmd.modifier,
            _rsvd: 0,
            input_modifier: cmd.input_modifier,
            status: 0,
            params: cmd.params,
        }
    }

    /// Write the whole slot, publishing `flags` last with release semantics.
    pub fn write_release<M: MemOps + ?Sized>(&self, mem: &M, addr: u64) -> core::result::Result<(), M::Error> {
        let mut body = *self;
        body.flags = 0;
        mem.write_val(addr, body)?;
        mem.store_release(addr + Self::FLAGS_OFFSET as u64, self.flags)
    }
}

/// Response slot of the phase-ring protocol.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct AdminCompletion {
    pub id: u16,
    pub status: u8,
    pub _rsvd0: u8,
    /// Phase flag, written last by the device.
    pub flags: u16,
    pub _rsvd1: u16,
    pub _rsvd2: [u32; 2],
    pub output: [u32; ADMIN_PARAM_WORDS],
}

const _: () = assert!(core::mem::size_of::<AdminCompletion>() == 64);
const _: () = assert!(AdminCompletion::FLAGS_OFFSET == 4);

impl AdminCompletion {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);

    /// Write the slot, publishing `flags` last with release semantics.
    pub fn write_release<M: MemOps + ?Sized>(&self, mem: &M, addr: u64) -> core::result::Result<(), M::Error> {
        let mut body = *self;
        body.flags = 0;
        mem.write_val(addr, body)?;
        mem.store_release(addr + Self::FLAGS_OFFSET as u64, self.flags)
    }
}

/// Program a 64-bit address into a low/high register pair.
fn write_addr<M: Mmio + ?Sized>(mmio: &M, offset: u64, addr: u64) {
    mmio.write32(offset, addr as u32);
    mmio.write32(offset + 4, (addr >> 32) as u32);
}

/// The admin queue of a device, tagged by handshake protocol.
#[derive(Debug)]
pub enum AdminQueue {
    PhaseRing(PhaseRingAdmin),
    EventCounter(EventCounterAdmin),
    GoBit(GoBitAdmin),
}

impl AdminQueue {
    /// A phase-ring admin queue of `config.admin_ring_len()` slots.
    pub fn phase_ring<P: Platform>(
        platform: &P,
        config: &DriverConfig,
        regs: PhaseRingRegisters,
    ) -> Result<Self> {
        PhaseRingAdmin::new(platform, regs, config.admin_ring_len()).map(AdminQueue::PhaseRing)
    }

    /// An event-counter admin queue of `config.admin_ring_len()` slots.
    pub fn event_counter<P: Platform>(
        platform: &P,
        config: &DriverConfig,
        regs: EventCounterRegisters,
    ) -> Result<Self> {
        EventCounterAdmin::new(platform, regs, config.admin_ring_len())
            .map(AdminQueue::EventCounter)
    }

    /// A go-bit admin interface. It has a single command register, so the
    /// configured ring length does not apply.
    pub fn go_bit<P: Platform>(platform: &P, regs: HcrRegisters) -> Result<Self> {
        GoBitAdmin::new(platform, regs).map(AdminQueue::GoBit)
    }

    /// Issue `cmd` and wait for its completion.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn submit<P: Platform>(
        &mut self,
        platform: &P,
        config: &DriverConfig,
        cmd: &AdminCommand,
    ) -> Result<AdminResponse> {
        log::debug!(
            "admin command {:#06x} modifier {:#x} input {:#x}",
            cmd.opcode,
            cmd.modifier,
            cmd.input_modifier
        );
        match self {
            AdminQueue::PhaseRing(q) => q.submit(platform, config, cmd),
            AdminQueue::EventCounter(q) => q.submit(platform, config, cmd),
            AdminQueue::GoBit(q) => q.submit(platform, config, cmd),
        }
    }

    /// (Re)program the device with the queue's memory and restart the
    /// counters. Required after every device reset.
    pub fn enable<P: Platform>(&mut self, platform: &P) -> Result<()> {
        match self {
            AdminQueue::PhaseRing(q) => q.enable(platform),
            AdminQueue::EventCounter(q) => q.enable(platform),
            AdminQueue::GoBit(q) => q.enable(platform),
        }
    }

    /// Whether a timed-out command may still be owned by the device.
    pub fn is_synchronized(&self) -> bool {
        match self {
            AdminQueue::PhaseRing(q) => q.is_synchronized(),
            AdminQueue::EventCounter(q) => q.is_synchronized(),
            AdminQueue::GoBit(q) => q.is_synchronized(),
        }
    }

    pub fn reset_signal(&self) -> Option<&ResetSignal> {
        match self {
            AdminQueue::PhaseRing(q) => q.reset_signal(),
            AdminQueue::EventCounter(q) => q.reset_signal(),
            AdminQueue::GoBit(q) => q.reset_signal(),
        }
    }

    /// Return the queue's DMA memory to the platform.
    pub fn release<P: Platform>(self, platform: &P) {
        match self {
            AdminQueue::PhaseRing(q) => q.release(platform),
            AdminQueue::EventCounter(q) => q.release(platform),
            AdminQueue::GoBit(q) => q.release(platform),
        }
    }
}
