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

//! In-memory device model for tests and fuzzing.
//!
//! [`MockDevice`] implements every [`Platform`](crate::Platform) trait over a
//! byte vector, a register file and a virtual clock. Optional firmware
//! answers admin commands in any of the three handshake protocols, and
//! helpers let a test play the device side of the data path.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::vec::Vec;

use crate::PAGE_SIZE;
use crate::admin::{
    ADMIN_PARAM_WORDS, AdminCommand, AdminCompletion, AdminRequest, EventCounterRegisters,
    HCR_GO, HCR_IN_MODIFIER, HCR_IN_PARAM, HCR_OPCODE_MASK, HCR_OPMOD_SHIFT, HCR_OUT_PARAM,
    HCR_STATUS, HCR_STATUS_SHIFT, HCR_TOGGLE, HcrRegisters, PhaseRingRegisters,
};
use crate::config::{OpcodeTable, UNMAP_EVENTS};
use crate::entry::{CompletionEntry, CqeOpcode, EventEntry, SubmissionEntry};
use crate::eq::EventQueue;
use crate::error::DeviceStatus;
use crate::platform::{Clock, DmaBuffer, DmaOps, DmaRegion, MemOps, Mmio};
use crate::qp::{QueueKind, QueuePair};
use crate::ring::{OWNERSHIP_BIT, OwnershipMode, Phase};
use crate::sq::SqShape;

/// Host address of the first byte of mock memory.
pub const HOST_BASE: u64 = 0x0010_0000;
/// Added to host addresses to form device addresses by default. A multiple
/// of 4 GiB so the low 32 bits of both agree.
pub const DEVICE_OFFSET: u64 = 0x7_0000_0000;

const DEFAULT_MEMORY: usize = 4 << 20;

/// Firmware area size reported by QUERY_FW, in pages.
pub const FW_PAGES: u32 = 2;
/// Queue numbers reserved by firmware, reported by QUERY_DEV_LIM.
pub const RESERVED_QUEUES: u32 = 16;
/// Device queue limit reported by QUERY_DEV_LIM.
pub const DEVICE_MAX_QUEUES: u32 = 48;
/// Auxiliary context pages reported by SET_ICM_SIZE.
pub const AUX_PAGES: u32 = 1;
/// Event queue numbers reserved by firmware, reported by QUERY_DEV_LIM.
pub const RESERVED_EQS: u32 = 1;

/// Register layout of the mock device.
pub mod regs {
    use crate::admin::{EventCounterRegisters, HcrRegisters, PhaseRingRegisters};
    use crate::config::{RegisterWrite, ResetSequence};
    use crate::wait::ResetSignal;

    pub const RESET_CTRL: u64 = 0x00;
    pub const RESET_STATUS: u64 = 0x04;
    pub const RESET_BIT: u32 = 1;

    pub const AQ_BASE: u64 = 0x10;
    pub const ACQ_BASE: u64 = 0x18;
    pub const AQ_DEPTH: u64 = 0x20;
    pub const AQ_DOORBELL: u64 = 0x24;

    pub const EVT_PFN: u64 = 0x30;
    pub const EVT_DOORBELL: u64 = 0x34;
    pub const EVT_COUNTER: u64 = 0x38;

    pub const HCR: u64 = 0x80;

    pub const SQ_DOORBELL_BASE: u64 = 0x1000;
    pub const CQ_DOORBELL_BASE: u64 = 0x2000;
    pub const EQ_DOORBELL_BASE: u64 = 0x3000;

    pub fn reset_signal() -> ResetSignal {
        ResetSignal {
            offset: RESET_STATUS,
            mask: RESET_BIT,
            value: RESET_BIT,
        }
    }

    pub fn phase_ring() -> PhaseRingRegisters {
        PhaseRingRegisters {
            request_base: AQ_BASE,
            response_base: ACQ_BASE,
            depth: AQ_DEPTH,
            doorbell: AQ_DOORBELL,
            reset: Some(reset_signal()),
        }
    }

    pub fn event_counter() -> EventCounterRegisters {
        EventCounterRegisters {
            pfn: EVT_PFN,
            doorbell: EVT_DOORBELL,
            event_counter: EVT_COUNTER,
            reset: Some(reset_signal()),
        }
    }

    pub fn hcr() -> HcrRegisters {
        HcrRegisters {
            base: HCR,
            reset: Some(reset_signal()),
        }
    }

    /// Assert reset, wait for the acknowledgement, release it again.
    pub fn reset_sequence() -> ResetSequence {
        ResetSequence {
            skip_when: None,
            trigger: RegisterWrite {
                offset: RESET_CTRL,
                value: RESET_BIT,
            },
            acknowledged: reset_signal(),
            release: Some((
                RegisterWrite {
                    offset: RESET_CTRL,
                    value: 0,
                },
                ResetSignal {
                    offset: RESET_STATUS,
                    mask: RESET_BIT,
                    value: 0,
                },
            )),
        }
    }

    /// Reset by clearing the admin page frame, skipped when already clear.
    pub fn pfn_reset_sequence() -> ResetSequence {
        let cleared = ResetSignal {
            offset: EVT_PFN,
            mask: u32::MAX,
            value: 0,
        };
        ResetSequence {
            skip_when: Some(cleared),
            trigger: RegisterWrite {
                offset: EVT_PFN,
                value: 0,
            },
            acknowledged: cleared,
            release: None,
        }
    }
}

/// Access outside mock memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds {
    pub addr: u64,
    pub len: usize,
}

/// A register operation observed by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioOp {
    Write { offset: u64, value: u32 },
    Barrier,
}

impl MmioOp {
    pub fn is_barrier(&self) -> bool {
        matches!(self, MmioOp::Barrier)
    }

    pub fn write_value(&self) -> Option<(u64, u32)> {
        match *self {
            MmioOp::Write { offset, value } => Some((offset, value)),
            MmioOp::Barrier => None,
        }
    }
}

/// How the mock firmware reacts to an admin doorbell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminBehaviour {
    /// Execute the command immediately.
    Respond,
    /// Never answer.
    Hang,
    /// Hold the command until [`MockDevice::complete_deferred`].
    Defer,
    /// Enter reset instead of answering.
    Reset,
}

#[derive(Debug, Clone, Copy)]
enum Protocol {
    PhaseRing(PhaseRingRegisters),
    EventCounter(EventCounterRegisters, u32),
    GoBit(HcrRegisters),
}

#[derive(Debug)]
struct Firmware {
    protocol: Protocol,
    opcodes: OpcodeTable,
    behaviour: AdminBehaviour,
    failures: HashMap<u16, u32>,
    outputs: HashMap<u16, [u32; ADMIN_PARAM_WORDS]>,
    commands: Vec<AdminCommand>,
    consumed: u32,
    responses: u32,
    deferred: Option<u32>,
    corrupt_next_id: bool,
    /// Opcode that drops the firmware into reset instead of running, once.
    reset_on: Option<u16>,
    cqs: BTreeSet<u32>,
    sqs: BTreeSet<u32>,
    eqs: BTreeSet<u32>,
    mapped_eqs: BTreeSet<u32>,
    configured: bool,
    page_lists: BTreeSet<u32>,
}

impl Firmware {
    fn new(protocol: Protocol, opcodes: OpcodeTable) -> Self {
        Self {
            protocol,
            opcodes,
            behaviour: AdminBehaviour::Respond,
            failures: HashMap::new(),
            outputs: HashMap::new(),
            commands: Vec::new(),
            consumed: 0,
            responses: 0,
            deferred: None,
            corrupt_next_id: false,
            reset_on: None,
            cqs: BTreeSet::new(),
            sqs: BTreeSet::new(),
            eqs: BTreeSet::new(),
            mapped_eqs: BTreeSet::new(),
            configured: false,
            page_lists: BTreeSet::new(),
        }
    }

    fn reset(&mut self) {
        self.consumed = 0;
        self.responses = 0;
        self.deferred = None;
        self.cqs.clear();
        self.sqs.clear();
        self.eqs.clear();
        self.mapped_eqs.clear();
        self.configured = false;
        self.page_lists.clear();
    }

    fn crashes_on(&mut self, opcode: u16) -> bool {
        if self.reset_on == Some(opcode) {
            self.reset_on = None;
            return true;
        }
        false
    }

    /// Run a command, returning its output or a raw failure status.
    fn execute(&mut self, cmd: AdminCommand) -> Result<[u32; ADMIN_PARAM_WORDS], u32> {
        self.commands.push(cmd);
        if let Some(status) = self.failures.get(&cmd.opcode) {
            return Err(*status);
        }
        if let Some(output) = self.outputs.get(&cmd.opcode) {
            return Ok(*output);
        }

        let op = self.opcodes;
        let qn = cmd.input_modifier;
        let mut out = [0; ADMIN_PARAM_WORDS];
        let code = cmd.opcode;
        if code == op.create_cq {
            self.cqs.insert(qn);
            out[0] = (regs::CQ_DOORBELL_BASE + 8 * u64::from(qn)) as u32;
        } else if code == op.destroy_cq {
            self.cqs.remove(&qn);
        } else if code == op.create_sq || code == op.rst2init {
            self.sqs.insert(qn);
            out[0] = (regs::SQ_DOORBELL_BASE + 8 * u64::from(qn)) as u32;
        } else if code == op.destroy_sq || code == op.to_reset {
            self.sqs.remove(&qn);
        } else if code == op.query_fw {
            out[0] = FW_PAGES;
        } else if code == op.query_dev_lim {
            out[0] = RESERVED_QUEUES;
            out[1] = DEVICE_MAX_QUEUES;
            out[2] = RESERVED_EQS;
        } else if code == op.set_icm_size {
            out[0] = AUX_PAGES;
        } else if code == op.sw2hw_eq {
            self.eqs.insert(qn);
            out[0] = (regs::EQ_DOORBELL_BASE + 8 * u64::from(qn)) as u32;
        } else if code == op.hw2sw_eq {
            self.eqs.remove(&qn);
        } else if code == op.map_eq {
            if qn & UNMAP_EVENTS != 0 {
                self.mapped_eqs.remove(&(qn & !UNMAP_EVENTS));
            } else {
                self.mapped_eqs.insert(qn);
            }
        } else if code == op.configure {
            self.configured = true;
        } else if code == op.deconfigure {
            self.configured = false;
        } else if code == op.register_page_list {
            self.page_lists.insert(qn);
        } else if code == op.unregister_page_list {
            self.page_lists.remove(&qn);
        }
        Ok(out)
    }
}

/// A test buffer with a synthetic device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TestBuffer {
    pub id: u32,
    pub len: u32,
}

impl TestBuffer {
    pub fn new(id: u32, len: u32) -> Self {
        Self { id, len }
    }
}

impl DmaBuffer for TestBuffer {
    fn device_addr(&self) -> u64 {
        0x8000_0000_0000 + u64::from(self.id) * 0x1000
    }

    fn len(&self) -> u32 {
        self.len
    }
}

/// A receive-buffer source handing out fresh [`TestBuffer`]s with ids
/// counting up from `first_id`.
pub fn rx_pool(first_id: u32) -> impl FnMut(u32) -> Option<TestBuffer> {
    let mut next = first_id;
    move |len| {
        let buf = TestBuffer::new(next, len);
        next += 1;
        Some(buf)
    }
}

/// Simulated device and platform.
#[derive(Debug)]
pub struct MockDevice {
    mem: RefCell<Vec<u8>>,
    next_alloc: Cell<u64>,
    live: RefCell<Vec<DmaRegion>>,
    freed: RefCell<Vec<DmaRegion>>,
    alloc_budget: Cell<Option<usize>>,
    write_faults: RefCell<BTreeSet<u64>>,
    device_offset: Cell<u64>,
    regs: RefCell<HashMap<u64, u32>>,
    mmio_log: RefCell<Vec<MmioOp>>,
    now: Cell<u64>,
    firmware: RefCell<Option<Firmware>>,
    cq_producers: RefCell<HashMap<u64, u32>>,
    eq_producers: RefCell<HashMap<u64, u32>>,
    acks_reset: Cell<bool>,
    resets: Cell<u32>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_memory(DEFAULT_MEMORY)
    }

    pub fn with_memory(len: usize) -> Self {
        Self {
            mem: RefCell::new(vec![0; len]),
            next_alloc: Cell::new(HOST_BASE),
            live: RefCell::new(Vec::new()),
            freed: RefCell::new(Vec::new()),
            alloc_budget: Cell::new(None),
            write_faults: RefCell::new(BTreeSet::new()),
            device_offset: Cell::new(DEVICE_OFFSET),
            regs: RefCell::new(HashMap::new()),
            mmio_log: RefCell::new(Vec::new()),
            now: Cell::new(0),
            firmware: RefCell::new(None),
            cq_producers: RefCell::new(HashMap::new()),
            eq_producers: RefCell::new(HashMap::new()),
            acks_reset: Cell::new(true),
            resets: Cell::new(0),
        }
    }

    fn range(&self, addr: u64, len: usize) -> Result<core::ops::Range<usize>, OutOfBounds> {
        let size = self.mem.borrow().len() as u64;
        let start = addr.checked_sub(HOST_BASE).ok_or(OutOfBounds { addr, len })?;
        let end = start.checked_add(len as u64).ok_or(OutOfBounds { addr, len })?;
        if end > size {
            return Err(OutOfBounds { addr, len });
        }
        Ok(start as usize..end as usize)
    }

    // ---- memory and allocation ----

    /// Fail every allocation after the next `n`.
    pub fn fail_allocations_after(&self, n: usize) {
        self.alloc_budget.set(Some(n));
    }

    /// Fail every write covering the byte at `addr`.
    pub fn fail_writes_at(&self, addr: u64) {
        self.write_faults.borrow_mut().insert(addr);
    }

    pub fn clear_write_faults(&self) {
        self.write_faults.borrow_mut().clear();
    }

    /// Translate host addresses with `offset` instead of [`DEVICE_OFFSET`].
    pub fn set_device_offset(&self, offset: u64) {
        self.device_offset.set(offset);
    }

    /// Host address the next page-aligned allocation will get.
    pub fn next_page_allocation(&self) -> u64 {
        self.next_alloc.get().next_multiple_of(PAGE_SIZE as u64)
    }

    pub fn live_regions(&self) -> Vec<DmaRegion> {
        self.live.borrow().clone()
    }

    pub fn freed_regions(&self) -> Vec<DmaRegion> {
        self.freed.borrow().clone()
    }

    // ---- registers ----

    pub fn reg(&self, offset: u64) -> u32 {
        self.regs.borrow().get(&offset).copied().unwrap_or(0)
    }

    fn reg64(&self, offset: u64) -> u64 {
        u64::from(self.reg(offset)) | u64::from(self.reg(offset + 4)) << 32
    }

    /// Set a register without going through the host write path.
    pub fn set_reg(&self, offset: u64, value: u32) {
        self.regs.borrow_mut().insert(offset, value);
    }

    pub fn mmio_log(&self) -> Vec<MmioOp> {
        self.mmio_log.borrow().clone()
    }

    pub fn clear_mmio_log(&self) {
        self.mmio_log.borrow_mut().clear();
    }

    /// Values written to `offset`, oldest first.
    pub fn writes_to(&self, offset: u64) -> Vec<u32> {
        self.mmio_log
            .borrow()
            .iter()
            .filter_map(|op| match op.write_value() {
                Some((o, v)) if o == offset => Some(v),
                _ => None,
            })
            .collect()
    }

    // ---- clock ----

    pub fn elapsed_ms(&self) -> u64 {
        self.now.get()
    }

    // ---- reset ----

    /// Stop acknowledging reset requests.
    pub fn ignore_reset(&self) {
        self.acks_reset.set(false);
    }

    /// Number of reset assertions seen.
    pub fn resets(&self) -> u32 {
        self.resets.get()
    }

    /// Spontaneously reset, as on a firmware crash.
    pub fn trigger_device_reset(&self) {
        self.set_reg(regs::RESET_STATUS, regs::RESET_BIT);
        self.reset_firmware();
    }

    fn reset_firmware(&self) {
        self.resets.set(self.resets.get() + 1);
        self.set_reg(regs::EVT_COUNTER, 0);
        self.set_reg(regs::HCR + HCR_STATUS, 0);
        if let Some(fw) = self.firmware.borrow_mut().as_mut() {
            fw.reset();
        }
    }

    // ---- firmware ----

    pub fn install_phase_ring_firmware(&self, opcodes: OpcodeTable) {
        *self.firmware.borrow_mut() = Some(Firmware::new(
            Protocol::PhaseRing(regs::phase_ring()),
            opcodes,
        ));
    }

    pub fn install_event_counter_firmware(&self, opcodes: OpcodeTable, depth: u32) {
        *self.firmware.borrow_mut() = Some(Firmware::new(
            Protocol::EventCounter(regs::event_counter(), depth),
            opcodes,
        ));
    }

    pub fn install_go_bit_firmware(&self, opcodes: OpcodeTable) {
        *self.firmware.borrow_mut() =
            Some(Firmware::new(Protocol::GoBit(regs::hcr()), opcodes));
    }

    fn with_firmware<T>(&self, f: impl FnOnce(&mut Firmware) -> T) -> T {
        let mut fw = self.firmware.borrow_mut();
        f(fw.as_mut().expect("no firmware installed"))
    }

    pub fn set_admin_behaviour(&self, behaviour: AdminBehaviour) {
        self.with_firmware(|fw| fw.behaviour = behaviour);
    }

    /// Answer every future `opcode` with the raw failure `status`.
    pub fn fail_command(&self, opcode: u16, status: u32) {
        self.with_firmware(|fw| fw.failures.insert(opcode, status));
    }

    pub fn clear_failure(&self, opcode: u16) {
        self.with_firmware(|fw| fw.failures.remove(&opcode));
    }

    pub fn set_command_output(&self, opcode: u16, output: [u32; ADMIN_PARAM_WORDS]) {
        self.with_firmware(|fw| fw.outputs.insert(opcode, output));
    }

    /// Fall into reset when `opcode` is next issued, leaving it unanswered.
    pub fn reset_on_command(&self, opcode: u16) {
        self.with_firmware(|fw| fw.reset_on = Some(opcode));
    }

    pub fn corrupt_next_response_id(&self) {
        self.with_firmware(|fw| fw.corrupt_next_id = true);
    }

    /// Commands executed so far, oldest first.
    pub fn commands(&self) -> Vec<AdminCommand> {
        self.with_firmware(|fw| fw.commands.clone())
    }

    pub fn command_count(&self, opcode: u16) -> usize {
        self.with_firmware(|fw| fw.commands.iter().filter(|c| c.opcode == opcode).count())
    }

    /// Completion queues the firmware currently owns.
    pub fn live_cqs(&self) -> Vec<u32> {
        self.with_firmware(|fw| fw.cqs.iter().copied().collect())
    }

    /// Send queues the firmware currently owns.
    pub fn live_sqs(&self) -> Vec<u32> {
        self.with_firmware(|fw| fw.sqs.iter().copied().collect())
    }

    /// Event queues the firmware currently owns.
    pub fn live_eqs(&self) -> Vec<u32> {
        self.with_firmware(|fw| fw.eqs.iter().copied().collect())
    }

    /// Event queues with events mapped to them.
    pub fn mapped_eqs(&self) -> Vec<u32> {
        self.with_firmware(|fw| fw.mapped_eqs.iter().copied().collect())
    }

    /// Whether the interface has been configured and not yet deconfigured.
    pub fn is_configured(&self) -> bool {
        self.with_firmware(|fw| fw.configured)
    }

    /// Page lists the firmware currently holds, by id.
    pub fn live_page_lists(&self) -> Vec<u32> {
        self.with_firmware(|fw| fw.page_lists.iter().copied().collect())
    }

    /// Answer a command held back by [`AdminBehaviour::Defer`] and go back to
    /// answering immediately.
    pub fn complete_deferred(&self) {
        let mut guard = self.firmware.borrow_mut();
        let fw = guard.as_mut().expect("no firmware installed");
        fw.behaviour = AdminBehaviour::Respond;
        if let Some(value) = fw.deferred.take() {
            self.process(fw, value);
        }
    }

    fn firmware_write(&self, fw: &mut Firmware, offset: u64, value: u32) {
        let doorbell = match fw.protocol {
            Protocol::PhaseRing(r) => {
                if offset == r.request_base {
                    fw.consumed = 0;
                    fw.responses = 0;
                }
                offset == r.doorbell
            }
            Protocol::EventCounter(r, _) => {
                if offset == r.pfn {
                    fw.consumed = 0;
                    self.set_reg(r.event_counter, 0);
                }
                offset == r.doorbell
            }
            Protocol::GoBit(r) => offset == r.base + HCR_STATUS && value & HCR_GO != 0,
        };
        if !doorbell {
            return;
        }

        match fw.behaviour {
            AdminBehaviour::Respond => self.process(fw, value),
            AdminBehaviour::Hang => {}
            AdminBehaviour::Defer => {
                if fw.deferred.is_none() {
                    fw.deferred = Some(value);
                }
            }
            AdminBehaviour::Reset => self.set_reg(regs::RESET_STATUS, regs::RESET_BIT),
        }
    }

    /// Firmware-initiated reset. The command interface is left as it was.
    fn crash(&self, fw: &mut Firmware) {
        self.resets.set(self.resets.get() + 1);
        self.set_reg(regs::RESET_STATUS, regs::RESET_BIT);
        fw.reset();
    }

    fn process(&self, fw: &mut Firmware, value: u32) {
        match fw.protocol {
            Protocol::PhaseRing(r) => {
                let depth = self.reg(r.depth);
                assert!(depth.is_power_of_two(), "admin depth not programmed");
                let mask = depth - 1;
                let shift = depth.trailing_zeros();
                let requests = self.to_host_pointer(self.reg64(r.request_base));
                let responses = self.to_host_pointer(self.reg64(r.response_base));

                while fw.consumed != value {
                    let slot = u64::from(fw.consumed & mask);
                    let req: AdminRequest = self
                        .read_val(requests + slot * AdminRequest::SIZE as u64)
                        .unwrap();
                    if fw.crashes_on(req.opcode) {
                        self.crash(fw);
                        return;
                    }
                    let result = fw.execute(command_of(&req));

                    let mut id = req.id;
                    if fw.corrupt_next_id {
                        fw.corrupt_next_id = false;
                        id ^= 0xffff;
                    }
                    let (status, output) = match result {
                        Ok(output) => (0, output),
                        Err(status) => (status as u8, [0; ADMIN_PARAM_WORDS]),
                    };
                    let resp = AdminCompletion {
                        id,
                        status,
                        flags: Phase::of_lap(fw.responses >> shift).bit(),
                        output,
                        ..bytemuck::Zeroable::zeroed()
                    };
                    let at = u64::from(fw.responses & mask);
                    resp.write_release(self, responses + at * AdminCompletion::SIZE as u64)
                        .unwrap();

                    fw.responses = fw.responses.wrapping_add(1);
                    fw.consumed = fw.consumed.wrapping_add(1);
                }
            }
            Protocol::EventCounter(r, depth) => {
                let mask = depth - 1;
                let ring = self.to_host_pointer(u64::from(self.reg(r.pfn)) * PAGE_SIZE as u64);

                while fw.consumed != value {
                    let addr = ring + u64::from(fw.consumed & mask) * AdminRequest::SIZE as u64;
                    let mut req: AdminRequest = self.read_val(addr).unwrap();
                    if fw.crashes_on(req.opcode) {
                        self.crash(fw);
                        return;
                    }
                    match fw.execute(command_of(&req)) {
                        Ok(output) => {
                            req.status = DeviceStatus::EVENT_STATUS_OK;
                            req.params = output;
                        }
                        Err(status) => req.status = status,
                    }
                    self.write_val(addr, req).unwrap();
                    fw.consumed = fw.consumed.wrapping_add(1);
                }
                self.set_reg(r.event_counter, value);
            }
            Protocol::GoBit(r) => {
                let in_addr = self.to_host_pointer(self.hcr_pair(r.base + HCR_IN_PARAM));
                let out_addr = self.to_host_pointer(self.hcr_pair(r.base + HCR_OUT_PARAM));
                let cmd = AdminCommand {
                    opcode: (value & HCR_OPCODE_MASK) as u16,
                    modifier: ((value >> HCR_OPMOD_SHIFT) & 0xf) as u8,
                    input_modifier: self.reg(r.base + HCR_IN_MODIFIER),
                    params: self.read_val(in_addr).unwrap(),
                };
                if fw.crashes_on(cmd.opcode) {
                    self.crash(fw);
                    return;
                }
                let status = match fw.execute(cmd) {
                    Ok(output) => {
                        self.write_val(out_addr, output).unwrap();
                        0
                    }
                    Err(status) => status & 0xff,
                };
                self.set_reg(
                    r.base + HCR_STATUS,
                    status << HCR_STATUS_SHIFT | (value & HCR_TOGGLE),
                );
            }
        }
    }

    /// High dword first, as laid out in the command register block.
    fn hcr_pair(&self, offset: u64) -> u64 {
        u64::from(self.reg(offset)) << 32 | u64::from(self.reg(offset + 4))
    }

    // ---- data path ----

    /// The reference a completion carries for `slot` of `qp`'s submission
    /// queue.
    pub fn wqe_ref<B>(&self, qp: &QueuePair<B>, slot: u32) -> u32 {
        match qp.sq().shape() {
            SqShape::Flat => slot,
            SqShape::Linked => {
                self.to_device_address(qp.sq().slot_addr(slot).unwrap()) as u32
            }
        }
    }

    /// The submission entry the host wrote into `slot`.
    pub fn submission<B>(&self, qp: &QueuePair<B>, slot: u32) -> SubmissionEntry {
        SubmissionEntry::read_acquire(self, qp.sq().slot_addr(slot).unwrap()).unwrap()
    }

    /// Complete `slot` successfully with `byte_count` bytes.
    pub fn complete<B>(&self, qp: &QueuePair<B>, slot: u32, byte_count: u32) -> bool {
        let opcode = match qp.kind() {
            QueueKind::Tx => CqeOpcode::SEND,
            QueueKind::Rx => CqeOpcode::RECV,
        };
        let entry = CompletionEntry {
            qpn: qp.number().hw(),
            wqe: self.wqe_ref(qp, slot),
            byte_count,
            opcode,
            ..bytemuck::Zeroable::zeroed()
        };
        self.push_completion(qp, entry)
    }

    /// Complete `slot` with an error syndrome.
    pub fn complete_error<B>(&self, qp: &QueuePair<B>, slot: u32, syndrome: u8, vendor: u8) -> bool {
        let opcode = match qp.kind() {
            QueueKind::Tx => CqeOpcode::SEND_ERROR,
            QueueKind::Rx => CqeOpcode::RECV_ERROR,
        };
        let entry = CompletionEntry {
            qpn: qp.number().hw(),
            wqe: self.wqe_ref(qp, slot),
            byte_count: u32::from(vendor) << 8 | u32::from(syndrome),
            opcode,
            ..bytemuck::Zeroable::zeroed()
        };
        self.push_completion(qp, entry)
    }

    /// Publish `entry` at the device's next completion slot of `qp`, setting
    /// its ownership word. Returns `false` if the slot is still owned by the
    /// host.
    pub fn push_completion<B>(&self, qp: &QueuePair<B>, mut entry: CompletionEntry) -> bool {
        let cq = qp.cq();
        let ring = cq.ring();
        let capacity = cq.capacity();
        let mut producers = self.cq_producers.borrow_mut();
        let counter = producers.entry(ring.addr).or_insert(0);
        let addr = ring.addr + u64::from(*counter & (capacity - 1)) * CompletionEntry::SIZE as u64;

        if cq.mode() == OwnershipMode::OwnerBit {
            let owner = CompletionEntry::load_owner(self, addr).unwrap();
            if owner & OWNERSHIP_BIT == 0 {
                return false;
            }
        }

        let phase = Phase::of_lap(*counter >> capacity.trailing_zeros());
        entry.owner = cq.mode().host_word(phase);
        entry.write_release(self, addr).unwrap();
        *counter = counter.wrapping_add(1);
        true
    }

    /// Publish `entry` at the device's next slot of `eq`. Returns `false` if
    /// the slot is still owned by the host.
    pub fn push_event(&self, eq: &EventQueue, mut entry: EventEntry) -> bool {
        let ring = eq.ring();
        let mut producers = self.eq_producers.borrow_mut();
        let counter = producers.entry(ring.addr).or_insert(0);
        let addr =
            ring.addr + u64::from(*counter & (eq.capacity() - 1)) * EventEntry::SIZE as u64;

        if EventEntry::load_owner(self, addr).unwrap() & OWNERSHIP_BIT == 0 {
            return false;
        }
        entry.owner = 0;
        entry.write_release(self, addr).unwrap();
        *counter = counter.wrapping_add(1);
        true
    }
}

fn command_of(req: &AdminRequest) -> AdminCommand {
    AdminCommand {
        opcode: req.opcode,
        modifier: req.modifier,
        input_modifier: req.input_modifier,
        params: req.params,
    }
}

impl MemOps for MockDevice {
    type Error = OutOfBounds;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let range = self.range(addr, dst.len())?;
        dst.copy_from_slice(&self.mem.borrow()[range]);
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        let len = src.len();
        let end = addr.saturating_add(len as u64);
        if self.write_faults.borrow().range(addr..end).next().is_some() {
            return Err(OutOfBounds { addr, len });
        }
        let range = self.range(addr, len)?;
        self.mem.borrow_mut()[range].copy_from_slice(src);
        Ok(src.len())
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
        let mut buf = [0; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
        self.write(addr, &val.to_le_bytes())?;
        Ok(())
    }
}

impl DmaOps for MockDevice {
    fn allocate_dma(&self, len: usize, align: usize) -> Option<DmaRegion> {
        if let Some(budget) = self.alloc_budget.get() {
            if budget == 0 {
                return None;
            }
            self.alloc_budget.set(Some(budget - 1));
        }

        let align = core::cmp::max(align, 1) as u64;
        let start = (self.next_alloc.get() + align - 1) & !(align - 1);
        let end = start + len as u64;
        if end > HOST_BASE + self.mem.borrow().len() as u64 {
            return None;
        }
        self.next_alloc.set(end);

        let region = DmaRegion { addr: start, len };
        self.live.borrow_mut().push(region);
        Some(region)
    }

    fn free_dma(&self, region: DmaRegion) {
        let mut live = self.live.borrow_mut();
        let idx = live
            .iter()
            .position(|r| *r == region)
            .unwrap_or_else(|| panic!("freeing unknown region {region:?}"));
        live.swap_remove(idx);
        self.freed.borrow_mut().push(region);
    }

    fn to_device_address(&self, host_addr: u64) -> u64 {
        host_addr.wrapping_add(self.device_offset.get())
    }

    fn to_host_pointer(&self, device_addr: u64) -> u64 {
        device_addr.wrapping_sub(self.device_offset.get())
    }
}

impl Mmio for MockDevice {
    fn read32(&self, offset: u64) -> u32 {
        self.reg(offset)
    }

    fn write32(&self, offset: u64, value: u32) {
        self.mmio_log
            .borrow_mut()
            .push(MmioOp::Write { offset, value });
        self.set_reg(offset, value);

        if offset == regs::RESET_CTRL {
            if self.acks_reset.get() {
                self.set_reg(regs::RESET_STATUS, value & regs::RESET_BIT);
            }
            if value & regs::RESET_BIT != 0 {
                self.reset_firmware();
            }
            return;
        }
        if offset == regs::EVT_PFN && value == 0 {
            self.reset_firmware();
        }

        let mut fw = self.firmware.borrow_mut();
        if let Some(fw) = fw.as_mut() {
            self.firmware_write(fw, offset, value);
        }
    }

    fn barrier(&self) {
        self.mmio_log.borrow_mut().push(MmioOp::Barrier);
    }
}

impl Clock for MockDevice {
    fn sleep_ms(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    fn ticks_ms(&self) -> u64 {
        self.now.get()
    }
}
