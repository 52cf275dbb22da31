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

//! Queue Lifecycle
//!
//! Creating a queue pair is a chain of steps that each acquire something:
//! a queue number, ring memory, doorbell records, and one or more firmware
//! objects. Every step registers its inverse with a [`Rollback`] guard; if a
//! later step fails, the guard runs the inverses newest-first when it is
//! dropped. A successful creation commits the guard and nothing is undone.
//!
//! ```text
//!  create:  qn ─> cq ring ─> sq ring ─> records ─> CQ to hw ─> SQ to hw ─> [RTR ─> RTS]
//!  undo:    free   free       free       clear     CQ to sw    SQ reset
//! ```
//!
//! A firmware hand-back that fails means the device may still own the
//! memory. From that point on nothing more is freed: the memory and queue
//! number are logged and leaked instead. A device found in reset owns
//! nothing; the remaining hand-backs are skipped and everything is freed.

pub mod context_memory;
pub mod event_queue;
pub mod page_list;

use smallvec::SmallVec;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::PAGE_SIZE;
use crate::admin::{AdminCommand, AdminQueue, AdminResponse};
use crate::allocator::{QueueNumber, QueueNumberAllocator};
use crate::config::{BindingModel, DriverConfig, QueueProfile};
use crate::cq::{CompletionEvent, CompletionQueue};
use crate::doorbell::{Doorbell, DoorbellArena, DoorbellRecord, RecordKind};
use crate::entry::{CompletionEntry, SubmissionEntry};
use crate::error::{QueueError, Result, log_then_return};
use crate::lifecycle::page_list::PageList;
use crate::platform::{DmaBuffer, DmaRegion, Platform};
use crate::qp::{QpState, QueueKind, QueuePair};
use crate::sq::SubmissionQueue;

/// Everything lifecycle operations need from the owning device.
pub struct ContextEnv<'a, P: Platform> {
    pub platform: &'a P,
    pub config: &'a DriverConfig,
    pub profile: &'a QueueProfile,
    pub admin: &'a mut AdminQueue,
    pub allocator: &'a mut QueueNumberAllocator,
    pub records: Option<&'a DoorbellArena>,
}

impl<P: Platform> ContextEnv<'_, P> {
    pub fn command(&mut self, cmd: AdminCommand) -> Result<AdminResponse> {
        self.admin.submit(self.platform, self.config, &cmd)
    }

    pub fn device_lost(&self) -> bool {
        device_lost(self.platform, self.profile, &*self.admin)
    }
}

/// Whether the device currently reads as reset, by the profile's watchdog
/// or else the admin queue's reset register.
pub(crate) fn device_lost<P: Platform>(
    platform: &P,
    profile: &QueueProfile,
    admin: &AdminQueue,
) -> bool {
    profile
        .watchdog
        .as_ref()
        .or(admin.reset_signal())
        .is_some_and(|signal| signal.in_reset(platform))
}

/// How much of the device is still there during a teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Hand every resource back to firmware before freeing it.
    Orderly,
    /// The device has reset and forgotten everything; just free.
    DeviceLost,
}

/// One inverse step registered with a [`Rollback`].
#[derive(Debug)]
pub(crate) enum Undo {
    QueueNumber(QueueNumber),
    Dma(DmaRegion),
    Records(u32),
    /// Hand a firmware object back with a single command.
    Command { opcode: u16, input_modifier: u32 },
}

/// Scope guard undoing partially completed acquisitions.
pub(crate) struct Rollback<'e, 'a, P: Platform> {
    env: &'e mut ContextEnv<'a, P>,
    steps: SmallVec<[Undo; 8]>,
}

impl<'e, 'a, P: Platform> Rollback<'e, 'a, P> {
    pub(crate) fn new(env: &'e mut ContextEnv<'a, P>) -> Self {
        Self {
            env,
            steps: SmallVec::new(),
        }
    }

    pub(crate) fn env(&mut self) -> &mut ContextEnv<'a, P> {
        &mut *self.env
    }

    pub(crate) fn push(&mut self, step: Undo) {
        self.steps.push(step);
    }

    /// Keep everything acquired so far.
    pub(crate) fn commit(mut self) {
        self.steps.clear();
    }
}

impl<P: Platform> Drop for Rollback<'_, '_, P> {
    fn drop(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        log::debug!("rolling back {} steps", self.steps.len());

        let mut lost = self.env.device_lost();
        let mut leaking = false;
        while let Some(step) = self.steps.pop() {
            match step {
                Undo::Command { opcode, .. } if lost => {
                    log::debug!("rollback: device reset, skipping command {:#06x}", opcode);
                }
                Undo::Command {
                    opcode,
                    input_modifier,
                } => {
                    let cmd = AdminCommand::new(opcode).with_input_modifier(input_modifier);
                    match self.env.command(cmd) {
                        Ok(_) => {}
                        Err(QueueError::Reset) => {
                            log::warn!(
                                "rollback: device reset during command {:#06x}; releasing without hand-back",
                                opcode
                            );
                            lost = true;
                        }
                        Err(e) => {
                            log::error!(
                                "rollback: command {:#06x} for {:#x} failed: {}; leaking what it guards",
                                opcode,
                                input_modifier,
                                e
                            );
                            leaking = true;
                        }
                    }
                }
                Undo::Dma(region) if leaking && !lost => {
                    log::warn!("rollback: leaking {:#x}+{:#x}", region.addr, region.len);
                }
                Undo::Dma(region) => self.env.platform.free_dma(region),
                Undo::Records(offset) => {
                    if (!leaking || lost)
                        && let Some(arena) = self.env.records
                        && let Err(e) = arena.clear(self.env.platform, offset)
                    {
                        log::error!("rollback: clearing records {}: {}", offset, e);
                    }
                }
                Undo::QueueNumber(qn) if leaking && !lost => {
                    log::warn!("rollback: leaking queue number {:#x}", qn.hw());
                }
                Undo::QueueNumber(qn) => {
                    if let Err(e) = self.env.allocator.free(qn) {
                        log::error!("rollback: freeing queue number {:#x}: {}", qn.hw(), e);
                    }
                }
            }
        }
    }
}

fn hand_back<P: Platform>(
    env: &mut ContextEnv<'_, P>,
    teardown: Teardown,
    opcode: u16,
    hw: u32,
) -> Result<()> {
    match teardown {
        Teardown::DeviceLost => Ok(()),
        Teardown::Orderly => env
            .command(AdminCommand::new(opcode).with_input_modifier(hw))
            .map(|_| ()),
    }
}

fn doorbell_at(offset: u32) -> Option<Doorbell> {
    (offset != 0).then(|| Doorbell::new(u64::from(offset)))
}

fn allocate_ring<P: Platform>(platform: &P, entries: u32, entry_size: usize) -> Result<DmaRegion> {
    platform.allocate_zeroed(entries as usize * entry_size, PAGE_SIZE)
}

/// Create a queue pair of `kind` with `capacity` entries in each ring and
/// bring it to ReadyToSend.
#[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
pub fn create_queue_pair<P: Platform, B: DmaBuffer>(
    env: &mut ContextEnv<'_, P>,
    kind: QueueKind,
    capacity: u32,
) -> Result<QueuePair<B>> {
    let platform = env.platform;
    let profile = *env.profile;
    let opcodes = profile.opcodes;
    let records = env.records.filter(|_| profile.doorbell_records);
    if !capacity.is_power_of_two() {
        return Err(QueueError::InvalidState);
    }
    let log2 = capacity.trailing_zeros();

    let mut rb = Rollback::new(env);
    let qn = rb.env().allocator.allocate()?;
    rb.push(Undo::QueueNumber(qn));

    let cq_ring = allocate_ring(platform, capacity, CompletionEntry::SIZE)?;
    rb.push(Undo::Dma(cq_ring));
    let mut cq =
        CompletionQueue::new(cq_ring, capacity, profile.ownership).ok_or(QueueError::InvalidState)?;
    cq.initialize(platform)?;

    let sq_ring = allocate_ring(platform, capacity, SubmissionEntry::SIZE)?;
    rb.push(Undo::Dma(sq_ring));
    let mut sq: SubmissionQueue<B> =
        SubmissionQueue::new(sq_ring, capacity, profile.shape, kind == QueueKind::Rx)
            .ok_or(QueueError::InvalidState)?;
    if !sq.completions_can_address(platform) {
        log_then_return!(
            QueueError::InvalidState,
            "{:?} send ring at {:#x} crosses a 4 GiB boundary",
            kind,
            sq_ring.device_addr(platform)
        );
    }

    let (producer_record, consumer_record) = match records {
        Some(arena) => {
            arena.clear(platform, qn.offset())?;
            rb.push(Undo::Records(qn.offset()));
            (
                arena.record(qn.offset(), RecordKind::Producer),
                arena.record(qn.offset(), RecordKind::Consumer),
            )
        }
        None => (None, None),
    };
    let record_addr =
        |r: Option<DoorbellRecord>| r.map_or(0, |r| platform.to_device_address(r.addr()));

    let hw = qn.hw();
    let resp = rb.env().command(
        AdminCommand::new(opcodes.create_cq)
            .with_input_modifier(hw)
            .with_param64(0, cq_ring.device_addr(platform))
            .with_param(2, log2)
            .with_param64(3, record_addr(consumer_record)),
    )?;
    rb.push(Undo::Command {
        opcode: opcodes.destroy_cq,
        input_modifier: hw,
    });
    cq.bind(doorbell_at(resp.word(0)), consumer_record);

    let context = |opcode| {
        let cmd = AdminCommand::new(opcode)
            .with_input_modifier(hw)
            .with_param64(0, sq_ring.device_addr(platform))
            .with_param(2, log2)
            .with_param(3, hw)
            .with_param64(4, record_addr(producer_record))
            .with_param(6, u32::from(kind == QueueKind::Rx));
        if profile.page_lists {
            cmd.with_param(7, PageList::id_for(kind))
        } else {
            cmd
        }
    };

    let qp = match profile.binding {
        BindingModel::Direct => {
            let resp = rb.env().command(context(opcodes.create_sq))?;
            rb.push(Undo::Command {
                opcode: opcodes.destroy_sq,
                input_modifier: hw,
            });
            sq.bind(doorbell_at(resp.word(0)), producer_record);
            let mut qp = QueuePair::new(kind, qn, sq, cq);
            qp.set_state(QpState::ReadyToSend);
            qp
        }
        BindingModel::StateMachine => {
            let resp = rb.env().command(context(opcodes.rst2init))?;
            rb.push(Undo::Command {
                opcode: opcodes.to_reset,
                input_modifier: hw,
            });
            sq.bind(doorbell_at(resp.word(0)), producer_record);
            let mut qp = QueuePair::new(kind, qn, sq, cq);
            qp.set_state(QpState::Init);
            transition(rb.env(), &mut qp, QpState::ReadyToReceive)?;
            transition(rb.env(), &mut qp, QpState::ReadyToSend)?;
            qp
        }
    };

    rb.commit();
    log::info!(
        "{:?} queue {:#x} ready: {} entries, {:?}",
        kind,
        hw,
        capacity,
        profile.shape
    );
    Ok(qp)
}

/// Move a state-machine queue pair to `target`.
///
/// Valid moves are Init -> ReadyToReceive -> ReadyToSend, ReadyToSend ->
/// ReadyToSend (a parameter update) and anything -> Reset.
pub fn transition<P: Platform, B>(
    env: &mut ContextEnv<'_, P>,
    qp: &mut QueuePair<B>,
    target: QpState,
) -> Result<()> {
    if env.profile.binding != BindingModel::StateMachine {
        return Err(QueueError::InvalidState);
    }
    let ops = env.profile.opcodes;
    let opcode = match (qp.state(), target) {
        (QpState::Init, QpState::ReadyToReceive) => ops.init2rtr,
        (QpState::ReadyToReceive, QpState::ReadyToSend) => ops.rtr2rts,
        (QpState::ReadyToSend, QpState::ReadyToSend) => ops.rts2rts,
        (_, QpState::Reset) => ops.to_reset,
        (from, to) => {
            log::warn!("invalid queue pair transition {:?} -> {:?}", from, to);
            return Err(QueueError::InvalidState);
        }
    };

    env.command(AdminCommand::new(opcode).with_input_modifier(qp.number().hw()))?;
    qp.set_state(target);
    Ok(())
}

/// Re-issue the ReadyToSend parameters of an active queue pair.
pub fn update<P: Platform, B>(env: &mut ContextEnv<'_, P>, qp: &mut QueuePair<B>) -> Result<()> {
    transition(env, qp, QpState::ReadyToSend)
}

/// Destroy `qp`, delivering a cancellation for every outstanding
/// submission to `sink`.
///
/// All steps are attempted even if some fail; the first failure is
/// returned. Anything the device may still own after a failed hand-back is
/// leaked.
#[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
pub fn destroy_queue_pair<P: Platform, B: DmaBuffer>(
    env: &mut ContextEnv<'_, P>,
    mut qp: QueuePair<B>,
    teardown: Teardown,
    sink: &mut impl FnMut(CompletionEvent<B>),
) -> Result<()> {
    let ops = env.profile.opcodes;
    let kind = qp.kind();
    let cancelled: SmallVec<[CompletionEvent<B>; 8]> = qp.cancel_all().collect();
    let (qn, sq, cq) = qp.into_parts();
    let hw = qn.hw();
    let sq_opcode = match env.profile.binding {
        BindingModel::Direct => ops.destroy_sq,
        BindingModel::StateMachine => ops.to_reset,
    };
    let sq_result = hand_back(env, teardown, sq_opcode, hw);
    let cq_result = hand_back(env, teardown, ops.destroy_cq, hw);
    for (what, result) in [("send queue", &sq_result), ("completion queue", &cq_result)] {
        if let Err(e) = result {
            log::error!("{:?} queue {:#x}: {} hand-back failed: {}", kind, hw, what, e);
        }
    }
    let (sq_released, cq_released) = (sq_result.is_ok(), cq_result.is_ok());

    if !cancelled.is_empty() {
        log::debug!(
            "{:?} queue {:#x}: cancelling {} submissions",
            kind,
            hw,
            cancelled.len()
        );
    }
    for event in cancelled {
        sink(event);
    }

    let platform = env.platform;
    let release = |released: bool, region: DmaRegion, what: &str| {
        if released {
            platform.free_dma(region);
        } else {
            log::warn!(
                "{:?} queue {:#x}: leaking {} ring {:#x}+{:#x}",
                kind,
                hw,
                what,
                region.addr,
                region.len
            );
        }
    };
    release(sq_released, sq.ring(), "send");
    release(cq_released, cq.ring(), "completion");

    if sq_released && cq_released {
        if env.profile.doorbell_records
            && let Some(arena) = env.records
        {
            arena.clear(platform, qn.offset())?;
        }
        env.allocator.free(qn)?;
        log::info!("{:?} queue {:#x} destroyed", kind, hw);
    } else {
        log::warn!("{:?} queue {:#x}: leaking queue number", kind, hw);
    }

    sq_result.and(cq_result)
}
