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

use super::{AdminCommand, AdminCompletion, AdminRequest, AdminResponse, write_addr};
use crate::PAGE_SIZE;
use crate::config::DriverConfig;
use crate::doorbell::Doorbell;
use crate::error::{DeviceStatus, QueueError, Result, log_then_return};
use crate::platform::{DmaRegion, Platform};
use crate::ring::{Ownership, OwnershipMode, RingIndex};
use crate::wait::{Check, ResetSignal, bounded_wait};

/// Register map of a phase-ring admin queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRingRegisters {
    /// Request ring base, low word here and high word four bytes above.
    pub request_base: u64,
    /// Response ring base, same split as `request_base`.
    pub response_base: u64,
    /// Ring depth in entries, shared by both rings.
    pub depth: u64,
    /// Producer doorbell.
    pub doorbell: u64,
    pub reset: Option<ResetSignal>,
}

/// Request ring plus response ring, readiness signalled by per-lap phase.
#[derive(Debug)]
pub struct PhaseRingAdmin {
    regs: PhaseRingRegisters,
    requests: DmaRegion,
    responses: DmaRegion,
    producer: RingIndex,
    consumer: RingIndex,
    /// Id of a command that timed out and may still be answered.
    outstanding: Option<u16>,
}

impl PhaseRingAdmin {
    /// Allocate both rings with `depth` entries each.
    pub fn new<P: Platform>(platform: &P, regs: PhaseRingRegisters, depth: u32) -> Result<Self> {
        let producer = RingIndex::new(depth).ok_or(QueueError::InvalidState)?;
        let requests = platform.allocate_zeroed(depth as usize * AdminRequest::SIZE, PAGE_SIZE)?;
        let responses =
            match platform.allocate_zeroed(depth as usize * AdminCompletion::SIZE, PAGE_SIZE) {
                Ok(region) => region,
                Err(err) => {
                    platform.free_dma(requests);
                    return Err(err);
                }
            };

        Ok(Self {
            regs,
            requests,
            responses,
            producer,
            consumer: producer,
            outstanding: None,
        })
    }

    pub(super) fn enable<P: Platform>(&mut self, platform: &P) -> Result<()> {
        platform.fill_zero(self.requests)?;
        platform.fill_zero(self.responses)?;

        let depth = self.producer.capacity();
        self.producer = RingIndex::new(depth).ok_or(QueueError::InvalidState)?;
        self.consumer = self.producer;
        self.outstanding = None;

        write_addr(platform, self.regs.request_base, self.requests.device_addr(platform));
        write_addr(platform, self.regs.response_base, self.responses.device_addr(platform));
        platform.write32(self.regs.depth, depth);
        Ok(())
    }

    pub(super) fn is_synchronized(&self) -> bool {
        self.outstanding.is_none()
    }

    pub(super) fn reset_signal(&self) -> Option<&ResetSignal> {
        self.regs.reset.as_ref()
    }

    pub(super) fn release<P: Platform>(self, platform: &P) {
        platform.free_dma(self.requests);
        platform.free_dma(self.responses);
    }

    fn slot_addr(region: &DmaRegion, idx: &RingIndex, size: usize) -> u64 {
        region.addr + idx.slot() as u64 * size as u64
    }

    /// The response at the consumer, if the device has published it.
    fn ready_response<P: Platform>(&self, platform: &P) -> Result<Option<AdminCompletion>> {
        let addr = Self::slot_addr(&self.responses, &self.consumer, AdminCompletion::SIZE);
        let flags = platform
            .load_acquire(addr + AdminCompletion::FLAGS_OFFSET as u64)
            .map_err(|_| QueueError::Mem)?;

        match OwnershipMode::Phase.decode(flags, self.consumer.phase()) {
            Ownership::Device => Ok(None),
            Ownership::Host => {
                let mut resp: AdminCompletion =
                    platform.read_val(addr).map_err(|_| QueueError::Mem)?;
                resp.flags = flags;
                Ok(Some(resp))
            }
        }
    }

    /// Reap the late answer to a timed-out command, if it has arrived.
    fn resync<P: Platform>(&mut self, platform: &P) -> Result<()> {
        let Some(id) = self.outstanding else {
            return Ok(());
        };

        match self.ready_response(platform)? {
            Some(late) => {
                log::warn!(
                    "admin: discarding late response {:#x} to timed out command {:#x}",
                    late.id,
                    id
                );
                self.consumer.advance();
                self.outstanding = None;
                Ok(())
            }
            None => {
                if let Some(signal) = self.regs.reset
                    && signal.in_reset(platform)
                {
                    return Err(QueueError::Reset);
                }
                Err(QueueError::Busy)
            }
        }
    }

    pub(super) fn submit<P: Platform>(
        &mut self,
        platform: &P,
        config: &DriverConfig,
        cmd: &AdminCommand,
    ) -> Result<AdminResponse> {
        self.resync(platform)?;
        if RingIndex::is_full(&self.producer, &self.consumer) {
            return Err(QueueError::Busy);
        }

        let id = self.producer.counter() as u16;
        let addr = Self::slot_addr(&self.requests, &self.producer, AdminRequest::SIZE);
        AdminRequest::from_command(cmd, id, self.producer.phase().bit())
            .write_release(platform, addr)
            .map_err(|_| QueueError::Mem)?;

        self.producer.advance();
        Doorbell::new(self.regs.doorbell).ring(platform, self.producer.counter());

        let waited = bounded_wait(
            platform,
            config.admin_timeout(),
            config.poll_interval(),
            self.regs.reset.as_ref(),
            || {
                Ok(match self.ready_response(platform)? {
                    Some(resp) => Check::Ready(resp),
                    None => Check::Pending,
                })
            },
        );

        let resp = match waited {
            Ok(resp) => resp,
            Err(err) => {
                self.outstanding = Some(id);
                log_then_return!(err, "admin command {:#06x} id {:#x}", cmd.opcode, id);
            }
        };
        self.consumer.advance();

        if resp.id != id {
            log::warn!(
                "admin: response id {:#x} does not match command {:#x}",
                resp.id,
                id
            );
            return Err(QueueError::Corrupted);
        }
        if let Some(status) = DeviceStatus::from_response_status(resp.status) {
            log::debug!("admin command {:#06x} failed: {}", cmd.opcode, status);
            return Err(QueueError::DeviceError(status));
        }

        Ok(AdminResponse {
            id,
            output: resp.output,
            immediate: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::AdminQueue;
    use crate::config::OpcodeTable;
    use crate::testing::{AdminBehaviour, MockDevice, regs};

    fn setup() -> (MockDevice, AdminQueue, DriverConfig) {
        let dev = MockDevice::new();
        dev.install_phase_ring_firmware(OpcodeTable::flat());
        let mut q = AdminQueue::PhaseRing(
            PhaseRingAdmin::new(&dev, regs::phase_ring(), 4).unwrap(),
        );
        q.enable(&dev).unwrap();
        (dev, q, DriverConfig::default())
    }

    #[test]
    fn completes_across_laps() {
        let (dev, mut q, cfg) = setup();
        dev.set_command_output(0x42, [7; 12]);

        // three laps of a four entry ring
        for n in 0..12u16 {
            let resp = q.submit(&dev, &cfg, &AdminCommand::new(0x42)).unwrap();
            assert_eq!(resp.id, n);
            assert_eq!(resp.output, [7; 12]);
        }
        assert_eq!(dev.commands().len(), 12);
    }

    #[test]
    fn device_status_is_reported() {
        let (dev, mut q, cfg) = setup();
        dev.fail_command(0x42, 1);

        let err = q.submit(&dev, &cfg, &AdminCommand::new(0x42)).unwrap_err();
        assert_eq!(err, QueueError::DeviceError(DeviceStatus::ResourceExhausted));
        assert!(q.is_synchronized());
    }

    #[test]
    fn timeout_is_bounded_and_resyncs() {
        let (dev, mut q, cfg) = setup();
        dev.set_admin_behaviour(AdminBehaviour::Defer);

        let start = dev.elapsed_ms();
        let err = q.submit(&dev, &cfg, &AdminCommand::new(0x42)).unwrap_err();
        let waited = dev.elapsed_ms() - start;
        assert_eq!(err, QueueError::Timeout);
        let timeout = cfg.admin_timeout().as_millis() as u64;
        let interval = cfg.poll_interval().as_millis() as u64;
        assert!(waited >= timeout && waited <= timeout + interval);
        assert!(!q.is_synchronized());

        // still unanswered
        assert_eq!(
            q.submit(&dev, &cfg, &AdminCommand::new(0x43)).unwrap_err(),
            QueueError::Busy
        );

        dev.complete_deferred();
        let resp = q.submit(&dev, &cfg, &AdminCommand::new(0x43)).unwrap();
        assert_eq!(resp.id, 1);
        assert!(q.is_synchronized());
    }

    #[test]
    fn reset_during_wait() {
        let (dev, mut q, cfg) = setup();
        dev.set_admin_behaviour(AdminBehaviour::Reset);

        let err = q.submit(&dev, &cfg, &AdminCommand::new(0x42)).unwrap_err();
        assert_eq!(err, QueueError::Reset);
        assert!(dev.elapsed_ms() < cfg.admin_timeout().as_millis() as u64);
    }

    #[test]
    fn mismatched_response_id_is_corrupted() {
        let (dev, mut q, cfg) = setup();
        dev.corrupt_next_response_id();

        let err = q.submit(&dev, &cfg, &AdminCommand::new(0x42)).unwrap_err();
        assert_eq!(err, QueueError::Corrupted);
        assert!(q.submit(&dev, &cfg, &AdminCommand::new(0x42)).is_ok());
    }

    #[test]
    fn enable_programs_ring_registers() {
        let (dev, q, _) = setup();
        let AdminQueue::PhaseRing(inner) = &q else {
            unreachable!()
        };
        let base = dev.reg(regs::AQ_BASE) as u64 | (dev.reg(regs::AQ_BASE + 4) as u64) << 32;
        assert_eq!(base, inner.requests.device_addr(&dev));
        assert_eq!(dev.reg(regs::AQ_DEPTH), 4);
    }
}
