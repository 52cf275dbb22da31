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

use super::{AdminCommand, AdminRequest, AdminResponse};
use crate::PAGE_SIZE;
use crate::config::DriverConfig;
use crate::doorbell::Doorbell;
use crate::error::{DeviceStatus, QueueError, Result, log_then_return};
use crate::platform::{DmaRegion, Platform};
use crate::ring::RingIndex;
use crate::wait::{Check, ResetSignal, bounded_wait};

/// Register map of an event-counter admin queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCounterRegisters {
    /// Page frame number of the command ring. Zero disables the queue.
    pub pfn: u64,
    /// Producer doorbell.
    pub doorbell: u64,
    /// Count of commands the device has completed.
    pub event_counter: u64,
    pub reset: Option<ResetSignal>,
}

/// Command ring whose completions are counted by a device register.
#[derive(Debug)]
pub struct EventCounterAdmin {
    regs: EventCounterRegisters,
    ring: DmaRegion,
    producer: RingIndex,
    /// Id of a command that timed out and may still complete.
    outstanding: Option<u16>,
}

impl EventCounterAdmin {
    pub fn new<P: Platform>(platform: &P, regs: EventCounterRegisters, depth: u32) -> Result<Self> {
        let producer = RingIndex::new(depth).ok_or(QueueError::InvalidState)?;
        let len = core::cmp::max(depth as usize * AdminRequest::SIZE, PAGE_SIZE);
        let ring = platform.allocate_zeroed(len, PAGE_SIZE)?;
        Ok(Self {
            regs,
            ring,
            producer,
            outstanding: None,
        })
    }

    pub(super) fn enable<P: Platform>(&mut self, platform: &P) -> Result<()> {
        platform.fill_zero(self.ring)?;
        self.producer = RingIndex::new(self.producer.capacity()).ok_or(QueueError::InvalidState)?;
        self.outstanding = None;

        let pfn = self.ring.device_addr(platform) / PAGE_SIZE as u64;
        platform.write32(self.regs.pfn, pfn as u32);
        Ok(())
    }

    fn completed<P: Platform>(&self, platform: &P) -> u32 {
        platform.read32(self.regs.event_counter)
    }

    pub(super) fn is_synchronized(&self) -> bool {
        self.outstanding.is_none()
    }

    pub(super) fn reset_signal(&self) -> Option<&ResetSignal> {
        self.regs.reset.as_ref()
    }

    pub(super) fn release<P: Platform>(self, platform: &P) {
        platform.free_dma(self.ring);
    }

    pub(super) fn submit<P: Platform>(
        &mut self,
        platform: &P,
        config: &DriverConfig,
        cmd: &AdminCommand,
    ) -> Result<AdminResponse> {
        // a timed-out command is still owned by the device until the counter
        // catches up with it
        if self.completed(platform) != self.producer.counter() {
            if let Some(signal) = self.regs.reset
                && signal.in_reset(platform)
            {
                return Err(QueueError::Reset);
            }
            return Err(QueueError::Busy);
        }
        if let Some(late) = self.outstanding.take() {
            log::warn!("admin: timed out command {:#x} completed late", late);
        }

        let id = self.producer.counter() as u16;
        let addr = self.ring.addr + self.producer.slot() as u64 * AdminRequest::SIZE as u64;
        AdminRequest::from_command(cmd, id, self.producer.phase().bit())
            .write_release(platform, addr)
            .map_err(|_| QueueError::Mem)?;

        self.producer.advance();
        let target = self.producer.counter();
        Doorbell::new(self.regs.doorbell).ring(platform, target);

        let waited = bounded_wait(
            platform,
            config.admin_timeout(),
            config.poll_interval(),
            self.regs.reset.as_ref(),
            || {
                Ok(if self.completed(platform) == target {
                    Check::Ready(())
                } else {
                    Check::Pending
                })
            },
        );
        if let Err(err) = waited {
            self.outstanding = Some(id);
            log_then_return!(err, "admin command {:#06x} id {:#x}", cmd.opcode, id);
        }

        let done: AdminRequest = platform.read_val(addr).map_err(|_| QueueError::Mem)?;
        if let Some(status) = DeviceStatus::from_event_status(done.status) {
            log::debug!("admin command {:#06x} failed: {}", cmd.opcode, status);
            return Err(QueueError::DeviceError(status));
        }

        Ok(AdminResponse {
            id,
            output: done.params,
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
        dev.install_event_counter_firmware(OpcodeTable::flat(), 4);
        let mut q = AdminQueue::EventCounter(
            EventCounterAdmin::new(&dev, regs::event_counter(), 4).unwrap(),
        );
        q.enable(&dev).unwrap();
        (dev, q, DriverConfig::default())
    }

    #[test]
    fn status_written_back_in_place() {
        let (dev, mut q, cfg) = setup();
        dev.set_command_output(0x7, [3; 12]);

        for n in 0..9u16 {
            let resp = q.submit(&dev, &cfg, &AdminCommand::new(0x7)).unwrap();
            assert_eq!(resp.id, n);
            assert_eq!(resp.output, [3; 12]);
        }
        assert_eq!(dev.reg(regs::EVT_COUNTER), 9);
    }

    #[test]
    fn failure_status_decoded() {
        let (dev, mut q, cfg) = setup();
        dev.fail_command(0x7, 0x18);
        assert_eq!(
            q.submit(&dev, &cfg, &AdminCommand::new(0x7)).unwrap_err(),
            QueueError::DeviceError(DeviceStatus::NotFound)
        );
    }

    #[test]
    fn busy_until_late_completion() {
        let (dev, mut q, cfg) = setup();
        dev.set_admin_behaviour(AdminBehaviour::Defer);
        assert_eq!(
            q.submit(&dev, &cfg, &AdminCommand::new(0x7)).unwrap_err(),
            QueueError::Timeout
        );
        assert_eq!(
            q.submit(&dev, &cfg, &AdminCommand::new(0x7)).unwrap_err(),
            QueueError::Busy
        );

        dev.complete_deferred();
        assert_eq!(q.submit(&dev, &cfg, &AdminCommand::new(0x7)).unwrap().id, 1);
    }

    #[test]
    fn enable_writes_page_frame() {
        let dev = MockDevice::new();
        let mut q = EventCounterAdmin::new(&dev, regs::event_counter(), 4).unwrap();
        q.enable(&dev).unwrap();
        assert_eq!(
            dev.reg(regs::EVT_PFN) as u64,
            q.ring.device_addr(&dev) / PAGE_SIZE as u64
        );
    }
}
