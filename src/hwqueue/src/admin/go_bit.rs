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

//! Go-bit command register protocol.
//!
//! ```text
//!  dword  0 in_param[63:32]     3 out_param[63:32]
//!         1 in_param[31:0]      4 out_param[31:0]
//!         2 input_modifier      5 token << 16
//!         6 status[31:24] | go[23] | t[21] | op_mod[15:12] | opcode[11:0]
//! ```
//!
//! Parameters travel through DMA mailboxes whose addresses are written into
//! the in/out parameter dwords.

use super::{ADMIN_PARAM_WORDS, AdminCommand, AdminResponse};
use crate::PAGE_SIZE;
use crate::config::DriverConfig;
use crate::error::{DeviceStatus, QueueError, Result, log_then_return};
use crate::platform::{DmaRegion, Platform};
use crate::wait::{Check, ResetSignal, bounded_wait};

pub const HCR_IN_PARAM: u64 = 0x00;
pub const HCR_IN_MODIFIER: u64 = 0x08;
pub const HCR_OUT_PARAM: u64 = 0x0c;
pub const HCR_TOKEN: u64 = 0x14;
pub const HCR_STATUS: u64 = 0x18;

pub const HCR_GO: u32 = 1 << 23;
pub const HCR_TOGGLE: u32 = 1 << 21;
pub const HCR_OPMOD_SHIFT: u32 = 12;
pub const HCR_STATUS_SHIFT: u32 = 24;
pub const HCR_OPCODE_MASK: u32 = 0xfff;

/// Offset of the output mailbox inside the mailbox page.
pub const OUT_MAILBOX_OFFSET: usize = PAGE_SIZE / 2;

const TOKEN_BASE: u16 = 0x8000;

/// Register map of a go-bit command interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcrRegisters {
    /// Offset of dword 0.
    pub base: u64,
    pub reset: Option<ResetSignal>,
}

#[derive(Debug)]
pub struct GoBitAdmin {
    regs: HcrRegisters,
    mailbox: DmaRegion,
    toggle: bool,
    token: u16,
    outstanding: Option<u16>,
}

impl GoBitAdmin {
    pub fn new<P: Platform>(platform: &P, regs: HcrRegisters) -> Result<Self> {
        let mailbox = platform.allocate_zeroed(PAGE_SIZE, PAGE_SIZE)?;
        Ok(Self {
            regs,
            mailbox,
            toggle: false,
            token: TOKEN_BASE,
            outstanding: None,
        })
    }

    fn status<P: Platform>(&self, platform: &P) -> u32 {
        platform.read32(self.regs.base + HCR_STATUS)
    }

    pub(super) fn enable<P: Platform>(&mut self, platform: &P) -> Result<()> {
        platform.fill_zero(self.mailbox)?;
        self.toggle = self.status(platform) & HCR_TOGGLE != 0;
        self.outstanding = None;
        Ok(())
    }

    pub(super) fn is_synchronized(&self) -> bool {
        self.outstanding.is_none()
    }

    pub(super) fn reset_signal(&self) -> Option<&ResetSignal> {
        self.regs.reset.as_ref()
    }

    pub(super) fn release<P: Platform>(self, platform: &P) {
        platform.free_dma(self.mailbox);
    }

    /// The interface is free when go is clear and the toggle reads back as
    /// last written.
    fn is_idle(&self, status: u32) -> bool {
        status & HCR_GO == 0 && (status & HCR_TOGGLE != 0) == self.toggle
    }

    pub(super) fn submit<P: Platform>(
        &mut self,
        platform: &P,
        config: &DriverConfig,
        cmd: &AdminCommand,
    ) -> Result<AdminResponse> {
        if !self.is_idle(self.status(platform)) {
            if let Some(signal) = self.regs.reset
                && signal.in_reset(platform)
            {
                return Err(QueueError::Reset);
            }
            return Err(QueueError::Busy);
        }
        if let Some(late) = self.outstanding.take() {
            log::warn!("admin: timed out command token {:#x} completed late", late);
        }

        let in_addr = self.mailbox.addr;
        let out_addr = self.mailbox.addr + OUT_MAILBOX_OFFSET as u64;
        platform
            .write_val(in_addr, cmd.params)
            .map_err(|_| QueueError::Mem)?;
        platform
            .write_val(out_addr, [0u32; ADMIN_PARAM_WORDS])
            .map_err(|_| QueueError::Mem)?;

        let in_dev = platform.to_device_address(in_addr);
        let out_dev = platform.to_device_address(out_addr);
        let token = self.token;
        self.token = self.token.wrapping_add(1);

        let words = [
            (in_dev >> 32) as u32,
            in_dev as u32,
            cmd.input_modifier,
            (out_dev >> 32) as u32,
            out_dev as u32,
            u32::from(token) << 16,
        ];
        for (i, word) in words.into_iter().enumerate() {
            platform.write32(self.regs.base + HCR_IN_PARAM + 4 * i as u64, word);
            platform.barrier();
        }

        self.toggle = !self.toggle;
        let mut go = HCR_GO
            | (u32::from(cmd.modifier) & 0xf) << HCR_OPMOD_SHIFT
            | u32::from(cmd.opcode) & HCR_OPCODE_MASK;
        if self.toggle {
            go |= HCR_TOGGLE;
        }
        log::trace!("hcr go {:#010x} token {:#x}", go, token);
        platform.write32(self.regs.base + HCR_STATUS, go);

        let waited = bounded_wait(
            platform,
            config.admin_timeout(),
            config.poll_interval(),
            self.regs.reset.as_ref(),
            || {
                let status = self.status(platform);
                Ok(if status & HCR_GO == 0 {
                    Check::Ready(status)
                } else {
                    Check::Pending
                })
            },
        );
        let status = match waited {
            Ok(status) => status,
            Err(err) => {
                self.outstanding = Some(token);
                log_then_return!(err, "admin command {:#06x} token {:#x}", cmd.opcode, token);
            }
        };

        if let Some(status) = DeviceStatus::from_hcr_status((status >> HCR_STATUS_SHIFT) as u8) {
            log::debug!("admin command {:#06x} failed: {}", cmd.opcode, status);
            return Err(QueueError::DeviceError(status));
        }

        let output = platform.read_val(out_addr).map_err(|_| QueueError::Mem)?;
        let immediate = u64::from(platform.read32(self.regs.base + HCR_OUT_PARAM)) << 32
            | u64::from(platform.read32(self.regs.base + HCR_OUT_PARAM + 4));
        Ok(AdminResponse {
            id: token,
            output,
            immediate,
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
        dev.install_go_bit_firmware(OpcodeTable::linked());
        let mut q = AdminQueue::GoBit(GoBitAdmin::new(&dev, regs::hcr()).unwrap());
        q.enable(&dev).unwrap();
        (dev, q, DriverConfig::default())
    }

    #[test]
    fn dwords_written_with_barriers_then_go() {
        let (dev, mut q, cfg) = setup();
        dev.clear_mmio_log();

        let cmd = AdminCommand::new(0x04).with_modifier(3).with_input_modifier(0x55);
        q.submit(&dev, &cfg, &cmd).unwrap();

        let log = dev.mmio_log();
        // six parameter dwords, each followed by a barrier, then the go word
        assert_eq!(log.len(), 13);
        for i in 0..6 {
            let (offset, _) = log[2 * i].write_value().unwrap();
            assert_eq!(offset, regs::HCR + 4 * i as u64);
            assert!(log[2 * i + 1].is_barrier());
        }
        assert_eq!(log[4].write_value(), Some((regs::HCR + HCR_IN_MODIFIER, 0x55)));
        assert_eq!(log[10].write_value(), Some((regs::HCR + HCR_TOKEN, 0x8000 << 16)));
        let (offset, go) = log[12].write_value().unwrap();
        assert_eq!(offset, regs::HCR + HCR_STATUS);
        assert_ne!(go & HCR_GO, 0);
        assert_ne!(go & HCR_TOGGLE, 0);
        assert_eq!(go & HCR_OPCODE_MASK, 0x04);
        assert_eq!((go >> HCR_OPMOD_SHIFT) & 0xf, 3);
    }

    #[test]
    fn mailbox_carries_parameters_and_output() {
        let (dev, mut q, cfg) = setup();
        dev.set_command_output(0x30, [9; 12]);

        let resp = q
            .submit(&dev, &cfg, &AdminCommand::new(0x30).with_param(2, 0xabc))
            .unwrap();
        assert_eq!(resp.output, [9; 12]);
        assert_eq!(resp.id, 0x8000);
        assert_eq!(dev.commands()[0].params[2], 0xabc);

        // toggle flips on every command
        let resp = q.submit(&dev, &cfg, &AdminCommand::new(0x30)).unwrap();
        assert_eq!(resp.id, 0x8001);
    }

    #[test]
    fn status_byte_decoded() {
        let (dev, mut q, cfg) = setup();
        dev.fail_command(0x30, 0x05);
        assert_eq!(
            q.submit(&dev, &cfg, &AdminCommand::new(0x30)).unwrap_err(),
            QueueError::DeviceError(DeviceStatus::NotFound)
        );
    }

    #[test]
    fn go_still_set_is_busy() {
        let (dev, mut q, cfg) = setup();
        dev.set_admin_behaviour(AdminBehaviour::Hang);

        assert_eq!(
            q.submit(&dev, &cfg, &AdminCommand::new(0x30)).unwrap_err(),
            QueueError::Timeout
        );
        assert!(!q.is_synchronized());
        assert_eq!(
            q.submit(&dev, &cfg, &AdminCommand::new(0x30)).unwrap_err(),
            QueueError::Busy
        );
    }

    #[test]
    fn deferred_completion_resyncs() {
        let (dev, mut q, cfg) = setup();
        dev.set_admin_behaviour(AdminBehaviour::Defer);
        assert_eq!(
            q.submit(&dev, &cfg, &AdminCommand::new(0x30)).unwrap_err(),
            QueueError::Timeout
        );

        dev.complete_deferred();
        assert!(q.submit(&dev, &cfg, &AdminCommand::new(0x30)).is_ok());
        assert!(q.is_synchronized());
    }
}
