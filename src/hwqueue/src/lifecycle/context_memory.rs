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

//! Host memory lent to firmware.
//!
//! Some devices keep no context memory of their own. Before any queue can be
//! created the host stages, in order: the firmware area, the auxiliary
//! context area, and a context table with one entry per queue number. Each
//! area is mapped with a command and must be unmapped, in reverse order,
//! before it is freed.

use crate::PAGE_SIZE;
use crate::admin::AdminCommand;
use crate::error::{QueueError, Result, log_then_return};
use crate::lifecycle::{ContextEnv, Rollback, Teardown, Undo};
use crate::platform::{DmaRegion, Platform};

/// Bytes of context memory per queue number, for both rings of a pair.
pub const CONTEXT_BYTES_PER_QUEUE: usize = 2 * 256;

/// Staged firmware and context areas.
#[derive(Debug)]
pub struct ContextMemory {
    firmware: DmaRegion,
    aux: Option<DmaRegion>,
    table: DmaRegion,
    reserved_queues: u32,
    usable_queues: u32,
    reserved_event_queues: u32,
}

fn pages(region: DmaRegion) -> u32 {
    region.len.div_ceil(PAGE_SIZE) as u32
}

/// Byte length of `count` firmware-reported pages.
fn page_bytes(count: u32, what: &str) -> Result<usize> {
    match (count as usize).checked_mul(PAGE_SIZE) {
        Some(len) => Ok(len),
        None => {
            log_then_return!(QueueError::InvalidState, "{} area of {} pages", what, count);
        }
    }
}

fn map_command<P: Platform>(platform: &P, opcode: u16, region: DmaRegion) -> AdminCommand {
    AdminCommand::new(opcode)
        .with_param64(0, region.device_addr(platform))
        .with_param(2, pages(region))
}

impl ContextMemory {
    /// Stage firmware and context memory for up to `max_queues` queue
    /// numbers. On failure everything staged so far is unmapped and freed.
    pub fn map<P: Platform>(env: &mut ContextEnv<'_, P>, max_queues: u32) -> Result<Self> {
        let platform = env.platform;
        let ops = env.profile.opcodes;
        let mut rb = Rollback::new(env);

        let fw_pages = rb.env().command(AdminCommand::new(ops.query_fw))?.word(0);
        if fw_pages == 0 {
            log_then_return!(QueueError::InvalidState, "firmware reported no firmware area");
        }
        let firmware = platform.allocate_zeroed(page_bytes(fw_pages, "firmware")?, PAGE_SIZE)?;
        rb.push(Undo::Dma(firmware));
        rb.env().command(map_command(platform, ops.map_fa, firmware))?;
        rb.push(Undo::Command {
            opcode: ops.unmap_fa,
            input_modifier: 0,
        });
        rb.env().command(AdminCommand::new(ops.run_fw))?;

        let limits = rb.env().command(AdminCommand::new(ops.query_dev_lim))?;
        let reserved_queues = limits.word(0);
        let reserved_event_queues = limits.word(2);
        let usable_queues = limits.word(1).saturating_sub(reserved_queues).min(max_queues);
        if usable_queues == 0 {
            log_then_return!(
                QueueError::Exhausted,
                "device reserves all {} queue numbers",
                limits.word(1)
            );
        }

        let table_len = (usable_queues as usize)
            .checked_mul(CONTEXT_BYTES_PER_QUEUE)
            .and_then(|len| len.checked_next_multiple_of(PAGE_SIZE))
            .ok_or(QueueError::InvalidState)?;
        let aux_pages = rb
            .env()
            .command(AdminCommand::new(ops.set_icm_size).with_param64(0, table_len as u64))?
            .word(0);

        let aux = if aux_pages == 0 {
            None
        } else {
            let aux = platform.allocate_zeroed(page_bytes(aux_pages, "aux")?, PAGE_SIZE)?;
            rb.push(Undo::Dma(aux));
            rb.env().command(map_command(platform, ops.map_icm_aux, aux))?;
            rb.push(Undo::Command {
                opcode: ops.unmap_icm_aux,
                input_modifier: 0,
            });
            Some(aux)
        };

        let table = platform.allocate_zeroed(table_len, PAGE_SIZE)?;
        rb.push(Undo::Dma(table));
        rb.env().command(map_command(platform, ops.map_icm, table))?;
        rb.push(Undo::Command {
            opcode: ops.unmap_icm,
            input_modifier: 0,
        });

        rb.commit();
        log::info!(
            "context memory staged: {} firmware pages, {} aux pages, {} queue contexts above {:#x}",
            fw_pages,
            aux_pages,
            usable_queues,
            reserved_queues
        );
        Ok(Self {
            firmware,
            aux,
            table,
            reserved_queues,
            usable_queues,
            reserved_event_queues,
        })
    }

    /// Queue numbers below this are owned by firmware.
    pub fn reserved_queues(&self) -> u32 {
        self.reserved_queues
    }

    /// Event queue numbers below this are owned by firmware.
    pub fn reserved_event_queues(&self) -> u32 {
        self.reserved_event_queues
    }

    /// Queue numbers the context table has room for.
    pub fn usable_queues(&self) -> u32 {
        self.usable_queues
    }

    /// Unmap and free every area, newest first. An area whose unmap fails
    /// is leaked; the remaining areas are still attempted and the first
    /// failure is returned.
    pub fn unmap<P: Platform>(self, env: &mut ContextEnv<'_, P>, teardown: Teardown) -> Result<()> {
        let ops = env.profile.opcodes;
        let areas = [
            (Some(self.table), ops.unmap_icm),
            (self.aux, ops.unmap_icm_aux),
            (Some(self.firmware), ops.unmap_fa),
        ];

        let mut result = Ok(());
        for (region, opcode) in areas {
            let Some(region) = region else { continue };
            let unmapped = match teardown {
                Teardown::DeviceLost => Ok(()),
                Teardown::Orderly => env.command(AdminCommand::new(opcode)).map(|_| ()),
            };
            match unmapped {
                Ok(()) => env.platform.free_dma(region),
                Err(e) => {
                    log::error!(
                        "unmap {:#06x} failed: {}; leaking {} pages at {:#x}",
                        opcode,
                        e,
                        pages(region),
                        region.addr
                    );
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::Fixture;
    use crate::testing::{AUX_PAGES, DEVICE_MAX_QUEUES, FW_PAGES, RESERVED_EQS, RESERVED_QUEUES};

    const QUERY_FW: u16 = 0x04;
    const MAP_FA: u16 = 0xfff;
    const RUN_FW: u16 = 0xff6;
    const QUERY_DEV_LIM: u16 = 0x03;
    const SET_ICM_SIZE: u16 = 0xffd;
    const MAP_ICM_AUX: u16 = 0xffc;
    const MAP_ICM: u16 = 0xffa;
    const UNMAP_ICM: u16 = 0xff9;
    const UNMAP_ICM_AUX: u16 = 0xffb;
    const UNMAP_FA: u16 = 0xffe;

    fn opcodes(fx: &Fixture) -> Vec<u16> {
        fx.dev.commands().iter().map(|c| c.opcode).collect()
    }

    #[test]
    fn staging_order_and_limits() {
        let mut fx = Fixture::linked();
        let mem = ContextMemory::map(&mut fx.env(), 64).unwrap();

        assert_eq!(
            opcodes(&fx),
            vec![QUERY_FW, MAP_FA, RUN_FW, QUERY_DEV_LIM, SET_ICM_SIZE, MAP_ICM_AUX, MAP_ICM]
        );
        assert_eq!(mem.reserved_queues(), RESERVED_QUEUES);
        assert_eq!(mem.usable_queues(), DEVICE_MAX_QUEUES - RESERVED_QUEUES);
        assert_eq!(mem.reserved_event_queues(), RESERVED_EQS);
        assert_eq!(fx.queue_regions(), 3);

        let map_fa = fx.dev.commands()[1];
        assert_eq!(map_fa.params[2], FW_PAGES);
        let map_aux = fx.dev.commands()[5];
        assert_eq!(map_aux.params[2], AUX_PAGES);
    }

    #[test]
    fn small_limit_caps_table() {
        let mut fx = Fixture::linked();
        let mem = ContextMemory::map(&mut fx.env(), 4).unwrap();
        assert_eq!(mem.usable_queues(), 4);

        let set_icm = fx.dev.commands()[4];
        assert_eq!(set_icm.params[0] as usize, PAGE_SIZE);
    }

    #[test]
    fn unmap_reverses_and_frees() {
        let mut fx = Fixture::linked();
        let mem = ContextMemory::map(&mut fx.env(), 64).unwrap();
        mem.unmap(&mut fx.env(), Teardown::Orderly).unwrap();

        assert_eq!(&opcodes(&fx)[7..], &[UNMAP_ICM, UNMAP_ICM_AUX, UNMAP_FA]);
        assert_eq!(fx.queue_regions(), 0);
    }

    #[test]
    fn failed_stage_unmaps_what_was_mapped() {
        let mut fx = Fixture::linked();
        fx.dev.fail_command(MAP_ICM, 0x08);

        let err = ContextMemory::map(&mut fx.env(), 64).unwrap_err();
        assert_eq!(
            err,
            QueueError::DeviceError(crate::error::DeviceStatus::ResourceExhausted)
        );
        assert_eq!(&opcodes(&fx)[7..], &[UNMAP_ICM_AUX, UNMAP_FA]);
        assert_eq!(fx.queue_regions(), 0);
    }

    #[test]
    fn failed_unmap_leaks_only_that_area() {
        let mut fx = Fixture::linked();
        let mem = ContextMemory::map(&mut fx.env(), 64).unwrap();
        fx.dev.fail_command(UNMAP_ICM_AUX, 0x01);

        assert!(mem.unmap(&mut fx.env(), Teardown::Orderly).is_err());
        assert_eq!(fx.queue_regions(), 1);
        assert_eq!(fx.dev.command_count(UNMAP_FA), 1);
    }

    #[test]
    fn device_lost_frees_without_commands() {
        let mut fx = Fixture::linked();
        let mem = ContextMemory::map(&mut fx.env(), 64).unwrap();
        mem.unmap(&mut fx.env(), Teardown::DeviceLost).unwrap();
        assert_eq!(fx.dev.commands().len(), 7);
        assert_eq!(fx.queue_regions(), 0);
    }

    #[test]
    fn oversized_areas_are_rejected() {
        assert_eq!(page_bytes(3, "firmware").unwrap(), 3 * PAGE_SIZE);
        assert_eq!(page_bytes(u32::MAX, "firmware").is_err(), usize::BITS <= 32);

        let mut fx = Fixture::linked();
        let mut answer = [0; crate::admin::ADMIN_PARAM_WORDS];
        answer[0] = u32::MAX;
        fx.dev.set_command_output(SET_ICM_SIZE, answer);
        // either too large to express or too large to allocate
        let err = ContextMemory::map(&mut fx.env(), 64).unwrap_err();
        assert!(matches!(err, QueueError::InvalidState | QueueError::NoMemory));
        assert_eq!(opcodes(&fx).last(), Some(&UNMAP_FA));
        assert_eq!(fx.dev.command_count(MAP_ICM_AUX), 0);
        assert_eq!(fx.queue_regions(), 0);
    }

    #[test]
    fn all_reserved_is_exhausted() {
        let mut fx = Fixture::linked();
        let mut limits = [0; crate::admin::ADMIN_PARAM_WORDS];
        limits[0] = 8;
        limits[1] = 8;
        fx.dev.set_command_output(QUERY_DEV_LIM, limits);

        assert_eq!(
            ContextMemory::map(&mut fx.env(), 64).unwrap_err(),
            QueueError::Exhausted
        );
        assert_eq!(opcodes(&fx).last(), Some(&UNMAP_FA));
        assert_eq!(fx.queue_regions(), 0);
    }
}
