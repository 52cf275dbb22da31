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

//! Queue page lists.
//!
//! Some devices only reach buffer memory through pages registered with them
//! up front. The interface is configured first, then one page list per
//! direction is registered, and only then are queues created. Teardown runs
//! the same steps backwards:
//!
//! ```text
//!  register:  configure ─> tx list ─> rx list
//!  release:   deconfigure <─ tx list <─ rx list
//! ```
//!
//! Buffers posted to such a device must live inside the data pages of the
//! list matching their queue.

#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::PAGE_SIZE;
use crate::admin::AdminCommand;
use crate::error::{QueueError, Result, log_then_return};
use crate::lifecycle::{ContextEnv, Rollback, Teardown, Undo, hand_back};
use crate::platform::{DmaRegion, Platform};
use crate::qp::QueueKind;

/// Page addresses one list page can hold.
pub const MAX_LIST_PAGES: usize = PAGE_SIZE / core::mem::size_of::<u64>();

/// Queues the interface is configured for: one transmit and one receive.
const CONFIGURED_QUEUES: u32 = 2;

/// Data pages registered under one id, and the page of device addresses
/// describing them.
#[derive(Debug)]
pub struct PageList {
    id: u32,
    data: DmaRegion,
    list: DmaRegion,
}

impl PageList {
    /// Id queues of `kind` name when they are created.
    pub fn id_for(kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Tx => 0,
            QueueKind::Rx => 1,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Buffer memory the device can reach.
    pub fn data(&self) -> DmaRegion {
        self.data
    }

    pub fn pages(&self) -> u32 {
        self.data.len.div_ceil(PAGE_SIZE) as u32
    }
}

/// Data pages needed for `entries` buffers of `buffer_len` bytes, packing as
/// many whole buffers into a page as fit.
fn pages_for(entries: u32, buffer_len: u32) -> Result<usize> {
    let per_page = (PAGE_SIZE / buffer_len.max(1) as usize).max(1);
    let pages = (entries as usize).div_ceil(per_page);
    if pages == 0 || pages > MAX_LIST_PAGES {
        log_then_return!(
            QueueError::InvalidState,
            "{} buffers of {} bytes need {} list pages",
            entries,
            buffer_len,
            pages
        );
    }
    Ok(pages)
}

fn register_one<P: Platform>(
    rb: &mut Rollback<'_, '_, P>,
    kind: QueueKind,
    entries: u32,
    buffer_len: u32,
) -> Result<PageList> {
    let platform = rb.env().platform;
    let ops = rb.env().profile.opcodes;
    let id = PageList::id_for(kind);
    let pages = pages_for(entries, buffer_len)?;

    let data = platform.allocate_zeroed(pages * PAGE_SIZE, PAGE_SIZE)?;
    rb.push(Undo::Dma(data));
    let list = platform.allocate_zeroed(PAGE_SIZE, PAGE_SIZE)?;
    rb.push(Undo::Dma(list));
    for page in 0..pages {
        let addr = platform.to_device_address(data.addr + (page * PAGE_SIZE) as u64);
        platform
            .write_val(list.addr + (page * core::mem::size_of::<u64>()) as u64, addr)
            .map_err(|_| QueueError::Mem)?;
    }

    rb.env().command(
        AdminCommand::new(ops.register_page_list)
            .with_input_modifier(id)
            .with_param64(0, list.device_addr(platform))
            .with_param(2, pages as u32)
            .with_param64(3, PAGE_SIZE as u64),
    )?;
    rb.push(Undo::Command {
        opcode: ops.unregister_page_list,
        input_modifier: id,
    });
    log::debug!("{:?} page list {} registered: {} pages", kind, id, pages);
    Ok(PageList { id, data, list })
}

/// The configured interface and both registered page lists.
#[derive(Debug)]
pub struct PageLists {
    tx: PageList,
    rx: PageList,
}

impl PageLists {
    /// Configure the interface and register page lists sized for
    /// `tx_entries` and `rx_entries` buffers of `buffer_len` bytes. On
    /// failure everything registered so far is unregistered and the
    /// interface deconfigured.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn register<P: Platform>(
        env: &mut ContextEnv<'_, P>,
        tx_entries: u32,
        rx_entries: u32,
        buffer_len: u32,
    ) -> Result<Self> {
        let ops = env.profile.opcodes;
        let mut rb = Rollback::new(env);

        rb.env()
            .command(AdminCommand::new(ops.configure).with_param(0, CONFIGURED_QUEUES))?;
        rb.push(Undo::Command {
            opcode: ops.deconfigure,
            input_modifier: 0,
        });
        let tx = register_one(&mut rb, QueueKind::Tx, tx_entries, buffer_len)?;
        let rx = register_one(&mut rb, QueueKind::Rx, rx_entries, buffer_len)?;

        rb.commit();
        Ok(Self { tx, rx })
    }

    pub fn get(&self, kind: QueueKind) -> &PageList {
        match kind {
            QueueKind::Tx => &self.tx,
            QueueKind::Rx => &self.rx,
        }
    }

    /// Unregister both lists, newest first, then deconfigure. A list whose
    /// unregister fails is leaked; every step is still attempted and the
    /// first failure is returned.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn release<P: Platform>(self, env: &mut ContextEnv<'_, P>, teardown: Teardown) -> Result<()> {
        let ops = env.profile.opcodes;
        let mut result = Ok(());

        for list in [self.rx, self.tx] {
            match hand_back(env, teardown, ops.unregister_page_list, list.id) {
                Ok(()) => {
                    env.platform.free_dma(list.list);
                    env.platform.free_dma(list.data);
                }
                Err(e) => {
                    log::error!(
                        "unregister page list {} failed: {}; leaking {} pages at {:#x}",
                        list.id,
                        e,
                        list.pages(),
                        list.data.addr
                    );
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        if let Err(e) = hand_back(env, teardown, ops.deconfigure, 0) {
            log::error!("deconfigure failed: {}", e);
            if result.is_ok() {
                result = Err(e);
            }
        }
        result
    }
}
