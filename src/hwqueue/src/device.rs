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

//! Device glue: one admin queue, one transmit and one receive queue pair.
//!
//! Bring-up is a retried sequence:
//!
//! ```text
//!   reset ─> admin enable ─> [context memory] ─> [doorbell records]
//!         ─> [event queue] ─> [page lists] ─> TX pair ─> RX pair ─> RX fill
//! ```
//!
//! A failed attempt tears down whatever it built before the next attempt
//! resets the device again. After `reset_retries + 1` failures, or one
//! failure that a reset cannot fix, the link is reported as failed.

use alloc::collections::VecDeque;

#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::admin::{AdminCommand, AdminQueue, AdminResponse};
use crate::allocator::QueueNumberAllocator;
use crate::config::{DriverConfig, QueueProfile};
use crate::cq::CompletionEvent;
use crate::doorbell::DoorbellArena;
use crate::eq::{Event, EventQueue};
use crate::error::{PostError, QueueError, Result};
use crate::lifecycle::context_memory::ContextMemory;
use crate::lifecycle::event_queue::{create_event_queue, destroy_event_queue};
use crate::lifecycle::page_list::PageLists;
use crate::lifecycle::{self, ContextEnv, Teardown, create_queue_pair, destroy_queue_pair};
use crate::platform::{DmaBuffer, DmaRegion, Platform, RxSource};
use crate::qp::{QueueKind, QueuePair};
use crate::wait::{Check, ResetSignal, bounded_wait};

/// Whether the device is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Up,
    /// Bring-up gave up, or the device reset underneath a running link.
    Failed(QueueError),
}

/// What [`Device::transmit`] did with a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Handed to the device.
    Posted,
    /// Queued until the transmit ring has room.
    Deferred,
}

pub struct Device<P: Platform, B: DmaBuffer, R: RxSource<B>> {
    platform: P,
    config: DriverConfig,
    profile: QueueProfile,
    admin: AdminQueue,
    allocator: QueueNumberAllocator,
    records: Option<DoorbellArena>,
    context_memory: Option<ContextMemory>,
    events: Option<EventQueue>,
    page_lists: Option<PageLists>,
    tx: Option<QueuePair<B>>,
    rx: Option<QueuePair<B>>,
    deferred: VecDeque<B>,
    rx_source: R,
    link: LinkState,
    /// Last port state the device reported.
    port_up: Option<bool>,
}

impl<P: Platform, B: DmaBuffer, R: RxSource<B>> Device<P, B, R> {
    pub fn new(
        platform: P,
        config: DriverConfig,
        profile: QueueProfile,
        admin: AdminQueue,
        rx_source: R,
    ) -> Self {
        Self {
            allocator: QueueNumberAllocator::new(config.max_queues(), 0),
            platform,
            config,
            profile,
            admin,
            records: None,
            context_memory: None,
            events: None,
            page_lists: None,
            tx: None,
            rx: None,
            deferred: VecDeque::new(),
            rx_source,
            link: LinkState::Down,
            port_up: None,
        }
    }

    fn env(&mut self) -> ContextEnv<'_, P> {
        ContextEnv {
            platform: &self.platform,
            config: &self.config,
            profile: &self.profile,
            admin: &mut self.admin,
            allocator: &mut self.allocator,
            records: self.records.as_ref(),
        }
    }

    /// Run the profile's reset handshake. Devices without one are left
    /// alone.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn reset(&mut self) -> Result<()> {
        let Some(seq) = self.profile.reset else {
            return Ok(());
        };
        let platform = &self.platform;
        let timeout = self.config.reset_timeout();
        let interval = self.config.poll_interval();
        let settled = |signal: ResetSignal| {
            move || -> Result<Check<()>> {
                Ok(if signal.in_reset(platform) {
                    Check::Ready(())
                } else {
                    Check::Pending
                })
            }
        };

        if seq.skip_when.is_some_and(|p| p.in_reset(platform)) {
            log::debug!("device already in reset");
        } else {
            platform.write32(seq.trigger.offset, seq.trigger.value);
            bounded_wait(platform, timeout, interval, None, settled(seq.acknowledged))
                .inspect_err(|e| log::error!("reset not acknowledged: {}", e))?;
        }

        if let Some((write, done)) = seq.release {
            platform.write32(write.offset, write.value);
            bounded_wait(platform, timeout, interval, None, settled(done))
                .inspect_err(|e| log::error!("reset not released: {}", e))?;
        }
        log::debug!("device reset complete");
        Ok(())
    }

    /// Bring the device up, resetting and retrying on recoverable failures.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn open(&mut self) -> Result<()> {
        if self.link == LinkState::Up {
            return Err(QueueError::InvalidState);
        }

        let attempts = u32::from(self.config.reset_retries()) + 1;
        let mut last = QueueError::InvalidState;
        for attempt in 1..=attempts {
            match self.start() {
                Ok(()) => {
                    self.link = LinkState::Up;
                    log::info!("link up after {} attempt(s)", attempt);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("bring-up attempt {}/{} failed: {}", attempt, attempts, e);
                    let mode = if self.device_lost() {
                        Teardown::DeviceLost
                    } else {
                        Teardown::Orderly
                    };
                    if let Err(te) = self.teardown(mode, &mut drop) {
                        log::error!("teardown after failed bring-up: {}", te);
                    }
                    last = e;
                    if !e.is_retryable() {
                        break;
                    }
                }
            }
        }

        log::error!("device failed to start: {}", last);
        self.link = LinkState::Failed(last);
        Err(last)
    }

    fn start(&mut self) -> Result<()> {
        self.reset()?;
        if self.profile.reset.is_some() {
            // the device no longer knows any queue handed to it before
            self.allocator.clear();
        }
        self.admin.enable(&self.platform)?;

        if self.profile.context_memory {
            let max_queues = self.config.max_queues();
            let memory = ContextMemory::map(&mut self.env(), max_queues)?;
            let (usable, reserved) = (memory.usable_queues(), memory.reserved_queues());
            self.context_memory = Some(memory);
            self.allocator.reconfigure(usable, reserved)?;
        }
        if self.profile.doorbell_records {
            let slots = self.allocator.capacity();
            self.records = Some(DoorbellArena::new(&self.platform, slots)?);
        }
        if self.profile.event_queue {
            let number = self
                .context_memory
                .as_ref()
                .map_or(0, ContextMemory::reserved_event_queues);
            let len = self.config.event_ring_len();
            self.events = Some(create_event_queue(&mut self.env(), len, number)?);
        }

        let tx_len = self.config.tx_ring_len();
        let rx_len = self.config.rx_ring_len();
        if self.profile.page_lists {
            let buffer_len = self.config.rx_buffer_len();
            let lists = PageLists::register(&mut self.env(), tx_len, rx_len, buffer_len)?;
            self.page_lists = Some(lists);
        }

        self.tx = Some(create_queue_pair(&mut self.env(), QueueKind::Tx, tx_len)?);
        self.rx = Some(create_queue_pair(&mut self.env(), QueueKind::Rx, rx_len)?);

        let filled = self.refill();
        log::debug!("posted {} receive buffers", filled);
        Ok(())
    }

    fn device_lost(&self) -> bool {
        lifecycle::device_lost(&self.platform, &self.profile, &self.admin)
    }

    /// Destroy both queue pairs and release everything staged for them.
    /// Memory the device may still own is leaked.
    fn teardown(
        &mut self,
        mode: Teardown,
        sink: &mut impl FnMut(CompletionEvent<B>),
    ) -> Result<()> {
        for buffer in self.deferred.drain(..) {
            sink(CompletionEvent::cancelled(QueueKind::Tx, buffer));
        }

        let mut result = Ok(());
        for qp in [self.rx.take(), self.tx.take()].into_iter().flatten() {
            result = result.and(destroy_queue_pair(&mut self.env(), qp, mode, &mut *sink));
        }
        let mut released = result.is_ok();

        if let Some(lists) = self.page_lists.take() {
            if released {
                result = result.and(lists.release(&mut self.env(), mode));
            } else {
                log::error!("leaking page lists still used by bound queues");
            }
        }
        if let Some(eq) = self.events.take() {
            let destroyed = destroy_event_queue(&mut self.env(), eq, mode);
            released &= destroyed.is_ok();
            result = result.and(destroyed);
        }
        self.port_up = None;

        if let Some(memory) = self.context_memory.take() {
            if released {
                result = result.and(memory.unmap(&mut self.env(), mode));
            } else {
                log::error!("leaking context memory still referenced by bound queues");
            }
        }
        if let Some(arena) = self.records.take() {
            if released {
                arena.release(&self.platform);
            } else {
                log::error!("leaking doorbell records still read by bound queues");
            }
        }
        result
    }

    /// Tear the link down. Every outstanding and deferred buffer is handed
    /// to `sink` as cancelled.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn close(&mut self, sink: &mut impl FnMut(CompletionEvent<B>)) -> Result<()> {
        let result = self.teardown(Teardown::Orderly, sink);
        self.link = LinkState::Down;
        log::info!("link down");
        result
    }

    /// Send `buffer`. A full ring defers it until completions make room;
    /// only when the deferral queue is full too is the buffer handed back.
    pub fn transmit(&mut self, buffer: B) -> core::result::Result<TxStatus, PostError<B>> {
        if self.link != LinkState::Up {
            return Err(PostError::new(QueueError::InvalidState, buffer));
        }
        let Some(tx) = self.tx.as_mut() else {
            return Err(PostError::new(QueueError::InvalidState, buffer));
        };

        // keep transmit order behind anything already deferred
        let buffer = if self.deferred.is_empty() {
            match tx.post(&self.platform, buffer) {
                Ok(_) => return Ok(TxStatus::Posted),
                Err(e) if e.error == QueueError::Busy => e.into_buffer(),
                Err(e) => return Err(e),
            }
        } else {
            buffer
        };

        if self.deferred.len() >= tx.sq().capacity() as usize {
            return Err(PostError::new(QueueError::Busy, buffer));
        }
        self.deferred.push_back(buffer);
        log::trace!("transmit deferred, {} waiting", self.deferred.len());
        Ok(TxStatus::Deferred)
    }

    /// Poll every bound queue, hand each completion to `sink`, then
    /// resubmit deferred transmits and refill the receive ring. Returns the
    /// number of completions delivered.
    pub fn poll(&mut self, sink: &mut impl FnMut(CompletionEvent<B>)) -> Result<usize> {
        if self.link != LinkState::Up {
            return Err(QueueError::InvalidState);
        }
        if let Some(signal) = self.profile.watchdog
            && signal.in_reset(&self.platform)
        {
            log::error!("device reset detected, cancelling all I/O");
            if let Err(e) = self.teardown(Teardown::DeviceLost, sink) {
                log::error!("teardown after device reset: {}", e);
            }
            self.link = LinkState::Failed(QueueError::Reset);
            return Err(QueueError::Reset);
        }

        if let Some(eq) = self.events.as_mut() {
            let port_up = &mut self.port_up;
            eq.drain(&self.platform, &mut |event| match event {
                Event::PortStateChange { port, up } => {
                    log::info!("port {} link {}", port, if up { "up" } else { "down" });
                    *port_up = Some(up);
                }
                Event::Other {
                    event_type,
                    sub_type,
                } => log::debug!("ignoring event {:#04x}/{:#04x}", event_type, sub_type),
            })?;
        }

        let mut delivered = 0;
        if let Some(tx) = self.tx.as_mut() {
            for event in tx.poll(&self.platform) {
                sink(event);
                delivered += 1;
            }
        }
        self.flush_deferred();

        if let Some(rx) = self.rx.as_mut() {
            for event in rx.poll(&self.platform) {
                sink(event);
                delivered += 1;
            }
        }
        self.refill();
        Ok(delivered)
    }

    fn flush_deferred(&mut self) {
        let Some(tx) = self.tx.as_mut() else {
            return;
        };
        while let Some(buffer) = self.deferred.pop_front() {
            if let Err(e) = tx.post(&self.platform, buffer) {
                if e.error != QueueError::Busy {
                    log::error!("resubmitting deferred transmit: {}", e.error);
                }
                self.deferred.push_front(e.into_buffer());
                break;
            }
        }
    }

    /// Top up the receive ring from the buffer source. Returns the number
    /// of buffers posted.
    pub fn refill(&mut self) -> usize {
        let Some(rx) = self.rx.as_mut() else {
            return 0;
        };
        let len = self.config.rx_buffer_len();
        let mut posted = 0;
        while !rx.is_full() {
            let Some(buffer) = self.rx_source.alloc_rx(len) else {
                break;
            };
            if let Err(e) = rx.post(&self.platform, buffer) {
                // a completed slot may still be waiting for its predecessor
                log::debug!("receive refill stopped: {}", e.error);
                break;
            }
            posted += 1;
        }
        posted
    }

    /// Issue a raw admin command.
    pub fn admin(&mut self, cmd: AdminCommand) -> Result<AdminResponse> {
        self.admin.submit(&self.platform, &self.config, &cmd)
    }

    /// Re-issue the ReadyToSend parameters of the `kind` queue pair.
    pub fn update(&mut self, kind: QueueKind) -> Result<()> {
        let slot = match kind {
            QueueKind::Tx => &mut self.tx,
            QueueKind::Rx => &mut self.rx,
        };
        let mut qp = slot.take().ok_or(QueueError::InvalidState)?;
        let result = lifecycle::update(&mut self.env(), &mut qp);
        match kind {
            QueueKind::Tx => self.tx = Some(qp),
            QueueKind::Rx => self.rx = Some(qp),
        }
        result
    }

    /// Close the link if needed and free the admin queue, returning the
    /// platform. Buffers still outstanding are cancelled and dropped.
    pub fn release(mut self) -> P {
        if self.tx.is_some()
            || self.rx.is_some()
            || self.context_memory.is_some()
            || self.events.is_some()
            || self.page_lists.is_some()
        {
            let mut dropped = 0usize;
            if let Err(e) = self.teardown(Teardown::Orderly, &mut |_| dropped += 1) {
                log::error!("teardown on release: {}", e);
            }
            if dropped != 0 {
                log::warn!("release dropped {} cancelled buffers", dropped);
            }
        }
        let Self {
            platform, admin, ..
        } = self;
        admin.release(&platform);
        platform
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn tx(&self) -> Option<&QueuePair<B>> {
        self.tx.as_ref()
    }

    pub fn rx(&self) -> Option<&QueuePair<B>> {
        self.rx.as_ref()
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    /// Port state from the most recent port event, if the device has sent
    /// one since the link came up.
    pub fn port_up(&self) -> Option<bool> {
        self.port_up
    }

    pub fn event_queue(&self) -> Option<&EventQueue> {
        self.events.as_ref()
    }

    /// Memory that `kind` buffers must be carved from on devices with
    /// registered page lists.
    pub fn page_list(&self, kind: QueueKind) -> Option<DmaRegion> {
        self.page_lists.as_ref().map(|lists| lists.get(kind).data())
    }

    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }
}

#[cfg(test)]
mod tests {
    use hwqueue_testing::{LOGGER, SimpleLogger};
    use log::Level;

    use super::*;
    use crate::config::OpcodeTable;
    use crate::entry::{EventEntry, EventType, PORT_ACTIVE};
    use crate::testing::{MockDevice, RESERVED_EQS, RESERVED_QUEUES, TestBuffer, regs, rx_pool};

    type Pool = Box<dyn FnMut(u32) -> Option<TestBuffer>>;
    type TestDevice = Device<MockDevice, TestBuffer, Pool>;

    fn pool(first_id: u32) -> Pool {
        Box::new(rx_pool(first_id))
    }

    fn config(tx: u32, rx: u32) -> DriverConfig {
        let mut config = DriverConfig::default();
        config.set_tx_ring_len(tx);
        config.set_rx_ring_len(rx);
        config.set_reset_retries(2);
        config
    }

    fn phase_ring_device(config: DriverConfig, profile: QueueProfile) -> TestDevice {
        let dev = MockDevice::new();
        dev.install_phase_ring_firmware(profile.opcodes);
        let admin = AdminQueue::phase_ring(&dev, &config, regs::phase_ring()).unwrap();
        Device::new(dev, config, profile, admin, pool(100))
    }

    fn flat_device(tx: u32, rx: u32) -> TestDevice {
        phase_ring_device(
            config(tx, rx),
            QueueProfile::flat()
                .with_reset(regs::reset_sequence())
                .with_watchdog(regs::reset_signal()),
        )
    }

    /// Regions besides the admin queue's own memory.
    fn queue_regions(device: &TestDevice) -> usize {
        device.platform().live_regions().len() - 2
    }

    #[test]
    fn opens_over_phase_ring() {
        let mut device = flat_device(4, 4);
        device.open().unwrap();

        assert_eq!(device.link_state(), LinkState::Up);
        assert_eq!(device.platform().resets(), 1);
        assert_eq!(device.tx().unwrap().number().hw(), 0);
        assert_eq!(device.rx().unwrap().number().hw(), 1);
        assert_eq!(device.rx().unwrap().in_flight(), 4);
        assert_eq!(device.open().unwrap_err(), QueueError::InvalidState);
    }

    #[test]
    fn admin_ring_follows_config() {
        let mut config = config(4, 4);
        config.set_admin_ring_len(16);
        let mut device = phase_ring_device(config, QueueProfile::flat());
        device.open().unwrap();
        assert_eq!(device.platform().reg(regs::AQ_DEPTH), 16);
    }

    #[test]
    fn opens_over_event_counter() {
        let dev = MockDevice::new();
        let profile = QueueProfile::flat().with_reset(regs::pfn_reset_sequence());
        let mut config = config(4, 4);
        config.set_admin_ring_len(4);
        dev.install_event_counter_firmware(profile.opcodes, config.admin_ring_len());
        let admin = AdminQueue::event_counter(&dev, &config, regs::event_counter()).unwrap();
        let mut device: TestDevice = Device::new(dev, config, profile, admin, pool(0));

        device.open().unwrap();
        // page frame was clear, so no reset was needed
        assert_eq!(device.platform().resets(), 0);
        assert_ne!(device.platform().reg(regs::EVT_PFN), 0);
        assert_eq!(device.platform().live_sqs(), vec![0, 1]);

        device.close(&mut drop).unwrap();
        assert!(device.platform().live_sqs().is_empty());
    }

    #[test]
    fn opens_over_go_bit_with_context_memory() {
        let dev = MockDevice::new();
        let profile = QueueProfile::linked().with_reset(regs::reset_sequence());
        dev.install_go_bit_firmware(profile.opcodes);
        let admin = AdminQueue::go_bit(&dev, regs::hcr()).unwrap();
        let mut device: TestDevice =
            Device::new(dev, config(4, 4), profile, admin, pool(0));

        device.open().unwrap();
        let tx = device.tx().unwrap();
        assert_eq!(tx.number().hw(), RESERVED_QUEUES);
        assert_eq!(tx.state(), crate::qp::QpState::ReadyToSend);
        assert_eq!(device.rx().unwrap().in_flight(), 4);

        device.update(QueueKind::Tx).unwrap();
        assert_eq!(device.platform().command_count(OpcodeTable::linked().rts2rts), 1);

        device.close(&mut drop).unwrap();
        // only the command mailbox is left
        assert_eq!(device.platform().live_regions().len(), 1);
        assert_eq!(device.link_state(), LinkState::Down);
    }

    fn linked_device() -> TestDevice {
        let dev = MockDevice::new();
        let profile = QueueProfile::linked().with_reset(regs::reset_sequence());
        dev.install_go_bit_firmware(profile.opcodes);
        let admin = AdminQueue::go_bit(&dev, regs::hcr()).unwrap();
        Device::new(dev, config(4, 4), profile, admin, pool(0))
    }

    fn port_event(up: bool) -> EventEntry {
        EventEntry {
            event_type: EventType::PORT_STATE_CHANGE,
            sub_type: if up { PORT_ACTIVE } else { 0 },
            port: 1,
            ..bytemuck::Zeroable::zeroed()
        }
    }

    #[test]
    fn poll_drains_port_events() {
        let mut device = linked_device();
        device.open().unwrap();
        let ops = OpcodeTable::linked();
        let eq = device.event_queue().unwrap();
        assert_eq!(eq.number(), RESERVED_EQS);
        assert_eq!(device.platform().live_eqs(), vec![RESERVED_EQS]);
        assert_eq!(device.port_up(), None);

        assert!(device.platform().push_event(eq, port_event(true)));
        assert_eq!(device.poll(&mut drop).unwrap(), 0);
        assert_eq!(device.port_up(), Some(true));

        let eq = device.event_queue().unwrap();
        assert!(device.platform().push_event(eq, port_event(false)));
        device.poll(&mut drop).unwrap();
        assert_eq!(device.port_up(), Some(false));
        let doorbell = regs::EQ_DOORBELL_BASE + 8 * u64::from(RESERVED_EQS);
        assert_eq!(device.platform().writes_to(doorbell), vec![1, 2]);

        device.close(&mut drop).unwrap();
        assert!(device.platform().live_eqs().is_empty());
        assert_eq!(device.port_up(), None);
        // the event queue goes back after both pairs and before context memory
        let issued: Vec<u16> = device.platform().commands().iter().map(|c| c.opcode).collect();
        let at = |op: u16| issued.iter().rposition(|&o| o == op).unwrap();
        assert!(at(ops.destroy_cq) < at(ops.hw2sw_eq));
        assert!(at(ops.map_eq) < at(ops.hw2sw_eq));
        assert!(at(ops.hw2sw_eq) < at(ops.unmap_icm));
    }

    #[test]
    fn paged_device_registers_lists_before_queues() {
        let mut device = phase_ring_device(config(4, 4), QueueProfile::flat().with_page_lists());
        device.open().unwrap();
        let ops = OpcodeTable::flat();

        let issued: Vec<u16> = device.platform().commands().iter().map(|c| c.opcode).collect();
        assert_eq!(
            &issued[..3],
            &[ops.configure, ops.register_page_list, ops.register_page_list]
        );
        assert_eq!(device.platform().live_page_lists(), vec![0, 1]);
        assert!(device.page_list(QueueKind::Rx).is_some());

        device.close(&mut drop).unwrap();
        assert!(device.platform().live_page_lists().is_empty());
        assert!(!device.platform().is_configured());
        assert_eq!(device.page_list(QueueKind::Tx), None);
        assert_eq!(queue_regions(&device), 0);
    }

    #[test]
    fn failed_create_unregisters_page_lists() {
        let mut config = config(4, 4);
        config.set_reset_retries(0);
        let mut device = phase_ring_device(config, QueueProfile::flat().with_page_lists());
        let ops = OpcodeTable::flat();
        device.platform().fail_command(ops.create_sq, 7);

        assert!(matches!(device.open(), Err(QueueError::DeviceError(_))));
        let issued: Vec<(u16, u32)> = device
            .platform()
            .commands()
            .iter()
            .map(|c| (c.opcode, c.input_modifier))
            .collect();
        assert_eq!(
            issued,
            vec![
                (ops.configure, 0),
                (ops.register_page_list, 0),
                (ops.register_page_list, 1),
                (ops.create_cq, 0),
                (ops.create_sq, 0),
                (ops.destroy_cq, 0),
                (ops.unregister_page_list, 1),
                (ops.unregister_page_list, 0),
                (ops.deconfigure, 0),
            ]
        );
        assert!(!device.platform().is_configured());
        assert_eq!(queue_regions(&device), 0);
    }

    #[test]
    fn unacknowledged_reset_is_retried_then_fails() {
        let mut device = flat_device(4, 4);
        device.platform().ignore_reset();

        assert_eq!(device.open().unwrap_err(), QueueError::Timeout);
        assert_eq!(device.platform().resets(), 3);
        assert_eq!(device.link_state(), LinkState::Failed(QueueError::Timeout));
        assert!(device.tx().is_none());
    }

    #[test]
    fn failing_firmware_retries_without_leaking() {
        let mut device = flat_device(4, 4);
        device.platform().fail_command(OpcodeTable::flat().create_sq, 7);

        assert!(matches!(device.open(), Err(QueueError::DeviceError(_))));
        assert_eq!(device.platform().resets(), 3);
        assert_eq!(queue_regions(&device), 0);

        device.platform().clear_failure(OpcodeTable::flat().create_sq);
        device.open().unwrap();
        assert_eq!(device.link_state(), LinkState::Up);
    }

    #[test]
    fn reset_during_state_walk_is_retried() {
        let dev = MockDevice::new();
        let profile = QueueProfile::linked().with_reset(regs::reset_sequence());
        dev.install_go_bit_firmware(profile.opcodes);
        dev.reset_on_command(profile.opcodes.rtr2rts);
        let admin = AdminQueue::go_bit(&dev, regs::hcr()).unwrap();
        let mut device: TestDevice =
            Device::new(dev, config(4, 4), profile, admin, pool(0));

        device.open().unwrap();
        assert_eq!(device.link_state(), LinkState::Up);
        // two host resets around the one the firmware fell into
        assert_eq!(device.platform().resets(), 3);
        assert_eq!(device.tx().unwrap().number().hw(), RESERVED_QUEUES);
        assert_eq!(device.rx().unwrap().number().hw(), RESERVED_QUEUES + 1);
        // nothing was handed back to firmware that had already forgotten it
        assert_eq!(device.platform().command_count(profile.opcodes.to_reset), 0);
        assert_eq!(device.platform().command_count(profile.opcodes.destroy_cq), 0);
    }

    #[test]
    fn reset_during_create_does_not_leak_numbers() {
        let mut device = flat_device(4, 4);
        let create_sq = OpcodeTable::flat().create_sq;
        device.platform().reset_on_command(create_sq);

        device.open().unwrap();
        assert_eq!(device.platform().resets(), 3);
        assert_eq!(device.tx().unwrap().number().hw(), 0);
        assert_eq!(device.rx().unwrap().number().hw(), 1);
        assert_eq!(device.platform().command_count(OpcodeTable::flat().destroy_cq), 0);
    }

    #[test]
    fn unrecoverable_failure_stops_after_one_attempt() {
        let mut config = config(4, 4);
        config.set_max_queues(1);
        let mut device = phase_ring_device(config, QueueProfile::flat().with_reset(regs::reset_sequence()));

        assert_eq!(device.open().unwrap_err(), QueueError::Exhausted);
        assert_eq!(device.platform().resets(), 1);
        // the transmit pair was created and destroyed again
        assert!(device.platform().live_sqs().is_empty());
        assert_eq!(queue_regions(&device), 0);
    }

    #[test]
    fn full_ring_defers_then_flushes() {
        let mut device = flat_device(2, 2);
        device.open().unwrap();

        assert_eq!(device.transmit(TestBuffer::new(1, 60)).unwrap(), TxStatus::Posted);
        assert_eq!(device.transmit(TestBuffer::new(2, 60)).unwrap(), TxStatus::Posted);
        assert_eq!(device.transmit(TestBuffer::new(3, 60)).unwrap(), TxStatus::Deferred);
        assert_eq!(device.deferred(), 1);

        assert!(device.platform().complete(device.tx().unwrap(), 0, 60));
        let mut events = Vec::new();
        assert_eq!(device.poll(&mut |e| events.push(e)).unwrap(), 1);

        assert_eq!(events[0].buffer.id, 1);
        assert_eq!(events[0].result, Ok(60));
        assert_eq!(device.deferred(), 0);
        assert_eq!(device.tx().unwrap().in_flight(), 2);
        let reposted = device.platform().submission(device.tx().unwrap(), 0);
        assert_eq!(reposted.addr, TestBuffer::new(3, 60).device_addr());
    }

    #[test]
    fn deferral_queue_is_bounded() {
        let mut device = flat_device(2, 2);
        device.open().unwrap();
        for id in 0..4 {
            device.transmit(TestBuffer::new(id, 60)).unwrap();
        }
        let err = device.transmit(TestBuffer::new(9, 60)).unwrap_err();
        assert_eq!(err.error, QueueError::Busy);
        assert_eq!(err.into_buffer().id, 9);
    }

    #[test]
    fn received_buffers_are_replaced() {
        let mut device = flat_device(2, 4);
        device.open().unwrap();
        let len = device.config().rx_buffer_len();

        assert!(device.platform().complete(device.rx().unwrap(), 0, 42));
        let mut events = Vec::new();
        device.poll(&mut |e| events.push(e)).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, QueueKind::Rx);
        assert_eq!((events[0].buffer.id, events[0].result), (100, Ok(42)));
        assert_eq!(device.rx().unwrap().in_flight(), 4);
        let refilled = device.platform().submission(device.rx().unwrap(), 0);
        assert_eq!(refilled.addr, TestBuffer::new(104, len).device_addr());
    }

    #[test]
    fn watchdog_cancels_everything_on_reset() {
        let mut device = flat_device(2, 4);
        device.open().unwrap();
        device.transmit(TestBuffer::new(1, 60)).unwrap();

        device.platform().trigger_device_reset();
        let mut events = Vec::new();
        assert_eq!(
            device.poll(&mut |e| events.push(e)).unwrap_err(),
            QueueError::Reset
        );
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.result == Err(QueueError::Cancelled)));
        assert_eq!(device.link_state(), LinkState::Failed(QueueError::Reset));
        assert_eq!(queue_regions(&device), 0);

        // the reset handshake brings it back
        device.open().unwrap();
        assert_eq!(device.link_state(), LinkState::Up);
    }

    #[test]
    fn close_cancels_posted_and_deferred() {
        let mut device = flat_device(2, 2);
        device.open().unwrap();
        for id in 0..3 {
            device.transmit(TestBuffer::new(id, 60)).unwrap();
        }

        let mut cancelled = Vec::new();
        device
            .close(&mut |e: CompletionEvent<TestBuffer>| {
                cancelled.push((e.kind, e.buffer.id))
            })
            .unwrap();

        assert_eq!(
            cancelled,
            vec![
                (QueueKind::Tx, 2),
                (QueueKind::Rx, 100),
                (QueueKind::Rx, 101),
                (QueueKind::Tx, 0),
                (QueueKind::Tx, 1),
            ]
        );
        assert_eq!(queue_regions(&device), 0);
        assert_eq!(device.transmit(TestBuffer::new(5, 1)).unwrap_err().error, QueueError::InvalidState);
    }

    #[test]
    fn release_returns_all_memory() {
        let mut device = flat_device(2, 2);
        device.open().unwrap();
        let dev = device.release();
        assert!(dev.live_regions().is_empty());
    }

    #[test]
    fn release_reports_dropped_buffers() {
        SimpleLogger::initialize_test_logger();
        let mut device = flat_device(2, 2);
        device.open().unwrap();
        device.transmit(TestBuffer::new(1, 60)).unwrap();
        device.transmit(TestBuffer::new(2, 60)).unwrap();
        device.transmit(TestBuffer::new(3, 60)).unwrap();

        // three transmits, one of them deferred, and two receive buffers
        device.release();
        assert!(
            !LOGGER
                .find(Level::Warn, "release dropped 5 cancelled buffers")
                .is_empty()
        );
    }
}
