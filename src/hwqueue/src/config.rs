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

use core::cmp::{max, min};
use core::time::Duration;

#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::ring::OwnershipMode;
use crate::sq::SqShape;
use crate::wait::ResetSignal;

/// Tunables shared by every queue of a device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DriverConfig {
    /// Upper bound on the wait for one admin command, in milliseconds.
    admin_timeout: u32,
    /// Sleep between polls inside bounded waits, in milliseconds.
    poll_interval: u32,
    /// Upper bound on each step of the reset handshake, in milliseconds.
    reset_timeout: u32,
    /// Extra startup attempts after the first one fails.
    reset_retries: u8,
    admin_ring_len: u32,
    event_ring_len: u32,
    tx_ring_len: u32,
    rx_ring_len: u32,
    /// Size of the queue-number space.
    max_queues: u32,
    /// Length of each receive buffer requested from the [`RxSource`](crate::RxSource).
    rx_buffer_len: u32,
}

impl DriverConfig {
    /// The default admin command timeout (in milliseconds)
    pub const DEFAULT_ADMIN_TIMEOUT: u32 = 500;
    /// The minimum admin command timeout (in milliseconds)
    pub const MIN_ADMIN_TIMEOUT: u32 = 1;
    /// The maximum admin command timeout (in milliseconds)
    pub const MAX_ADMIN_TIMEOUT: u32 = 60_000;
    /// The default poll interval (in milliseconds)
    pub const DEFAULT_POLL_INTERVAL: u32 = 1;
    /// The maximum poll interval (in milliseconds)
    pub const MAX_POLL_INTERVAL: u32 = 100;
    /// The default reset handshake timeout (in milliseconds)
    pub const DEFAULT_RESET_TIMEOUT: u32 = 500;
    /// The maximum reset handshake timeout (in milliseconds)
    pub const MAX_RESET_TIMEOUT: u32 = 60_000;
    pub const DEFAULT_RESET_RETRIES: u8 = 5;
    pub const MAX_RESET_RETRIES: u8 = 16;
    pub const DEFAULT_ADMIN_RING_LEN: u32 = 32;
    pub const DEFAULT_EVENT_RING_LEN: u32 = 8;
    pub const DEFAULT_TX_RING_LEN: u32 = 64;
    pub const DEFAULT_RX_RING_LEN: u32 = 64;
    pub const MIN_RING_LEN: u32 = 2;
    pub const MAX_RING_LEN: u32 = 4096;
    pub const DEFAULT_MAX_QUEUES: u32 = 64;
    pub const MAX_MAX_QUEUES: u32 = 1 << 16;
    /// Fits a standard Ethernet frame plus headroom.
    pub const DEFAULT_RX_BUFFER_LEN: u32 = 1536;
    pub const MAX_RX_BUFFER_LEN: u32 = 1 << 16;

    fn clamp_ms(value: Duration, default: u32, lo: u32, hi: u32) -> u32 {
        match value.as_millis() {
            0 => default,
            ms => min(u128::from(hi), max(ms, u128::from(lo))) as u32,
        }
    }

    /// Ring lengths are rounded up to a power of two within the allowed range.
    fn ring_len(len: u32, default: u32) -> u32 {
        match len {
            0 => default,
            len => min(Self::MAX_RING_LEN, max(len, Self::MIN_RING_LEN)).next_power_of_two(),
        }
    }

    /// Set the admin command timeout. Zero restores the default.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level = "Trace"))]
    pub fn set_admin_timeout(&mut self, timeout: Duration) {
        self.admin_timeout = Self::clamp_ms(
            timeout,
            Self::DEFAULT_ADMIN_TIMEOUT,
            Self::MIN_ADMIN_TIMEOUT,
            Self::MAX_ADMIN_TIMEOUT,
        );
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_timeout.into())
    }

    /// Set the bounded-wait poll interval. Zero restores the default.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = Self::clamp_ms(
            interval,
            Self::DEFAULT_POLL_INTERVAL,
            1,
            Self::MAX_POLL_INTERVAL,
        );
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval.into())
    }

    /// Set the per-step reset handshake timeout. Zero restores the default.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level = "Trace"))]
    pub fn set_reset_timeout(&mut self, timeout: Duration) {
        self.reset_timeout = Self::clamp_ms(
            timeout,
            Self::DEFAULT_RESET_TIMEOUT,
            1,
            Self::MAX_RESET_TIMEOUT,
        );
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout.into())
    }

    pub fn set_reset_retries(&mut self, retries: u8) {
        if retries > Self::MAX_RESET_RETRIES {
            log::warn!(
                "reset retries {} above limit, using {}",
                retries,
                Self::MAX_RESET_RETRIES
            );
        }
        self.reset_retries = min(retries, Self::MAX_RESET_RETRIES);
    }

    pub fn reset_retries(&self) -> u8 {
        self.reset_retries
    }

    pub fn set_admin_ring_len(&mut self, len: u32) {
        self.admin_ring_len = Self::ring_len(len, Self::DEFAULT_ADMIN_RING_LEN);
    }

    pub fn admin_ring_len(&self) -> u32 {
        self.admin_ring_len
    }

    pub fn set_event_ring_len(&mut self, len: u32) {
        self.event_ring_len = Self::ring_len(len, Self::DEFAULT_EVENT_RING_LEN);
    }

    pub fn event_ring_len(&self) -> u32 {
        self.event_ring_len
    }

    pub fn set_tx_ring_len(&mut self, len: u32) {
        self.tx_ring_len = Self::ring_len(len, Self::DEFAULT_TX_RING_LEN);
    }

    pub fn tx_ring_len(&self) -> u32 {
        self.tx_ring_len
    }

    pub fn set_rx_ring_len(&mut self, len: u32) {
        self.rx_ring_len = Self::ring_len(len, Self::DEFAULT_RX_RING_LEN);
    }

    pub fn rx_ring_len(&self) -> u32 {
        self.rx_ring_len
    }

    /// Set the size of the queue-number space. Zero restores the default.
    pub fn set_max_queues(&mut self, queues: u32) {
        self.max_queues = match queues {
            0 => Self::DEFAULT_MAX_QUEUES,
            n => min(n, Self::MAX_MAX_QUEUES),
        };
    }

    pub fn max_queues(&self) -> u32 {
        self.max_queues
    }

    pub fn set_rx_buffer_len(&mut self, len: u32) {
        self.rx_buffer_len = match len {
            0 => Self::DEFAULT_RX_BUFFER_LEN,
            n => min(n, Self::MAX_RX_BUFFER_LEN),
        };
    }

    pub fn rx_buffer_len(&self) -> u32 {
        self.rx_buffer_len
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            admin_timeout: Self::DEFAULT_ADMIN_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            reset_timeout: Self::DEFAULT_RESET_TIMEOUT,
            reset_retries: Self::DEFAULT_RESET_RETRIES,
            admin_ring_len: Self::DEFAULT_ADMIN_RING_LEN,
            event_ring_len: Self::DEFAULT_EVENT_RING_LEN,
            tx_ring_len: Self::DEFAULT_TX_RING_LEN,
            rx_ring_len: Self::DEFAULT_RX_RING_LEN,
            max_queues: Self::DEFAULT_MAX_QUEUES,
            rx_buffer_len: Self::DEFAULT_RX_BUFFER_LEN,
        }
    }
}

/// How a submission queue is handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingModel {
    /// A single create command makes the queue usable.
    Direct,
    /// The queue walks Reset -> Init -> ReadyToReceive -> ReadyToSend through
    /// one command per transition.
    StateMachine,
}

/// Admin opcodes used by queue lifecycle and context-memory staging.
///
/// Operations a device does not support are left at zero and never issued
/// by profiles that do not need them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeTable {
    pub create_cq: u16,
    pub destroy_cq: u16,
    pub create_sq: u16,
    pub destroy_sq: u16,
    pub rst2init: u16,
    pub init2rtr: u16,
    pub rtr2rts: u16,
    pub rts2rts: u16,
    pub to_reset: u16,
    pub query_fw: u16,
    pub map_fa: u16,
    pub unmap_fa: u16,
    pub run_fw: u16,
    pub query_dev_lim: u16,
    pub set_icm_size: u16,
    pub map_icm_aux: u16,
    pub unmap_icm_aux: u16,
    pub map_icm: u16,
    pub unmap_icm: u16,
    pub configure: u16,
    pub deconfigure: u16,
    pub register_page_list: u16,
    pub unregister_page_list: u16,
    pub sw2hw_eq: u16,
    pub hw2sw_eq: u16,
    /// Maps events to an event queue; with [`UNMAP_EVENTS`] set in the input
    /// modifier it unmaps them again.
    pub map_eq: u16,
}

/// Input-modifier flag turning `map_eq` into an unmap.
pub const UNMAP_EVENTS: u32 = 1 << 31;

impl OpcodeTable {
    /// Opcodes of devices binding queues with a single create command.
    pub const fn flat() -> Self {
        Self {
            create_sq: 0x01,
            destroy_sq: 0x02,
            create_cq: 0x03,
            destroy_cq: 0x04,
            rst2init: 0,
            init2rtr: 0,
            rtr2rts: 0,
            rts2rts: 0,
            to_reset: 0,
            query_fw: 0,
            map_fa: 0,
            unmap_fa: 0,
            run_fw: 0,
            query_dev_lim: 0,
            set_icm_size: 0,
            map_icm_aux: 0,
            unmap_icm_aux: 0,
            map_icm: 0,
            unmap_icm: 0,
            configure: 0x05,
            deconfigure: 0x06,
            register_page_list: 0x07,
            unregister_page_list: 0x08,
            sw2hw_eq: 0,
            hw2sw_eq: 0,
            map_eq: 0,
        }
    }

    /// Opcodes of host channel adapters with queue-pair state machines and
    /// host-provided context memory.
    pub const fn linked() -> Self {
        Self {
            create_cq: 0x16,
            destroy_cq: 0x17,
            create_sq: 0,
            destroy_sq: 0,
            rst2init: 0x19,
            init2rtr: 0x1a,
            rtr2rts: 0x1b,
            rts2rts: 0x1c,
            to_reset: 0x21,
            query_fw: 0x04,
            map_fa: 0xfff,
            unmap_fa: 0xffe,
            run_fw: 0xff6,
            query_dev_lim: 0x03,
            set_icm_size: 0xffd,
            map_icm_aux: 0xffc,
            unmap_icm_aux: 0xffb,
            map_icm: 0xffa,
            unmap_icm: 0xff9,
            configure: 0,
            deconfigure: 0,
            register_page_list: 0,
            unregister_page_list: 0,
            sw2hw_eq: 0x13,
            hw2sw_eq: 0x14,
            map_eq: 0x12,
        }
    }
}

/// A single register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub offset: u64,
    pub value: u32,
}

/// Device reset handshake.
///
/// The trigger is written, then `acknowledged` is awaited. Devices that also
/// need the reset released get a second write and a second wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSequence {
    /// Condition under which the device is already in reset and the trigger
    /// is skipped.
    pub skip_when: Option<ResetSignal>,
    pub trigger: RegisterWrite,
    pub acknowledged: ResetSignal,
    pub release: Option<(RegisterWrite, ResetSignal)>,
}

/// Everything that differs between device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueProfile {
    pub shape: SqShape,
    pub ownership: OwnershipMode,
    pub binding: BindingModel,
    pub opcodes: OpcodeTable,
    pub reset: Option<ResetSequence>,
    /// Checked on every poll; a match means the device reset underneath us.
    pub watchdog: Option<ResetSignal>,
    /// Whether firmware and queue contexts live in host memory that must be
    /// staged before any queue is created.
    pub context_memory: bool,
    /// Whether the device reads producer and consumer counters from
    /// doorbell records in host memory.
    pub doorbell_records: bool,
    /// Whether the device reports asynchronous events, such as port state
    /// changes, on an event queue.
    pub event_queue: bool,
    /// Whether the device only reaches buffers through page lists registered
    /// after a configure command.
    pub page_lists: bool,
}

impl QueueProfile {
    /// Flat rings, phase ownership, single-command binding.
    pub const fn flat() -> Self {
        Self {
            shape: SqShape::Flat,
            ownership: OwnershipMode::Phase,
            binding: BindingModel::Direct,
            opcodes: OpcodeTable::flat(),
            reset: None,
            watchdog: None,
            context_memory: false,
            doorbell_records: false,
            event_queue: false,
            page_lists: false,
        }
    }

    /// Linked rings, owner-bit ownership, state-machine binding with
    /// doorbell records, host context memory and an event queue.
    pub const fn linked() -> Self {
        Self {
            shape: SqShape::Linked,
            ownership: OwnershipMode::OwnerBit,
            binding: BindingModel::StateMachine,
            opcodes: OpcodeTable::linked(),
            reset: None,
            watchdog: None,
            context_memory: true,
            doorbell_records: true,
            event_queue: true,
            page_lists: false,
        }
    }

    pub const fn with_reset(mut self, reset: ResetSequence) -> Self {
        self.reset = Some(reset);
        self
    }

    pub const fn with_watchdog(mut self, signal: ResetSignal) -> Self {
        self.watchdog = Some(signal);
        self
    }

    pub const fn with_page_lists(mut self) -> Self {
        self.page_lists = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_restores_defaults() {
        let mut cfg = DriverConfig::default();
        cfg.set_admin_timeout(Duration::from_millis(20));
        cfg.set_admin_timeout(Duration::ZERO);
        assert_eq!(
            cfg.admin_timeout(),
            Duration::from_millis(DriverConfig::DEFAULT_ADMIN_TIMEOUT.into())
        );

        cfg.set_tx_ring_len(0);
        assert_eq!(cfg.tx_ring_len(), DriverConfig::DEFAULT_TX_RING_LEN);
        cfg.set_max_queues(0);
        assert_eq!(cfg.max_queues(), DriverConfig::DEFAULT_MAX_QUEUES);
    }

    #[test]
    fn values_are_clamped() {
        let mut cfg = DriverConfig::default();
        cfg.set_admin_timeout(Duration::from_secs(3600));
        assert_eq!(
            cfg.admin_timeout(),
            Duration::from_millis(DriverConfig::MAX_ADMIN_TIMEOUT.into())
        );
        cfg.set_poll_interval(Duration::from_secs(1));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(100));
        cfg.set_reset_retries(200);
        assert_eq!(cfg.reset_retries(), DriverConfig::MAX_RESET_RETRIES);
    }

    #[test]
    fn ring_lengths_round_to_power_of_two() {
        let mut cfg = DriverConfig::default();
        cfg.set_rx_ring_len(100);
        assert_eq!(cfg.rx_ring_len(), 128);
        cfg.set_rx_ring_len(1);
        assert_eq!(cfg.rx_ring_len(), DriverConfig::MIN_RING_LEN);
        cfg.set_admin_ring_len(1 << 20);
        assert_eq!(cfg.admin_ring_len(), DriverConfig::MAX_RING_LEN);
        cfg.set_event_ring_len(5);
        assert_eq!(cfg.event_ring_len(), 8);
        cfg.set_event_ring_len(0);
        assert_eq!(cfg.event_ring_len(), DriverConfig::DEFAULT_EVENT_RING_LEN);
    }

    #[test]
    fn profiles_pair_shape_with_ownership() {
        let flat = QueueProfile::flat();
        assert_eq!(flat.ownership, OwnershipMode::Phase);
        assert_eq!(flat.binding, BindingModel::Direct);
        assert_eq!(flat.opcodes.create_sq, 1);

        let linked = QueueProfile::linked();
        assert_eq!(linked.ownership, OwnershipMode::OwnerBit);
        assert_eq!(linked.opcodes.rst2init, 0x19);
        assert_eq!(linked.opcodes.map_fa, 0xfff);
        assert!(linked.context_memory && linked.doorbell_records && linked.event_queue);
        assert_eq!(linked.opcodes.map_eq, 0x12);

        let paged = QueueProfile::flat().with_page_lists();
        assert!(paged.page_lists && !paged.event_queue);
        assert_eq!(paged.opcodes.register_page_list, 0x07);
    }
}
