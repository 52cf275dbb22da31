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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
// The mock device and the fuzz target need std
#![cfg_attr(not(any(test, feature = "fuzzing")), no_std)]

//! Hardware command and data queue protocol engine.
//!
//! The crate drives the shared-memory protocols that NIC and RDMA host
//! channel adapter firmware expose to a host driver: an admin queue for
//! control-plane commands, submission rings for transmit and receive
//! descriptors, completion rings reporting finished work, and the doorbells
//! and ownership bits that let both sides cooperate without locks.
//!
//! Everything outside the protocol itself (register mapping, address
//! translation, DMA allocation, timekeeping) is consumed through the traits
//! in [`platform`].

extern crate alloc;

pub mod admin;
pub mod allocator;
pub mod config;
pub mod cq;
pub mod device;
pub mod doorbell;
pub mod entry;
pub mod eq;
pub mod error;
pub mod lifecycle;
pub mod platform;
pub mod qp;
pub mod ring;
pub mod sq;
pub(crate) mod wait;

#[cfg(any(test, feature = "fuzzing"))]
pub mod testing;

pub use admin::{AdminCommand, AdminQueue, AdminResponse};
pub use config::{DriverConfig, QueueProfile};
pub use cq::{CompletionEvent, CompletionQueue};
pub use device::{Device, LinkState, TxStatus};
pub use eq::{Event, EventQueue};
pub use error::{DeviceStatus, PostError, QueueError, Result};
pub use platform::{Clock, DmaBuffer, DmaOps, DmaRegion, MemOps, Mmio, Platform, RxSource};
pub use qp::{QpState, QueueKind, QueuePair};
pub use ring::{Ownership, OwnershipMode, Phase, RingIndex};
pub use sq::{SqShape, SubmissionQueue};
pub use wait::ResetSignal;

/// Size of a device page, used for firmware and context memory sizing.
pub const PAGE_SIZE: usize = 0x1_000;
